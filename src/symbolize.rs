use std::collections::HashMap;
use std::path::{Path, PathBuf};

use blazesym::symbolize::source::{Elf, Source};
use blazesym::symbolize::{Input, Sym, Symbolized, Symbolizer};

use crate::mmap::{LineInfo, LineInfoResolver};

/// Resolves file offsets in ELF objects through blazesym, keeping every
/// answer so repeated addresses cost one lookup.
pub struct BlazeResolver {
    symbolizer: Symbolizer,
    cache: HashMap<(PathBuf, u64), Option<LineInfo>>,
}

impl Default for BlazeResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl BlazeResolver {
    pub fn new() -> Self {
        BlazeResolver {
            symbolizer: Symbolizer::builder()
                .enable_code_info(true)
                .enable_inlined_fns(false)
                .build(),
            cache: HashMap::new(),
        }
    }

    fn symbolize(&self, dso: &Path, file_offset: u64) -> Option<LineInfo> {
        let src = Source::Elf(Elf::new(dso));
        let dso_name = dso.to_string_lossy();
        match self
            .symbolizer
            .symbolize_single(&src, Input::FileOffset(file_offset))
        {
            Ok(Symbolized::Sym(Sym {
                name, code_info, ..
            })) => {
                let line_info = match code_info.as_ref() {
                    Some(info) => LineInfo::new(
                        &name,
                        &info.to_path().to_string_lossy(),
                        info.line.unwrap_or(0),
                        &dso_name,
                    ),
                    None => LineInfo::for_function(&name, &dso_name),
                };
                Some(line_info)
            }
            Ok(Symbolized::Unknown(reason)) => {
                tracing::trace!("{}+{file_offset:#x} unresolved: {reason}", dso.display());
                None
            }
            Err(e) => {
                tracing::debug!("symbolizing {}+{file_offset:#x} failed: {e}", dso.display());
                None
            }
        }
    }
}

impl LineInfoResolver for BlazeResolver {
    fn resolve(&mut self, dso: &Path, file_offset: u64) -> Option<LineInfo> {
        let key = (dso.to_path_buf(), file_offset);
        if let Some(cached) = self.cache.get(&key) {
            return cached.clone();
        }
        let line_info = self.symbolize(dso, file_offset);
        self.cache.insert(key, line_info.clone());
        line_info
    }
}
