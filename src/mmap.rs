//! Memory maps of monitored processes and the line info of addresses in them.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{PoisonError, RwLock, RwLockReadGuard};

use anyhow::{bail, Context, Result};
use serde::Serialize;

/// Symbolic location of an instruction address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct LineInfo {
    pub function: String,
    pub file: String,
    pub line: u32,
    pub dso: String,
}

impl LineInfo {
    pub fn new(function: &str, file: &str, line: u32, dso: &str) -> Self {
        LineInfo {
            function: function.to_string(),
            file: file.to_string(),
            line,
            dso: dso.to_string(),
        }
    }

    pub fn for_unknown_function() -> Self {
        Self::new("<unknown function>", "<unknown file>", 0, "<unknown binary>")
    }

    pub fn for_binary(dso: &str) -> Self {
        Self::new("<unknown function>", "<unknown file>", 0, dso)
    }

    pub fn for_function(function: &str, dso: &str) -> Self {
        Self::new(function, "<unknown file>", 0, dso)
    }
}

impl fmt::Display for LineInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}:{} in {}", self.function, self.file, self.line, self.dso)
    }
}

/// Source of line info for an offset into an object file.
pub trait LineInfoResolver {
    fn resolve(&mut self, dso: &Path, file_offset: u64) -> Option<LineInfo>;
}

/// Resolver used when symbol resolution is turned off.
#[derive(Debug, Default)]
pub struct NoLineInfo;

impl LineInfoResolver for NoLineInfo {
    fn resolve(&mut self, _dso: &Path, _file_offset: u64) -> Option<LineInfo> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub start: u64,
    pub end: u64,
    pub pgoff: u64,
    pub filename: String,
}

impl Mapping {
    /// Anonymous memory and pseudo files like `[vdso]` have nothing to resolve against.
    pub fn is_file_backed(&self) -> bool {
        self.filename.starts_with('/') && !self.filename.starts_with("//anon")
    }

    pub fn file_offset(&self, ip: u64) -> u64 {
        ip - self.start + self.pgoff
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryMap {
    mappings: BTreeMap<u64, Mapping>,
}

impl MemoryMap {
    /// Parses the text of `/proc/<pid>/maps`, keeping executable mappings.
    pub fn from_proc_maps(content: &str) -> Self {
        let mut map = MemoryMap::default();
        for line in content.lines() {
            let mut fields = line.split_whitespace();
            let (Some(range), Some(perms), Some(offset)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            if !perms.contains('x') {
                continue;
            }
            let filename = fields.nth(2).unwrap_or("").to_string();
            let Some((start, end)) = range.split_once('-') else {
                continue;
            };
            let (Ok(start), Ok(end), Ok(pgoff)) = (
                u64::from_str_radix(start, 16),
                u64::from_str_radix(end, 16),
                u64::from_str_radix(offset, 16),
            ) else {
                continue;
            };
            map.insert(Mapping {
                start,
                end,
                pgoff,
                filename,
            });
        }
        map
    }

    pub fn load(pid: libc::pid_t) -> Result<Self> {
        let path = format!("/proc/{pid}/maps");
        let content = fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
        Ok(Self::from_proc_maps(&content))
    }

    /// Adds a mapping, dropping whatever it overlaps.
    pub fn insert(&mut self, mapping: Mapping) {
        let overlapping: Vec<u64> = self
            .mappings
            .range(..mapping.end)
            .filter(|(_, m)| m.end > mapping.start)
            .map(|(start, _)| *start)
            .collect();
        for start in overlapping {
            self.mappings.remove(&start);
        }
        self.mappings.insert(mapping.start, mapping);
    }

    pub fn lookup(&self, ip: u64) -> Option<&Mapping> {
        self.mappings
            .range(..=ip)
            .next_back()
            .map(|(_, m)| m)
            .filter(|m| ip < m.end)
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn lookup_line_info(&self, ip: u64, resolver: &mut dyn LineInfoResolver) -> LineInfo {
        let Some(mapping) = self.lookup(ip) else {
            return LineInfo::for_unknown_function();
        };
        if !mapping.is_file_backed() {
            return LineInfo::for_binary(&mapping.filename);
        }
        resolver
            .resolve(Path::new(&mapping.filename), mapping.file_offset(ip))
            .unwrap_or_else(|| LineInfo::for_binary(&mapping.filename))
    }

    /// Raw bytes of the object file at `ip`, rendered as hex.
    pub fn lookup_instruction(&self, ip: u64) -> Result<String> {
        const INSTRUCTION_BYTES: usize = 8;

        let Some(mapping) = self.lookup(ip) else {
            bail!("no mapping for {ip:#x}");
        };
        if !mapping.is_file_backed() {
            bail!("{} is not backed by a file", mapping.filename);
        }
        let mut file = File::open(&mapping.filename)
            .with_context(|| format!("opening {}", mapping.filename))?;
        file.seek(SeekFrom::Start(mapping.file_offset(ip)))?;
        let mut buf = [0u8; INSTRUCTION_BYTES];
        let n = file.read(&mut buf)?;
        if n == 0 {
            bail!("{ip:#x} is past the end of {}", mapping.filename);
        }
        Ok(buf[..n]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(" "))
    }
}

#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: libc::pid_t,
    pub maps: MemoryMap,
}

/// Memory maps of every process seen so far, shared by all monitors.
#[derive(Debug, Default)]
pub struct ProcessMap {
    processes: RwLock<BTreeMap<libc::pid_t, ProcessInfo>>,
}

impl ProcessMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `pid`, seeding its maps from /proc unless it is already known.
    pub fn insert_process(&self, pid: libc::pid_t, read_proc_maps: bool) {
        let mut processes = self.processes.write().unwrap_or_else(PoisonError::into_inner);
        if processes.contains_key(&pid) {
            return;
        }
        let maps = if read_proc_maps {
            MemoryMap::load(pid).unwrap_or_else(|e| {
                tracing::debug!("no initial maps for {pid}: {e:#}");
                MemoryMap::default()
            })
        } else {
            MemoryMap::default()
        };
        processes.insert(pid, ProcessInfo { pid, maps });
    }

    pub fn mmap(&self, pid: libc::pid_t, mapping: Mapping) {
        let mut processes = self.processes.write().unwrap_or_else(PoisonError::into_inner);
        processes
            .entry(pid)
            .or_insert_with(|| ProcessInfo {
                pid,
                maps: MemoryMap::default(),
            })
            .maps
            .insert(mapping);
    }

    /// A forked child starts with a copy of its parent's address space.
    pub fn fork(&self, parent: libc::pid_t, child: libc::pid_t) {
        let mut processes = self.processes.write().unwrap_or_else(PoisonError::into_inner);
        let maps = processes
            .get(&parent)
            .map(|info| info.maps.clone())
            .unwrap_or_default();
        processes.insert(child, ProcessInfo { pid: child, maps });
    }

    /// A new image replaces the address space.
    pub fn exec(&self, pid: libc::pid_t) {
        let mut processes = self.processes.write().unwrap_or_else(PoisonError::into_inner);
        processes.insert(
            pid,
            ProcessInfo {
                pid,
                maps: MemoryMap::default(),
            },
        );
    }

    pub fn read(&self) -> RwLockReadGuard<'_, BTreeMap<libc::pid_t, ProcessInfo>> {
        self.processes.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copies the maps of `pids`, so symbolization runs without the lock.
    pub fn snapshot<I>(&self, pids: I) -> BTreeMap<libc::pid_t, ProcessInfo>
    where
        I: IntoIterator<Item = libc::pid_t>,
    {
        let processes = self.read();
        pids.into_iter()
            .filter_map(|pid| processes.get(&pid).map(|info| (pid, info.clone())))
            .collect()
    }
}
