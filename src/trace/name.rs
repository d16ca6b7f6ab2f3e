//! Trace directory names and the "latest trace" symlink.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::{Captures, Regex};

pub const DEFAULT_TRACE_TEMPLATE: &str = "lo2s_trace_{DATE}";
pub const OUTPUT_TRACE_ENV: &str = "LO2S_OUTPUT_TRACE";
pub const OUTPUT_LINK_ENV: &str = "LO2S_OUTPUT_LINK";

/// Tokens: `{DATE}`, `{HOSTNAME}` and `{ENV=NAME}`.
static TEMPLATE_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{(DATE|HOSTNAME|ENV=([^}]*))\}").expect("Invalid trace name token regex")
});

/// Values substituted into a trace name template.
pub struct NameContext<'a> {
    pub date: DateTime<Utc>,
    pub hostname: String,
    pub env: &'a dyn Fn(&str) -> Option<String>,
}

fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

impl NameContext<'static> {
    pub fn current() -> Self {
        NameContext {
            date: Utc::now(),
            hostname: crate::process::hostname(),
            env: &process_env,
        }
    }
}

pub fn format_date(date: &DateTime<Utc>) -> String {
    date.format("%Y-%m-%dT%H-%M-%S").to_string()
}

/// Replaces every token in one pass, so substituted text is never expanded
/// again. Unknown environment variables expand to nothing.
pub fn expand_template(template: &str, ctx: &NameContext<'_>) -> String {
    TEMPLATE_TOKEN_RE
        .replace_all(template, |caps: &Captures<'_>| match &caps[1] {
            "DATE" => format_date(&ctx.date),
            "HOSTNAME" => ctx.hostname.clone(),
            _ => {
                let name = caps.get(2).map_or("", |m| m.as_str());
                (ctx.env)(name).unwrap_or_else(|| {
                    tracing::warn!("{{ENV={name}}} in the trace name is not set");
                    String::new()
                })
            }
        })
        .into_owned()
}

/// Explicit template, then `LO2S_OUTPUT_TRACE`, then the default.
pub fn trace_path(explicit: Option<&str>, ctx: &NameContext<'_>) -> PathBuf {
    let template = explicit
        .map(str::to_string)
        .or_else(|| (ctx.env)(OUTPUT_TRACE_ENV).filter(|t| !t.is_empty()))
        .unwrap_or_else(|| DEFAULT_TRACE_TEMPLATE.to_string());
    PathBuf::from(expand_template(&template, ctx))
}

/// Points `link` at `target`, replacing an existing symlink atomically.
/// Anything else at `link` is left alone.
pub fn update_trace_link(link: &Path, target: &Path) -> Result<bool> {
    match std::fs::symlink_metadata(link) {
        Ok(meta) if !meta.file_type().is_symlink() => {
            tracing::warn!(
                "{} exists and is not a symlink, not linking the trace",
                link.display()
            );
            return Ok(false);
        }
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("inspecting {}", link.display())),
    }

    let target = std::fs::canonicalize(target)
        .with_context(|| format!("resolving {}", target.display()))?;
    let mut tmp = link.as_os_str().to_owned();
    tmp.push(format!(".tmp{}", std::process::id()));
    let tmp = PathBuf::from(tmp);
    let _ = std::fs::remove_file(&tmp);
    std::os::unix::fs::symlink(&target, &tmp)
        .with_context(|| format!("creating {}", tmp.display()))?;
    std::fs::rename(&tmp, link).with_context(|| format!("replacing {}", link.display()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn fixed_env(name: &str) -> Option<String> {
        match name {
            "USER" => Some("alice".into()),
            "TEMPLATE" => Some("{HOSTNAME}".into()),
            _ => None,
        }
    }

    fn ctx() -> NameContext<'static> {
        NameContext {
            date: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            hostname: "box1".into(),
            env: &fixed_env,
        }
    }

    #[test]
    fn test_expand_all_tokens() {
        assert_eq!(
            expand_template("run_{HOSTNAME}_{DATE}_{ENV=USER}", &ctx()),
            "run_box1_2024-01-02T03-04-05_alice"
        );
    }

    #[test]
    fn test_literal_braces_preserved() {
        assert_eq!(expand_template("{a}_{DATE_}_{}", &ctx()), "{a}_{DATE_}_{}");
        assert_eq!(expand_template("x{{HOSTNAME}}", &ctx()), "x{box1}");
    }

    #[test]
    fn test_substitution_is_not_expanded_again() {
        assert_eq!(expand_template("{ENV=TEMPLATE}", &ctx()), "{HOSTNAME}");
        assert_eq!(expand_template("a{ENV=MISSING}b", &ctx()), "ab");
    }

    #[test]
    fn test_trace_path_precedence() {
        assert_eq!(
            trace_path(Some("t_{HOSTNAME}"), &ctx()),
            PathBuf::from("t_box1")
        );
        assert_eq!(
            trace_path(None, &ctx()),
            PathBuf::from("lo2s_trace_2024-01-02T03-04-05")
        );
        let from_env = |name: &str| (name == OUTPUT_TRACE_ENV).then(|| "env_{DATE}".to_string());
        let ctx = NameContext {
            date: ctx().date,
            hostname: "box1".into(),
            env: &from_env,
        };
        assert_eq!(
            trace_path(None, &ctx),
            PathBuf::from("env_2024-01-02T03-04-05")
        );
    }

    #[test]
    fn test_trace_link_replaces_symlink_only() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        std::fs::create_dir(&first).unwrap();
        std::fs::create_dir(&second).unwrap();
        let link = dir.path().join("latest");

        assert!(update_trace_link(&link, &first).unwrap());
        assert_eq!(std::fs::read_link(&link).unwrap(), first.canonicalize().unwrap());
        assert!(update_trace_link(&link, &second).unwrap());
        assert_eq!(std::fs::read_link(&link).unwrap(), second.canonicalize().unwrap());

        let file = dir.path().join("plain");
        std::fs::write(&file, "keep").unwrap();
        assert!(!update_trace_link(&file, &first).unwrap());
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "keep");
    }
}
