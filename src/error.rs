use std::io;
use std::path::PathBuf;

/// Errors callers are expected to match on. Everything else travels as
/// `anyhow::Error` with context attached.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to open counter {name} for {target}: {source}")]
    CounterOpen {
        name: String,
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to read counter {name}: {source}")]
    CounterRead {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("no {kind} definition for key {key}")]
    MissingDefinition { kind: &'static str, key: String },

    #[error("{kind} definition for key {key} already exists")]
    DuplicateDefinition { kind: &'static str, key: String },

    #[error("counter frame holds {actual} values, expected {expected}")]
    MalformedFrame { expected: usize, actual: usize },

    #[error("timer setup failed: {0}")]
    Timer(#[source] io::Error),

    #[error("failed to pin monitor for {location}: {source}")]
    Affinity {
        location: String,
        #[source]
        source: nix::Error,
    },

    #[error("trace archive error at {}: {source}", path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// True when the target of a counter went away before we could attach.
    pub fn is_vanished_target(&self) -> bool {
        matches!(
            self,
            Error::CounterOpen { source, .. } if source.raw_os_error() == Some(libc::ESRCH)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vanished_target() {
        let err = Error::CounterOpen {
            name: "instructions".into(),
            target: "thread 42".into(),
            source: io::Error::from_raw_os_error(libc::ESRCH),
        };
        assert!(err.is_vanished_target());
        assert!(err.to_string().contains("thread 42"));

        let err = Error::CounterOpen {
            name: "instructions".into(),
            target: "cpu 0".into(),
            source: io::Error::from_raw_os_error(libc::EACCES),
        };
        assert!(!err.is_vanished_target());
    }
}
