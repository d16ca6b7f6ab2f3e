//! Producers of events: threads and CPUs.

use std::fmt;

use serde::Serialize;

/// Process id used for threads whose parent process is not known.
pub const NO_PARENT_PROCESS_PID: libc::pid_t = -1;

/// Synthetic pid that owns the location group of non-unique metric writers.
pub const METRIC_PID: libc::pid_t = 0;

/// Ordering of the variants is significant: locations sort by kind first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationKind {
    Thread,
    Cpu,
    SampleCpu,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Location {
    pub kind: LocationKind,
    pub id: i64,
}

impl Location {
    pub fn thread(tid: libc::pid_t) -> Self {
        Location {
            kind: LocationKind::Thread,
            id: tid as i64,
        }
    }

    pub fn cpu(cpu: u32) -> Self {
        Location {
            kind: LocationKind::Cpu,
            id: cpu as i64,
        }
    }

    pub fn sample_cpu(cpu: u32) -> Self {
        Location {
            kind: LocationKind::SampleCpu,
            id: cpu as i64,
        }
    }

    /// Arguments for `perf_event_open`: (pid, cpu).
    pub fn perf_target(&self) -> (libc::pid_t, libc::c_int) {
        match self.kind {
            LocationKind::Thread => (self.id as libc::pid_t, -1),
            LocationKind::Cpu | LocationKind::SampleCpu => (-1, self.id as libc::c_int),
            LocationKind::Unknown => (-1, -1),
        }
    }

    pub fn tid(&self) -> Option<libc::pid_t> {
        match self.kind {
            LocationKind::Thread => Some(self.id as libc::pid_t),
            _ => None,
        }
    }

    pub fn cpuid(&self) -> Option<u32> {
        match self.kind {
            LocationKind::Cpu | LocationKind::SampleCpu => Some(self.id as u32),
            _ => None,
        }
    }

    pub fn name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            LocationKind::Thread => write!(f, "thread {}", self.id),
            LocationKind::Cpu => write!(f, "cpu {}", self.id),
            LocationKind::SampleCpu => write!(f, "sample cpu {}", self.id),
            LocationKind::Unknown => write!(f, "unknown location"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_ordering() {
        let mut locations = vec![
            Location::sample_cpu(0),
            Location::cpu(2),
            Location::thread(100),
            Location::cpu(1),
            Location::thread(5),
        ];
        locations.sort();
        assert_eq!(
            locations,
            vec![
                Location::thread(5),
                Location::thread(100),
                Location::cpu(1),
                Location::cpu(2),
                Location::sample_cpu(0),
            ]
        );
    }

    #[test]
    fn test_location_equality_needs_kind_and_id() {
        assert_eq!(Location::cpu(3), Location::cpu(3));
        assert_ne!(Location::cpu(3), Location::sample_cpu(3));
        assert_ne!(Location::thread(3), Location::cpu(3));
    }

    #[test]
    fn test_perf_target() {
        assert_eq!(Location::thread(42).perf_target(), (42, -1));
        assert_eq!(Location::cpu(7).perf_target(), (-1, 7));
        assert_eq!(Location::sample_cpu(7).perf_target(), (-1, 7));
    }

    #[test]
    fn test_location_names() {
        assert_eq!(Location::thread(12).name(), "thread 12");
        assert_eq!(Location::cpu(0).name(), "cpu 0");
        assert_eq!(Location::sample_cpu(1).name(), "sample cpu 1");
    }

    #[test]
    fn test_unknown_location_targets_nothing() {
        let unknown = Location {
            kind: LocationKind::Unknown,
            id: -1,
        };
        assert_eq!(unknown.perf_target(), (-1, -1));
        assert_eq!(unknown.tid(), None);
        assert_eq!(unknown.cpuid(), None);
        assert!(unknown > Location::sample_cpu(u32::MAX));
    }
}
