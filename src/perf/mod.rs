//! Kernel performance events: counters, counter groups and sample rings.

pub mod counter;
pub mod event;
pub mod record;
pub mod ring;
pub mod sample;
pub mod sys;

pub use counter::{CounterBuffer, PerfCounter, PerfCounterGroup, ReadFrame};
pub use event::{CounterDescription, EventCatalog, EventCollection};
pub use sample::{RecordHandler, SampleOptions, SampleReader};

/// Kernels before 4.3 lack PERF_RECORD_SWITCH and `comm_exec`.
pub fn has_native_context_switch() -> bool {
    match sysinfo::System::kernel_version() {
        Some(version) => kernel_at_least(&version, 4, 3),
        None => false,
    }
}

fn kernel_at_least(version: &str, major: u64, minor: u64) -> bool {
    let mut parts = version
        .split(|c: char| !c.is_ascii_digit())
        .filter(|p| !p.is_empty())
        .map(|p| p.parse::<u64>().unwrap_or(0));
    let found_major = parts.next().unwrap_or(0);
    let found_minor = parts.next().unwrap_or(0);
    (found_major, found_minor) >= (major, minor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_version_compare() {
        assert!(kernel_at_least("6.8.0-45-generic", 4, 3));
        assert!(kernel_at_least("4.3", 4, 3));
        assert!(!kernel_at_least("4.2.8", 4, 3));
        assert!(!kernel_at_least("3.19.0", 4, 3));
        assert!(kernel_at_least("10.0", 4, 3));
    }
}
