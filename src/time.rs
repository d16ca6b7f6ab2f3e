//! Trace timestamps and conversion from perf's clock.

use std::fmt;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;

use crate::perf::record::{Record, RecordParser};
use crate::perf::ring::RingBuffer;
use crate::perf::sys::*;

/// Nanoseconds on CLOCK_MONOTONIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn saturating_sub(self, other: Timestamp) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn get_clock_value(clock_id: libc::c_int) -> u64 {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    if unsafe { libc::clock_gettime(clock_id, &mut ts) } != 0 {
        return 0;
    }
    (ts.tv_sec as u64 * 1_000_000_000) + ts.tv_nsec as u64
}

pub fn now() -> Timestamp {
    Timestamp(get_clock_value(libc::CLOCK_MONOTONIC))
}

/// Maps raw perf timestamps onto the trace clock with a single offset taken
/// when recording starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeConverter {
    offset: i64,
}

impl TimeConverter {
    pub fn identity() -> Self {
        TimeConverter { offset: 0 }
    }

    pub fn with_offset(offset: i64) -> Self {
        TimeConverter { offset }
    }

    /// With `use_clockid` perf already reports CLOCK_MONOTONIC. Otherwise the
    /// offset between perf's clock and ours is measured once.
    pub fn calibrate(use_clockid: bool) -> Result<Self> {
        if use_clockid {
            return Ok(Self::identity());
        }
        let offset = measure_perf_clock_offset().context("calibrating perf clock")?;
        tracing::info!("perf clock offset is {offset} ns");
        Ok(Self::with_offset(offset))
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn convert(&self, raw: u64) -> Timestamp {
        Timestamp((raw as i64).saturating_add(self.offset).max(0) as u64)
    }
}

/// Opens a short cpu-clock sampling event on the calling thread and brackets
/// its first sample between two reads of our clock.
fn measure_perf_clock_offset() -> Result<i64> {
    let mut attr = perf_event_attr::new(PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CPU_CLOCK);
    attr.sample.sample_period = 10_000;
    attr.sample_type = PERF_SAMPLE_TIME;
    attr.flags.set_exclude_kernel(1);
    attr.flags.set_exclude_hv(1);
    attr.wakeup.wakeup_events = 1;

    let file = perf_event_open(&attr, 0, -1, -1, 0)?;
    let mut ring = RingBuffer::map(&file, 1)?;
    let parser = RecordParser::new(PERF_SAMPLE_TIME, false);

    let deadline = get_clock_value(libc::CLOCK_MONOTONIC) + Duration::from_secs(1).as_nanos() as u64;
    let mut before = get_clock_value(libc::CLOCK_MONOTONIC);
    loop {
        let after = get_clock_value(libc::CLOCK_MONOTONIC);
        if ring.has_data() {
            let mut sample_time = None;
            ring.drain(|header, body| {
                if let Some(Record::Sample(sample)) = parser.parse(header, body) {
                    sample_time.get_or_insert(sample.time);
                }
            });
            if let Some(time) = sample_time {
                let midpoint = before / 2 + after / 2;
                return Ok(midpoint as i64 - time as i64);
            }
        }
        if after > deadline {
            bail!("no calibration sample within one second");
        }
        before = after;
    }
}
