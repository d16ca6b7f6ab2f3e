//! Counter reads and multiplexing correction.

use std::os::fd::{AsRawFd, RawFd};

use crate::error::{Error, Result};
use crate::location::Location;

use super::event::{CounterDescription, EventCollection};
use super::record::{Record, RecordParser};
use super::ring::RingBuffer;
use super::sys::*;

const FRAME_HEADER: usize = 3;

/// View over one group read: `{nr, time_enabled, time_running, values[nr]}`.
#[derive(Debug, Clone, Copy)]
pub struct ReadFrame<'a> {
    words: &'a [u64],
}

impl<'a> ReadFrame<'a> {
    pub fn new(words: &'a [u64]) -> Result<Self> {
        let nr = words.first().copied().unwrap_or(0) as usize;
        if words.len() < FRAME_HEADER + nr {
            return Err(Error::MalformedFrame {
                expected: nr,
                actual: words.len().saturating_sub(FRAME_HEADER),
            });
        }
        Ok(ReadFrame {
            words: &words[..FRAME_HEADER + nr],
        })
    }

    pub fn nr(&self) -> usize {
        self.words[0] as usize
    }

    pub fn time_enabled(&self) -> u64 {
        self.words[1]
    }

    pub fn time_running(&self) -> u64 {
        self.words[2]
    }

    pub fn values(&self) -> &'a [u64] {
        &self.words[FRAME_HEADER..]
    }
}

/// Scales a counter delta for the time the counter was multiplexed out.
/// Which of `running`/`enabled` is larger is not trusted, some kernels swap
/// them, so the scale is always max/min and never shrinks `value`.
pub fn scale(value: f64, running: u64, enabled: u64) -> f64 {
    if running == 0 || running == enabled {
        return value;
    }
    let max = running.max(enabled) as f64;
    let min = running.min(enabled) as f64;
    value * max / min
}

/// Previous and current frame of a counter group stored back to back in one
/// allocation, plus the running totals.
#[derive(Debug, Clone)]
pub struct CounterBuffer {
    frames: Box<[u64]>,
    current: usize,
    previous: usize,
    initialized: bool,
    accumulated: Vec<f64>,
}

impl CounterBuffer {
    pub fn new(ncounters: usize) -> Self {
        let frame_len = FRAME_HEADER + ncounters;
        let mut frames = vec![0u64; 2 * frame_len].into_boxed_slice();
        frames[0] = ncounters as u64;
        frames[frame_len] = ncounters as u64;
        CounterBuffer {
            frames,
            current: 0,
            previous: frame_len,
            initialized: false,
            accumulated: vec![0.0; ncounters],
        }
    }

    pub fn len(&self) -> usize {
        self.accumulated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accumulated.is_empty()
    }

    fn frame_len(&self) -> usize {
        FRAME_HEADER + self.len()
    }

    fn frame(&self, offset: usize) -> &[u64] {
        &self.frames[offset..offset + self.frame_len()]
    }

    /// Takes a new frame, accumulating scaled deltas against the previous one.
    /// The first frame only establishes the baseline.
    pub fn read(&mut self, frame: &ReadFrame<'_>) -> Result<()> {
        if frame.nr() != self.len() {
            return Err(Error::MalformedFrame {
                expected: self.len(),
                actual: frame.nr(),
            });
        }
        let frame_len = self.frame_len();
        self.frames[self.current..self.current + frame_len].copy_from_slice(frame.words);

        if !self.initialized {
            self.frames
                .copy_within(self.current..self.current + frame_len, self.previous);
            self.initialized = true;
        } else {
            let current = self.frame(self.current);
            let previous = self.frame(self.previous);
            let running = current[2].saturating_sub(previous[2]);
            let enabled = current[1].saturating_sub(previous[1]);
            let deltas: Vec<f64> = if current[2] == 0 {
                vec![0.0; self.len()]
            } else {
                current[FRAME_HEADER..]
                    .iter()
                    .zip(&previous[FRAME_HEADER..])
                    .map(|(cur, prev)| scale(cur.saturating_sub(*prev) as f64, running, enabled))
                    .collect()
            };
            for (total, delta) in self.accumulated.iter_mut().zip(deltas) {
                *total += delta;
            }
        }

        std::mem::swap(&mut self.current, &mut self.previous);
        Ok(())
    }

    pub fn enabled(&self) -> u64 {
        self.frame(self.previous)[1]
    }

    pub fn running(&self) -> u64 {
        self.frame(self.previous)[2]
    }

    pub fn accumulated(&self) -> &[f64] {
        &self.accumulated
    }

    pub fn get(&self, index: usize) -> f64 {
        self.accumulated[index]
    }
}

fn counter_attr(description: &CounterDescription, exclude_kernel: bool) -> perf_event_attr {
    let mut attr = description.attr();
    attr.flags.set_exclude_kernel(exclude_kernel as u64);
    attr.flags.set_exclude_hv(1);
    attr
}

fn open_counter(
    description: &CounterDescription,
    attr: &perf_event_attr,
    location: Location,
    group_fd: RawFd,
) -> Result<PerfEventFile> {
    let (pid, cpu) = location.perf_target();
    perf_event_open(attr, pid, cpu, group_fd, 0).map_err(|source| Error::CounterOpen {
        name: description.name.clone(),
        target: location.name(),
        source,
    })
}

/// A single counter read on its own, for events that refuse to be grouped.
pub struct PerfCounter {
    file: PerfEventFile,
    buffer: CounterBuffer,
    description: CounterDescription,
}

impl PerfCounter {
    pub fn open(
        description: &CounterDescription,
        location: Location,
        enable_on_exec: bool,
        exclude_kernel: bool,
    ) -> Result<Self> {
        let mut attr = counter_attr(description, exclude_kernel);
        attr.read_format = PERF_FORMAT_TOTAL_TIME_ENABLED | PERF_FORMAT_TOTAL_TIME_RUNNING;
        if enable_on_exec {
            attr.flags.set_disabled(1);
            attr.flags.set_enable_on_exec(1);
        }
        let file = open_counter(description, &attr, location, -1)?;
        Ok(PerfCounter {
            file,
            buffer: CounterBuffer::new(1),
            description: description.clone(),
        })
    }

    /// Reads `{value, time_enabled, time_running}` and returns the scaled total.
    pub fn read(&mut self) -> Result<f64> {
        let mut raw = [0u64; 3];
        self.file
            .read_words(&mut raw)
            .map_err(|source| Error::CounterRead {
                name: self.description.name.clone(),
                source,
            })?;
        let words = [1, raw[1], raw[2], raw[0]];
        self.buffer.read(&ReadFrame::new(&words)?)?;
        Ok(self.buffer.get(0) * self.description.scale)
    }

    pub fn buffer(&self) -> &CounterBuffer {
        &self.buffer
    }
}

/// Leader and members opened as one group. Dropping the group closes every
/// descriptor; a failed open drops the ones already opened.
pub struct PerfCounterGroup {
    leader: PerfEventFile,
    leader_name: String,
    _members: Vec<PerfEventFile>,
    buffer: CounterBuffer,
    scales: Vec<f64>,
    ring: Option<(RingBuffer, RecordParser)>,
    frame: Vec<u64>,
}

impl PerfCounterGroup {
    /// Opens the group for `location`. With `sample_period` the leader samples
    /// the whole group into its own ring buffer instead of being read on timer
    /// ticks.
    pub fn open(
        events: &EventCollection,
        location: Location,
        enable_on_exec: bool,
        exclude_kernel: bool,
        sample_period: Option<u64>,
        mmap_pages: usize,
        use_clockid: bool,
    ) -> Result<Self> {
        let read_format =
            PERF_FORMAT_GROUP | PERF_FORMAT_TOTAL_TIME_ENABLED | PERF_FORMAT_TOTAL_TIME_RUNNING;

        let mut attr = counter_attr(&events.leader, exclude_kernel);
        attr.read_format = read_format;
        if enable_on_exec {
            attr.flags.set_disabled(1);
            attr.flags.set_enable_on_exec(1);
        }
        let sample_type = PERF_SAMPLE_TIME | PERF_SAMPLE_READ;
        if let Some(period) = sample_period {
            attr.sample.sample_period = period;
            attr.sample_type = sample_type;
            attr.wakeup.wakeup_events = 1;
            if use_clockid {
                attr.flags.set_use_clockid(1);
                attr.clockid = libc::CLOCK_MONOTONIC;
            }
        }
        let leader = open_counter(&events.leader, &attr, location, -1)?;

        let mut members = Vec::with_capacity(events.counters.len());
        for description in &events.counters {
            let mut attr = counter_attr(description, exclude_kernel);
            attr.read_format = read_format;
            members.push(open_counter(
                description,
                &attr,
                location,
                leader.as_raw_fd(),
            )?);
        }

        let ring = match sample_period {
            Some(_) => {
                let ring = RingBuffer::map(&leader, mmap_pages).map_err(|source| {
                    Error::CounterOpen {
                        name: events.leader.name.clone(),
                        target: location.name(),
                        source,
                    }
                })?;
                Some((ring, RecordParser::new(sample_type, false)))
            }
            None => None,
        };

        Ok(PerfCounterGroup {
            leader,
            leader_name: events.leader.name.clone(),
            _members: members,
            buffer: CounterBuffer::new(events.len()),
            scales: events.iter().map(|c| c.scale).collect(),
            ring,
            frame: vec![0; FRAME_HEADER + events.len()],
        })
    }

    /// Descriptor to poll when the leader samples, `None` for timer reads.
    pub fn poll_fd(&self) -> Option<RawFd> {
        self.ring.as_ref().map(|_| self.leader.as_raw_fd())
    }

    pub fn is_sampling(&self) -> bool {
        self.ring.is_some()
    }

    pub fn read(&mut self) -> Result<()> {
        let n = self
            .leader
            .read_words(&mut self.frame)
            .map_err(|source| Error::CounterRead {
                name: self.leader_name.clone(),
                source,
            })?;
        let frame = ReadFrame::new(&self.frame[..n / 8])?;
        self.buffer.read(&frame)
    }

    /// Feeds every sampled frame in the leader's ring buffer through the
    /// counter buffer and reports it with its raw kernel timestamp.
    pub fn read_samples<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(u64, &Self),
    {
        let Some((mut ring, parser)) = self.ring.take() else {
            return Ok(());
        };
        let mut frames = Vec::new();
        ring.drain(|header, body| {
            if let Some(Record::Sample(sample)) = parser.parse(header, body) {
                frames.push((sample.time, sample.read));
            }
        });
        self.ring = Some((ring, parser));

        for (time, words) in frames {
            self.buffer.read(&ReadFrame::new(&words)?)?;
            f(time, self);
        }
        Ok(())
    }

    pub fn buffer(&self) -> &CounterBuffer {
        &self.buffer
    }

    /// Accumulated values with each event's sysfs scale applied.
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.buffer
            .accumulated()
            .iter()
            .zip(&self.scales)
            .map(|(value, scale)| value * scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(enabled: u64, running: u64, values: &[u64]) -> Vec<u64> {
        let mut words = vec![values.len() as u64, enabled, running];
        words.extend_from_slice(values);
        words
    }

    fn read(buffer: &mut CounterBuffer, words: &[u64]) {
        buffer.read(&ReadFrame::new(words).unwrap()).unwrap();
    }

    #[test]
    fn test_first_read_contributes_zero() {
        let mut buffer = CounterBuffer::new(2);
        read(&mut buffer, &frame(1000, 1000, &[500, 700]));
        assert_eq!(buffer.accumulated(), &[0.0, 0.0]);
        assert_eq!(buffer.enabled(), 1000);
        assert_eq!(buffer.running(), 1000);
    }

    #[test]
    fn test_unscaled_delta_is_exact() {
        let mut buffer = CounterBuffer::new(1);
        read(&mut buffer, &frame(100, 100, &[40]));
        read(&mut buffer, &frame(350, 350, &[40 + 12345]));
        assert_eq!(buffer.get(0), 12345.0);
        assert_eq!(buffer.enabled(), 350);
    }

    #[test]
    fn test_scale_multiplexed_counter() {
        let mut buffer = CounterBuffer::new(1);
        read(&mut buffer, &frame(1000, 1000, &[100]));
        read(&mut buffer, &frame(2000, 1500, &[200]));
        assert_eq!(buffer.get(0), 200.0);
    }

    #[test]
    fn test_scale_swapped_fields() {
        let mut buffer = CounterBuffer::new(1);
        read(&mut buffer, &frame(1000, 2000, &[0]));
        read(&mut buffer, &frame(1500, 3000, &[10]));
        assert_eq!(buffer.get(0), 20.0);
    }

    #[test]
    fn test_scale_never_shrinks() {
        assert_eq!(scale(10.0, 0, 100), 10.0);
        assert_eq!(scale(10.0, 100, 100), 10.0);
        for (running, enabled) in [(1, 100), (100, 1), (7, 9), (9, 7)] {
            assert!(scale(10.0, running, enabled) >= 10.0);
        }
    }

    #[test]
    fn test_zero_running_contributes_zero() {
        let mut buffer = CounterBuffer::new(1);
        read(&mut buffer, &frame(0, 0, &[0]));
        read(&mut buffer, &frame(1000, 0, &[0]));
        assert_eq!(buffer.get(0), 0.0);
    }

    #[test]
    fn test_accumulated_is_monotonic() {
        let mut buffer = CounterBuffer::new(2);
        let mut last = vec![0.0, 0.0];
        let mut value = 0;
        for step in 1..50u64 {
            value += step * 3;
            let running = step * 100;
            let enabled = running + step * 7;
            read(&mut buffer, &frame(enabled, running, &[value, value / 2]));
            for (i, total) in buffer.accumulated().iter().enumerate() {
                assert!(*total >= last[i]);
                last[i] = *total;
            }
        }
    }

    #[test]
    fn test_nr_mismatch_is_an_error() {
        let mut buffer = CounterBuffer::new(2);
        let words = frame(1, 1, &[1]);
        let result = buffer.read(&ReadFrame::new(&words).unwrap());
        assert!(matches!(
            result,
            Err(Error::MalformedFrame {
                expected: 2,
                actual: 1
            })
        ));
        assert!(ReadFrame::new(&[3, 0, 0, 1]).is_err());
    }
}
