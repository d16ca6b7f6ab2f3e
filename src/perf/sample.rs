//! Instruction pointer sampling through a perf ring buffer.

use std::os::fd::{AsRawFd, RawFd};

use anyhow::Result;

use crate::error::Error;
use crate::location::Location;

use super::event::CounterDescription;
use super::record::*;
use super::ring::{page_size, RingBuffer};
use super::sys::*;

/// Receives the records of a sample ring in the order the kernel wrote them.
pub trait RecordHandler {
    fn handle_sample(&mut self, sample: &SampleRecord) -> Result<()>;

    fn handle_mmap(&mut self, _mmap: &MmapRecord) -> Result<()> {
        Ok(())
    }

    fn handle_comm(&mut self, _comm: &CommRecord) -> Result<()> {
        Ok(())
    }

    fn handle_switch(&mut self, _switch: &SwitchRecord) -> Result<()> {
        Ok(())
    }

    fn handle_fork(&mut self, _task: &TaskRecord) -> Result<()> {
        Ok(())
    }

    fn handle_exit(&mut self, _task: &TaskRecord) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SampleOptions {
    pub event: CounterDescription,
    pub period: u64,
    pub call_graph: bool,
    pub exclude_kernel: bool,
    pub enable_on_exec: bool,
    pub use_clockid: bool,
    /// Ask for fork/exit and context switch records (CPU-wide monitors).
    pub track_tasks: bool,
    pub context_switch: bool,
    pub mmap_pages: usize,
}

pub struct SampleReader {
    file: PerfEventFile,
    ring: RingBuffer,
    parser: RecordParser,
    lost: u64,
    samples: u64,
}

impl SampleReader {
    pub fn open(location: Location, options: &SampleOptions) -> Result<Self, Error> {
        let mut sample_type = PERF_SAMPLE_IP | PERF_SAMPLE_TID | PERF_SAMPLE_TIME | PERF_SAMPLE_CPU;
        if options.call_graph {
            sample_type |= PERF_SAMPLE_CALLCHAIN;
        }

        let mut attr = options.event.attr();
        attr.sample.sample_period = options.period;
        attr.sample_type = sample_type;
        attr.flags.set_mmap(1);
        attr.flags.set_comm(1);
        attr.flags.set_comm_exec(1);
        attr.flags.set_sample_id_all(1);
        attr.flags.set_exclude_kernel(options.exclude_kernel as u64);
        attr.flags.set_exclude_callchain_kernel(options.exclude_kernel as u64);
        attr.flags.set_exclude_hv(1);
        if options.track_tasks {
            attr.flags.set_task(1);
        }
        if options.context_switch {
            attr.flags.set_context_switch(1);
        }
        if options.enable_on_exec {
            attr.flags.set_disabled(1);
            attr.flags.set_enable_on_exec(1);
        }
        if options.use_clockid {
            attr.flags.set_use_clockid(1);
            attr.clockid = libc::CLOCK_MONOTONIC;
        }
        // Wake up the monitor once the ring is half full.
        attr.flags.set_watermark(1);
        attr.wakeup.wakeup_watermark = (options.mmap_pages * page_size() / 2) as u32;

        let (pid, cpu) = location.perf_target();
        let file =
            perf_event_open(&attr, pid, cpu, -1, 0).map_err(|source| Error::CounterOpen {
                name: options.event.name.clone(),
                target: location.name(),
                source,
            })?;
        let ring =
            RingBuffer::map(&file, options.mmap_pages).map_err(|source| Error::CounterOpen {
                name: options.event.name.clone(),
                target: location.name(),
                source,
            })?;

        Ok(SampleReader {
            file,
            ring,
            parser: RecordParser::new(sample_type, true),
            lost: 0,
            samples: 0,
        })
    }

    /// Dispatches every pending record. Handler errors do not stop the drain;
    /// the first one is returned after all records are consumed.
    pub fn read<H: RecordHandler>(&mut self, handler: &mut H) -> Result<()> {
        let parser = self.parser;
        let mut lost = 0;
        let mut samples = 0;
        let mut first_error = None;

        self.ring.drain(|header, body| {
            let Some(record) = parser.parse(header, body) else {
                tracing::debug!("truncated perf record of type {}", header.type_);
                return;
            };
            let result = match &record {
                Record::Sample(sample) => {
                    samples += 1;
                    handler.handle_sample(sample)
                }
                Record::Mmap(mmap) => handler.handle_mmap(mmap),
                Record::Comm(comm) => handler.handle_comm(comm),
                Record::Switch(switch) => handler.handle_switch(switch),
                Record::Fork(task) => handler.handle_fork(task),
                Record::Exit(task) => handler.handle_exit(task),
                Record::Lost(n) => {
                    lost += n;
                    Ok(())
                }
                Record::Other(_) => Ok(()),
            };
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        });

        if lost > 0 {
            tracing::warn!("perf ring buffer overflow, {lost} records lost");
        }
        self.lost += lost;
        self.samples += samples;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stops the event and flushes what is left in the ring.
    pub fn end<H: RecordHandler>(&mut self, handler: &mut H) -> Result<()> {
        if let Err(e) = self.file.disable() {
            tracing::debug!("failed to disable sampling event: {e}");
        }
        self.read(handler)
    }

    pub fn lost_count(&self) -> u64 {
        self.lost
    }

    pub fn sample_count(&self) -> u64 {
        self.samples
    }

    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}
