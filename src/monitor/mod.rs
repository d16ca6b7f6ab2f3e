//! Per-location acquisition threads.
//!
//! Every monitor runs [`run`] on its own thread: a poll loop over a periodic
//! timer, the shared stop signal and whatever descriptors the monitor adds.

pub mod location;
pub mod shutdown;
pub mod supervisor;
pub mod timer;

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

pub use location::{LocationMonitor, SampleWriter};
pub use shutdown::ShutdownSignal;
pub use supervisor::{MonitorSupervisor, SupervisorEvent, SupervisorSummary};
pub use timer::TimerFd;

use crate::config::Config;
use crate::location::Location;
use crate::mmap::ProcessMap;
use crate::perf::{CounterDescription, EventCollection};
use crate::time::TimeConverter;
use crate::trace::Trace;

/// What every monitor of a recording shares.
pub struct MonitorContext {
    pub config: Config,
    pub trace: Arc<Trace>,
    pub processes: Arc<ProcessMap>,
    pub time: TimeConverter,
    /// Event driving instruction sampling, `None` when sampling is off
    pub sampling_event: Option<CounterDescription>,
    pub group_events: Option<EventCollection>,
    pub safe_events: Vec<CounterDescription>,
    /// Kernel emits PERF_RECORD_SWITCH
    pub native_switch: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// The stop signal arrived.
    Stopped,
    /// The monitored thread went away.
    TargetExited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorStats {
    pub location: Location,
    pub outcome: MonitorOutcome,
    pub samples: u64,
    pub lost: u64,
    pub events: u64,
}

impl MonitorStats {
    pub fn new(location: Location) -> Self {
        MonitorStats {
            location,
            outcome: MonitorOutcome::Stopped,
            samples: 0,
            lost: 0,
            events: 0,
        }
    }
}

pub trait PollMonitor {
    fn location(&self) -> Location;

    /// Runs on the monitor thread before the first poll.
    fn initialize_thread(&mut self) -> Result<()>;

    /// Runs on the monitor thread after the loop, whatever ended it.
    fn finalize_thread(&mut self) -> Result<MonitorStats>;

    /// Periodic read, and one final read when the stop signal arrives.
    fn on_tick(&mut self) -> Result<()>;

    /// Descriptors polled besides the timer and the stop signal.
    fn poll_fds(&self) -> Vec<RawFd> {
        Vec::new()
    }

    fn on_ready(&mut self, _fd: RawFd) -> Result<()> {
        Ok(())
    }

    /// `fd` hung up and is no longer polled. Returns true when the monitor
    /// has nothing left to observe.
    fn on_hangup(&mut self, _fd: RawFd) -> bool {
        true
    }

    /// Checked after every wake-up.
    fn is_finished(&self) -> bool {
        false
    }
}

fn poll_loop<M: PollMonitor + ?Sized>(
    monitor: &mut M,
    timer: &TimerFd,
    stop: &ShutdownSignal,
) -> Result<MonitorOutcome> {
    const TIMER: usize = 0;
    const STOP: usize = 1;

    let mut fds: Vec<libc::pollfd> = [timer.fd(), stop.fd()]
        .into_iter()
        .chain(monitor.poll_fds())
        .map(|fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();

    loop {
        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err).context("poll failed");
        }

        if fds[TIMER].revents & libc::POLLIN != 0 {
            timer.read()?;
            monitor.on_tick()?;
        }

        let mut exhausted = false;
        for pfd in fds[STOP + 1..].iter_mut() {
            if pfd.revents & libc::POLLIN != 0 {
                monitor.on_ready(pfd.fd)?;
            }
            if pfd.revents & (libc::POLLHUP | libc::POLLERR) != 0 {
                tracing::debug!("{}: descriptor {} hung up", monitor.location(), pfd.fd);
                exhausted |= monitor.on_hangup(pfd.fd);
                // Negative descriptors are skipped by poll.
                pfd.fd = -1;
            }
        }

        if fds[STOP].revents & libc::POLLIN != 0 {
            monitor.on_tick()?;
            return Ok(MonitorOutcome::Stopped);
        }
        if exhausted || monitor.is_finished() {
            return Ok(MonitorOutcome::TargetExited);
        }
    }
}

/// Drives `monitor` until the stop signal or until its target is gone.
/// `finalize_thread` runs on every path, so captured data is always flushed.
pub fn run<M: PollMonitor + ?Sized>(
    monitor: &mut M,
    interval: Duration,
    stop: &ShutdownSignal,
) -> Result<MonitorStats> {
    let outcome = monitor.initialize_thread().and_then(|_| {
        let timer = TimerFd::new(interval)?;
        poll_loop(monitor, &timer, stop)
    });
    let stats = monitor.finalize_thread();
    let outcome = outcome?;
    let mut stats = stats?;
    stats.outcome = outcome;
    Ok(stats)
}
