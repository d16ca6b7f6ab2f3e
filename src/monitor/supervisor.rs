//! Owns the monitor threads and decides what a failing monitor means for
//! the rest of the recording.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};

use super::{LocationMonitor, MonitorContext, MonitorStats, PollMonitor, ShutdownSignal};
use crate::error::Error;
use crate::location::Location;

/// Everything the main thread waits for.
#[derive(Debug)]
pub enum SupervisorEvent {
    /// Ctrl-C
    Interrupted,
    /// The traced command exited with this status.
    ChildExited(i32),
    DurationElapsed,
    MonitorExit {
        location: Location,
        result: Result<MonitorStats>,
    },
}

#[derive(Debug, Default)]
pub struct SupervisorSummary {
    pub stats: Vec<MonitorStats>,
    pub failures: usize,
}

impl SupervisorSummary {
    pub fn samples(&self) -> u64 {
        self.stats.iter().map(|s| s.samples).sum()
    }

    pub fn lost(&self) -> u64 {
        self.stats.iter().map(|s| s.lost).sum()
    }

    pub fn events(&self) -> u64 {
        self.stats.iter().map(|s| s.events).sum()
    }
}

pub struct MonitorSupervisor {
    ctx: Arc<MonitorContext>,
    stop: Arc<ShutdownSignal>,
    events: Sender<SupervisorEvent>,
    handles: BTreeMap<Location, JoinHandle<()>>,
    summary: SupervisorSummary,
}

impl MonitorSupervisor {
    pub fn new(ctx: Arc<MonitorContext>, events: Sender<SupervisorEvent>) -> Result<Self> {
        let stop = ShutdownSignal::new().context("creating monitor stop signal")?;
        Ok(MonitorSupervisor {
            ctx,
            stop: Arc::new(stop),
            events,
            handles: BTreeMap::new(),
            summary: SupervisorSummary::default(),
        })
    }

    pub fn is_monitored(&self, location: Location) -> bool {
        self.handles.contains_key(&location)
    }

    pub fn running(&self) -> usize {
        self.handles.len()
    }

    /// Opens the events of `location` and starts its monitor thread.
    /// Returns false when the location is already monitored or its thread
    /// exited before the events could be attached.
    pub fn spawn(&mut self, location: Location, enable_on_exec: bool) -> Result<bool> {
        if self.is_monitored(location) {
            return Ok(false);
        }
        let monitor = match LocationMonitor::open(self.ctx.clone(), location, enable_on_exec) {
            Ok(monitor) => monitor,
            Err(e) if e.downcast_ref::<Error>().is_some_and(Error::is_vanished_target) => {
                tracing::debug!("{location} exited before it could be monitored");
                return Ok(false);
            }
            Err(e) => return Err(e.context(format!("opening monitor for {location}"))),
        };

        self.start(location, monitor)?;
        Ok(true)
    }

    /// Runs `monitor` on a thread of its own. The exit is always reported,
    /// a panic as a failure.
    fn start<M>(&mut self, location: Location, mut monitor: M) -> Result<()>
    where
        M: PollMonitor + Send + 'static,
    {
        let interval = self.ctx.config.read_interval;
        let stop = self.stop.clone();
        let events = self.events.clone();
        let handle = thread::Builder::new()
            .name(format!("lo2s {location}"))
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    super::run(&mut monitor, interval, &stop)
                }))
                .unwrap_or_else(|_| Err(anyhow!("monitor for {location} panicked")));
                let _ = events.send(SupervisorEvent::MonitorExit { location, result });
            })
            .with_context(|| format!("spawning monitor thread for {location}"))?;
        tracing::debug!("Started monitor for {location}");
        self.handles.insert(location, handle);
        Ok(())
    }

    /// Books the exit of one monitor. Returns true when the whole recording
    /// has to stop.
    pub fn monitor_exited(&mut self, location: Location, result: Result<MonitorStats>) -> bool {
        if let Some(handle) = self.handles.remove(&location) {
            if handle.join().is_err() {
                tracing::error!("monitor thread for {location} panicked");
            }
        }
        match result {
            Ok(stats) => {
                tracing::debug!("monitor for {location} finished: {:?}", stats.outcome);
                self.summary.stats.push(stats);
                false
            }
            Err(e) => {
                tracing::error!("monitor for {location} failed: {e:#}");
                self.summary.failures += 1;
                !self.ctx.config.keep_going
            }
        }
    }

    pub fn stop(&self) {
        self.stop.signal();
    }

    /// Stops every monitor, waits for them and collects what they reported.
    /// Other events still queued are dropped.
    pub fn join_all(mut self, events: &Receiver<SupervisorEvent>) -> SupervisorSummary {
        self.stop();
        while !self.handles.is_empty() {
            match events.recv() {
                Ok(SupervisorEvent::MonitorExit { location, result }) => {
                    self.monitor_exited(location, result);
                }
                Ok(other) => tracing::trace!("ignoring {other:?} during shutdown"),
                Err(_) => break,
            }
        }
        for (location, handle) in std::mem::take(&mut self.handles) {
            if handle.join().is_err() {
                tracing::error!("monitor thread for {location} panicked");
            }
        }
        self.summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::mmap::ProcessMap;
    use crate::monitor::MonitorOutcome;
    use crate::time::TimeConverter;
    use crate::trace::{Trace, TraceOptions};
    use std::sync::mpsc;
    use tempfile::TempDir;

    fn context(dir: &TempDir, keep_going: bool) -> Arc<MonitorContext> {
        Arc::new(MonitorContext {
            config: Config {
                keep_going,
                ..Config::default()
            },
            trace: Arc::new(
                Trace::new(&dir.path().join("trace"), TraceOptions::default()).unwrap(),
            ),
            processes: Arc::new(ProcessMap::new()),
            time: TimeConverter::identity(),
            sampling_event: None,
            group_events: None,
            safe_events: Vec::new(),
            native_switch: true,
        })
    }

    #[test]
    fn test_failure_stops_the_world() {
        let dir = TempDir::new().unwrap();
        let (tx, _rx) = mpsc::channel();
        let mut supervisor = MonitorSupervisor::new(context(&dir, false), tx).unwrap();

        let stats = MonitorStats {
            samples: 7,
            lost: 1,
            outcome: MonitorOutcome::TargetExited,
            ..MonitorStats::new(Location::thread(5))
        };
        assert!(!supervisor.monitor_exited(Location::thread(5), Ok(stats)));
        assert!(supervisor.monitor_exited(Location::thread(6), Err(anyhow::anyhow!("boom"))));

        let (_tx, rx) = mpsc::channel();
        let summary = supervisor.join_all(&rx);
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.samples(), 7);
        assert_eq!(summary.lost(), 1);
    }

    struct PanickingMonitor;

    impl PollMonitor for PanickingMonitor {
        fn location(&self) -> Location {
            Location::thread(9)
        }

        fn initialize_thread(&mut self) -> Result<()> {
            Ok(())
        }

        fn finalize_thread(&mut self) -> Result<MonitorStats> {
            Ok(MonitorStats::new(self.location()))
        }

        fn on_tick(&mut self) -> Result<()> {
            panic!("tick failed");
        }
    }

    #[test]
    fn test_panicking_monitor_is_reported() {
        let dir = TempDir::new().unwrap();
        let (tx, rx) = mpsc::channel();
        let mut supervisor = MonitorSupervisor::new(context(&dir, true), tx).unwrap();
        supervisor.start(Location::thread(9), PanickingMonitor).unwrap();

        let summary = supervisor.join_all(&rx);
        assert_eq!(summary.failures, 1);
        assert!(summary.stats.is_empty());
    }

    #[test]
    fn test_keep_going_tolerates_failure() {
        let dir = TempDir::new().unwrap();
        let (tx, _rx) = mpsc::channel();
        let mut supervisor = MonitorSupervisor::new(context(&dir, true), tx).unwrap();
        assert!(!supervisor.monitor_exited(Location::cpu(0), Err(anyhow::anyhow!("boom"))));
        assert_eq!(supervisor.running(), 0);
    }
}
