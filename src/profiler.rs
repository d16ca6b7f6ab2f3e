//! One recording from setup to the finished trace.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::config::{Config, MonitorMode};
use crate::location::{Location, NO_PARENT_PROCESS_PID};
use crate::mmap::ProcessMap;
use crate::monitor::{MonitorContext, MonitorSupervisor, SupervisorEvent, SupervisorSummary};
use crate::perf::{has_native_context_switch, CounterDescription, EventCatalog, EventCollection};
use crate::process::{self, Uname};
use crate::time::TimeConverter;
use crate::topology::Topology;
use crate::trace::name::{self, NameContext, OUTPUT_LINK_ENV};
use crate::trace::{MetricSpec, Trace, TraceOptions};
use crate::traced_command::TracedCommand;

/// How long an interrupted command may take to exit before it is killed.
const COMMAND_GRACE: Duration = Duration::from_secs(5);

/// Refuses setups `kernel.perf_event_paranoid` will reject anyway and warns
/// about the ones it degrades.
pub fn check_perf_paranoid(paranoid: i64, config: &Config, privileged: bool) -> Result<()> {
    if privileged {
        return Ok(());
    }
    if config.mode == MonitorMode::System && paranoid > 0 {
        bail!(
            "system mode needs kernel.perf_event_paranoid <= 0 (currently {paranoid}) or root"
        );
    }
    if paranoid > 1 && !config.exclude_kernel {
        tracing::warn!(
            "kernel.perf_event_paranoid is {paranoid}, kernel samples will be refused; use --exclude-kernel"
        );
    }
    if paranoid > 2 {
        tracing::warn!("kernel.perf_event_paranoid is {paranoid}, perf events may be unavailable");
    }
    Ok(())
}

fn metric_spec(event: &CounterDescription) -> MetricSpec {
    MetricSpec::new(&event.name, &event.unit)
}

fn output_link() -> Option<PathBuf> {
    std::env::var_os(OUTPUT_LINK_ENV)
        .filter(|link| !link.is_empty())
        .map(PathBuf::from)
}

/// Everything resolved before the trace exists.
struct Events {
    sampling: Option<CounterDescription>,
    group: Option<EventCollection>,
    safe: Vec<CounterDescription>,
}

impl Events {
    fn resolve(config: &Config) -> Result<Self> {
        let catalog = EventCatalog::discover().context("discovering perf events")?;
        let sampling = if config.sampling {
            Some(catalog.resolve(&config.sampling_event)?)
        } else {
            None
        };
        let group = EventCollection::resolve(&config.group_counters(), &catalog)?;
        let safe = config
            .safe_counters
            .iter()
            .map(|name| catalog.resolve(name))
            .collect::<Result<Vec<_>>>()?;
        Ok(Events {
            sampling,
            group,
            safe,
        })
    }
}

/// Registers the target process and its threads. Returns the threads to
/// monitor.
fn register_process(
    trace: &Trace,
    processes: &ProcessMap,
    pid: libc::pid_t,
    spawned: Option<&[String]>,
) -> Result<Vec<libc::pid_t>> {
    match spawned {
        Some(command) => {
            let name = command
                .first()
                .and_then(|program| program.rsplit('/').next())
                .unwrap_or("<unknown>");
            trace.add_process(pid, NO_PARENT_PROCESS_PID, name)?;
            trace.add_thread(pid, name);
            // The new image reports its mappings after exec.
            processes.insert_process(pid, false);
            Ok(vec![pid])
        }
        None => {
            let tasks = process::process_tasks(pid)
                .with_context(|| format!("process {pid} is not running"))?;
            trace.add_process(pid, NO_PARENT_PROCESS_PID, &process::pid_comm(pid))?;
            let names: BTreeMap<_, _> = tasks
                .iter()
                .map(|tid| (*tid, process::task_comm(pid, *tid)))
                .collect();
            for tid in tasks.iter().filter(|tid| **tid != pid) {
                trace.add_monitored_thread(pid, *tid);
            }
            trace.add_threads(&names);
            processes.insert_process(pid, true);
            Ok(tasks)
        }
    }
}

/// Registers every running process, parents before children where known.
fn register_system(trace: &Trace, processes: &ProcessMap) -> Result<()> {
    let running = process::running_processes()?;
    tracing::debug!("Registering {} running processes", running.len());
    let mut known = BTreeSet::new();
    for (pid, name) in &running {
        let parent = process::parent_pid(*pid)
            .filter(|parent| known.contains(parent))
            .unwrap_or(NO_PARENT_PROCESS_PID);
        trace.add_process(*pid, parent, name)?;
        trace.add_thread(*pid, name);
        processes.insert_process(*pid, true);
        known.insert(*pid);
    }
    Ok(())
}

/// Process mode: threads that appeared since the last scan get a monitor.
fn rescan_threads(
    pid: libc::pid_t,
    trace: &Trace,
    supervisor: &mut MonitorSupervisor,
    seen: &mut BTreeSet<libc::pid_t>,
) -> bool {
    let Ok(tasks) = process::process_tasks(pid) else {
        return false;
    };
    for tid in tasks {
        if !seen.insert(tid) {
            continue;
        }
        trace.add_monitored_thread(pid, tid);
        trace.update_thread_name(tid, &process::task_comm(pid, tid));
        let location = Location::thread(tid);
        if let Err(e) = supervisor.spawn(location, false) {
            if supervisor.monitor_exited(location, Err(e)) {
                return true;
            }
        }
    }
    false
}

fn spawn_timer(duration: u64, events: mpsc::Sender<SupervisorEvent>) -> Result<()> {
    thread::Builder::new()
        .name("lo2s duration".into())
        .spawn(move || {
            thread::sleep(Duration::from_secs(duration));
            let _ = events.send(SupervisorEvent::DurationElapsed);
        })
        .context("spawning duration timer")?;
    Ok(())
}

/// Waits for the end of the recording. Returns true when a failing monitor
/// ended it.
fn event_loop(
    config: &Config,
    target: Option<libc::pid_t>,
    trace: &Trace,
    supervisor: &mut MonitorSupervisor,
    events: &Receiver<SupervisorEvent>,
    command: Option<&TracedCommand>,
    mut seen: BTreeSet<libc::pid_t>,
) -> bool {
    loop {
        match events.recv_timeout(config.read_interval) {
            Ok(SupervisorEvent::Interrupted) => {
                tracing::info!("Interrupted, stopping");
                if let Some(command) = command {
                    command.interrupt();
                }
                return false;
            }
            Ok(SupervisorEvent::ChildExited(_)) => return false,
            Ok(SupervisorEvent::DurationElapsed) => {
                tracing::info!("Recording duration elapsed");
                return false;
            }
            Ok(SupervisorEvent::MonitorExit { location, result }) => {
                if supervisor.monitor_exited(location, result) {
                    return true;
                }
                // An attached process is done once none of its threads is left.
                if command.is_none() && config.mode == MonitorMode::Process && supervisor.running() == 0 {
                    tracing::info!("All monitored threads exited");
                    return false;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if let (MonitorMode::Process, Some(pid)) = (config.mode, target) {
                    if rescan_threads(pid, trace, supervisor, &mut seen) {
                        return true;
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => return false,
        }
    }
}

fn print_summary(path: &std::path::Path, summary: &SupervisorSummary) {
    println!(
        "[ lo2s: {} samples, {} lost records, {} events from {} monitors ]",
        summary.samples(),
        summary.lost(),
        summary.events(),
        summary.stats.len()
    );
    println!("[ lo2s: trace written to {} ]", path.display());
}

/// Records until the command exits, the duration elapses or Ctrl-C.
/// Returns the exit code of the command, 0 without one.
pub fn run(config: Config, mut command: Option<TracedCommand>) -> Result<i32> {
    match process::get_sysctl("kernel", "perf_event_paranoid") {
        Ok(paranoid) => {
            let privileged = nix::unistd::geteuid().is_root();
            check_perf_paranoid(paranoid, &config, privileged)?;
        }
        Err(e) => tracing::debug!("{e:#}"),
    }

    let events = Events::resolve(&config)?;
    let native_switch = has_native_context_switch();
    if !native_switch {
        tracing::warn!("kernel lacks context switch records, samples go to separate cpu locations");
    }
    let topology = Topology::probe().context("probing cpu topology")?;

    let path = name::trace_path(config.trace_path.as_deref(), &NameContext::current());
    let options = TraceOptions {
        description: config.command_line.clone(),
        hostname: process::hostname(),
        uname: Uname::current()?,
        topology: topology.clone(),
        sampling_event: config.sampling_event.clone(),
        sampling_period: config.sampling_period,
        counters: events.group.iter().flat_map(|g| g.iter()).map(metric_spec).collect(),
        safe_counters: events.safe.iter().map(metric_spec).collect(),
        disassemble: config.disassemble,
        output_link: output_link(),
    };
    let trace = Arc::new(Trace::new(&path, options)?);
    let processes = Arc::new(ProcessMap::new());

    let target = command.as_ref().map(TracedCommand::pid).or(config.pid);
    let initial = match (config.mode, target) {
        (MonitorMode::Process, Some(pid)) => {
            let spawned = command.as_ref().map(|_| config.command.as_slice());
            register_process(&trace, &processes, pid, spawned)?
                .into_iter()
                .map(Location::thread)
                .collect::<Vec<_>>()
        }
        (MonitorMode::Process, None) => bail!("process mode needs a command or a pid"),
        (MonitorMode::System, _) => {
            register_system(&trace, &processes)?;
            topology.cpus().map(|cpu| Location::cpu(cpu.id)).collect()
        }
    };

    let ctx = Arc::new(MonitorContext {
        config: config.clone(),
        trace: trace.clone(),
        processes,
        time: TimeConverter::calibrate(config.use_clockid)?,
        sampling_event: events.sampling,
        group_events: events.group,
        safe_events: events.safe,
        native_switch,
    });

    let (tx, rx) = mpsc::channel();
    let mut supervisor = MonitorSupervisor::new(ctx, tx.clone())?;
    let enable_on_exec = command.is_some() && config.mode == MonitorMode::Process;
    for location in &initial {
        if let Err(e) = supervisor.spawn(*location, enable_on_exec) {
            supervisor.join_all(&rx);
            return Err(e);
        }
    }
    tracing::info!("Monitoring {} locations", supervisor.running());

    {
        let tx = tx.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            let _ = tx.send(SupervisorEvent::Interrupted);
        }) {
            tracing::warn!("could not install Ctrl-C handler: {e}");
        }
    }
    if config.duration > 0 {
        spawn_timer(config.duration, tx.clone())?;
    }

    trace.begin_record();
    if let Some(command) = &mut command {
        if let Err(e) = command.start() {
            supervisor.join_all(&rx);
            return Err(e);
        }
        command.watch(tx.clone())?;
    }
    drop(tx);

    let seen = initial.iter().filter_map(|location| location.tid()).collect();
    let failed = event_loop(
        &config,
        target,
        &trace,
        &mut supervisor,
        &rx,
        command.as_ref(),
        seen,
    );

    trace.end_record();
    let summary = supervisor.join_all(&rx);
    let path = trace.finalize()?;
    let exit_code = command
        .as_ref()
        .map_or(0, |command| command.finish(COMMAND_GRACE));

    print_summary(&path, &summary);
    if failed {
        bail!("{} monitor(s) failed, trace is incomplete", summary.failures);
    }
    Ok(exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{Key, LocationDef};
    use tempfile::TempDir;

    #[test]
    fn test_paranoid_checks() {
        let process = Config::default();
        let system = Config {
            mode: MonitorMode::System,
            ..Config::default()
        };
        assert!(check_perf_paranoid(2, &process, false).is_ok());
        assert!(check_perf_paranoid(1, &system, false).is_err());
        assert!(check_perf_paranoid(0, &system, false).is_ok());
        assert!(check_perf_paranoid(4, &system, true).is_ok());
    }

    #[test]
    fn test_register_attached_process() {
        let dir = TempDir::new().unwrap();
        let trace = Trace::new(&dir.path().join("trace"), TraceOptions::default()).unwrap();
        let processes = ProcessMap::new();
        let pid = std::process::id() as libc::pid_t;

        let threads = register_process(&trace, &processes, pid, None).unwrap();
        assert!(threads.contains(&pid));
        assert!(processes.read().contains_key(&pid));
        for tid in threads {
            assert_eq!(trace.group_of(Location::thread(tid)), Some(Location::thread(pid)));
        }
    }

    #[test]
    fn test_register_spawned_command() {
        let dir = TempDir::new().unwrap();
        let trace = Trace::new(&dir.path().join("trace"), TraceOptions::default()).unwrap();
        let processes = ProcessMap::new();
        let command = vec!["/usr/bin/true".to_string()];

        let threads = register_process(&trace, &processes, 4242, Some(&command)).unwrap();
        assert_eq!(threads, vec![4242]);
        assert!(trace.location(Location::thread(4242)).is_ok());
        let name = trace.with_registry(|registry| {
            let location = registry
                .get::<LocationDef>(&Key::ByLocation(Location::thread(4242)))
                .unwrap();
            registry.string(registry.def(location).name).to_string()
        });
        assert_eq!(name, "true (4242)");
    }
}
