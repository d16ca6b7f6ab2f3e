//! Acquisition for one location: instruction samples, grouped counters and
//! individually read counters.

use std::os::fd::RawFd;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use nix::sched::CpuSet;

use super::{MonitorContext, MonitorStats, PollMonitor, TimerFd};
use crate::cctx::LocalCctxTree;
use crate::config::MonitorMode;
use crate::location::{Location, LocationKind};
use crate::metric::MetricWriter;
use crate::mmap::{LineInfoResolver, Mapping, NoLineInfo, ProcessMap};
use crate::perf::record::{
    callchain_frames, CommRecord, MmapRecord, SampleRecord, SwitchRecord, TaskRecord,
};
use crate::perf::{PerfCounter, PerfCounterGroup, RecordHandler, SampleOptions, SampleReader};
use crate::process;
use crate::symbolize::BlazeResolver;
use crate::time::{self, TimeConverter, Timestamp};
use crate::trace::{
    Event, InterruptGenerator, LocalWriter, MetricInstance, MetricScope, MetricValue, Ref, Trace,
};

/// Turns the records of one sample ring into events of one location.
pub struct SampleWriter {
    trace: Arc<Trace>,
    processes: Arc<ProcessMap>,
    time: TimeConverter,
    writer: LocalWriter,
    tree: LocalCctxTree,
    interrupt_generator: Ref<InterruptGenerator>,
    /// Thread monitors only: instance and last cpu seen
    cpuid: Option<(Ref<MetricInstance>, Option<u32>)>,
    /// CPU-wide ring: records describe every task on the CPU
    system_wide: bool,
    /// Root reference and enter time of the thread on the CPU
    running: Option<(u32, Timestamp)>,
    last_time: Timestamp,
}

impl SampleWriter {
    pub fn new(
        trace: Arc<Trace>,
        processes: Arc<ProcessMap>,
        time: TimeConverter,
        writer: LocalWriter,
        cpuid: Option<Ref<MetricInstance>>,
        system_wide: bool,
    ) -> Self {
        let interrupt_generator = trace.interrupt_generator();
        SampleWriter {
            trace,
            processes,
            time,
            writer,
            tree: LocalCctxTree::new(),
            interrupt_generator,
            cpuid: cpuid.map(|instance| (instance, None)),
            system_wide,
            running: None,
            last_time: Timestamp::default(),
        }
    }

    fn convert(&mut self, raw: u64) -> Timestamp {
        let t = self.time.convert(raw);
        self.last_time = self.last_time.max(t);
        t
    }

    pub fn tree(&self) -> &LocalCctxTree {
        &self.tree
    }

    pub fn events(&self) -> u64 {
        self.writer.count()
    }

    fn leave_running(&mut self, time: Timestamp) -> Result<()> {
        if let Some((calling_context, _)) = self.running.take() {
            self.writer.write(Event::CallingContextLeave {
                time,
                calling_context,
            })?;
        }
        Ok(())
    }

    /// Closes a thread still on the CPU, merges the local calling contexts
    /// and writes the location's mapping table.
    pub fn finish(mut self, resolver: &mut dyn LineInfoResolver) -> Result<u64> {
        let end = self.last_time;
        self.leave_running(end)?;
        let processes = self
            .processes
            .snapshot(self.tree.threads().filter_map(|(_, thread)| thread.pid));
        let table = self
            .trace
            .merge_calling_contexts(&self.tree, &processes, resolver);
        Ok(self.writer.close(&[table])?)
    }
}

impl RecordHandler for SampleWriter {
    fn handle_sample(&mut self, sample: &SampleRecord) -> Result<()> {
        let time = self.convert(sample.time);

        if let Some((instance, last_cpu)) = &mut self.cpuid {
            if *last_cpu != Some(sample.cpu) {
                *last_cpu = Some(sample.cpu);
                let instance = *instance;
                self.writer.write(Event::Metric {
                    time,
                    instance,
                    values: vec![MetricValue::Signed(sample.cpu as i64)],
                })?;
            }
        }

        let calling_context = if sample.callchain.is_empty() {
            self.tree
                .sample_ref(sample.pid, sample.tid, std::iter::once(sample.ip))
        } else {
            self.tree
                .sample_ref(sample.pid, sample.tid, callchain_frames(&sample.callchain))
        };
        self.writer.write(Event::CallingContextSample {
            time,
            calling_context,
            unwind_distance: 2,
            interrupt_generator: self.interrupt_generator,
        })?;
        Ok(())
    }

    fn handle_mmap(&mut self, mmap: &MmapRecord) -> Result<()> {
        tracing::trace!(
            "mmap {}: {:#x}+{:#x} {}",
            mmap.pid,
            mmap.addr,
            mmap.len,
            mmap.filename
        );
        self.processes.mmap(
            mmap.pid,
            Mapping {
                start: mmap.addr,
                end: mmap.addr + mmap.len,
                pgoff: mmap.pgoff,
                filename: mmap.filename.clone(),
            },
        );
        Ok(())
    }

    fn handle_comm(&mut self, comm: &CommRecord) -> Result<()> {
        if let Some(raw) = comm.time {
            self.convert(raw);
        }
        if comm.exec {
            self.processes.exec(comm.pid);
            if comm.pid == comm.tid {
                self.trace.update_process_name(comm.pid, &comm.name);
            }
        }
        self.trace.add_thread(comm.tid, &comm.name);
        Ok(())
    }

    fn handle_fork(&mut self, task: &TaskRecord) -> Result<()> {
        self.convert(task.time);
        if !self.system_wide {
            return Ok(());
        }
        if task.pid == task.tid {
            let name = process::pid_comm(task.pid);
            self.processes.fork(task.ppid, task.pid);
            self.trace.add_process(task.pid, task.ppid, &name)?;
            self.trace.add_thread(task.tid, &name);
        } else {
            self.trace.add_monitored_thread(task.ptid, task.tid);
        }
        Ok(())
    }

    fn handle_exit(&mut self, task: &TaskRecord) -> Result<()> {
        self.convert(task.time);
        tracing::trace!("task {} of process {} exited", task.tid, task.pid);
        Ok(())
    }

    fn handle_switch(&mut self, switch: &SwitchRecord) -> Result<()> {
        let time = self.convert(switch.time);
        if switch.switch_out {
            return self.leave_running(time);
        }
        self.leave_running(time)?;
        let calling_context = self.tree.thread_ref(Some(switch.pid), switch.tid);
        self.writer.write(Event::CallingContextEnter {
            time,
            calling_context,
            unwind_distance: 1,
        })?;
        self.running = Some((calling_context, time));
        Ok(())
    }
}

struct SafeCounters {
    counters: Vec<PerfCounter>,
    writer: MetricWriter,
    timer: TimerFd,
}

impl SafeCounters {
    fn write(&mut self) -> Result<()> {
        let values = self
            .counters
            .iter_mut()
            .map(|counter| counter.read().map(MetricValue::Double))
            .collect::<crate::error::Result<Vec<_>>>()?;
        self.writer.write(time::now(), values)?;
        Ok(())
    }
}

/// Monitor of a single thread (process mode) or CPU (system mode).
pub struct LocationMonitor {
    location: Location,
    ctx: Arc<MonitorContext>,
    sampler: Option<SampleReader>,
    samples: Option<SampleWriter>,
    counters: Option<(PerfCounterGroup, MetricWriter)>,
    safe: Option<SafeCounters>,
    affinity: Option<CpuSet>,
    target_gone: bool,
}

impl LocationMonitor {
    /// Opens every event of `location` on the calling thread, so a target
    /// that vanished is reported before a monitor thread exists. The trace
    /// only learns about the location once all events are open.
    pub fn open(ctx: Arc<MonitorContext>, location: Location, enable_on_exec: bool) -> Result<Self> {
        let system_wide = ctx.config.mode == MonitorMode::System;
        let trace = &ctx.trace;

        let sampler = match &ctx.sampling_event {
            Some(event) => Some(SampleReader::open(
                location,
                &SampleOptions {
                    event: event.clone(),
                    period: ctx.config.sampling_period,
                    call_graph: ctx.config.call_graph,
                    exclude_kernel: ctx.config.exclude_kernel,
                    enable_on_exec,
                    use_clockid: ctx.config.use_clockid,
                    track_tasks: system_wide,
                    context_switch: system_wide && ctx.native_switch,
                    mmap_pages: ctx.config.mmap_pages,
                },
            )?),
            None => None,
        };

        let group = match (&ctx.group_events, trace.perf_metric_class()) {
            (Some(events), Some(class)) => Some((
                PerfCounterGroup::open(
                    events,
                    location,
                    enable_on_exec,
                    ctx.config.exclude_kernel,
                    ctx.config.metric_count,
                    ctx.config.mmap_pages,
                    ctx.config.use_clockid,
                )?,
                class,
            )),
            _ => None,
        };

        let safe_counters = match trace.safe_metric_class() {
            Some(class) if !ctx.safe_events.is_empty() => {
                let counters = ctx
                    .safe_events
                    .iter()
                    .map(|event| {
                        PerfCounter::open(event, location, enable_on_exec, ctx.config.exclude_kernel)
                    })
                    .collect::<crate::error::Result<Vec<_>>>()?;
                Some((counters, class, TimerFd::new(ctx.config.safe_read_interval)?))
            }
            _ => None,
        };

        let scope = match location.cpuid() {
            Some(cpu) => MetricScope::SystemTreeNode(trace.cpu_node(cpu)?),
            None => MetricScope::Location(trace.location(location)?),
        };

        let samples = match &sampler {
            Some(_) => {
                let sample_location = match location.cpuid() {
                    Some(cpu) if !ctx.native_switch => Location::sample_cpu(cpu),
                    _ => location,
                };
                let writer = trace.sample_writer(sample_location)?;
                let cpuid = match location.kind {
                    LocationKind::Thread => Some(trace.metric_instance(
                        trace.cpuid_metric_class(),
                        writer.location(),
                        scope,
                    )),
                    _ => None,
                };
                Some(SampleWriter::new(
                    trace.clone(),
                    ctx.processes.clone(),
                    ctx.time,
                    writer,
                    cpuid,
                    system_wide,
                ))
            }
            None => None,
        };

        let counters = match group {
            Some((group, class)) => {
                Some((group, MetricWriter::open(trace, location, class, scope)?))
            }
            None => None,
        };

        let safe = match safe_counters {
            Some((counters, class, timer)) => Some(SafeCounters {
                counters,
                writer: MetricWriter::open_non_unique(
                    trace,
                    &format!("safe metrics for {location}"),
                    class,
                    scope,
                )?,
                timer,
            }),
            None => None,
        };

        Ok(LocationMonitor {
            location,
            ctx,
            sampler,
            samples,
            counters,
            safe,
            affinity: None,
            target_gone: false,
        })
    }

    fn read_samples(&mut self) -> Result<()> {
        if let (Some(sampler), Some(samples)) = (&mut self.sampler, &mut self.samples) {
            sampler.read(samples)?;
        }
        Ok(())
    }

    fn read_counters(&mut self) -> Result<()> {
        let Some((group, writer)) = &mut self.counters else {
            return Ok(());
        };
        if group.is_sampling() {
            let time = self.ctx.time;
            let mut result = Ok(());
            group.read_samples(|raw, group| {
                if result.is_ok() {
                    result = writer.write_counters(time.convert(raw), group);
                }
            })?;
            result?;
        } else {
            group.read()?;
            writer.write_counters(time::now(), group)?;
        }
        Ok(())
    }

    fn follow_affinity(&mut self) {
        let Some(tid) = self.location.tid() else {
            return;
        };
        if let Err(e) = process::follow_thread_affinity(tid, &mut self.affinity) {
            tracing::debug!("{e}");
        }
    }
}

impl PollMonitor for LocationMonitor {
    fn location(&self) -> Location {
        self.location
    }

    fn initialize_thread(&mut self) -> Result<()> {
        self.ctx.trace.add_monitoring_thread(
            process::gettid(),
            &format!("{} monitor", self.location),
            "lo2s",
        );
        match self.location.kind {
            LocationKind::Thread => self.follow_affinity(),
            _ => {
                self.affinity = process::pin_to_location(self.location)?;
            }
        }
        Ok(())
    }

    fn on_tick(&mut self) -> Result<()> {
        self.follow_affinity();
        self.read_samples()?;
        self.read_counters()?;
        if self.sampler.is_none() {
            if let Some(tid) = self.location.tid() {
                self.target_gone = !Path::new("/proc").join(tid.to_string()).exists();
            }
        }
        Ok(())
    }

    fn poll_fds(&self) -> Vec<RawFd> {
        let mut fds = Vec::new();
        fds.extend(self.sampler.as_ref().map(SampleReader::fd));
        fds.extend(self.counters.as_ref().and_then(|(group, _)| group.poll_fd()));
        fds.extend(self.safe.as_ref().map(|safe| safe.timer.fd()));
        fds
    }

    fn on_ready(&mut self, fd: RawFd) -> Result<()> {
        if self.sampler.as_ref().map(SampleReader::fd) == Some(fd) {
            self.read_samples()?;
        }
        if self.counters.as_ref().and_then(|(group, _)| group.poll_fd()) == Some(fd) {
            self.read_counters()?;
        }
        if let Some(safe) = &mut self.safe {
            if safe.timer.fd() == fd {
                safe.timer.read()?;
                safe.write()?;
            }
        }
        Ok(())
    }

    fn on_hangup(&mut self, fd: RawFd) -> bool {
        // The sampling event of a thread hangs up when the thread exits.
        let sampler_gone = self.sampler.as_ref().map(SampleReader::fd) == Some(fd);
        if sampler_gone && self.location.kind == LocationKind::Thread {
            self.target_gone = true;
        }
        self.target_gone
    }

    fn is_finished(&self) -> bool {
        self.target_gone
    }

    fn finalize_thread(&mut self) -> Result<MonitorStats> {
        let mut stats = MonitorStats::new(self.location);
        let mut first_error: Option<anyhow::Error> = None;

        if let (Some(mut sampler), Some(mut samples)) = (self.sampler.take(), self.samples.take()) {
            if let Err(e) = sampler.end(&mut samples) {
                tracing::warn!("{}: final sample read failed: {e:#}", self.location);
            }
            stats.samples = sampler.sample_count();
            stats.lost = sampler.lost_count();
            let mut resolver: Box<dyn LineInfoResolver> = if self.ctx.config.line_info {
                Box::new(BlazeResolver::new())
            } else {
                Box::new(NoLineInfo)
            };
            match samples
                .finish(resolver.as_mut())
                .with_context(|| format!("closing sample stream of {}", self.location))
            {
                Ok(n) => stats.events += n,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some((mut group, mut writer)) = self.counters.take() {
            if !group.is_sampling() {
                if let Err(e) = group
                    .read()
                    .map_err(anyhow::Error::from)
                    .and_then(|_| Ok(writer.write_counters(time::now(), &group)?))
                {
                    tracing::debug!("{}: final counter read failed: {e:#}", self.location);
                }
            }
            match writer.close() {
                Ok(n) => stats.events += n,
                Err(e) => {
                    first_error.get_or_insert(e.into());
                }
            }
        }

        if let Some(safe) = self.safe.take() {
            match safe.writer.close() {
                Ok(n) => stats.events += n,
                Err(e) => {
                    first_error.get_or_insert(e.into());
                }
            }
        }

        tracing::debug!(
            "{}: {} samples, {} lost, {} events",
            self.location,
            stats.samples,
            stats.lost,
            stats.events
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::location::NO_PARENT_PROCESS_PID;
    use crate::mmap::LineInfo;
    use crate::perf::sys::{PERF_COUNT_SW_CPU_CLOCK, PERF_TYPE_SOFTWARE};
    use crate::perf::CounterDescription;
    use crate::topology::{Cpu, Topology};
    use crate::trace::{CallingContext, Key, LocationDef, TraceOptions};
    use tempfile::TempDir;

    struct NamedResolver;

    impl LineInfoResolver for NamedResolver {
        fn resolve(&mut self, _dso: &Path, file_offset: u64) -> Option<LineInfo> {
            Some(LineInfo::new(
                &format!("fn_{file_offset:x}"),
                "main.c",
                file_offset as u32,
                "app",
            ))
        }
    }

    fn trace(dir: &TempDir) -> Arc<Trace> {
        Arc::new(
            Trace::new(
                &dir.path().join("trace"),
                TraceOptions {
                    sampling_event: "instructions".into(),
                    sampling_period: 1000,
                    topology: Topology::from_cpus([Cpu {
                        id: 0,
                        core_id: 0,
                        package_id: 0,
                    }]),
                    ..TraceOptions::default()
                },
            )
            .unwrap(),
        )
    }

    fn read_events(dir: &TempDir, location: Ref<LocationDef>) -> Vec<serde_json::Value> {
        std::fs::read_to_string(
            dir.path()
                .join("trace/traces")
                .join(format!("{}.evt", location.id())),
        )
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
    }

    fn sample(tid: libc::pid_t, time: u64, cpu: u32, ip: u64) -> SampleRecord {
        SampleRecord {
            ip,
            pid: 100,
            tid,
            time,
            cpu,
            read: Vec::new(),
            callchain: Vec::new(),
        }
    }

    #[test]
    fn test_thread_samples_and_cpu_migration() {
        let dir = TempDir::new().unwrap();
        let trace = trace(&dir);
        trace.add_process(100, 1, "app").unwrap();
        let processes = Arc::new(ProcessMap::new());
        processes.insert_process(100, false);

        let writer = trace.sample_writer(Location::thread(100)).unwrap();
        let location = writer.location();
        let cpuid = trace.metric_instance(
            trace.cpuid_metric_class(),
            location,
            MetricScope::Location(location),
        );
        let mut samples = SampleWriter::new(
            trace.clone(),
            processes,
            TimeConverter::identity(),
            writer,
            Some(cpuid),
            false,
        );
        samples
            .handle_mmap(&MmapRecord {
                pid: 100,
                tid: 100,
                addr: 0x1000,
                len: 0x1000,
                pgoff: 0,
                filename: "/usr/bin/app".into(),
            })
            .unwrap();
        samples.handle_sample(&sample(100, 10, 0, 0x1010)).unwrap();
        samples.handle_sample(&sample(100, 20, 0, 0x1010)).unwrap();
        samples.handle_sample(&sample(100, 30, 3, 0x1020)).unwrap();
        assert_eq!(samples.events(), 5);
        let first_ref = samples.tree().num_refs();
        assert_eq!(first_ref, 3);
        samples.finish(&mut NamedResolver).unwrap();

        let events = read_events(&dir, location);
        let kinds: Vec<&str> = events.iter().map(|e| e["type"].as_str().unwrap()).collect();
        assert_eq!(
            kinds,
            vec![
                "metric",
                "calling_context_sample",
                "calling_context_sample",
                "metric",
                "calling_context_sample"
            ]
        );
        assert_eq!(events[3]["values"][0], 3);
        assert_eq!(events[1]["calling_context"], events[2]["calling_context"]);
        assert_ne!(events[1]["calling_context"], events[4]["calling_context"]);

        let defs: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(
                dir.path()
                    .join("trace/traces")
                    .join(format!("{}.def", location.id())),
            )
            .unwrap(),
        )
        .unwrap();
        let mappings = defs["mapping_tables"][0]["mappings"].as_array().unwrap();
        assert_eq!(mappings.len(), 3);
        trace.with_registry(|registry| {
            assert!(registry.has::<CallingContext>(&Key::ByThread(100)));
            assert!(registry.all::<CallingContext>().len() >= 3);
        });
    }

    #[test]
    fn test_cpu_wide_switches_and_forks() {
        let dir = TempDir::new().unwrap();
        let trace = trace(&dir);
        let processes = Arc::new(ProcessMap::new());
        let writer = trace.sample_writer(Location::cpu(0)).unwrap();
        let location = writer.location();
        let mut samples = SampleWriter::new(
            trace.clone(),
            processes.clone(),
            TimeConverter::identity(),
            writer,
            None,
            true,
        );

        samples
            .handle_fork(&TaskRecord {
                pid: 200,
                ppid: 1,
                tid: 200,
                ptid: 1,
                time: 5,
            })
            .unwrap();
        samples
            .handle_comm(&CommRecord {
                pid: 200,
                tid: 200,
                name: "worker".into(),
                exec: true,
                time: Some(6),
            })
            .unwrap();
        samples
            .handle_fork(&TaskRecord {
                pid: 200,
                ppid: 200,
                tid: 201,
                ptid: 200,
                time: 7,
            })
            .unwrap();
        for (switch_out, tid, time) in [(false, 200, 10), (true, 200, 20), (false, 201, 30)] {
            samples
                .handle_switch(&SwitchRecord {
                    switch_out,
                    next_prev: None,
                    pid: 200,
                    tid,
                    time,
                    cpu: 0,
                })
                .unwrap();
        }
        samples.handle_sample(&sample(201, 35, 0, 0x40)).unwrap();
        samples.finish(&mut NamedResolver).unwrap();

        assert!(processes.read().contains_key(&200));
        assert_eq!(trace.group_of(Location::thread(201)), Some(Location::thread(200)));

        let events = read_events(&dir, location);
        let kinds: Vec<&str> = events.iter().map(|e| e["type"].as_str().unwrap()).collect();
        assert_eq!(
            kinds,
            vec![
                "calling_context_enter",
                "calling_context_leave",
                "calling_context_enter",
                "calling_context_sample",
                "calling_context_leave"
            ]
        );
        // The thread still running is closed at the last seen time.
        assert_eq!(events[4]["time"], 35);
        assert_eq!(events[0]["calling_context"], events[1]["calling_context"]);
    }

    /// Records new mappings while it resolves, like a monitor whose thread
    /// keeps running while another one symbolizes.
    struct MappingResolver(Arc<ProcessMap>);

    impl LineInfoResolver for MappingResolver {
        fn resolve(&mut self, _dso: &Path, file_offset: u64) -> Option<LineInfo> {
            self.0.mmap(
                100,
                Mapping {
                    start: 0x9000,
                    end: 0xa000,
                    pgoff: 0,
                    filename: "/usr/lib/liblate.so".into(),
                },
            );
            Some(LineInfo::new("late", "late.c", file_offset as u32, "app"))
        }
    }

    #[test]
    fn test_finish_does_not_block_mmap_updates() {
        let dir = TempDir::new().unwrap();
        let trace = trace(&dir);
        trace.add_process(100, 1, "app").unwrap();
        let processes = Arc::new(ProcessMap::new());
        processes.mmap(
            100,
            Mapping {
                start: 0x1000,
                end: 0x2000,
                pgoff: 0,
                filename: "/usr/bin/app".into(),
            },
        );

        let writer = trace.sample_writer(Location::thread(100)).unwrap();
        let mut samples = SampleWriter::new(
            trace.clone(),
            processes.clone(),
            TimeConverter::identity(),
            writer,
            None,
            false,
        );
        samples.handle_sample(&sample(100, 10, 0, 0x1010)).unwrap();
        assert_eq!(samples.finish(&mut MappingResolver(processes.clone())).unwrap(), 1);
        assert_eq!(processes.read()[&100].maps.len(), 2);
    }

    #[test]
    fn test_vanished_thread_leaves_no_trace_location() {
        let dir = TempDir::new().unwrap();
        let trace = trace(&dir);
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let tid = child.id() as libc::pid_t;
        child.wait().unwrap();
        trace.add_process(tid, NO_PARENT_PROCESS_PID, "true").unwrap();
        trace.add_thread(tid, "true");

        let ctx = Arc::new(MonitorContext {
            config: Config::default(),
            trace: trace.clone(),
            processes: Arc::new(ProcessMap::new()),
            time: TimeConverter::identity(),
            sampling_event: Some(CounterDescription::new(
                "cpu-clock",
                PERF_TYPE_SOFTWARE,
                PERF_COUNT_SW_CPU_CLOCK,
            )),
            group_events: None,
            safe_events: Vec::new(),
            native_switch: true,
        });
        assert!(LocationMonitor::open(ctx, Location::thread(tid), false).is_err());

        trace.with_registry(|registry| {
            assert!(registry
                .find::<LocationDef>(&Key::ByLocation(Location::thread(tid)))
                .is_none());
        });
        let written = std::fs::read_dir(dir.path().join("trace/traces")).unwrap().count();
        assert_eq!(written, 0);
    }
}
