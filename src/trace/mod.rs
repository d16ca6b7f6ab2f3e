//! Trace assembly.
//!
//! [`Trace`] owns the archive and every global definition. Monitors get
//! their own [`LocalWriter`]s from it and only come back to it for
//! definitions: new processes and threads, names, and the calling-context
//! merge when they finish.
//!
//! - [`registry`]: keyed definition stores
//! - [`definitions`]: the definition records
//! - [`archive`]: files of a trace directory
//! - [`name`]: trace directory templates and the latest-trace link

pub mod archive;
pub mod definitions;
pub mod name;
pub mod registry;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};

pub use archive::{Archive, Event, LocalWriter, MappingTable, MetricValue};
pub use definitions::*;
pub use registry::{Key, Ref, Registry};

use crate::cctx::{IpRefMap, LocalCctxTree};
use crate::location::{Location, METRIC_PID, NO_PARENT_PROCESS_PID};
use crate::mmap::{LineInfo, LineInfoResolver, ProcessInfo};
use crate::process::Uname;
use crate::time::{self, Timestamp};
use crate::topology::Topology;

const UNSET_MAPPING: u32 = u32::MAX;

/// A metric recorded by the trace: name, description and unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSpec {
    pub name: String,
    pub description: String,
    pub unit: String,
}

impl MetricSpec {
    pub fn new(name: &str, unit: &str) -> Self {
        MetricSpec {
            name: name.to_string(),
            description: name.to_string(),
            unit: unit.to_string(),
        }
    }
}

/// Everything the trace needs to know up front.
#[derive(Debug, Clone, Default)]
pub struct TraceOptions {
    /// Full command line of the profiler
    pub description: String,
    pub hostname: String,
    pub uname: Uname,
    pub topology: Topology,
    /// Event driving instruction sampling and its period
    pub sampling_event: String,
    pub sampling_period: u64,
    /// Grouped counters, leader first
    pub counters: Vec<MetricSpec>,
    /// Counters read one by one
    pub safe_counters: Vec<MetricSpec>,
    /// Attach instruction bytes to new calling contexts
    pub disassemble: bool,
    /// Symlink pointed at the finished trace
    pub output_link: Option<PathBuf>,
}

#[derive(Debug)]
struct GlobalCctx {
    cctx: Ref<CallingContext>,
    children: HashMap<(Ref<Region>, Ref<SourceCodeLocation>), GlobalCctx>,
}

impl GlobalCctx {
    fn new(cctx: Ref<CallingContext>) -> Self {
        GlobalCctx {
            cctx,
            children: HashMap::new(),
        }
    }
}

/// Line info (and instruction bytes) of the addresses in a local tree,
/// gathered before the trace lock is taken.
#[derive(Debug, Default)]
struct ResolvedIps {
    line_info: HashMap<(libc::pid_t, u64), LineInfo>,
    instructions: HashMap<(libc::pid_t, u64), String>,
}

impl ResolvedIps {
    fn collect(
        tree: &LocalCctxTree,
        processes: &BTreeMap<libc::pid_t, ProcessInfo>,
        resolver: &mut dyn LineInfoResolver,
        disassemble: bool,
    ) -> Self {
        let mut resolved = ResolvedIps::default();
        for (_, thread) in tree.threads() {
            let pid = thread.pid.unwrap_or(NO_PARENT_PROCESS_PID);
            resolved.visit(pid, &thread.entry.children, processes, resolver, disassemble);
        }
        resolved
    }

    fn visit(
        &mut self,
        pid: libc::pid_t,
        children: &IpRefMap,
        processes: &BTreeMap<libc::pid_t, ProcessInfo>,
        resolver: &mut dyn LineInfoResolver,
        disassemble: bool,
    ) {
        let maps = processes.get(&pid).map(|info| &info.maps);
        for (ip, child) in children {
            if !self.line_info.contains_key(&(pid, *ip)) {
                let line_info = match maps {
                    Some(maps) => maps.lookup_line_info(*ip, resolver),
                    None => LineInfo::for_unknown_function(),
                };
                tracing::trace!("resolved {ip:#x}: {line_info}");
                self.line_info.insert((pid, *ip), line_info);

                if let (true, Some(maps)) = (disassemble, maps) {
                    match maps.lookup_instruction(*ip) {
                        Ok(instruction) => {
                            self.instructions.insert((pid, *ip), instruction);
                        }
                        Err(e) => tracing::trace!("could not read instruction at {ip:#x}: {e:#}"),
                    }
                }
            }
            self.visit(pid, &child.children, processes, resolver, disassemble);
        }
    }
}

#[derive(Debug)]
struct TraceState {
    registry: Registry,
    /// Location -> location owning its location group
    groups: BTreeMap<Location, Location>,
    thread_names: BTreeMap<libc::pid_t, String>,
    calling_context_tree: BTreeMap<libc::pid_t, GlobalCctx>,
    system_tree_root: Ref<SystemTreeNode>,
    comm_locations_group: Ref<CommGroup>,
    lo2s_regions_group: Ref<RegionsGroup>,
    starting_time: Option<Timestamp>,
    stopping_time: Option<Timestamp>,
}

impl TraceState {
    fn intern_process_node(&mut self, pid: libc::pid_t) -> Ref<SystemTreeNode> {
        match self.registry.find(&Key::ByProcess(pid)) {
            Some(node) => node,
            None => {
                tracing::warn!("could not find system tree node for pid {pid}");
                self.system_tree_root
            }
        }
    }

    fn add_process(&mut self, pid: libc::pid_t, parent: libc::pid_t, name: &str) -> Result<()> {
        if self.registry.has::<SystemTreeNode>(&Key::ByProcess(pid)) {
            self.update_process_name(pid, name);
            return Ok(());
        }
        self.groups
            .entry(Location::thread(pid))
            .or_insert(Location::thread(pid));

        let iname = self.registry.intern(name);
        let class = self.registry.intern("process");
        let parent_node = if parent == NO_PARENT_PROCESS_PID {
            self.system_tree_root
        } else {
            self.intern_process_node(parent)
        };
        let node = self.registry.create(
            Key::ByProcess(pid),
            SystemTreeNode {
                name: iname,
                class,
                parent: Some(parent_node),
                domains: Vec::new(),
                properties: Vec::new(),
            },
        )?;
        self.registry.emplace(
            Key::ByLocation(Location::thread(pid)),
            LocationGroup {
                name: iname,
                group_type: LocationGroupType::Process,
                parent: node,
            },
        );
        let comm_group = self.registry.emplace(
            Key::ByProcess(pid),
            CommGroup {
                name: iname,
                paradigm: Paradigm::Pthread,
                members: Vec::new(),
            },
        );
        self.registry.emplace(
            Key::ByProcess(pid),
            Comm {
                name: iname,
                group: comm_group,
            },
        );
        Ok(())
    }

    fn update_process_name(&mut self, pid: libc::pid_t, name: &str) {
        let (Some(node), Some(group), Some(comm_group), Some(comm)) = (
            self.registry.find::<SystemTreeNode>(&Key::ByProcess(pid)),
            self.registry
                .find::<LocationGroup>(&Key::ByLocation(Location::thread(pid))),
            self.registry.find::<CommGroup>(&Key::ByProcess(pid)),
            self.registry.find::<Comm>(&Key::ByProcess(pid)),
        ) else {
            tracing::warn!("attempting to update name of unknown process {pid} ({name})");
            return;
        };
        let iname = self.registry.intern(name);
        self.registry.def_mut(node).name = iname;
        self.registry.def_mut(group).name = iname;
        self.registry.def_mut(comm_group).name = iname;
        self.registry.def_mut(comm).name = iname;
        self.update_thread_name(pid, name);
    }

    fn update_thread_name(&mut self, tid: libc::pid_t, name: &str) {
        let Some(region) = self.registry.find::<Region>(&Key::ByThread(tid)) else {
            tracing::warn!("attempting to update name of unknown thread {tid} ({name})");
            return;
        };
        let iname = self.registry.intern(&format!("{name} ({tid})"));
        let region = self.registry.def_mut(region);
        region.name = iname;
        region.canonical_name = iname;
        region.source_file = iname;
        region.description = iname;

        if let Some(location) = self
            .registry
            .find::<LocationDef>(&Key::ByLocation(Location::thread(tid)))
        {
            self.registry.def_mut(location).name = iname;
        }
        self.thread_names.insert(tid, name.to_string());
    }

    fn add_thread(&mut self, tid: libc::pid_t, name: &str) {
        if self.registry.has::<CallingContext>(&Key::ByThread(tid)) {
            self.update_thread_name(tid, name);
            return;
        }
        self.thread_names
            .entry(tid)
            .or_insert_with(|| name.to_string());

        let iname = self.registry.intern(&format!("{name} ({tid})"));
        let region = self.registry.emplace(
            Key::ByThread(tid),
            Region {
                name: iname,
                canonical_name: iname,
                description: iname,
                role: RegionRole::Function,
                paradigm: Paradigm::User,
                source_file: iname,
                begin_line: 0,
                end_line: 0,
            },
        );
        let cctx = self.registry.emplace(
            Key::ByThread(tid),
            CallingContext {
                region,
                source_code_location: None,
                parent: None,
            },
        );
        self.calling_context_tree
            .entry(tid)
            .or_insert_with(|| GlobalCctx::new(cctx));
    }

    fn add_monitored_thread(&mut self, ptid: libc::pid_t, tid: libc::pid_t) {
        // The parent's name is a placeholder until a comm record arrives.
        let name = self
            .thread_names
            .get(&ptid)
            .cloned()
            .unwrap_or_else(|| "<unknown>".to_string());
        self.add_thread(tid, &name);

        let group = match self.groups.get(&Location::thread(ptid)) {
            Some(group) => *group,
            None => {
                tracing::warn!(
                    "parent thread {ptid} of {tid} was never seen before, using pid {NO_PARENT_PROCESS_PID} as parent"
                );
                Location::thread(NO_PARENT_PROCESS_PID)
            }
        };
        self.groups.entry(Location::thread(tid)).or_insert(group);
    }

    fn location_name(&self, location: Location) -> String {
        match location.tid() {
            Some(tid) => match self.thread_names.get(&tid) {
                Some(name) => format!("{name} ({tid})"),
                None => location.name(),
            },
            None => location.name(),
        }
    }

    fn location_group(&self, location: Location) -> crate::error::Result<Ref<LocationGroup>> {
        let owner = self.groups.get(&location).copied().ok_or_else(|| {
            crate::error::Error::MissingDefinition {
                kind: "location_group",
                key: Key::ByLocation(location).to_string(),
            }
        })?;
        self.registry.get(&Key::ByLocation(owner))
    }

    fn location(&mut self, location: Location) -> crate::error::Result<Ref<LocationDef>> {
        let key = Key::ByLocation(location);
        if let Some(r) = self.registry.find(&key) {
            return Ok(r);
        }
        let group = self.location_group(location)?;
        let name = self.location_name(location);
        let name = self.registry.intern(&name);
        let r = self.registry.create(
            key,
            LocationDef {
                name,
                location_type: LocationType::CpuThread,
                group,
            },
        )?;
        let all = self.comm_locations_group;
        self.registry.def_mut(all).members.push(r);
        Ok(r)
    }

    fn merge_ips(
        registry: &mut Registry,
        children: &IpRefMap,
        global: &mut GlobalCctx,
        mappings: &mut [u32],
        pid: libc::pid_t,
        resolved: &ResolvedIps,
    ) {
        for (ip, local) in children {
            let line_info = resolved
                .line_info
                .get(&(pid, *ip))
                .cloned()
                .unwrap_or_else(LineInfo::for_unknown_function);
            let region = registry.intern_region(&line_info);
            let scl = registry.intern_scl(&line_info);
            let parent = global.cctx;

            let child = global.children.entry((region, scl)).or_insert_with(|| {
                let cctx = registry.create_unkeyed(CallingContext {
                    region,
                    source_code_location: Some(scl),
                    parent: Some(parent),
                });
                if let Some(instruction) = resolved.instructions.get(&(pid, *ip)) {
                    let name = registry.intern("instruction");
                    let value = registry.intern(instruction);
                    registry.create_unkeyed(CallingContextProperty {
                        calling_context: cctx,
                        name,
                        value,
                    });
                }
                GlobalCctx::new(cctx)
            });
            mappings[local.local_ref as usize] = child.cctx.id();
            Self::merge_ips(registry, &local.children, child, mappings, pid, resolved);
        }
    }

    fn merge_calling_contexts(&mut self, tree: &LocalCctxTree, resolved: &ResolvedIps) -> MappingTable {
        let mut mappings = vec![UNSET_MAPPING; tree.num_refs()];

        for (tid, thread) in tree.threads() {
            if !self.calling_context_tree.contains_key(&tid) {
                let name = if tid == 0 {
                    "<idle>".to_string()
                } else {
                    self.thread_names
                        .get(&tid)
                        .cloned()
                        .unwrap_or_else(|| "<unknown thread>".to_string())
                };
                self.add_thread(tid, &name);
            }
            let TraceState {
                registry,
                calling_context_tree,
                ..
            } = &mut *self;
            let Some(global) = calling_context_tree.get_mut(&tid) else {
                unreachable!("thread {tid} added above");
            };
            mappings[thread.entry.local_ref as usize] = global.cctx.id();

            let pid = thread.pid.unwrap_or(NO_PARENT_PROCESS_PID);
            Self::merge_ips(
                registry,
                &thread.entry.children,
                global,
                &mut mappings,
                pid,
                resolved,
            );
        }

        debug_assert!(
            mappings.iter().all(|id| *id != UNSET_MAPPING),
            "calling context merge left local references unmapped"
        );
        MappingTable::calling_context(mappings)
    }
}

pub struct Trace {
    archive: Archive,
    creator: String,
    description: String,
    properties: BTreeMap<String, String>,
    disassemble: bool,
    output_link: Option<PathBuf>,
    interrupt_generator: Ref<InterruptGenerator>,
    perf_metric_class: Option<Ref<MetricClass>>,
    safe_metric_class: Option<Ref<MetricClass>>,
    cpuid_metric_class: Ref<MetricClass>,
    state: Mutex<TraceState>,
}

fn metric_member(
    registry: &mut Registry,
    spec: &MetricSpec,
    mode: MetricMode,
    value_type: MetricValueType,
) -> Ref<MetricMember> {
    let name = registry.intern(&spec.name);
    let description = registry.intern(&spec.description);
    let unit = registry.intern(&spec.unit);
    registry.create_unkeyed(MetricMember {
        name,
        description,
        mode,
        value_type,
        unit,
    })
}

impl Trace {
    /// Creates the archive at `path` and seeds the definitions every trace
    /// has: system tree, metric classes, location groups.
    pub fn new(path: &Path, options: TraceOptions) -> Result<Self> {
        let archive = Archive::create(path)
            .with_context(|| format!("creating trace archive {}", path.display()))?;
        tracing::info!("Using trace directory: {}", path.display());

        let mut registry = Registry::new();

        let interrupt_generator = {
            let name = registry.intern(&format!("perf {}", options.sampling_event));
            registry.create_unkeyed(InterruptGenerator {
                name,
                mode: "count",
                period: options.sampling_period,
            })
        };

        let comm_locations_group = {
            let name = registry.intern("All pthread locations");
            registry.create_unkeyed(CommGroup {
                name,
                paradigm: Paradigm::Pthread,
                members: Vec::new(),
            })
        };

        let lo2s_regions_group = {
            let name = registry.intern("lo2s");
            registry.create_unkeyed(RegionsGroup {
                name,
                paradigm: Paradigm::User,
                members: Vec::new(),
            })
        };

        let cpuid_metric_class = {
            let cpu = metric_member(
                &mut registry,
                &MetricSpec {
                    name: "CPU".into(),
                    description: "CPU executing the task".into(),
                    unit: "cpuid".into(),
                },
                MetricMode::AbsolutePoint,
                MetricValueType::Int64,
            );
            registry.create_unkeyed(MetricClass { members: vec![cpu] })
        };

        let perf_metric_class = if options.counters.is_empty() {
            None
        } else {
            let mut members: Vec<_> = options
                .counters
                .iter()
                .map(|spec| {
                    metric_member(
                        &mut registry,
                        spec,
                        MetricMode::AccumulatedStart,
                        MetricValueType::Double,
                    )
                })
                .collect();
            for (name, description) in [
                ("time_enabled", "time event active"),
                ("time_running", "time event on CPU"),
            ] {
                members.push(metric_member(
                    &mut registry,
                    &MetricSpec {
                        name: name.into(),
                        description: description.into(),
                        unit: "ns".into(),
                    },
                    MetricMode::AccumulatedStart,
                    MetricValueType::Uint64,
                ));
            }
            Some(registry.create_unkeyed(MetricClass { members }))
        };

        let safe_metric_class = if options.safe_counters.is_empty() {
            None
        } else {
            let members = options
                .safe_counters
                .iter()
                .map(|spec| {
                    metric_member(
                        &mut registry,
                        spec,
                        MetricMode::AccumulatedStart,
                        MetricValueType::Double,
                    )
                })
                .collect();
            Some(registry.create_unkeyed(MetricClass { members }))
        };

        let system_tree_root = {
            let name = registry.intern(&options.hostname);
            let class = registry.intern("machine");
            registry.create_unkeyed(SystemTreeNode {
                name,
                class,
                parent: None,
                domains: vec![SystemTreeDomain::SharedMemory],
                properties: Vec::new(),
            })
        };

        let mut properties = BTreeMap::new();
        for (key, value) in options.uname.properties() {
            let property = format!("LO2S::UNAME::{key}");
            let name = registry.intern(&property);
            let ivalue = registry.intern(value);
            registry
                .def_mut(system_tree_root)
                .properties
                .push((name, ivalue));
            properties.insert(property, value.to_string());
        }

        {
            let name = registry.intern("Metric Location Group");
            registry.create(
                Key::ByLocation(Location::thread(METRIC_PID)),
                LocationGroup {
                    name,
                    group_type: LocationGroupType::Process,
                    parent: system_tree_root,
                },
            )?;
        }

        let mut groups = BTreeMap::new();
        let topology = &options.topology;
        for package in topology.packages() {
            tracing::debug!("Registering package {package}");
            let name = registry.intern(&package.to_string());
            let class = registry.intern("package");
            registry.create(
                Key::ByPackage(package),
                SystemTreeNode {
                    name,
                    class,
                    parent: Some(system_tree_root),
                    domains: vec![SystemTreeDomain::Socket],
                    properties: Vec::new(),
                },
            )?;
        }
        for core in topology.cores() {
            tracing::debug!("Registering core {}@{}", core.id, core.package_id);
            let name = registry.intern(&format!("{}:{}", core.package_id, core.id));
            let class = registry.intern("core");
            let parent = registry.get(&Key::ByPackage(core.package_id))?;
            registry.create(
                Key::ByCore {
                    core: core.id,
                    package: core.package_id,
                },
                SystemTreeNode {
                    name,
                    class,
                    parent: Some(parent),
                    domains: vec![SystemTreeDomain::Core],
                    properties: Vec::new(),
                },
            )?;
        }
        for cpu in topology.cpus() {
            tracing::debug!(
                "Registering cpu {}@{}:{}",
                cpu.id,
                cpu.core_id,
                cpu.package_id
            );
            let location = Location::cpu(cpu.id);
            let name = registry.intern(&location.name());
            let class = registry.intern("cpu");
            let parent = registry.get(&Key::ByCore {
                core: cpu.core_id,
                package: cpu.package_id,
            })?;
            let node = registry.create(
                Key::ByCpu(cpu.id),
                SystemTreeNode {
                    name,
                    class,
                    parent: Some(parent),
                    domains: vec![SystemTreeDomain::Pu],
                    properties: Vec::new(),
                },
            )?;
            registry.create(
                Key::ByLocation(location),
                LocationGroup {
                    name,
                    group_type: LocationGroupType::Process,
                    parent: node,
                },
            )?;
            groups.insert(location, location);
            groups.insert(Location::sample_cpu(cpu.id), location);
        }

        let mut state = TraceState {
            registry,
            groups,
            thread_names: BTreeMap::new(),
            calling_context_tree: BTreeMap::new(),
            system_tree_root,
            comm_locations_group,
            lo2s_regions_group,
            starting_time: None,
            stopping_time: None,
        };
        // Threads whose process cannot be determined end up here.
        state.add_process(NO_PARENT_PROCESS_PID, NO_PARENT_PROCESS_PID, "<unknown process>")?;
        state.groups.insert(Location::thread(METRIC_PID), Location::thread(METRIC_PID));

        Ok(Trace {
            archive,
            creator: format!("lo2s - {}", env!("CARGO_PKG_VERSION")),
            description: options.description,
            properties,
            disassemble: options.disassemble,
            output_link: options.output_link,
            interrupt_generator,
            perf_metric_class,
            safe_metric_class,
            cpuid_metric_class,
            state: Mutex::new(state),
        })
    }

    fn state(&self) -> MutexGuard<'_, TraceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> &Path {
        self.archive.path()
    }

    pub fn interrupt_generator(&self) -> Ref<InterruptGenerator> {
        self.interrupt_generator
    }

    pub fn perf_metric_class(&self) -> Option<Ref<MetricClass>> {
        self.perf_metric_class
    }

    pub fn safe_metric_class(&self) -> Option<Ref<MetricClass>> {
        self.safe_metric_class
    }

    pub fn cpuid_metric_class(&self) -> Ref<MetricClass> {
        self.cpuid_metric_class
    }

    pub fn begin_record(&self) {
        tracing::info!("Initialization done. Start recording...");
        self.state().starting_time = Some(time::now());
    }

    pub fn end_record(&self) {
        self.state().stopping_time = Some(time::now());
        tracing::info!("Recording done. Start finalization...");
    }

    pub fn record_from(&self) -> Option<Timestamp> {
        self.state().starting_time
    }

    pub fn record_to(&self) -> Option<Timestamp> {
        self.state().stopping_time
    }

    pub fn add_process(&self, pid: libc::pid_t, parent: libc::pid_t, name: &str) -> Result<()> {
        self.state().add_process(pid, parent, name)
    }

    pub fn update_process_name(&self, pid: libc::pid_t, name: &str) {
        self.state().update_process_name(pid, name)
    }

    pub fn add_thread(&self, tid: libc::pid_t, name: &str) {
        self.state().add_thread(tid, name)
    }

    pub fn add_threads(&self, threads: &BTreeMap<libc::pid_t, String>) {
        tracing::debug!("Adding {} monitored thread(s) to the trace", threads.len());
        let mut state = self.state();
        for (tid, name) in threads {
            state.add_thread(*tid, name);
        }
    }

    pub fn update_thread_name(&self, tid: libc::pid_t, name: &str) {
        self.state().update_thread_name(tid, name)
    }

    /// Registers `tid`, created by `ptid`, in the location group of its
    /// parent. An unknown parent puts it in the `<unknown process>` group.
    pub fn add_monitored_thread(&self, ptid: libc::pid_t, tid: libc::pid_t) {
        self.state().add_monitored_thread(ptid, tid)
    }

    /// Region `lo2s::<name>` for one of the profiler's own threads.
    pub fn add_monitoring_thread(&self, tid: libc::pid_t, name: &str, group: &str) {
        let mut state = self.state();
        tracing::debug!("Adding monitoring thread {tid} ({name}): group {group}");
        if state.registry.has::<Region>(&Key::ByThread(tid)) {
            return;
        }
        let iname = state.registry.intern(&format!("lo2s::{name}"));
        let Ok(region) = state.registry.create(
            Key::ByThread(tid),
            Region {
                name: iname,
                canonical_name: iname,
                description: iname,
                role: RegionRole::Function,
                paradigm: Paradigm::User,
                source_file: iname,
                begin_line: 0,
                end_line: 0,
            },
        ) else {
            return;
        };
        let lo2s_group = state.lo2s_regions_group;
        state.registry.def_mut(lo2s_group).members.push(region);
        let cctx = state.registry.emplace(
            Key::ByThread(tid),
            CallingContext {
                region,
                source_code_location: None,
                parent: None,
            },
        );
        state
            .calling_context_tree
            .entry(tid)
            .or_insert_with(|| GlobalCctx::new(cctx));
    }

    pub fn location(&self, location: Location) -> crate::error::Result<Ref<LocationDef>> {
        self.state().location(location)
    }

    /// Writer for samples and context switches of `location`.
    pub fn sample_writer(&self, location: Location) -> crate::error::Result<LocalWriter> {
        let r = self.location(location)?;
        self.archive.local_writer(r)
    }

    /// Writer for the metrics recorded at `location`, in the same location
    /// group.
    pub fn metric_writer(&self, location: Location) -> crate::error::Result<LocalWriter> {
        let r = {
            let mut state = self.state();
            let group = state.location_group(location)?;
            let metric_name = format!("metrics for {location}");
            let name = state.registry.intern(&metric_name);
            state.registry.emplace(
                Key::ByString(metric_name),
                LocationDef {
                    name,
                    location_type: LocationType::Metric,
                    group,
                },
            )
        };
        self.archive.local_writer(r)
    }

    /// Metric writer for names that need not be unique.
    pub fn non_unique_metric_writer(&self, name: &str) -> crate::error::Result<LocalWriter> {
        let r = {
            let mut state = self.state();
            let group = state
                .registry
                .get(&Key::ByLocation(Location::thread(METRIC_PID)))?;
            let name = state.registry.intern(name);
            state.registry.create_unkeyed(LocationDef {
                name,
                location_type: LocationType::Metric,
                group,
            })
        };
        self.archive.local_writer(r)
    }

    pub fn metric_instance(
        &self,
        class: Ref<MetricClass>,
        recorder: Ref<LocationDef>,
        scope: MetricScope,
    ) -> Ref<MetricInstance> {
        self.state().registry.create_unkeyed(MetricInstance {
            class,
            recorder,
            scope,
        })
    }

    pub fn cpu_node(&self, cpu: u32) -> crate::error::Result<Ref<SystemTreeNode>> {
        self.state().registry.get(&Key::ByCpu(cpu))
    }

    pub fn intern(&self, value: &str) -> Ref<StringDef> {
        self.state().registry.intern(value)
    }

    pub fn intern_region(&self, line_info: &LineInfo) -> Ref<Region> {
        self.state().registry.intern_region(line_info)
    }

    pub fn intern_scl(&self, line_info: &LineInfo) -> Ref<SourceCodeLocation> {
        self.state().registry.intern_scl(line_info)
    }

    /// Folds a monitor's local calling-context tree into the global one.
    /// The returned table maps every local reference of `tree` to a global
    /// calling context. Addresses are resolved before the lock is taken.
    pub fn merge_calling_contexts(
        &self,
        tree: &LocalCctxTree,
        processes: &BTreeMap<libc::pid_t, ProcessInfo>,
        resolver: &mut dyn LineInfoResolver,
    ) -> MappingTable {
        let resolved = ResolvedIps::collect(tree, processes, resolver, self.disassemble);
        self.state().merge_calling_contexts(tree, &resolved)
    }

    /// Runs `f` with read access to the definitions.
    pub fn with_registry<T>(&self, f: impl FnOnce(&Registry) -> T) -> T {
        f(&self.state().registry)
    }

    /// Location owning the location group of `location`.
    pub fn group_of(&self, location: Location) -> Option<Location> {
        self.state().groups.get(&location).copied()
    }

    /// Writes the global definitions and the anchor, then updates the
    /// latest-trace link. All local writers must be closed by now.
    pub fn finalize(&self) -> Result<PathBuf> {
        let mut state = self.state();

        let threads: Vec<(libc::pid_t, String)> = state
            .thread_names
            .iter()
            .map(|(tid, name)| (*tid, name.clone()))
            .collect();
        for (tid, name) in threads {
            let Some(region) = state.registry.find::<Region>(&Key::ByThread(tid)) else {
                continue;
            };
            let iname = state.registry.intern(&name);
            let group = state.registry.emplace(
                Key::ByString(name),
                RegionsGroup {
                    name: iname,
                    paradigm: Paradigm::User,
                    members: Vec::new(),
                },
            );
            let members = &mut state.registry.def_mut(group).members;
            if !members.contains(&region) {
                members.push(region);
            }
        }

        let start = state.starting_time.unwrap_or_else(time::now);
        let stop = state.stopping_time.unwrap_or_else(time::now).max(start);
        self.archive.write_definitions(&state.registry)?;
        self.archive.write_anchor(&archive::Anchor {
            creator: self.creator.clone(),
            description: self.description.clone(),
            version: "3.0",
            properties: self.properties.clone(),
            clock_properties: archive::ClockProperties::new(start, stop),
            number_of_locations: state.registry.all::<LocationDef>().len(),
        })?;
        drop(state);

        if let Some(link) = &self.output_link {
            name::update_trace_link(link, self.archive.path())
                .with_context(|| format!("linking {} to the trace", link.display()))?;
        }
        Ok(self.archive.path().to_path_buf())
    }
}
