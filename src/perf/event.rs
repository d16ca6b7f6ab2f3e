//! Counter descriptions and their discovery from the generic perf names and
//! the PMUs exported in sysfs.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use regex::Regex;

use super::sys::*;

const EVENT_SOURCE_DEVICES: &str = "/sys/bus/event_source/devices";

/// A kernel event identity.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterDescription {
    pub name: String,
    pub event_type: u32,
    pub config: u64,
    pub config1: u64,
    pub unit: String,
    pub scale: f64,
}

impl CounterDescription {
    pub fn new(name: &str, event_type: u32, config: u64) -> Self {
        CounterDescription {
            name: name.to_string(),
            event_type,
            config,
            config1: 0,
            unit: "#".to_string(),
            scale: 1.0,
        }
    }

    pub fn attr(&self) -> perf_event_attr {
        let mut attr = perf_event_attr::new(self.event_type, self.config);
        attr.bp_1.config1 = self.config1;
        attr
    }
}

/// The leader and members of a counter group, leader first when iterated.
#[derive(Debug, Clone)]
pub struct EventCollection {
    pub leader: CounterDescription,
    pub counters: Vec<CounterDescription>,
}

impl EventCollection {
    pub fn resolve(names: &[String], catalog: &EventCatalog) -> Result<Option<Self>> {
        let mut descriptions = names
            .iter()
            .map(|name| catalog.resolve(name))
            .collect::<Result<Vec<_>>>()?;
        if descriptions.is_empty() {
            return Ok(None);
        }
        let leader = descriptions.remove(0);
        Ok(Some(EventCollection {
            leader,
            counters: descriptions,
        }))
    }

    pub fn len(&self) -> usize {
        self.counters.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn iter(&self) -> impl Iterator<Item = &CounterDescription> {
        std::iter::once(&self.leader).chain(self.counters.iter())
    }
}

fn generic_event(name: &str) -> Option<(u32, u64)> {
    let event = match name {
        "cpu-cycles" | "cycles" => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES),
        "instructions" => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_INSTRUCTIONS),
        "cache-references" => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_REFERENCES),
        "cache-misses" => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_MISSES),
        "branch-instructions" | "branches" => {
            (PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_INSTRUCTIONS)
        }
        "branch-misses" => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_MISSES),
        "bus-cycles" => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_BUS_CYCLES),
        "stalled-cycles-frontend" => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_STALLED_CYCLES_FRONTEND),
        "stalled-cycles-backend" => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_STALLED_CYCLES_BACKEND),
        "ref-cycles" => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_REF_CPU_CYCLES),
        "cpu-clock" => (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CPU_CLOCK),
        "task-clock" => (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_TASK_CLOCK),
        "page-faults" | "faults" => (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS),
        "context-switches" | "cs" => (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CONTEXT_SWITCHES),
        "cpu-migrations" | "migrations" => (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CPU_MIGRATIONS),
        "minor-faults" => (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS_MIN),
        "major-faults" => (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS_MAJ),
        _ => return None,
    };
    Some(event)
}

/// PMU events exported by the kernel, keyed by event name.
#[derive(Debug, Default)]
pub struct EventCatalog {
    events: HashMap<String, Vec<CounterDescription>>,
}

impl EventCatalog {
    pub fn discover() -> Result<Self> {
        let mut catalog = EventCatalog::default();
        let root = Path::new(EVENT_SOURCE_DEVICES);
        if root.is_dir() {
            catalog.visit_pmus(root)?;
        }
        Ok(catalog)
    }

    pub fn discover_in(root: &Path) -> Result<Self> {
        let mut catalog = EventCatalog::default();
        catalog.visit_pmus(root)?;
        Ok(catalog)
    }

    fn visit_pmus(&mut self, root: &Path) -> Result<()> {
        for entry in fs::read_dir(root).with_context(|| format!("reading {}", root.display()))? {
            let path = entry?.path();
            let Some(pmu) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            let Ok(buf) = fs::read_to_string(path.join("type")) else {
                continue;
            };
            let Ok(event_type) = buf.trim().parse::<u32>() else {
                continue;
            };
            let events_dir = path.join("events");
            if events_dir.is_dir() {
                for mut event in visit_events(&events_dir)? {
                    event.event_type = event_type;
                    self.events
                        .entry(format!("{pmu}/{}/", event.name))
                        .or_default()
                        .push(event.clone());
                    self.events.entry(event.name.clone()).or_default().push(event);
                }
            }
        }
        Ok(())
    }

    /// Looks up a PMU event by name. `*` matches any sequence of characters.
    pub fn event(&self, name: &str) -> Option<Vec<CounterDescription>> {
        if let Some(result) = self.events.get(name) {
            return Some(result.clone());
        }

        if !name.contains('*') {
            return None;
        }

        let pattern = format!("^{}$", regex::escape(name).replace(r"\*", ".*"));
        let re = Regex::new(&pattern).ok()?;
        let mut result: Vec<CounterDescription> = Vec::new();
        for (key, value) in &self.events {
            if re.is_match(key) {
                result.extend(value.iter().cloned());
            }
        }
        if result.is_empty() {
            return None;
        }
        Some(result)
    }

    /// Resolves a user supplied event name: generic perf names first, then
    /// sysfs PMU events (`name` or `pmu/name/`), then raw `rNNNN` codes.
    pub fn resolve(&self, name: &str) -> Result<CounterDescription> {
        if let Some((event_type, config)) = generic_event(name) {
            return Ok(CounterDescription::new(name, event_type, config));
        }
        if let Some(mut events) = self.event(name) {
            let mut event = events.remove(0);
            event.name = name.to_string();
            return Ok(event);
        }
        if let Some(raw) = name.strip_prefix('r') {
            if let Ok(config) = u64::from_str_radix(raw, 16) {
                return Ok(CounterDescription::new(name, PERF_TYPE_RAW, config));
            }
        }
        bail!("unknown perf event: {name}")
    }
}

fn visit_events(dir: &Path) -> Result<Vec<CounterDescription>> {
    let event_re = Regex::new(r"event=0x([0-9a-fA-F]+)")?;
    let umask_re = Regex::new(r"umask=0x([0-9a-fA-F]+)")?;
    let config1_re = Regex::new(r"config1=0x([0-9a-fA-F]+)")?;

    let mut events = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.contains('.') {
            continue;
        }
        let buf = fs::read_to_string(&path)?;
        let mut event = CounterDescription::new(name, 0, 0);

        if let Some(caps) = event_re.captures(&buf) {
            event.config = u64::from_str_radix(&caps[1], 16)?;
        }
        if let Some(caps) = umask_re.captures(&buf) {
            event.config |= u64::from_str_radix(&caps[1], 16)? << 8;
        }
        if let Some(caps) = config1_re.captures(&buf) {
            event.config1 = u64::from_str_radix(&caps[1], 16)?;
        }
        if let Ok(unit) = fs::read_to_string(dir.join(format!("{name}.unit"))) {
            let unit = unit.trim();
            if !unit.is_empty() {
                event.unit = unit.to_string();
            }
        }
        if let Ok(scale) = fs::read_to_string(dir.join(format!("{name}.scale"))) {
            event.scale = scale.trim().parse().unwrap_or(1.0);
        }
        events.push(event);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_pmu(root: &Path, pmu: &str, event_type: u32, events: &[(&str, &str)]) {
        let dir = root.join(pmu);
        fs::create_dir_all(dir.join("events")).unwrap();
        fs::write(dir.join("type"), format!("{event_type}\n")).unwrap();
        for (name, content) in events {
            fs::write(dir.join("events").join(name), content).unwrap();
        }
    }

    #[test]
    fn test_generic_names() {
        let catalog = EventCatalog::default();
        let event = catalog.resolve("instructions").unwrap();
        assert_eq!(event.event_type, PERF_TYPE_HARDWARE);
        assert_eq!(event.config, PERF_COUNT_HW_INSTRUCTIONS);

        let event = catalog.resolve("task-clock").unwrap();
        assert_eq!(event.event_type, PERF_TYPE_SOFTWARE);
        assert_eq!(event.config, PERF_COUNT_SW_TASK_CLOCK);
    }

    #[test]
    fn test_raw_and_unknown_events() {
        let catalog = EventCatalog::default();
        let event = catalog.resolve("r01c2").unwrap();
        assert_eq!(event.event_type, PERF_TYPE_RAW);
        assert_eq!(event.config, 0x1c2);
        assert!(catalog.resolve("no-such-event").is_err());
    }

    #[test]
    fn test_discover_sysfs_events() {
        let tmp = TempDir::new().unwrap();
        fake_pmu(
            tmp.path(),
            "cpu",
            4,
            &[
                ("mem-loads", "event=0xcd,umask=0x1,ldlat=3\n"),
                ("topdown-retiring", "event=0x00,umask=0x80\n"),
            ],
        );
        fake_pmu(
            tmp.path(),
            "power",
            23,
            &[
                ("energy-pkg", "event=0x02\n"),
                ("energy-pkg.unit", "Joules\n"),
                ("energy-pkg.scale", "2.3283064365386962890625e-10\n"),
            ],
        );

        let catalog = EventCatalog::discover_in(tmp.path()).unwrap();

        let loads = catalog.resolve("mem-loads").unwrap();
        assert_eq!(loads.event_type, 4);
        assert_eq!(loads.config, 0xcd | (0x1 << 8));

        let energy = catalog.resolve("power/energy-pkg/").unwrap();
        assert_eq!(energy.event_type, 23);
        assert_eq!(energy.unit, "Joules");
        assert!(energy.scale < 1e-9);

        let topdown = catalog.event("topdown-*").unwrap();
        assert_eq!(topdown.len(), 1);
    }

    #[test]
    fn test_collection_leader_first() {
        let catalog = EventCatalog::default();
        let names = vec!["cpu-cycles".to_string(), "cache-misses".to_string()];
        let collection = EventCollection::resolve(&names, &catalog).unwrap().unwrap();
        let order: Vec<_> = collection.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(order, vec!["cpu-cycles", "cache-misses"]);
        assert_eq!(collection.len(), 2);

        assert!(EventCollection::resolve(&[], &catalog).unwrap().is_none());
    }
}
