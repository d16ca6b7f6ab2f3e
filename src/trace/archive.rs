//! On-disk layout of a trace.
//!
//! ```text
//! <trace>/traces.otf2        anchor: creator, properties, clock, locations
//! <trace>/traces.def         global definitions, one JSON object per line
//! <trace>/traces/<ref>.evt   events of one location, one JSON object per line
//! <trace>/traces/<ref>.def   mapping tables and event count of that location
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::definitions::{CallingContext, InterruptGenerator, LocationDef, MetricInstance};
use super::registry::{Ref, Registry};
use crate::error::{Error, Result};
use crate::time::Timestamp;

pub const ANCHOR_FILE: &str = "traces.otf2";
pub const DEFINITIONS_FILE: &str = "traces.def";
pub const LOCAL_DIR: &str = "traces";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Double(f64),
    Unsigned(u64),
    Signed(i64),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Metric {
        time: Timestamp,
        instance: Ref<MetricInstance>,
        values: Vec<MetricValue>,
    },
    CallingContextSample {
        time: Timestamp,
        calling_context: u32,
        unwind_distance: u32,
        interrupt_generator: Ref<InterruptGenerator>,
    },
    CallingContextEnter {
        time: Timestamp,
        calling_context: u32,
        unwind_distance: u32,
    },
    CallingContextLeave {
        time: Timestamp,
        calling_context: u32,
    },
}

impl Event {
    pub fn time(&self) -> Timestamp {
        match self {
            Event::Metric { time, .. }
            | Event::CallingContextSample { time, .. }
            | Event::CallingContextEnter { time, .. }
            | Event::CallingContextLeave { time, .. } => *time,
        }
    }

    fn set_time(&mut self, t: Timestamp) {
        match self {
            Event::Metric { time, .. }
            | Event::CallingContextSample { time, .. }
            | Event::CallingContextEnter { time, .. }
            | Event::CallingContextLeave { time, .. } => *time = t,
        }
    }
}

/// Translation of the local reference ids in one event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappingTable {
    pub kind: &'static str,
    pub mappings: Vec<u32>,
}

impl MappingTable {
    pub fn calling_context(mappings: Vec<u32>) -> Self {
        MappingTable {
            kind: "calling_context",
            mappings,
        }
    }

    pub fn resolve(&self, local: u32) -> Option<Ref<CallingContext>> {
        self.mappings
            .get(local as usize)
            .copied()
            .filter(|id| *id != u32::MAX)
            .map(Ref::from_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClockProperties {
    pub timer_resolution: u64,
    pub global_offset: u64,
    pub trace_length: u64,
}

impl ClockProperties {
    pub fn new(start: Timestamp, stop: Timestamp) -> Self {
        ClockProperties {
            timer_resolution: 1_000_000_000,
            global_offset: start.0,
            trace_length: stop.saturating_sub(start),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Anchor {
    pub creator: String,
    pub description: String,
    pub version: &'static str,
    pub properties: BTreeMap<String, String>,
    pub clock_properties: ClockProperties,
    pub number_of_locations: usize,
}

/// Directory of one trace.
#[derive(Debug)]
pub struct Archive {
    root: PathBuf,
    local_dir: PathBuf,
}

fn archive_error(path: &Path) -> impl FnOnce(std::io::Error) -> Error + '_ {
    move |source| Error::Archive {
        path: path.to_path_buf(),
        source,
    }
}

impl Archive {
    /// Creates the trace directory. An existing trace is never overwritten.
    pub fn create(root: &Path) -> Result<Self> {
        let anchor = root.join(ANCHOR_FILE);
        if anchor.exists() {
            return Err(Error::Archive {
                path: anchor,
                source: std::io::ErrorKind::AlreadyExists.into(),
            });
        }
        let local_dir = root.join(LOCAL_DIR);
        fs::create_dir_all(&local_dir).map_err(archive_error(&local_dir))?;
        Ok(Archive {
            root: root.to_path_buf(),
            local_dir,
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn local_writer(&self, location: Ref<LocationDef>) -> Result<LocalWriter> {
        let events = self.local_dir.join(format!("{}.evt", location.id()));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&events)
            .map_err(archive_error(&events))?;
        Ok(LocalWriter {
            location,
            events: BufWriter::new(file),
            events_path: events,
            definitions_path: self.local_dir.join(format!("{}.def", location.id())),
            last_time: Timestamp::default(),
            count: 0,
            clamped: 0,
        })
    }

    pub fn write_definitions(&self, registry: &Registry) -> Result<()> {
        let path = self.root.join(DEFINITIONS_FILE);
        let file = File::create(&path).map_err(archive_error(&path))?;
        let mut out = BufWriter::new(file);
        registry
            .write_definitions(&mut out)
            .and_then(|_| out.flush())
            .map_err(archive_error(&path))
    }

    pub fn write_anchor(&self, anchor: &Anchor) -> Result<()> {
        let path = self.root.join(ANCHOR_FILE);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(archive_error(&path))?;
        let mut out = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut out, anchor)
            .map_err(std::io::Error::from)
            .and_then(|_| out.flush())
            .map_err(archive_error(&path))
    }
}

#[derive(Serialize)]
struct LocalDefinitions<'a> {
    location: Ref<LocationDef>,
    number_of_events: u64,
    mapping_tables: &'a [MappingTable],
}

/// Event stream of a single location. Owned by exactly one monitor.
#[derive(Debug)]
pub struct LocalWriter {
    location: Ref<LocationDef>,
    events: BufWriter<File>,
    events_path: PathBuf,
    definitions_path: PathBuf,
    last_time: Timestamp,
    count: u64,
    clamped: u64,
}

impl LocalWriter {
    pub fn location(&self) -> Ref<LocationDef> {
        self.location
    }

    /// Appends `event`. A timestamp older than the previous event is raised
    /// to it so the stream stays monotonic.
    pub fn write(&mut self, mut event: Event) -> Result<()> {
        if event.time() < self.last_time {
            self.clamped += 1;
            event.set_time(self.last_time);
        }
        self.last_time = event.time();
        serde_json::to_writer(&mut self.events, &event)
            .map_err(std::io::Error::from)
            .and_then(|_| self.events.write_all(b"\n"))
            .map_err(archive_error(&self.events_path))?;
        self.count += 1;
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn clamped(&self) -> u64 {
        self.clamped
    }

    /// Flushes the events and writes the location's definitions file.
    pub fn close(mut self, mapping_tables: &[MappingTable]) -> Result<u64> {
        self.events
            .flush()
            .map_err(archive_error(&self.events_path))?;
        if self.clamped > 0 {
            tracing::warn!(
                "{} events of location {} were older than their predecessor",
                self.clamped,
                self.location.id()
            );
        }
        let defs = LocalDefinitions {
            location: self.location,
            number_of_events: self.count,
            mapping_tables,
        };
        let file = File::create(&self.definitions_path).map_err(archive_error(&self.definitions_path))?;
        let mut out = BufWriter::new(file);
        serde_json::to_writer(&mut out, &defs)
            .map_err(std::io::Error::from)
            .and_then(|_| out.flush())
            .map_err(archive_error(&self.definitions_path))?;
        Ok(self.count)
    }
}
