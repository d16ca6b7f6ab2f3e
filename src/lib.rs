//! lo2s library - perf sampling and counters recorded into a trace archive.
//!
//! # Modules
//!
//! - [`perf`] - perf_event_open plumbing: counters, groups and sample rings
//! - [`monitor`] - one acquisition thread per thread or CPU
//! - [`trace`] - definitions registry and the on-disk archive
//! - [`profiler`] - a whole recording, from setup to the finished trace

pub mod cctx;
pub mod config;
pub mod error;
pub mod location;
pub mod metric;
pub mod mmap;
pub mod monitor;
pub mod perf;
pub mod process;
pub mod profiler;
pub mod symbolize;
pub mod time;
pub mod topology;
pub mod trace;
pub mod traced_command;

pub use config::{Config, MonitorMode};
pub use error::{Error, Result};
pub use location::Location;
