use std::time::Duration;

/// What the profiler attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorMode {
    /// One monitor per thread of a single process (attached or spawned).
    Process,
    /// One monitor per online CPU.
    System,
}

/// Runtime options for a recording, separated from the CLI parsing.
#[derive(Debug, Clone)]
pub struct Config {
    /// Verbosity level (0 = warn, 1 = info, 2 = debug, 3+ = trace)
    pub verbosity: u8,
    /// Only report errors
    pub quiet: bool,
    pub mode: MonitorMode,
    /// Attach to this running process instead of spawning a command
    pub pid: Option<libc::pid_t>,
    /// Command to spawn and record (everything after --)
    pub command: Vec<String>,
    /// Trace directory template, falls back to LO2S_OUTPUT_TRACE
    pub trace_path: Option<String>,
    /// Record instruction pointer samples
    pub sampling: bool,
    /// Event that drives instruction sampling
    pub sampling_event: String,
    /// Sampling period in events
    pub sampling_period: u64,
    /// Record the call chain with every sample
    pub call_graph: bool,
    pub exclude_kernel: bool,
    /// Interval between counter reads
    pub read_interval: Duration,
    /// Interval between reads of the individually opened counters
    pub safe_read_interval: Duration,
    /// Counters opened as one group
    pub counters: Vec<String>,
    /// Group leader, defaults to the first counter
    pub metric_leader: Option<String>,
    /// When set, the leader samples the whole group every N events
    pub metric_count: Option<u64>,
    /// Counters opened individually
    pub safe_counters: Vec<String>,
    /// Ring buffer data pages per perf event, must be a power of two
    pub mmap_pages: usize,
    /// Attach instruction bytes to calling contexts
    pub disassemble: bool,
    /// Resolve instruction addresses to functions and source lines
    pub line_info: bool,
    /// Ask perf for CLOCK_MONOTONIC timestamps
    pub use_clockid: bool,
    /// A failing monitor does not stop the other monitors
    pub keep_going: bool,
    /// Duration in seconds (0 = until the command exits or Ctrl-C)
    pub duration: u64,
    /// Full command line, recorded as the trace description
    pub command_line: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            verbosity: 0,
            quiet: false,
            mode: MonitorMode::Process,
            pid: None,
            command: Vec::new(),
            trace_path: None,
            sampling: true,
            sampling_event: "instructions".to_string(),
            sampling_period: 11_010_113,
            call_graph: false,
            exclude_kernel: true,
            read_interval: Duration::from_millis(100),
            safe_read_interval: Duration::from_millis(100),
            counters: Vec::new(),
            metric_leader: None,
            metric_count: None,
            safe_counters: Vec::new(),
            mmap_pages: 16,
            disassemble: false,
            line_info: true,
            use_clockid: true,
            keep_going: false,
            duration: 0,
            command_line: String::new(),
        }
    }
}

impl Config {
    /// Counters the main group reads, leader first.
    pub fn group_counters(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let Some(leader) = &self.metric_leader {
            names.push(leader.clone());
        }
        for name in &self.counters {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    pub fn tracing_filter(&self) -> &'static str {
        if self.quiet {
            return "error";
        }
        match self.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}
