use std::time::Duration;

use anyhow::{bail, Result};
use clap::{ArgAction, Parser};
use tracing_subscriber::filter::EnvFilter;

use lo2s::config::{Config, MonitorMode};
use lo2s::profiler;
use lo2s::traced_command::TracedCommand;

/// Sampling profiler writing perf samples and counters into a trace.
#[derive(Debug, Parser)]
#[command(name = "lo2s", version, about)]
struct Command {
    /// Attach to a running process
    #[arg(short, long, conflicts_with = "command")]
    pid: Option<libc::pid_t>,
    /// System mode: one monitor per online CPU
    #[arg(short, long)]
    all_cpus: bool,
    /// Trace directory template (overrides LO2S_OUTPUT_TRACE)
    #[arg(short, long = "output-trace")]
    output_trace: Option<String>,
    /// Counters read on every read interval
    #[arg(short, long = "event")]
    events: Vec<String>,
    /// Counter group leader
    #[arg(long)]
    metric_leader: Option<String>,
    /// The leader samples the group every N events
    #[arg(long)]
    metric_count: Option<u64>,
    /// Counters read individually on the safe read interval
    #[arg(long = "safe-event")]
    safe_events: Vec<String>,
    /// Counter read interval in milliseconds
    #[arg(short = 'i', long, default_value = "100")]
    read_interval: u64,
    /// Safe counter read interval in milliseconds
    #[arg(long, default_value = "100")]
    safe_read_interval: u64,
    #[arg(long)]
    no_instruction_sampling: bool,
    /// Event driving instruction sampling
    #[arg(long, default_value = "instructions")]
    sampling_event: String,
    /// Sampling period in events
    #[arg(short = 'c', long = "count", default_value = "11010113")]
    sampling_period: u64,
    /// Record call stacks
    #[arg(short = 'g', long)]
    call_graph: bool,
    #[arg(short = 'k', long, default_value_t = true, action = ArgAction::Set)]
    exclude_kernel: bool,
    /// Attach instruction bytes to calling contexts
    #[arg(long)]
    disassemble: bool,
    /// Skip symbol resolution
    #[arg(long)]
    no_line_info: bool,
    /// Do not ask perf for CLOCK_MONOTONIC timestamps
    #[arg(long)]
    no_clockid: bool,
    /// Ring buffer data pages per event, a power of two
    #[arg(long, default_value = "16")]
    mmap_pages: usize,
    /// A failed monitor does not stop the recording
    #[arg(long)]
    keep_going: bool,
    /// Stop after this many seconds (0 = until exit or Ctrl-C)
    #[arg(short, long, default_value = "0")]
    duration: u64,
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
    /// Command to record
    #[arg(last = true)]
    command: Vec<String>,
}

impl Command {
    fn into_config(self) -> Result<Config> {
        if !self.mmap_pages.is_power_of_two() {
            bail!("--mmap-pages must be a power of two, got {}", self.mmap_pages);
        }
        if self.sampling_period == 0 {
            bail!("--count must be positive");
        }
        let mode = if self.all_cpus {
            MonitorMode::System
        } else {
            MonitorMode::Process
        };
        if mode == MonitorMode::Process && self.pid.is_none() && self.command.is_empty() {
            bail!("nothing to record: give a command after --, --pid or --all-cpus");
        }
        Ok(Config {
            verbosity: self.verbose,
            quiet: self.quiet,
            mode,
            pid: self.pid,
            command: self.command,
            trace_path: self.output_trace,
            sampling: !self.no_instruction_sampling,
            sampling_event: self.sampling_event,
            sampling_period: self.sampling_period,
            call_graph: self.call_graph,
            exclude_kernel: self.exclude_kernel,
            read_interval: Duration::from_millis(self.read_interval.max(1)),
            safe_read_interval: Duration::from_millis(self.safe_read_interval.max(1)),
            counters: self.events,
            metric_leader: self.metric_leader,
            metric_count: self.metric_count,
            safe_counters: self.safe_events,
            mmap_pages: self.mmap_pages,
            disassemble: self.disassemble,
            line_info: !self.no_line_info,
            use_clockid: !self.no_clockid,
            keep_going: self.keep_going,
            duration: self.duration,
            command_line: std::env::args().collect::<Vec<_>>().join(" "),
        })
    }
}

fn init_log(config: &Config) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.tracing_filter()));
    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .try_init()
    {
        eprintln!("failed to init logger: {e}");
    }
}

fn main() -> Result<()> {
    let config = Command::parse().into_config()?;
    init_log(&config);

    // Fork before any thread exists.
    let command = match config.pid {
        None if !config.command.is_empty() => Some(TracedCommand::spawn(&config.command)?),
        _ => None,
    };

    let code = profiler::run(config, command)?;
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_to_config() {
        let config = Command::parse_from([
            "lo2s", "-e", "cpu-cycles", "-e", "cache-misses", "-i", "50", "-vv", "--", "ls",
            "-l",
        ])
        .into_config()
        .unwrap();
        assert_eq!(config.mode, MonitorMode::Process);
        assert_eq!(config.command, vec!["ls", "-l"]);
        assert_eq!(config.counters, vec!["cpu-cycles", "cache-misses"]);
        assert_eq!(config.read_interval, Duration::from_millis(50));
        assert_eq!(config.verbosity, 2);
        assert!(config.exclude_kernel);
        assert!(config.sampling);
    }

    #[test]
    fn test_invalid_command_lines() {
        assert!(Command::parse_from(["lo2s"]).into_config().is_err());
        assert!(Command::parse_from(["lo2s", "--mmap-pages", "3", "--", "ls"])
            .into_config()
            .is_err());
        assert!(Command::try_parse_from(["lo2s", "-p", "1", "--", "ls"]).is_err());
        let system = Command::parse_from(["lo2s", "-a", "-k", "false"]).into_config().unwrap();
        assert_eq!(system.mode, MonitorMode::System);
        assert!(!system.exclude_kernel);
    }
}
