//! Host and process metadata from /proc, /sys and uname.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
use nix::unistd::Pid;

use crate::error::Error;
use crate::location::{Location, LocationKind};

fn read_comm(path: &str) -> String {
    match fs::read_to_string(path) {
        Ok(comm) => comm.trim().to_string(),
        Err(_) => "<unknown>".to_string(),
    }
}

pub fn pid_comm(pid: libc::pid_t) -> String {
    read_comm(&format!("/proc/{pid}/comm"))
}

pub fn task_comm(pid: libc::pid_t, tid: libc::pid_t) -> String {
    read_comm(&format!("/proc/{pid}/task/{tid}/comm"))
}

pub fn process_exe(pid: libc::pid_t) -> Option<PathBuf> {
    fs::read_link(format!("/proc/{pid}/exe")).ok()
}

/// Thread ids of `pid`, sorted.
pub fn process_tasks(pid: libc::pid_t) -> Result<Vec<libc::pid_t>> {
    let dir = format!("/proc/{pid}/task");
    let mut tids = Vec::new();
    for entry in fs::read_dir(&dir).with_context(|| format!("listing {dir}"))? {
        if let Some(tid) = entry?.file_name().to_str().and_then(|s| s.parse().ok()) {
            tids.push(tid);
        }
    }
    tids.sort_unstable();
    Ok(tids)
}

/// Command names of every process currently running.
pub fn running_processes() -> Result<BTreeMap<libc::pid_t, String>> {
    let mut comms = BTreeMap::new();
    for entry in fs::read_dir("/proc").context("listing /proc")? {
        let entry = entry?;
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) else {
            continue;
        };
        comms.insert(pid, pid_comm(pid));
    }
    Ok(comms)
}

/// Fields of /proc/<pid>/stat, counted from 1 as in proc(5). The command
/// name may contain spaces and parentheses, so parsing starts after the last
/// closing parenthesis.
fn stat_field(stat: &str, field: usize) -> Option<&str> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(field.checked_sub(3)?)
}

pub fn parse_stat_ppid(stat: &str) -> Option<libc::pid_t> {
    stat_field(stat, 4)?.parse().ok()
}

pub fn parse_stat_last_cpu(stat: &str) -> Option<u32> {
    stat_field(stat, 39)?.parse().ok()
}

pub fn parent_pid(pid: libc::pid_t) -> Option<libc::pid_t> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_stat_ppid(&stat)
}

pub fn task_last_cpu(pid: libc::pid_t, tid: libc::pid_t) -> Option<u32> {
    let stat = fs::read_to_string(format!("/proc/{pid}/task/{tid}/stat")).ok()?;
    parse_stat_last_cpu(&stat)
}

/// Reads `/proc/sys/<section>/<name>`.
pub fn get_sysctl(section: &str, name: &str) -> Result<i64> {
    let path = format!("/proc/sys/{section}/{name}");
    let value = fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    value
        .trim()
        .parse()
        .with_context(|| format!("parsing {path}: {value:?}"))
}

pub fn gettid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Uname {
    pub sysname: String,
    pub nodename: String,
    pub release: String,
    pub version: String,
    pub machine: String,
}

impl Uname {
    pub fn current() -> Result<Self> {
        let uts = nix::sys::utsname::uname().context("uname")?;
        Ok(Uname {
            sysname: uts.sysname().to_string_lossy().into_owned(),
            nodename: uts.nodename().to_string_lossy().into_owned(),
            release: uts.release().to_string_lossy().into_owned(),
            version: uts.version().to_string_lossy().into_owned(),
            machine: uts.machine().to_string_lossy().into_owned(),
        })
    }

    /// (key, value) pairs recorded as `LO2S::UNAME::<KEY>` trace properties.
    pub fn properties(&self) -> [(&'static str, &str); 5] {
        [
            ("SYSNAME", &self.sysname),
            ("NODENAME", &self.nodename),
            ("RELEASE", &self.release),
            ("VERSION", &self.version),
            ("MACHINE", &self.machine),
        ]
    }
}

pub fn hostname() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string())
}

/// Pins the calling thread next to what it measures: the CPU itself for CPU
/// locations, the target's current affinity for threads. Returns the mask
/// that was applied.
pub fn pin_to_location(location: Location) -> Result<Option<CpuSet>, Error> {
    let affinity_error = |source| Error::Affinity {
        location: location.name(),
        source,
    };
    let mask = match location.kind {
        LocationKind::Cpu | LocationKind::SampleCpu => {
            let mut mask = CpuSet::new();
            mask.set(location.id as usize).map_err(affinity_error)?;
            mask
        }
        LocationKind::Thread => {
            sched_getaffinity(Pid::from_raw(location.id as libc::pid_t)).map_err(affinity_error)?
        }
        LocationKind::Unknown => return Ok(None),
    };
    sched_setaffinity(Pid::from_raw(0), &mask).map_err(affinity_error)?;
    Ok(Some(mask))
}

/// Follows a monitored thread whose affinity changed since the last call.
pub fn follow_thread_affinity(tid: libc::pid_t, current: &mut Option<CpuSet>) -> Result<(), Error> {
    let location = Location::thread(tid);
    let mask = sched_getaffinity(Pid::from_raw(tid)).map_err(|source| Error::Affinity {
        location: location.name(),
        source,
    })?;
    if current.as_ref() != Some(&mask) {
        sched_setaffinity(Pid::from_raw(0), &mask).map_err(|source| Error::Affinity {
            location: location.name(),
            source,
        })?;
        *current = Some(mask);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "1234 (my (odd) proc) S 1 1234 1234 0 -1 4194560 300 0 0 0 \
        5 3 0 0 20 0 4 0 1000 10000000 500 18446744073709551615 1 1 0 0 0 0 0 0 0 0 0 0 17 6 \
        0 0 0 0 0";

    #[test]
    fn test_parse_stat() {
        assert_eq!(parse_stat_ppid(STAT), Some(1));
        assert_eq!(parse_stat_last_cpu(STAT), Some(6));
        assert_eq!(parse_stat_ppid("garbage"), None);
    }

    #[test]
    fn test_self_metadata() {
        let pid = std::process::id() as libc::pid_t;
        assert_ne!(pid_comm(pid), "<unknown>");
        assert!(process_tasks(pid).unwrap().contains(&gettid()));
        assert!(running_processes().unwrap().contains_key(&pid));
        assert_eq!(pid_comm(-5), "<unknown>");
    }

    #[test]
    fn test_uname_properties() {
        let uname = Uname::current().unwrap();
        assert_eq!(uname.sysname, "Linux");
        assert_eq!(uname.properties()[4].0, "MACHINE");
    }

    #[test]
    fn test_sysctl() {
        assert!(get_sysctl("kernel", "pid_max").unwrap() > 0);
        assert!(get_sysctl("kernel", "no_such_sysctl").is_err());
    }
}
