//! Raw `perf_event_open` ABI.

use std::io::{Error, ErrorKind};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use bitfield::bitfield;
use nix::errno::Errno;
use nix::ioctl_none;

#[repr(C)]
#[derive(Clone, Copy)]
pub union sample_un {
    pub sample_period: u64,
    pub sample_freq: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union wakeup_un {
    pub wakeup_events: u32,
    pub wakeup_watermark: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union bp_1_un {
    pub bp_addr: u64,
    pub config1: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union bp_2_un {
    pub bp_len: u64,
    pub config2: u64,
}

bitfield! {
    #[allow(non_camel_case_types)]
    #[derive(Clone, Copy)]
    pub struct perf_event_attr_flags(u64);
    impl Debug;
    pub disabled, set_disabled: 0, 0;
    pub inherit, set_inherit: 1, 1;
    pub pinned, set_pinned: 2, 2;
    pub exclusive, set_exclusive: 3, 3;
    pub exclude_user, set_exclude_user: 4, 4;
    pub exclude_kernel, set_exclude_kernel: 5, 5;
    pub exclude_hv, set_exclude_hv: 6, 6;
    pub exclude_idle, set_exclude_idle: 7, 7;
    pub mmap, set_mmap: 8, 8;
    pub comm, set_comm: 9, 9;
    pub freq, set_freq: 10, 10;
    pub inherit_stat, set_inherit_stat: 11, 11;
    pub enable_on_exec, set_enable_on_exec: 12, 12;
    pub task, set_task: 13, 13;
    pub watermark, set_watermark: 14, 14;
    pub precise_ip, set_precise_ip: 16, 15;
    pub mmap_data, set_mmap_data: 17, 17;
    pub sample_id_all, set_sample_id_all: 18, 18;
    pub exclude_host, set_exclude_host: 19, 19;
    pub exclude_guest, set_exclude_guest: 20, 20;
    pub exclude_callchain_kernel, set_exclude_callchain_kernel: 21, 21;
    pub exclude_callchain_user, set_exclude_callchain_user: 22, 22;
    pub mmap2, set_mmap2: 23, 23;
    pub comm_exec, set_comm_exec: 24, 24;
    pub use_clockid, set_use_clockid: 25, 25;
    pub context_switch, set_context_switch: 26, 26;
    pub __reserved_1, _: 63, 27;
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(non_camel_case_types)]
pub struct perf_event_attr {
    pub _type: u32,
    pub size: u32,
    pub config: u64,
    pub sample: sample_un,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: perf_event_attr_flags,
    pub wakeup: wakeup_un,
    pub bp_type: u32,
    pub bp_1: bp_1_un,
    pub bp_2: bp_2_un,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
    pub aux_sample_size: u32,
    pub __reserved_3: u32,
}

impl perf_event_attr {
    /// A zeroed attribute for the given event with `size` filled in.
    pub fn new(event_type: u32, config: u64) -> Self {
        // SAFETY: every field is an integer, a union of integers or a bitfield over u64.
        let mut attr: perf_event_attr = unsafe { mem::zeroed() };
        attr._type = event_type;
        attr.size = mem::size_of::<perf_event_attr>() as u32;
        attr.config = config;
        attr
    }
}

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_SOFTWARE: u32 = 1;
pub const PERF_TYPE_RAW: u32 = 4;

pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
pub const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
pub const PERF_COUNT_HW_CACHE_REFERENCES: u64 = 2;
pub const PERF_COUNT_HW_CACHE_MISSES: u64 = 3;
pub const PERF_COUNT_HW_BRANCH_INSTRUCTIONS: u64 = 4;
pub const PERF_COUNT_HW_BRANCH_MISSES: u64 = 5;
pub const PERF_COUNT_HW_BUS_CYCLES: u64 = 6;
pub const PERF_COUNT_HW_STALLED_CYCLES_FRONTEND: u64 = 7;
pub const PERF_COUNT_HW_STALLED_CYCLES_BACKEND: u64 = 8;
pub const PERF_COUNT_HW_REF_CPU_CYCLES: u64 = 9;

pub const PERF_COUNT_SW_CPU_CLOCK: u64 = 0;
pub const PERF_COUNT_SW_TASK_CLOCK: u64 = 1;
pub const PERF_COUNT_SW_PAGE_FAULTS: u64 = 2;
pub const PERF_COUNT_SW_CONTEXT_SWITCHES: u64 = 3;
pub const PERF_COUNT_SW_CPU_MIGRATIONS: u64 = 4;
pub const PERF_COUNT_SW_PAGE_FAULTS_MIN: u64 = 5;
pub const PERF_COUNT_SW_PAGE_FAULTS_MAJ: u64 = 6;
pub const PERF_COUNT_SW_DUMMY: u64 = 9;

pub const PERF_SAMPLE_IP: u64 = 1 << 0;
pub const PERF_SAMPLE_TID: u64 = 1 << 1;
pub const PERF_SAMPLE_TIME: u64 = 1 << 2;
pub const PERF_SAMPLE_READ: u64 = 1 << 4;
pub const PERF_SAMPLE_CALLCHAIN: u64 = 1 << 5;
pub const PERF_SAMPLE_CPU: u64 = 1 << 7;

pub const PERF_FORMAT_TOTAL_TIME_ENABLED: u64 = 1 << 0;
pub const PERF_FORMAT_TOTAL_TIME_RUNNING: u64 = 1 << 1;
pub const PERF_FORMAT_GROUP: u64 = 1 << 3;

pub const PERF_RECORD_MMAP: u32 = 1;
pub const PERF_RECORD_LOST: u32 = 2;
pub const PERF_RECORD_COMM: u32 = 3;
pub const PERF_RECORD_EXIT: u32 = 4;
pub const PERF_RECORD_FORK: u32 = 7;
pub const PERF_RECORD_SAMPLE: u32 = 9;
pub const PERF_RECORD_SWITCH: u32 = 14;
pub const PERF_RECORD_SWITCH_CPU_WIDE: u32 = 15;

pub const PERF_RECORD_MISC_COMM_EXEC: u16 = 1 << 13;
pub const PERF_RECORD_MISC_SWITCH_OUT: u16 = 1 << 13;

/// Callchain entries at or above this value are context markers, not addresses.
pub const PERF_CONTEXT_MAX: u64 = -4095i64 as u64;

pub const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;

extern "C" {
    fn syscall(number: libc::c_long, ...) -> libc::c_long;
}

pub fn perf_event_open(
    hw_event: &perf_event_attr,
    pid: libc::pid_t,
    cpu: libc::c_int,
    group_fd: libc::c_int,
    flags: libc::c_ulong,
) -> Result<PerfEventFile, Error> {
    let fd = unsafe {
        syscall(
            libc::SYS_perf_event_open,
            hw_event as *const perf_event_attr,
            pid,
            cpu,
            group_fd,
            flags | PERF_FLAG_FD_CLOEXEC,
        )
    } as i32;

    if fd < 0 {
        return Err(Error::last_os_error());
    }

    Ok(PerfEventFile {
        fd: unsafe { OwnedFd::from_raw_fd(fd) },
    })
}

const PERF_EVENT_MAGIC: u8 = b'$';
const PERF_EVENT_IOC_DISABLE: u8 = 1;
ioctl_none!(
    perf_event_ioc_disable,
    PERF_EVENT_MAGIC,
    PERF_EVENT_IOC_DISABLE
);

/// An open perf event. The descriptor is closed on drop.
#[derive(Debug)]
pub struct PerfEventFile {
    fd: OwnedFd,
}

impl PerfEventFile {
    /// Descriptors that are not perf events (ENOTTY) count as disabled.
    pub fn disable(&mut self) -> Result<(), Error> {
        match unsafe { perf_event_ioc_disable(self.fd.as_raw_fd()) } {
            Ok(_) | Err(Errno::ENOTTY) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads `buf.len()` words. Returns the number of bytes the kernel wrote.
    pub fn read_words(&self, buf: &mut [u64]) -> Result<usize, Error> {
        let len = mem::size_of_val(buf);
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                len,
            )
        };
        if n < 0 {
            return Err(Error::last_os_error());
        }
        if n == 0 {
            return Err(Error::new(ErrorKind::UnexpectedEof, "perf event read EOF"));
        }
        Ok(n as usize)
    }
}

impl AsRawFd for PerfEventFile {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
impl From<OwnedFd> for PerfEventFile {
    fn from(fd: OwnedFd) -> Self {
        PerfEventFile { fd }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_size_matches_abi() {
        // PERF_ATTR_SIZE_VER6
        assert_eq!(mem::size_of::<perf_event_attr>(), 120);
    }

    #[test]
    fn test_attr_flags() {
        let mut attr = perf_event_attr::new(PERF_TYPE_HARDWARE, PERF_COUNT_HW_INSTRUCTIONS);
        attr.flags.set_disabled(1);
        attr.flags.set_enable_on_exec(1);
        attr.flags.set_use_clockid(1);
        attr.flags.set_precise_ip(2);
        assert_eq!(attr.flags.0, 1 | (1 << 12) | (1 << 25) | (2 << 15));
        assert_eq!(attr.config, PERF_COUNT_HW_INSTRUCTIONS);
        assert_eq!(attr.size, 120);
    }

    #[test]
    fn test_disable_tolerates_plain_descriptor() {
        let fd = OwnedFd::from(std::fs::File::open("/dev/null").unwrap());
        let mut file = PerfEventFile::from(fd);
        file.disable().unwrap();
        file.disable().unwrap();
        assert!(file.as_raw_fd() >= 0);
    }

    #[test]
    fn test_context_marker() {
        // PERF_CONTEXT_USER
        assert!(0xffff_ffff_ffff_fe00u64 >= PERF_CONTEXT_MAX);
        assert!(0x0000_7fff_1234_0000u64 < PERF_CONTEXT_MAX);
    }
}
