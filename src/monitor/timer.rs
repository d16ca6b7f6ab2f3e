use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::error::{Error, Result};

/// Periodic CLOCK_MONOTONIC timerfd. The first expiry is right away.
#[derive(Debug)]
pub struct TimerFd {
    fd: OwnedFd,
}

fn timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    }
}

impl TimerFd {
    pub fn new(interval: Duration) -> Result<Self> {
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_CLOEXEC | libc::TFD_NONBLOCK)
        };
        if fd < 0 {
            return Err(Error::Timer(io::Error::last_os_error()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let spec = libc::itimerspec {
            it_interval: timespec(interval),
            it_value: timespec(Duration::from_nanos(1)),
        };
        if unsafe { libc::timerfd_settime(fd.as_raw_fd(), 0, &spec, std::ptr::null_mut()) } != 0 {
            return Err(Error::Timer(io::Error::last_os_error()));
        }
        Ok(TimerFd { fd })
    }

    /// Number of expirations since the last call, 0 if none.
    pub fn read(&self) -> Result<u64> {
        let mut expirations: u64 = 0;
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut expirations as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            return Err(Error::Timer(err));
        }
        Ok(expirations)
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
