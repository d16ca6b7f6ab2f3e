//! The command recorded in command mode.
//!
//! The child is forked early and parked on a pipe. Monitors open their
//! events with enable-on-exec against its pid, then [`TracedCommand::start`]
//! releases it into `execv`, so counting begins exactly at the new image.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

use crate::monitor::SupervisorEvent;

/// Reaping state shared with the waiter thread. Exactly one side reaps.
#[derive(Debug, Default)]
struct ChildState {
    reaped: AtomicBool,
    status: Mutex<Option<i32>>,
}

impl ChildState {
    fn claim(&self) -> bool {
        self.reaped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn set_status(&self, code: i32) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = Some(code);
    }

    fn status(&self) -> Option<i32> {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct TracedCommand {
    pid: libc::pid_t,
    /// Closing or writing releases the child into exec.
    go: Option<OwnedFd>,
    /// Close-on-exec in the child: EOF means exec happened, four bytes are
    /// the errno of a failed exec.
    exec_status: Option<OwnedFd>,
    state: Arc<ChildState>,
}

/// Shell-style exit code: the exit status, or 128 + signal.
pub fn exit_code(status: libc::c_int) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        1
    }
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Finds `name` in `PATH` unless it already names a file.
pub fn resolve_executable(name: &str) -> Result<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        if !is_executable(&path) {
            bail!("{name} is not an executable file");
        }
        return Ok(path);
    }
    std::env::var_os("PATH")
        .iter()
        .flat_map(std::env::split_paths)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
        .with_context(|| format!("command {name} not found in PATH"))
}

fn pipe(flags: libc::c_int) -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), flags) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

impl TracedCommand {
    /// Forks the child that will run `command`. Call this before any other
    /// thread exists: the child only makes async-signal-safe calls until exec.
    pub fn spawn(command: &[String]) -> Result<Self> {
        let Some(program) = command.first() else {
            bail!("no command to record");
        };
        let path = resolve_executable(program)?;
        tracing::debug!("Resolved {program} to {}", path.display());

        // Everything the child touches is allocated before the fork.
        let path = CString::new(path.as_os_str().as_bytes()).context("command path contains NUL")?;
        let args = command
            .iter()
            .map(|arg| CString::new(arg.as_bytes()).with_context(|| format!("argument {arg:?} contains NUL")))
            .collect::<Result<Vec<_>>>()?;
        let mut argv: Vec<*const libc::c_char> = args.iter().map(|arg| arg.as_ptr()).collect();
        argv.push(std::ptr::null());

        let (go_read, go_write) = pipe(0).context("creating start pipe")?;
        let (status_read, status_write) = pipe(libc::O_CLOEXEC).context("creating exec status pipe")?;
        let parent = unsafe { libc::getpid() };

        match unsafe { libc::fork() } {
            -1 => Err(io::Error::last_os_error()).context("fork failed"),
            0 => unsafe {
                libc::close(go_write.as_raw_fd());
                libc::close(status_read.as_raw_fd());
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
                if libc::getppid() != parent {
                    libc::_exit(1);
                }
                let mut byte = 0u8;
                let n = libc::read(go_read.as_raw_fd(), &mut byte as *mut u8 as *mut libc::c_void, 1);
                if n <= 0 {
                    libc::_exit(1);
                }
                libc::execv(path.as_ptr(), argv.as_ptr());
                let errno = (*libc::__errno_location()).to_ne_bytes();
                libc::write(
                    status_write.as_raw_fd(),
                    errno.as_ptr() as *const libc::c_void,
                    errno.len(),
                );
                libc::_exit(127)
            },
            pid => {
                drop(go_read);
                drop(status_write);
                tracing::info!("Spawned {program} as pid {pid}");
                Ok(TracedCommand {
                    pid,
                    go: Some(go_write),
                    exec_status: Some(status_read),
                    state: Arc::new(ChildState::default()),
                })
            }
        }
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    /// Lets the child exec and waits until it did.
    pub fn start(&mut self) -> Result<()> {
        if let Some(go) = self.go.take() {
            let byte = 1u8;
            let n = unsafe { libc::write(go.as_raw_fd(), &byte as *const u8 as *const libc::c_void, 1) };
            if n != 1 {
                return Err(io::Error::last_os_error()).context("releasing the command");
            }
        }
        let Some(status) = self.exec_status.take() else {
            return Ok(());
        };
        let mut errno = [0u8; 4];
        let n = unsafe {
            libc::read(
                status.as_raw_fd(),
                errno.as_mut_ptr() as *mut libc::c_void,
                errno.len(),
            )
        };
        match n {
            0 => Ok(()),
            n if n < 0 => Err(io::Error::last_os_error()).context("reading exec status"),
            _ => {
                self.reap(0);
                bail!(
                    "exec failed: {}",
                    io::Error::from_raw_os_error(i32::from_ne_bytes(errno))
                )
            }
        }
    }

    /// Reaps the child if nobody else did. Returns its exit code once known.
    fn reap(&self, flags: libc::c_int) -> Option<i32> {
        if self.state.reaped.load(Ordering::Acquire) {
            return self.state.status();
        }
        let mut status = 0;
        let ret = unsafe { libc::waitpid(self.pid, &mut status, flags) };
        if ret == self.pid && self.state.claim() {
            self.state.set_status(exit_code(status));
        }
        self.state.status()
    }

    /// Blocks on the child in a thread of its own and reports its exit.
    pub fn watch(&self, events: Sender<SupervisorEvent>) -> Result<JoinHandle<()>> {
        let pid = self.pid;
        let state = self.state.clone();
        thread::Builder::new()
            .name("lo2s waitpid".into())
            .spawn(move || {
                let mut status = 0;
                if unsafe { libc::waitpid(pid, &mut status, 0) } != pid {
                    return;
                }
                let code = exit_code(status);
                state.set_status(code);
                state.reaped.store(true, Ordering::Release);
                tracing::info!("Command (pid {pid}) exited with {code}");
                let _ = events.send(SupervisorEvent::ChildExited(code));
            })
            .context("spawning waitpid thread")
    }

    pub fn interrupt(&self) {
        if !self.state.reaped.load(Ordering::Acquire) {
            unsafe { libc::kill(self.pid, libc::SIGINT) };
        }
    }

    /// Exit code of the command, interrupting it if it is still running.
    /// After `grace` the child is left to `Drop`, which kills it.
    pub fn finish(&self, grace: Duration) -> i32 {
        if let Some(code) = self.reap(libc::WNOHANG) {
            return code;
        }
        self.interrupt();
        tracing::info!("Sent SIGINT to the command (pid {})", self.pid);
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if let Some(code) = self.reap(libc::WNOHANG) {
                return code;
            }
            thread::sleep(Duration::from_millis(10));
        }
        tracing::warn!("command (pid {}) ignored SIGINT", self.pid);
        1
    }
}

impl Drop for TracedCommand {
    fn drop(&mut self) {
        self.go.take();
        self.exec_status.take();
        if self.state.claim() {
            unsafe {
                libc::kill(self.pid, libc::SIGKILL);
                let mut status = 0;
                libc::waitpid(self.pid, &mut status, 0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_resolve_executable() {
        assert!(resolve_executable("sh").unwrap().is_absolute());
        assert!(resolve_executable("/bin/sh").is_ok());
        assert!(resolve_executable("no-such-command-lo2s").is_err());
        assert!(resolve_executable("/etc/hostname-lo2s-missing").is_err());
    }

    #[test]
    fn test_exit_code() {
        // Raw wait statuses as the kernel encodes them.
        assert_eq!(exit_code(3 << 8), 3);
        assert_eq!(exit_code(libc::SIGKILL), 128 + libc::SIGKILL);
    }

    #[test]
    fn test_command_reports_exit() {
        let mut command =
            TracedCommand::spawn(&["sh".into(), "-c".into(), "exit 3".into()]).unwrap();
        assert!(command.pid() > 0);
        command.start().unwrap();
        let (tx, rx) = mpsc::channel();
        let waiter = command.watch(tx).unwrap();
        match rx.recv_timeout(Duration::from_secs(10)).unwrap() {
            SupervisorEvent::ChildExited(code) => assert_eq!(code, 3),
            other => panic!("unexpected event {other:?}"),
        }
        waiter.join().unwrap();
        assert_eq!(command.finish(Duration::from_secs(1)), 3);
    }

    #[test]
    fn test_exec_failure_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("broken");
        // Executable bit without a valid image or interpreter.
        std::fs::write(&script, b"\x7fELFjunk").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let mut command = TracedCommand::spawn(&[script.to_string_lossy().into_owned()]).unwrap();
        assert!(command.start().is_err());
    }
}
