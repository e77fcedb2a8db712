//! OS process inspection and signalling.
//!
//! Everything that needs to look at or signal a process outside our own children
//! goes through `ProcessControl`, so the port and shutdown logic can be exercised
//! against a fake.

use std::io;

/// Signals the shutdown path sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Polite request to exit (SIGTERM).
    Terminate,
    /// Forced kill (SIGKILL).
    Kill,
}

/// A single process or a whole process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalTarget {
    Process(u32),
    Group(u32),
}

pub trait ProcessControl: Send + Sync {
    /// Live command line of `pid`, or `None` if it cannot be read.
    fn command_line(&self, pid: u32) -> Option<String>;
    /// Process group id of `pid`.
    fn process_group(&self, pid: u32) -> Option<u32>;
    /// Whether `pid` exists. A process we may not signal still counts as alive.
    fn is_alive(&self, pid: u32) -> bool;
    fn signal(&self, target: SignalTarget, signal: Signal) -> io::Result<()>;
}

/// The host's process table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcesses;

/// True when `err` means the target process no longer exists.
pub fn is_no_such_process(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::ESRCH)
    }
    #[cfg(not(unix))]
    {
        err.kind() == io::ErrorKind::NotFound
    }
}

/// Runs a blocking call such as a short CLI invocation. On a multi-threaded runtime
/// the worker's other tasks move to another thread while `work` runs.
pub fn run_blocking<T>(work: impl FnOnce() -> T) -> T {
    use tokio::runtime::{Handle, RuntimeFlavor};
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(work)
        }
        _ => work(),
    }
}

#[cfg(unix)]
fn checked_pid(pid: u32) -> io::Result<libc::pid_t> {
    // 0 and negative values address our own group or every process.
    match libc::pid_t::try_from(pid) {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal pid {}", pid),
        )),
    }
}

#[cfg(unix)]
impl ProcessControl for SystemProcesses {
    fn command_line(&self, pid: u32) -> Option<String> {
        let line = read_command_line(pid)?;
        let line = line.trim().to_string();
        if line.is_empty() {
            None
        } else {
            Some(line)
        }
    }

    fn process_group(&self, pid: u32) -> Option<u32> {
        let pid = checked_pid(pid).ok()?;
        let pgid = unsafe { libc::getpgid(pid) };
        u32::try_from(pgid).ok().filter(|pgid| *pgid > 0)
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = checked_pid(pid) else {
            return false;
        };
        if unsafe { libc::kill(pid, 0) } == 0 {
            return true;
        }
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    fn signal(&self, target: SignalTarget, signal: Signal) -> io::Result<()> {
        let sig = match signal {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        let rc = match target {
            SignalTarget::Process(pid) => unsafe { libc::kill(checked_pid(pid)?, sig) },
            SignalTarget::Group(pgid) => unsafe { libc::killpg(checked_pid(pgid)?, sig) },
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(target_os = "linux")]
fn read_command_line(pid: u32) -> Option<String> {
    let raw = std::fs::read(format!("/proc/{}/cmdline", pid)).ok()?;
    let parts: Vec<String> = raw
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect();
    Some(parts.join(" "))
}

#[cfg(all(unix, not(target_os = "linux")))]
fn read_command_line(pid: u32) -> Option<String> {
    let output = run_blocking(|| {
        std::process::Command::new("ps")
            .args(["-o", "command=", "-p", &pid.to_string()])
            .output()
    })
    .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(not(unix))]
impl ProcessControl for SystemProcesses {
    fn command_line(&self, _pid: u32) -> Option<String> {
        None
    }

    fn process_group(&self, _pid: u32) -> Option<u32> {
        None
    }

    fn is_alive(&self, _pid: u32) -> bool {
        false
    }

    fn signal(&self, _target: SignalTarget, _signal: Signal) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "process signalling is only supported on unix",
        ))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_visible() {
        let control = SystemProcesses;
        let pid = std::process::id();
        assert!(control.is_alive(pid));
        assert!(control.process_group(pid).is_some());
        assert!(control.command_line(pid).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_work_runs_inside_a_multi_threaded_runtime() {
        let ticker = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            7
        });
        let line = run_blocking(|| SystemProcesses.command_line(std::process::id()));
        assert!(line.is_some());
        assert_eq!(ticker.await.unwrap(), 7);
    }

    #[test]
    fn blocking_work_runs_without_a_runtime() {
        assert_eq!(run_blocking(|| 40 + 2), 42);
    }

    #[test]
    fn refuses_pid_zero() {
        let control = SystemProcesses;
        let err = control
            .signal(SignalTarget::Group(0), Signal::Terminate)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(!control.is_alive(0));
    }

    #[test]
    fn signalling_a_reaped_child_reports_missing_process() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        let err = SystemProcesses
            .signal(SignalTarget::Process(pid), Signal::Kill)
            .unwrap_err();
        assert!(is_no_such_process(&err));
    }
}
