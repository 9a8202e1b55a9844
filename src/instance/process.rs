//! OS process control: liveness probes and signal delivery

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::time::Duration;
use tokio::process::Child;
use tracing::debug;

/// Poll interval while waiting on a process we did not spawn
const ATTACHED_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A persisted pid as a signal target. Zero and values past `i32::MAX`
/// would address a process group or every process we may signal.
fn target(pid: u32) -> Option<Pid> {
    i32::try_from(pid).ok().filter(|p| *p > 0).map(Pid::from_raw)
}

/// Probe a pid with signal 0. EPERM still means the process exists.
pub fn pid_exists(pid: u32) -> bool {
    let Some(target) = target(pid) else {
        return false;
    };
    match kill(target, None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Ask the strategy to exit (SIGINT to the process)
pub fn interrupt(pid: u32) -> nix::Result<()> {
    kill(target(pid).ok_or(Errno::ESRCH)?, Signal::SIGINT)
}

/// SIGKILL the whole process group, falling back to the bare pid
pub fn force_kill(pid: u32) -> nix::Result<()> {
    let raw = target(pid).ok_or(Errno::ESRCH)?;
    match killpg(raw, Signal::SIGKILL) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) | Err(Errno::EPERM) => kill(raw, Signal::SIGKILL),
        Err(e) => Err(e),
    }
}

/// Handle to a strategy process.
///
/// `Owned` processes were spawned by this program and must be reaped through
/// the child handle (a zombie still answers signal 0). `Attached` processes
/// were adopted from persisted state after a restart of the controller.
#[derive(Debug)]
pub enum ProcessHandle {
    Owned(Child),
    Attached(u32),
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        match self {
            ProcessHandle::Owned(child) => child.id().unwrap_or(0),
            ProcessHandle::Attached(pid) => *pid,
        }
    }

    /// Non-blocking liveness check. Returns a description of the exit if the
    /// process is gone.
    pub fn check_exit(&mut self) -> Option<String> {
        match self {
            ProcessHandle::Owned(child) => match child.try_wait() {
                Ok(None) => None,
                Ok(Some(status)) => Some(format!("exited with {status}")),
                Err(e) => Some(format!("wait failed: {e}")),
            },
            ProcessHandle::Attached(pid) => {
                if pid_exists(*pid) {
                    None
                } else {
                    Some("no longer exists".to_string())
                }
            }
        }
    }

    /// Wait for the process to exit. Returns `false` if `limit` elapsed first.
    pub async fn wait_exit(&mut self, limit: Duration) -> bool {
        match self {
            ProcessHandle::Owned(child) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(%status, "Strategy process exited");
                    true
                }
                // The child is no longer waitable; treat it as gone
                Ok(Err(_)) => true,
                Err(_) => false,
            },
            ProcessHandle::Attached(pid) => {
                let pid = *pid;
                let deadline = tokio::time::Instant::now() + limit;
                loop {
                    if !pid_exists(pid) {
                        return true;
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return false;
                    }
                    tokio::time::sleep(ATTACHED_POLL_INTERVAL).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::process::Command;

    #[tokio::test]
    async fn test_owned_child_lifecycle() {
        let child = Command::new("sh").args(["-c", "sleep 30"]).spawn().unwrap();
        let mut handle = ProcessHandle::Owned(child);
        let pid = handle.pid();
        assert!(pid > 0);
        assert!(handle.check_exit().is_none());
        assert!(pid_exists(pid));

        force_kill(pid).unwrap();
        assert!(handle.wait_exit(Duration::from_secs(5)).await);
        assert!(handle.check_exit().is_some());
    }

    #[tokio::test]
    async fn test_wait_exit_times_out() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let mut handle = ProcessHandle::Owned(child);
        assert!(!handle.wait_exit(Duration::from_millis(100)).await);
        kill(Pid::from_raw(handle.pid() as i32), Signal::SIGKILL).unwrap();
        assert!(handle.wait_exit(Duration::from_secs(5)).await);
    }

    #[test]
    fn test_pid_zero_never_exists() {
        assert!(!pid_exists(0));
    }

    #[test]
    fn test_out_of_range_pid_is_never_signalled() {
        for pid in [u32::MAX, i32::MAX as u32 + 1] {
            assert!(!pid_exists(pid));
            assert_eq!(interrupt(pid), Err(Errno::ESRCH));
            assert_eq!(force_kill(pid), Err(Errno::ESRCH));
        }
    }
}
