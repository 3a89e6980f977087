//! Signals sent to worker processes.

use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Existence check only (signal 0).
    Probe,
    /// Graceful stop.
    Hangup,
    /// Escalation after a graceful stop was ignored.
    ForceTerminate,
}

impl Signal {
    fn number(self) -> libc::c_int {
        match self {
            Signal::Probe => 0,
            Signal::Hangup => libc::SIGHUP,
            Signal::ForceTerminate => libc::SIGKILL,
        }
    }
}

#[derive(Debug)]
pub enum SignalOutcome {
    Delivered,
    NoSuchProcess,
    PermissionDenied,
    Failed(io::Error),
}

pub fn send_signal(pid: i32, signal: Signal) -> SignalOutcome {
    if pid <= 0 {
        return SignalOutcome::NoSuchProcess;
    }
    // SAFETY: kill has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, signal.number()) };
    if rc == 0 {
        return SignalOutcome::Delivered;
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => SignalOutcome::NoSuchProcess,
        Some(libc::EPERM) => SignalOutcome::PermissionDenied,
        _ => SignalOutcome::Failed(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_own_process() {
        let pid = std::process::id() as i32;
        assert!(matches!(send_signal(pid, Signal::Probe), SignalOutcome::Delivered));
    }

    #[test]
    fn invalid_pid_is_not_a_process() {
        assert!(matches!(
            send_signal(0, Signal::Hangup),
            SignalOutcome::NoSuchProcess
        ));
        assert!(matches!(
            send_signal(-1, Signal::ForceTerminate),
            SignalOutcome::NoSuchProcess
        ));
    }

    #[test]
    fn reaped_child_is_gone() {
        let mut child = std::process::Command::new("/bin/true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();
        assert!(matches!(
            send_signal(pid, Signal::Probe),
            SignalOutcome::NoSuchProcess
        ));
    }
}
