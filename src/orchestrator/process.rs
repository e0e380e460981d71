//! OS process liveness and signal delivery for detached sessions.
//!
//! Sessions run in their own process group, so every signal here targets the
//! whole group: the shell wrapper and the agent command it launched.

use crate::{AppError, Result};

/// Signals the session manager sends to a session's process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSignal {
    /// Suspend (`SIGSTOP`).
    Pause,
    /// Continue (`SIGCONT`).
    Resume,
    /// Polite termination request (`SIGTERM`).
    Terminate,
    /// Forced termination (`SIGKILL`).
    Kill,
}

/// Liveness probe for a process ID.
///
/// Reaps the process first when it is a child of the current process, so an
/// exited child is never reported alive as a zombie.
#[cfg(unix)]
#[must_use]
pub fn is_process_running(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    use nix::unistd::Pid;

    if pid <= 0 {
        return false;
    }
    let target = Pid::from_raw(pid);

    match waitpid(target, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) => return false,
        Ok(_) | Err(Errno::ECHILD) => {}
        Err(_) => return false,
    }

    match kill(target, None) {
        Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

/// Liveness probe for a process ID.
#[cfg(not(unix))]
#[must_use]
pub fn is_process_running(_pid: i32) -> bool {
    false
}

/// Detect zombies that belong to another parent (Linux only).
#[cfg(unix)]
fn is_zombie(pid: i32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let (_, rest) = stat.rsplit_once(')')?;
            rest.split_whitespace().next().map(|state| state == "Z")
        })
        .unwrap_or(false)
}

/// Send `signal` to the process group led by `pid`.
///
/// # Errors
///
/// Returns `AppError::Process` if the group does not exist or the signal
/// cannot be delivered.
#[cfg(unix)]
pub fn signal_group(pid: i32, signal: SessionSignal) -> Result<()> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if pid <= 0 {
        return Err(AppError::Process(format!("invalid pid {pid}")));
    }
    let sig = match signal {
        SessionSignal::Pause => Signal::SIGSTOP,
        SessionSignal::Resume => Signal::SIGCONT,
        SessionSignal::Terminate => Signal::SIGTERM,
        SessionSignal::Kill => Signal::SIGKILL,
    };
    killpg(Pid::from_raw(pid), sig)
        .map_err(|err| AppError::Process(format!("cannot send {sig} to group {pid}: {err}")))
}

/// Send `signal` to the process group led by `pid`.
///
/// # Errors
///
/// Always fails: process groups are a unix concept.
#[cfg(not(unix))]
pub fn signal_group(pid: i32, signal: SessionSignal) -> Result<()> {
    Err(AppError::Process(format!(
        "cannot send {signal:?} to {pid}: unsupported platform"
    )))
}
