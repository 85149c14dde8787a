//! Process liveness checks and signalling against the host process table.

use podnet_common::error::{PodnetError, Result};

/// Returns whether a process with `pid` currently exists.
///
/// Sends signal 0, which performs permission and existence checks
/// without delivering anything. `EPERM` means the process exists but
/// belongs to someone else.
#[cfg(target_os = "linux")]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Stub for non-Linux platforms.
///
/// Always reports the process as alive, so nothing is ever reclaimed
/// on a host where liveness cannot be determined.
#[cfg(not(target_os = "linux"))]
pub const fn is_process_alive(_pid: u32) -> bool {
    true
}

/// Sends `SIGKILL` to every process in the group led by `pgid`.
///
/// A group that has already exited is not an error.
///
/// # Errors
///
/// Returns `CommandFailed` if the signal cannot be delivered.
#[cfg(target_os = "linux")]
pub fn kill_process_group(pgid: u32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let raw = i32::try_from(pgid)
        .ok()
        .filter(|raw| *raw > 1)
        .ok_or_else(|| PodnetError::CommandFailed {
            program: "killpg".into(),
            code: None,
            stderr: format!("refusing to signal process group {pgid}"),
        })?;
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(PodnetError::CommandFailed {
            program: "killpg".into(),
            code: None,
            stderr: e.to_string(),
        }),
    }
}

/// Stub for non-Linux platforms. Callers still kill the direct child.
#[cfg(not(target_os = "linux"))]
pub const fn kill_process_group(_pgid: u32) -> Result<()> {
    Ok(())
}
