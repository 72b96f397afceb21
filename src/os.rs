//! Thin wrappers over the OS process primitives the registry relies on.

use std::fs::File;
use std::path::Path;
use std::process::{Command, Stdio};

use crate::error::{MusterError, Result};

/// Signals the registry sends when stopping a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

/// Spawn `command` detached from the caller, appending stdout and stderr to `log`.
///
/// The child leads its own process group so that `signal_group` reaches any
/// grandchildren it forks, and so terminal job control of the caller does
/// not propagate to it.
pub fn spawn_detached(command: &[String], cwd: &Path, log: &Path) -> Result<u32> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| MusterError::Invalid("command must not be empty".into()))?;

    let stdout = File::options().create(true).append(true).open(log)?;
    let stderr = stdout.try_clone()?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let child = cmd
        .spawn()
        .map_err(|e| MusterError::Spawn(command.join(" "), e.to_string()))?;
    Ok(child.id())
}

/// Whether `pid` still names a live process.
///
/// Exited children of the calling process are reaped first; otherwise they
/// linger as zombies and would look alive to `kill(pid, 0)`.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    let mut status = 0;
    // SAFETY: waitpid with WNOHANG never blocks; ECHILD simply means `pid` is
    // not our child.
    let reaped = unsafe { libc::waitpid(raw, &mut status, libc::WNOHANG) };
    if reaped == raw {
        return false;
    }
    // SAFETY: signal 0 performs only the existence/permission check.
    if unsafe { libc::kill(raw, 0) } == 0 {
        return !is_zombie(pid);
    }
    // EPERM: the process exists but belongs to someone else.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// An exited process whose parent has not reaped it yet. Happens when the
/// spawning CLI invocation is gone and the adopting parent is slow to wait.
#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // The state letter follows the parenthesised command name.
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .is_some_and(|state| state == "Z")
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

/// Send `signal` to the process group led by `pid`, falling back to the
/// single process when the group no longer exists.
#[cfg(unix)]
pub fn signal_group(pid: u32, signal: Signal) -> Result<()> {
    let raw = libc::pid_t::try_from(pid)
        .map_err(|_| MusterError::Signal(pid, "pid out of range".into()))?;
    let signo = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: plain kill(2); negative pid addresses the process group.
    if unsafe { libc::kill(-raw, signo) } == 0 {
        return Ok(());
    }
    // SAFETY: as above, addressing the single process.
    if unsafe { libc::kill(raw, signo) } == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        // Already gone.
        return Ok(());
    }
    Err(MusterError::Signal(pid, err.to_string()))
}

#[cfg(not(unix))]
pub fn signal_group(pid: u32, _signal: Signal) -> Result<()> {
    Err(MusterError::Signal(
        pid,
        "process signals are only supported on unix".into(),
    ))
}
