//! POSIX signal helpers for supervised subprocesses.
//!
//! Supervisors put each job's shell into its own process group so a single
//! signal reaches the whole descendant tree. Every sender here is
//! best-effort: signals race with natural exit, so a vanished process
//! (`ESRCH`) is treated as success. On non-Unix platforms the senders return
//! `Unsupported` instead of silently degrading.

use std::io;

#[cfg(unix)]
pub(crate) const SIGTERM: i32 = libc::SIGTERM;
#[cfg(unix)]
pub(crate) const SIGSTOP: i32 = libc::SIGSTOP;
#[cfg(unix)]
pub(crate) const SIGCONT: i32 = libc::SIGCONT;

#[cfg(not(unix))]
pub(crate) const SIGTERM: i32 = 15;
#[cfg(not(unix))]
pub(crate) const SIGSTOP: i32 = 19;
#[cfg(not(unix))]
pub(crate) const SIGCONT: i32 = 18;

#[cfg(unix)]
/// Put the calling process into its own process group.
///
/// Runs in `pre_exec`, so the child becomes the group leader before exec.
pub(crate) fn set_process_group() -> io::Result<()> {
    if unsafe { libc::setpgid(0, 0) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(unix)]
/// Send `signal` to a single process.
pub(crate) fn signal_pid(pid: u32, signal: i32) -> io::Result<()> {
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(unix)]
/// Send `signal` to the process group that `pid` belongs to.
pub(crate) fn signal_process_group(pid: u32, signal: i32) -> io::Result<()> {
    let pgid = unsafe { libc::getpgid(pid as libc::pid_t) };
    if pgid == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
        return Ok(());
    }

    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn signal_pid(_pid: u32, _signal: i32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process signals require a POSIX platform",
    ))
}

#[cfg(not(unix))]
pub(crate) fn signal_process_group(_pid: u32, _signal: i32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process groups require a POSIX platform",
    ))
}
