//! Process-exit watching.
//!
//! Each live child gets a pidfd registered with the runtime as a
//! readiness source; the fd becomes readable when the process
//! terminates, replacing a SIGCHLD-and-rescan pattern. The watch task
//! owns the descriptor, so it is closed on exactly one path: task
//! exit.

use crate::manager::SessionManager;
use crate::state::SessionId;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::warn;

/// Which child of a session an exit event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChildKind {
    /// The user program (top process of a plain start).
    User,
    /// The debug stub (top process of a debug start, or the attached
    /// stub of a RUNNING session).
    Stub,
}

/// Opens a process-exit handle for `pid`.
fn pidfd_open(pid: i32) -> io::Result<OwnedFd> {
    // SAFETY: plain syscall; the returned fd is owned below.
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0u32) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    #[allow(clippy::cast_possible_truncation)]
    let fd = fd as RawFd;
    // SAFETY: fd is a fresh descriptor owned here alone.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Registers an exit watch for `pid` and drives the session state
/// machine when it fires.
///
/// Without a pidfd (old kernel, fd exhaustion) the session has no
/// exit watch; KILL's eager reap still recovers it, matching the
/// degraded behavior of signal-less watching.
pub(crate) fn spawn_exit_watch(
    manager: Arc<SessionManager>,
    session: SessionId,
    pid: i32,
    kind: ChildKind,
) {
    let pidfd = match pidfd_open(pid) {
        Ok(fd) => fd,
        Err(err) => {
            warn!(%session, pid, %err, "pidfd_open failed; no exit watch for child");
            return;
        }
    };

    tokio::spawn(async move {
        let afd = match AsyncFd::with_interest(pidfd, Interest::READABLE) {
            Ok(afd) => afd,
            Err(err) => {
                warn!(%session, pid, %err, "failed to register exit watch");
                return;
            }
        };
        // Readable means the process terminated; the readiness never
        // clears, so a single await suffices.
        if afd.readable().await.is_ok() {
            manager.on_child_exit(&session, pid, kind);
        }
    });
}

/// Non-blocking reap. Returns true when the child is collected or is
/// no longer ours to collect (already reaped elsewhere).
pub(crate) fn try_reap(pid: i32) -> bool {
    let mut status: libc::c_int = 0;
    // SAFETY: status points at a writable int.
    let rc = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
    if rc == pid {
        return true;
    }
    if rc < 0 {
        return io::Error::last_os_error().raw_os_error() == Some(libc::ECHILD);
    }
    false
}

/// Signals the process group led by `pid`, then the leader itself.
/// The group kill may already have taken the leader, so errors on the
/// individual kill are ignored.
pub(crate) fn signal_group(pid: i32, sig: libc::c_int) {
    // SAFETY: plain syscalls on a pid owned by a session.
    unsafe {
        libc::kill(-pid, sig);
        libc::kill(pid, sig);
    }
}
