//! Fork/exec launcher.
//!
//! The daemon is multi-threaded, so the window between `fork` and
//! `exec` follows the strict rule: the child may only make
//! async-signal-safe calls. Everything that allocates (argv, the
//! environment, resolved helper paths) is composed into a
//! [`LaunchPlan`] of `CString`s before the fork; the child just walks
//! pre-built pointers.
//!
//! Child stdout and stderr share one capture pipe whose read end is a
//! non-blocking [`pipe::Receiver`] registered with the runtime. All
//! descriptors are created close-on-exec; the dup2 onto stdio clears
//! the flag on exactly the ends the child must keep.

use crate::output::OutputRing;
use crate::state::SessionId;
use lanthorn_image::Image;
use std::collections::BTreeMap;
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tracing::trace;

/// Name of the debug stub searched on PATH.
pub const DEBUG_STUB: &str = "gdbserver";

/// Read chunk size when draining a capture pipe.
const DRAIN_CHUNK: usize = 4096;

/// Everything the forked child needs, composed before the fork.
#[derive(Debug)]
pub(crate) struct LaunchPlan {
    /// Exec target path (ignored when `exec_fd` is set).
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    /// Working directory for bundle launches.
    chdir: Option<CString>,
    /// Exec directly by descriptor (raw image, no stub).
    exec_fd: Option<RawFd>,
    /// Descriptor whose close-on-exec flag the child clears so it
    /// survives into the stub (raw image under the stub).
    inherit_fd: Option<RawFd>,
}

/// How a session is being launched.
#[derive(Debug, Clone, Copy)]
pub(crate) enum LaunchMode {
    Plain,
    Debug { port: u16 },
}

impl LaunchPlan {
    /// Composes the plan for starting a session's image.
    pub(crate) fn for_image(
        image: &Image,
        args: &str,
        env: &BTreeMap<String, String>,
        mode: LaunchMode,
    ) -> io::Result<Self> {
        let user_args = args.split_whitespace();
        let envp = compose_env(env)?;

        match (image, mode) {
            (Image::Raw(raw), LaunchMode::Plain) => {
                let fd_path = raw.fd_path();
                let argv = build_argv([fd_path.as_str()], user_args)?;
                Ok(Self {
                    program: cstring(&fd_path)?,
                    argv,
                    envp,
                    chdir: None,
                    exec_fd: Some(raw.raw_fd()),
                    inherit_fd: None,
                })
            }
            (Image::Raw(raw), LaunchMode::Debug { port }) => {
                let fd_path = raw.fd_path();
                let port_arg = format!(":{port}");
                let argv = build_argv([DEBUG_STUB, &port_arg, &fd_path], user_args)?;
                Ok(Self {
                    program: stub_program()?,
                    argv,
                    envp,
                    chdir: None,
                    exec_fd: None,
                    inherit_fd: Some(raw.raw_fd()),
                })
            }
            (Image::Bundle(bundle), LaunchMode::Plain) => {
                let entry = bundle.entry_path();
                let entry = entry.to_string_lossy();
                let argv = build_argv([entry.as_ref()], user_args)?;
                Ok(Self {
                    program: cstring(&entry)?,
                    argv,
                    envp,
                    chdir: Some(cstring_path(bundle.root())?),
                    exec_fd: None,
                    inherit_fd: None,
                })
            }
            (Image::Bundle(bundle), LaunchMode::Debug { port }) => {
                let entry = bundle.entry_path();
                let entry = entry.to_string_lossy();
                let port_arg = format!(":{port}");
                let argv = build_argv([DEBUG_STUB, &port_arg, entry.as_ref()], user_args)?;
                Ok(Self {
                    program: stub_program()?,
                    argv,
                    envp,
                    chdir: Some(cstring_path(bundle.root())?),
                    exec_fd: None,
                    inherit_fd: None,
                })
            }
        }
    }

    /// Composes the plan for attaching a debug stub to a live pid.
    /// The stub inherits the daemon's environment and stdio.
    pub(crate) fn for_attach(pid: i32, port: u16) -> io::Result<Self> {
        let port_arg = format!(":{port}");
        let pid_arg = pid.to_string();
        let argv = build_argv(
            [DEBUG_STUB, &port_arg, "--attach", &pid_arg],
            std::iter::empty::<&str>(),
        )?;
        Ok(Self {
            program: stub_program()?,
            argv,
            envp: compose_env(&BTreeMap::new())?,
            chdir: None,
            exec_fd: None,
            inherit_fd: None,
        })
    }

    #[cfg(test)]
    pub(crate) fn argv_strings(&self) -> Vec<String> {
        self.argv
            .iter()
            .map(|c| c.to_string_lossy().into_owned())
            .collect()
    }
}

/// Forks and execs a plan.
///
/// With a capture fd, the child's stdout and stderr are duped onto
/// the pipe's write end. The child joins a fresh process group, opts
/// in to being traced by any process, and exits 127 on exec failure,
/// indistinguishable from a program that exited immediately.
pub(crate) fn fork_exec(plan: &LaunchPlan, capture_fd: Option<RawFd>) -> io::Result<i32> {
    let mut argv_ptrs: Vec<*const libc::c_char> = plan.argv.iter().map(|a| a.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());
    let mut envp_ptrs: Vec<*const libc::c_char> = plan.envp.iter().map(|e| e.as_ptr()).collect();
    envp_ptrs.push(std::ptr::null());

    // SAFETY: the child between fork and exec only performs
    // async-signal-safe calls over pointers composed above; nothing
    // below allocates in the child.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(io::Error::last_os_error());
    }

    if pid == 0 {
        // Child. Only async-signal-safe calls until exec or _exit.
        unsafe {
            libc::setpgid(0, 0);
            // The Rust runtime ignores SIGPIPE; user code must not
            // inherit that.
            libc::signal(libc::SIGPIPE, libc::SIG_DFL);
            if let Some(fd) = capture_fd {
                libc::dup2(fd, libc::STDOUT_FILENO);
                libc::dup2(fd, libc::STDERR_FILENO);
            }
            libc::prctl(
                libc::PR_SET_PTRACER,
                libc::PR_SET_PTRACER_ANY,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
            );
            if let Some(fd) = plan.inherit_fd {
                libc::fcntl(fd, libc::F_SETFD, 0);
            }
            if let Some(dir) = &plan.chdir {
                if libc::chdir(dir.as_ptr()) != 0 {
                    libc::_exit(127);
                }
            }
            match plan.exec_fd {
                Some(fd) => {
                    libc::fexecve(fd, argv_ptrs.as_ptr(), envp_ptrs.as_ptr());
                }
                None => {
                    libc::execve(plan.program.as_ptr(), argv_ptrs.as_ptr(), envp_ptrs.as_ptr());
                }
            }
            libc::_exit(127);
        }
    }

    // Parent half of the setpgid race: harmless if the child already
    // won or already exec'd.
    // SAFETY: plain syscall on a pid we own.
    unsafe {
        libc::setpgid(pid, pid);
    }
    Ok(pid)
}

/// Creates the capture pipe: a non-blocking async read end for the
/// daemon and a close-on-exec write end for the child's stdio.
pub(crate) fn make_capture_pipe() -> io::Result<(pipe::Receiver, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: fds points at two writable ints.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors are fresh and owned here alone.
    let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    // The daemon's end never blocks the event loop.
    // SAFETY: read is a valid pipe descriptor.
    unsafe {
        libc::fcntl(read.as_raw_fd(), libc::F_SETFL, libc::O_NONBLOCK);
    }
    let receiver = pipe::Receiver::from_owned_fd(read)?;
    Ok((receiver, write))
}

/// Drains a session's capture pipe into its output ring until
/// end-of-file or a read error, then closes the pipe.
pub(crate) fn spawn_output_reader(
    mut receiver: pipe::Receiver,
    ring: Arc<Mutex<OutputRing>>,
    session: SessionId,
) {
    tokio::spawn(async move {
        let mut chunk = [0u8; DRAIN_CHUNK];
        loop {
            match receiver.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    let Ok(mut ring) = ring.lock() else { break };
                    ring.append(&chunk[..n]);
                }
                Err(err) => {
                    trace!(%session, %err, "capture pipe read error");
                    break;
                }
            }
        }
        trace!(%session, "capture pipe closed");
    });
}

/// Searches PATH for an executable file.
#[must_use]
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

/// Resolved debug stub path. Falls back to the bare name so a missing
/// stub surfaces as an exec failure (exit 127), not a launch error.
fn stub_program() -> io::Result<CString> {
    let resolved = find_in_path(DEBUG_STUB)
        .map_or_else(|| DEBUG_STUB.to_string(), |p| p.to_string_lossy().into_owned());
    cstring(&resolved)
}

/// Daemon environment with session overrides applied on top,
/// overrides winning on conflict.
fn compose_env(overrides: &BTreeMap<String, String>) -> io::Result<Vec<CString>> {
    let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = std::env::vars_os()
        .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec()))
        .collect();
    for (key, value) in overrides {
        merged.insert(key.as_bytes().to_vec(), value.as_bytes().to_vec());
    }

    let mut envp = Vec::with_capacity(merged.len());
    for (key, value) in merged {
        let mut entry = key;
        entry.push(b'=');
        entry.extend_from_slice(&value);
        match CString::new(entry) {
            Ok(c) => envp.push(c),
            // An inherited variable with an interior NUL cannot be
            // represented; drop it rather than failing the launch.
            Err(_) => continue,
        }
    }
    Ok(envp)
}

fn build_argv<'a>(
    prefix: impl IntoIterator<Item = &'a str>,
    args: impl Iterator<Item = &'a str>,
) -> io::Result<Vec<CString>> {
    prefix
        .into_iter()
        .chain(args)
        .map(cstring)
        .collect::<io::Result<Vec<_>>>()
}

fn cstring(s: &str) -> io::Result<CString> {
    CString::new(s).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))
}

fn cstring_path(p: &Path) -> io::Result<CString> {
    CString::new(p.as_os_str().as_bytes()).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))
}
