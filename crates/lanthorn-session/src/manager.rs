//! Session registry and lifecycle manager.
//!
//! One lock guards the registry, the aggregate byte counter, the
//! debug-port allocator, and every state transition. The launcher
//! holds it across fork and exit-watch registration, so an exit event
//! can never arrive for a child the registry does not know.

use crate::error::{Result, SessionError};
use crate::launcher::{self, LaunchMode, LaunchPlan};
use crate::output::OutputRing;
use crate::state::{Session, SessionId, SessionState, SessionStatus};
use crate::watcher::{self, ChildKind};
use lanthorn_image::{Image, PendingBundle, RawImage};
use std::collections::{BTreeMap, HashMap};
use std::os::fd::AsRawFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

/// First debug-stub port handed out.
const DEBUG_PORT_BASE: u16 = 5500;
/// Ports are allocated round-robin over `[BASE, BASE + RANGE)`.
const DEBUG_PORT_RANGE: u16 = 200;

/// SIGKILL delivery is asynchronous; the eager reap after KILL polls
/// briefly before giving up and leaving the exit to the pidfd watch.
const KILL_REAP_ATTEMPTS: u32 = 50;
const KILL_REAP_INTERVAL: Duration = Duration::from_millis(2);

/// Admission caps.
#[derive(Debug, Clone, Copy)]
pub struct ManagerConfig {
    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,
    /// Maximum aggregate bytes of stored images.
    pub max_total_bytes: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 32,
            max_total_bytes: 512 * 1024 * 1024,
        }
    }
}

struct Registry {
    sessions: HashMap<SessionId, Session>,
    total_bytes: u64,
    next_debug_port: u16,
}

impl Registry {
    fn alloc_debug_port(&mut self) -> u16 {
        let port = self.next_debug_port;
        self.next_debug_port += 1;
        if self.next_debug_port >= DEBUG_PORT_BASE + DEBUG_PORT_RANGE {
            self.next_debug_port = DEBUG_PORT_BASE;
        }
        port
    }
}

/// The session manager: registry plus lifecycle operations.
pub struct SessionManager {
    cfg: ManagerConfig,
    state: Mutex<Registry>,
}

impl SessionManager {
    /// Creates a manager with the given caps.
    #[must_use]
    pub fn new(cfg: ManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            state: Mutex::new(Registry {
                sessions: HashMap::new(),
                total_bytes: 0,
                next_debug_port: DEBUG_PORT_BASE,
            }),
        })
    }

    fn reg(&self) -> MutexGuard<'_, Registry> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn parse_id(id: &str) -> Result<SessionId> {
        SessionId::parse(id).ok_or(SessionError::NotFound)
    }

    fn check_caps(&self, reg: &Registry, size: u64) -> Result<()> {
        if reg.sessions.len() >= self.cfg.max_sessions {
            return Err(SessionError::MaxSessions);
        }
        if reg.total_bytes + size > self.cfg.max_total_bytes {
            return Err(SessionError::MaxTotalBytes);
        }
        Ok(())
    }

    /// Advisory cap check before expensive admission work (bundle
    /// extraction). The binding check happens again at insert.
    ///
    /// # Errors
    ///
    /// Returns the cap error that admission would return right now.
    pub fn precheck_admission(&self, size: u64) -> Result<()> {
        self.check_caps(&self.reg(), size)
    }

    /// Admits a raw image as a new LOADED session.
    ///
    /// # Errors
    ///
    /// Returns a cap error when the registry is full; the image is
    /// dropped (and its memory released) on rejection.
    pub fn admit_raw(&self, image: RawImage, size: u64) -> Result<SessionStatus> {
        self.admit(Image::Raw(image), size)
    }

    /// Admits an extracted bundle as a new LOADED session. The
    /// extraction directory is persisted only if admission succeeds.
    ///
    /// # Errors
    ///
    /// Returns a cap error when the registry is full; the pending
    /// extraction directory is removed on rejection.
    pub fn admit_bundle(&self, bundle: PendingBundle, size: u64) -> Result<SessionStatus> {
        let mut reg = self.reg();
        self.check_caps(&reg, size)?;
        let session = Session::new(bundle.into_image(), size);
        Self::insert(&mut reg, session, size)
    }

    fn admit(&self, image: Image, size: u64) -> Result<SessionStatus> {
        let mut reg = self.reg();
        self.check_caps(&reg, size)?;
        let session = Session::new(image, size);
        Self::insert(&mut reg, session, size)
    }

    fn insert(reg: &mut Registry, session: Session, size: u64) -> Result<SessionStatus> {
        let status = session.status();
        info!(
            session = %session.id,
            size,
            bundle = session.image.is_bundle(),
            "session admitted"
        );
        reg.total_bytes += size;
        reg.sessions.insert(session.id.clone(), session);
        Ok(status)
    }

    /// Status of one session.
    ///
    /// # Errors
    ///
    /// `NotFound` when the id is unknown.
    pub fn status(&self, id: &str) -> Result<SessionStatus> {
        let sid = Self::parse_id(id)?;
        let reg = self.reg();
        reg.sessions
            .get(&sid)
            .map(Session::status)
            .ok_or(SessionError::NotFound)
    }

    /// Status of every session.
    #[must_use]
    pub fn list(&self) -> Vec<SessionStatus> {
        let reg = self.reg();
        reg.sessions.values().map(Session::status).collect()
    }

    /// Replaces the saved argument string.
    ///
    /// # Errors
    ///
    /// `NotFound` when the id is unknown.
    pub fn set_args(&self, id: &str, args: &str) -> Result<SessionStatus> {
        self.with_session(id, |s| {
            s.args = args.to_string();
            Ok(s.status())
        })
    }

    /// Sets one environment override.
    ///
    /// # Errors
    ///
    /// `NotFound` when the id is unknown.
    pub fn set_env(&self, id: &str, key: &str, value: &str) -> Result<SessionStatus> {
        self.with_session(id, |s| {
            s.env.insert(key.to_string(), value.to_string());
            Ok(s.status())
        })
    }

    /// Removes one environment override. Removing an absent key is
    /// not an error.
    ///
    /// # Errors
    ///
    /// `NotFound` when the id is unknown.
    pub fn del_env(&self, id: &str, key: &str) -> Result<SessionStatus> {
        self.with_session(id, |s| {
            s.env.remove(key);
            Ok(s.status())
        })
    }

    /// The session's environment overrides.
    ///
    /// # Errors
    ///
    /// `NotFound` when the id is unknown.
    pub fn env_list(&self, id: &str) -> Result<BTreeMap<String, String>> {
        self.with_session(id, |s| Ok(s.env.clone()))
    }

    /// Launches a LOADED or STOPPED session, optionally under the
    /// debug stub.
    ///
    /// # Errors
    ///
    /// `NotFound`, `AlreadyRunning`, or `Fork` when the pipe or fork
    /// fails. A child that fails to exec is not an error here: it
    /// surfaces as an immediate exit event.
    pub fn start(self: &Arc<Self>, id: &str, debug: bool) -> Result<SessionStatus> {
        let sid = Self::parse_id(id)?;
        let mut reg = self.reg();

        match reg.sessions.get(&sid) {
            None => return Err(SessionError::NotFound),
            Some(s) if s.state.is_live() => return Err(SessionError::AlreadyRunning),
            Some(_) => {}
        }
        let port = debug.then(|| reg.alloc_debug_port());

        let Some(session) = reg.sessions.get_mut(&sid) else {
            return Err(SessionError::NotFound);
        };

        // Fresh ring per run; a reader still draining the previous
        // pipe keeps its own Arc and cannot touch this one.
        session.output = Arc::new(Mutex::new(OutputRing::new()));

        let mode = port.map_or(LaunchMode::Plain, |port| LaunchMode::Debug { port });
        let plan = LaunchPlan::for_image(&session.image, &session.args, &session.env, mode)
            .map_err(SessionError::Fork)?;
        let (receiver, write_end) = launcher::make_capture_pipe().map_err(SessionError::Fork)?;
        let pid = launcher::fork_exec(&plan, Some(write_end.as_raw_fd()))
            .map_err(SessionError::Fork)?;
        drop(write_end);

        session.state = match port {
            None => SessionState::Running { pid },
            Some(debug_port) => SessionState::Debugging {
                pid,
                debug_pid: pid,
                debug_port,
            },
        };

        launcher::spawn_output_reader(receiver, session.output.clone(), session.id.clone());
        let kind = if port.is_some() {
            ChildKind::Stub
        } else {
            ChildKind::User
        };
        watcher::spawn_exit_watch(Arc::clone(self), session.id.clone(), pid, kind);

        info!(session = %session.id, pid, debug = port.is_some(), "session started");
        Ok(session.status())
    }

    /// Attaches a debug stub to a RUNNING session.
    ///
    /// # Errors
    ///
    /// `NotFound`, `NotRunning` (also when already DEBUGGING), or
    /// `Fork`.
    pub fn attach_debug(self: &Arc<Self>, id: &str) -> Result<SessionStatus> {
        let sid = Self::parse_id(id)?;
        let mut reg = self.reg();

        let pid = match reg.sessions.get(&sid) {
            None => return Err(SessionError::NotFound),
            Some(s) => match s.state {
                SessionState::Running { pid } => pid,
                _ => return Err(SessionError::NotRunning),
            },
        };
        let debug_port = reg.alloc_debug_port();

        let plan = LaunchPlan::for_attach(pid, debug_port).map_err(SessionError::Fork)?;
        let debug_pid = launcher::fork_exec(&plan, None).map_err(SessionError::Fork)?;

        let Some(session) = reg.sessions.get_mut(&sid) else {
            return Err(SessionError::NotFound);
        };
        session.state = SessionState::Debugging {
            pid,
            debug_pid,
            debug_port,
        };
        watcher::spawn_exit_watch(Arc::clone(self), sid, debug_pid, ChildKind::Stub);

        info!(session = %session.id, pid, debug_pid, debug_port, "debug stub attached");
        Ok(session.status())
    }

    /// Sends graceful termination to the session's process group.
    /// The state stays RUNNING/DEBUGGING until the exit event lands.
    ///
    /// # Errors
    ///
    /// `NotFound` or `NotRunning`.
    pub fn stop(&self, id: &str) -> Result<SessionStatus> {
        self.with_session(id, |s| {
            let Some(pid) = s.state.pid() else {
                return Err(SessionError::NotRunning);
            };
            watcher::signal_group(pid, libc::SIGTERM);
            debug!(session = %s.id, pid, "sent SIGTERM");
            Ok(s.status())
        })
    }

    /// Sends hard termination, then eagerly reaps so the STOPPED
    /// transition is visible before the reply even when the exit
    /// watch has not fired yet.
    ///
    /// # Errors
    ///
    /// `NotFound` or `NotRunning`.
    pub async fn kill(&self, id: &str) -> Result<SessionStatus> {
        let (sid, pid) = self.with_session(id, |s| {
            let Some(pid) = s.state.pid() else {
                return Err(SessionError::NotRunning);
            };
            watcher::signal_group(pid, libc::SIGKILL);
            debug!(session = %s.id, pid, "sent SIGKILL");
            Ok((s.id.clone(), pid))
        })?;

        for _ in 0..KILL_REAP_ATTEMPTS {
            if watcher::try_reap(pid) {
                self.finish_kill(&sid, pid);
                break;
            }
            tokio::time::sleep(KILL_REAP_INTERVAL).await;
        }
        self.status(id)
    }

    /// Applies the STOPPED transition after a successful eager reap.
    /// A no-op when the exit watch already handled it.
    fn finish_kill(&self, sid: &SessionId, pid: i32) {
        let mut reg = self.reg();
        let Some(session) = reg.sessions.get_mut(sid) else {
            return;
        };
        match session.state {
            SessionState::Running { pid: p } if p == pid => {
                session.state = SessionState::Stopped;
                info!(session = %sid, pid, "session killed");
            }
            SessionState::Debugging { pid: p, debug_pid, .. } if p == pid => {
                if debug_pid != p {
                    watcher::signal_group(debug_pid, libc::SIGKILL);
                    watcher::try_reap(debug_pid);
                }
                session.state = SessionState::Stopped;
                info!(session = %sid, pid, "session killed");
            }
            _ => {}
        }
    }

    /// Removes a LOADED or STOPPED session, releasing its image and
    /// its share of the byte cap. Returns the removed id.
    ///
    /// # Errors
    ///
    /// `NotFound` or `SessionRunning`.
    pub fn delete(&self, id: &str) -> Result<String> {
        let sid = Self::parse_id(id)?;
        let mut reg = self.reg();

        match reg.sessions.get(&sid) {
            None => return Err(SessionError::NotFound),
            Some(s) if s.state.is_live() => return Err(SessionError::SessionRunning),
            Some(_) => {}
        }
        let Some(session) = reg.sessions.remove(&sid) else {
            return Err(SessionError::NotFound);
        };
        reg.total_bytes = reg.total_bytes.saturating_sub(session.size);
        info!(session = %sid, "session deleted");
        // Dropping the session releases the image: the memfd closes,
        // a bundle directory is removed recursively.
        Ok(sid.to_string())
    }

    /// Captured output from `offset` through the buffer end, plus the
    /// current total.
    ///
    /// # Errors
    ///
    /// `NotFound` when the id is unknown.
    pub fn output_slice(&self, id: &str, offset: usize) -> Result<(Vec<u8>, usize)> {
        let ring = self.with_session(id, |s| Ok(s.output.clone()))?;
        let ring = ring.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(ring.slice_from(offset))
    }

    /// Applies one exit event from the watcher.
    pub(crate) fn on_child_exit(&self, session: &SessionId, pid: i32, kind: ChildKind) {
        watcher::try_reap(pid);
        let mut reg = self.reg();
        let Some(s) = reg.sessions.get_mut(session) else {
            debug!(%session, pid, "exit event for removed session");
            return;
        };

        match (s.state, kind) {
            (SessionState::Running { pid: p }, ChildKind::User) if p == pid => {
                s.state = SessionState::Stopped;
                info!(%session, pid, "session stopped");
            }
            (SessionState::Debugging { pid: p, debug_pid, .. }, ChildKind::Stub)
                if debug_pid == pid =>
            {
                if p == debug_pid {
                    // The stub was the top process; the user program
                    // is gone with it. Sweep the group for anything
                    // the stub spawned.
                    watcher::signal_group(pid, libc::SIGKILL);
                    s.state = SessionState::Stopped;
                    info!(%session, pid, "debug session stopped");
                } else {
                    s.state = SessionState::Running { pid: p };
                    info!(%session, pid, user_pid = p, "debug stub exited, program still running");
                }
            }
            (SessionState::Debugging { pid: p, debug_pid, .. }, ChildKind::User)
                if p == pid && debug_pid != pid =>
            {
                watcher::signal_group(debug_pid, libc::SIGKILL);
                watcher::try_reap(debug_pid);
                s.state = SessionState::Stopped;
                info!(%session, pid, debug_pid, "session stopped, debug stub killed");
            }
            _ => {
                debug!(%session, pid, ?kind, "stale exit event");
            }
        }
    }

    fn with_session<T>(&self, id: &str, f: impl FnOnce(&mut Session) -> Result<T>) -> Result<T> {
        let sid = Self::parse_id(id)?;
        let mut reg = self.reg();
        let Some(session) = reg.sessions.get_mut(&sid) else {
            return Err(SessionError::NotFound);
        };
        f(session)
    }
}
