//! Session records and the lifecycle state type.

use crate::output::OutputRing;
use lanthorn_image::Image;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Opaque session identifier: 128 bits rendered as lowercase
/// hyphenated hex, unique for the daemon's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Creates a new random session id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses an id from its wire rendering.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.as_hyphenated())
    }
}

/// Lifecycle state.
///
/// The payload carries exactly the process identity each state
/// implies: LOADED and STOPPED hold nothing, RUNNING holds the child
/// pid, DEBUGGING adds the stub pid and its TCP port. A launch-time
/// debug session has `debug_pid == pid` (the stub is the top
/// process); an attach-time one has two distinct children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Uploaded, never started (or awaiting restart after STOPPED).
    Loaded,
    /// User program alive.
    Running { pid: i32 },
    /// Debug stub listening; user program alive.
    Debugging {
        pid: i32,
        debug_pid: i32,
        debug_port: u16,
    },
    /// All children exited or were reaped.
    Stopped,
}

impl SessionState {
    /// Wire name of the state.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Loaded => "LOADED",
            Self::Running { .. } => "RUNNING",
            Self::Debugging { .. } => "DEBUGGING",
            Self::Stopped => "STOPPED",
        }
    }

    /// Pid of the top child, if one is alive.
    #[must_use]
    pub fn pid(&self) -> Option<i32> {
        match *self {
            Self::Running { pid } | Self::Debugging { pid, .. } => Some(pid),
            Self::Loaded | Self::Stopped => None,
        }
    }

    /// True when a child process is live.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.pid().is_some()
    }
}

/// One session: an image plus its lifecycle.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub state: SessionState,
    pub image: Image,
    /// Byte count of the original upload, counted against the
    /// aggregate cap.
    pub size: u64,
    /// Saved argument string, whitespace-split at launch.
    pub args: String,
    /// Environment overrides applied on top of the daemon's
    /// environment at launch.
    pub env: BTreeMap<String, String>,
    /// Captured output of the current (or last) run. Replaced with a
    /// fresh ring on every start so a draining reader from a
    /// previous run can never write into the new one.
    pub output: Arc<Mutex<OutputRing>>,
}

impl Session {
    /// Creates a freshly admitted session in the LOADED state.
    #[must_use]
    pub fn new(image: Image, size: u64) -> Self {
        Self {
            id: SessionId::new(),
            state: SessionState::Loaded,
            image,
            size,
            args: String::new(),
            env: BTreeMap::new(),
            output: Arc::new(Mutex::new(OutputRing::new())),
        }
    }

    /// Snapshot for rendering outside the registry lock.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        let (bundle_dir, exec_path) = match &self.image {
            Image::Bundle(b) => (
                Some(b.root().to_string_lossy().into_owned()),
                Some(b.entry().to_string_lossy().into_owned()),
            ),
            Image::Raw(_) => (None, None),
        };
        SessionStatus {
            id: self.id.to_string(),
            state: self.state.as_str(),
            pid: self.state.pid(),
            debug_port: match self.state {
                SessionState::Debugging { debug_port, .. } => Some(debug_port),
                _ => None,
            },
            size: self.size,
            bundle_dir,
            exec_path,
            args: self.args.clone(),
            env: self.env.clone(),
        }
    }
}

/// Point-in-time view of a session, detached from the registry.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub id: String,
    pub state: &'static str,
    pub pid: Option<i32>,
    pub debug_port: Option<u16>,
    pub size: u64,
    pub bundle_dir: Option<String>,
    pub exec_path: Option<String>,
    pub args: String,
    pub env: BTreeMap<String, String>,
}

impl SessionStatus {
    /// True for bundle-backed sessions.
    #[must_use]
    pub fn is_bundle(&self) -> bool {
        self.bundle_dir.is_some()
    }
}
