//! Error types for session operations.

use thiserror::Error;

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors that can occur during session lifecycle operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No session with the given id.
    #[error("session not found")]
    NotFound,

    /// START on a session that already has a live child.
    #[error("session is already running")]
    AlreadyRunning,

    /// STOP/KILL/DEBUG on a session with no live child.
    #[error("session is not running")]
    NotRunning,

    /// DELETE on a session with a live child.
    #[error("session must be stopped before delete")]
    SessionRunning,

    /// The registry already holds the maximum number of sessions.
    #[error("maximum session count reached")]
    MaxSessions,

    /// Admitting the upload would exceed the aggregate byte cap.
    #[error("maximum total RAM usage reached")]
    MaxTotalBytes,

    /// The launcher could not create the capture pipe or fork.
    #[error("fork failed: {0}")]
    Fork(#[source] std::io::Error),
}

impl SessionError {
    /// Wire error code for this error (protocol taxonomy).
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::AlreadyRunning => "already_running",
            Self::NotRunning => "not_running",
            Self::SessionRunning => "session_running",
            Self::MaxSessions => "max_sessions_reached",
            Self::MaxTotalBytes => "max_total_bytes_reached",
            Self::Fork(_) => "fork_failed",
        }
    }
}
