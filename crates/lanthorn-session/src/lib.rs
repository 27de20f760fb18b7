//! # lanthorn-session
//!
//! Session lifecycle for the lanthorn daemon.
//!
//! A session is one uploaded image plus its derived process
//! lifecycle, addressed by a stable id. This crate owns:
//!
//! - the in-memory registry of sessions and the two admission caps
//!   (session count, aggregate stored bytes),
//! - the state machine LOADED → RUNNING/DEBUGGING → STOPPED,
//! - the fork/exec launcher that wires child stdout/stderr into a
//!   capture pipe and optionally wraps the program in a debug stub,
//! - the pidfd-based process watcher feeding exit transitions,
//! - the bounded per-session output ring.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │               SessionManager                  │
//! │   registry ─ caps ─ debug ports ─ watches     │
//! └──────┬───────────────┬────────────────┬──────┘
//!        │ fork/exec     │ pidfd ready    │ pipe ready
//!   launcher         watcher task      output task
//! ```
//!
//! Every mutation funnels through the manager's single lock, which
//! the launcher holds across fork and watch registration: an exit
//! event can never be observed before its session knows the child.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod launcher;
pub mod manager;
pub mod output;
pub mod state;
mod watcher;

pub use error::{Result, SessionError};
pub use manager::{ManagerConfig, SessionManager};
pub use output::{OutputRing, OUTPUT_CAP};
pub use state::{Session, SessionId, SessionState, SessionStatus};
