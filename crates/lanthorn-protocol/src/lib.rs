//! # lanthorn-protocol
//!
//! The line-framed control protocol of the lanthorn daemon.
//!
//! Commands are single ASCII lines, verb first, uppercase. Responses
//! are one line of JSON (an array for LIST) terminated by `\n`; the
//! two streaming responses (UPLOAD payload in, SYSROOT tar out) are
//! framed by a byte count on the command or header line.
//!
//! Session output and environment values may carry arbitrary client
//! bytes, so those responses are rendered by a byte-exact JSON writer
//! ([`escape`]) instead of serde: named escapes for the usual control
//! characters, `?` for the rest, and non-ASCII bytes passed through
//! untouched. Responses whose values the daemon controls (errors,
//! DEPS) go through serde_json.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod command;
pub mod escape;
pub mod response;

pub use command::{parse_command, Command, ParseError};
pub use response::DepStatus;
