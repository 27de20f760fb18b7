//! Command-line parsing.
//!
//! One command per line: the first whitespace-delimited token is the
//! verb (uppercase, case-sensitive), the rest are arguments. ARGS and
//! ENV take the remainder of the line verbatim after the id, with one
//! leading space stripped.

/// A parsed command. Borrowed from the input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    /// Enter upload mode for `size` payload bytes; an entry path
    /// makes it a bundle upload.
    Upload { size: u64, entry: Option<&'a str> },
    List,
    Status { id: &'a str },
    Args { id: &'a str, args: &'a str },
    Env { id: &'a str, kv: &'a str },
    EnvDel { id: &'a str, key: &'a str },
    EnvList { id: &'a str },
    Start { id: &'a str, debug: bool },
    Stop { id: &'a str },
    Kill { id: &'a str },
    Debug { id: &'a str },
    Delete { id: &'a str },
    Output { id: &'a str, offset: usize },
    Deps,
    Sysroot,
}

/// Parse failure, mapped straight onto wire error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Unrecognized verb (or empty line).
    UnknownCommand,
    /// UPLOAD size missing, unparsable, or zero.
    InvalidSize,
}

impl ParseError {
    /// Wire error code.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::UnknownCommand => "unknown_command",
            Self::InvalidSize => "invalid_size",
        }
    }
}

/// Splits the next whitespace-delimited token off the front of `s`,
/// returning the token and everything after it (delimiter included).
fn next_token(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], &s[i..]),
        None => (s, ""),
    }
}

/// The remainder of the line with a single leading space stripped.
fn rest_of_line(s: &str) -> &str {
    s.strip_prefix(' ').unwrap_or(s)
}

/// Parses one command line (terminator and trailing CR already
/// stripped).
///
/// # Errors
///
/// [`ParseError::UnknownCommand`] for an unrecognized verb,
/// [`ParseError::InvalidSize`] for a bad UPLOAD size. Missing ids
/// parse as the empty string and fail downstream as `not_found`.
pub fn parse_command(line: &str) -> Result<Command<'_>, ParseError> {
    let (verb, rest) = next_token(line);
    match verb {
        "UPLOAD" => {
            let (size_tok, rest) = next_token(rest);
            let size: u64 = size_tok.parse().map_err(|_| ParseError::InvalidSize)?;
            if size == 0 {
                return Err(ParseError::InvalidSize);
            }
            let (entry, _) = next_token(rest);
            Ok(Command::Upload {
                size,
                entry: (!entry.is_empty()).then_some(entry),
            })
        }
        "LIST" => Ok(Command::List),
        "STATUS" => {
            let (id, _) = next_token(rest);
            Ok(Command::Status { id })
        }
        "ARGS" => {
            let (id, rest) = next_token(rest);
            Ok(Command::Args {
                id,
                args: rest_of_line(rest),
            })
        }
        "ENV" => {
            let (id, rest) = next_token(rest);
            Ok(Command::Env {
                id,
                kv: rest_of_line(rest),
            })
        }
        "ENVDEL" => {
            let (id, rest) = next_token(rest);
            let (key, _) = next_token(rest);
            Ok(Command::EnvDel { id, key })
        }
        "ENVLIST" => {
            let (id, _) = next_token(rest);
            Ok(Command::EnvList { id })
        }
        "START" => {
            let (id, mut rest) = next_token(rest);
            let mut debug = false;
            loop {
                let (tok, next) = next_token(rest);
                if tok.is_empty() {
                    break;
                }
                if tok == "--debug" {
                    debug = true;
                }
                rest = next;
            }
            Ok(Command::Start { id, debug })
        }
        "STOP" => {
            let (id, _) = next_token(rest);
            Ok(Command::Stop { id })
        }
        "KILL" => {
            let (id, _) = next_token(rest);
            Ok(Command::Kill { id })
        }
        "DEBUG" => {
            let (id, _) = next_token(rest);
            Ok(Command::Debug { id })
        }
        "DELETE" => {
            let (id, _) = next_token(rest);
            Ok(Command::Delete { id })
        }
        "OUTPUT" => {
            let (id, rest) = next_token(rest);
            let (offset_tok, _) = next_token(rest);
            // Absent or unparsable offsets read from the start.
            let offset = offset_tok.parse().unwrap_or(0);
            Ok(Command::Output { id, offset })
        }
        "DEPS" => Ok(Command::Deps),
        "SYSROOT" => Ok(Command::Sysroot),
        _ => Err(ParseError::UnknownCommand),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_variants() {
        assert_eq!(
            parse_command("UPLOAD 1024"),
            Ok(Command::Upload {
                size: 1024,
                entry: None
            })
        );
        assert_eq!(
            parse_command("UPLOAD 2048 bin/app"),
            Ok(Command::Upload {
                size: 2048,
                entry: Some("bin/app")
            })
        );
        assert_eq!(parse_command("UPLOAD 0"), Err(ParseError::InvalidSize));
        assert_eq!(parse_command("UPLOAD"), Err(ParseError::InvalidSize));
        assert_eq!(parse_command("UPLOAD lots"), Err(ParseError::InvalidSize));
    }

    #[test]
    fn args_keeps_rest_of_line_verbatim() {
        assert_eq!(
            parse_command(r#"ARGS abc a b "c d""#),
            Ok(Command::Args {
                id: "abc",
                args: r#"a b "c d""#
            })
        );
        // Extra interior spacing survives; only one leading space is
        // stripped.
        assert_eq!(
            parse_command("ARGS abc  spaced  out"),
            Ok(Command::Args {
                id: "abc",
                args: " spaced  out"
            })
        );
        assert_eq!(
            parse_command("ARGS abc"),
            Ok(Command::Args { id: "abc", args: "" })
        );
    }

    #[test]
    fn env_value_may_contain_spaces_and_equals() {
        assert_eq!(
            parse_command("ENV abc KEY=a b=c"),
            Ok(Command::Env {
                id: "abc",
                kv: "KEY=a b=c"
            })
        );
    }

    #[test]
    fn start_scans_for_debug_flag() {
        assert_eq!(
            parse_command("START abc"),
            Ok(Command::Start {
                id: "abc",
                debug: false
            })
        );
        assert_eq!(
            parse_command("START abc --debug"),
            Ok(Command::Start {
                id: "abc",
                debug: true
            })
        );
        assert_eq!(
            parse_command("START abc --verbose --debug"),
            Ok(Command::Start {
                id: "abc",
                debug: true
            })
        );
    }

    #[test]
    fn output_offset_defaults_to_zero() {
        assert_eq!(
            parse_command("OUTPUT abc"),
            Ok(Command::Output { id: "abc", offset: 0 })
        );
        assert_eq!(
            parse_command("OUTPUT abc 512"),
            Ok(Command::Output {
                id: "abc",
                offset: 512
            })
        );
        assert_eq!(
            parse_command("OUTPUT abc junk"),
            Ok(Command::Output { id: "abc", offset: 0 })
        );
    }

    #[test]
    fn verbs_are_case_sensitive() {
        assert_eq!(parse_command("list"), Err(ParseError::UnknownCommand));
        assert_eq!(parse_command("Status x"), Err(ParseError::UnknownCommand));
        assert_eq!(parse_command(""), Err(ParseError::UnknownCommand));
    }

    #[test]
    fn missing_ids_parse_as_empty() {
        assert_eq!(parse_command("STATUS"), Ok(Command::Status { id: "" }));
        assert_eq!(parse_command("DELETE"), Ok(Command::Delete { id: "" }));
    }
}
