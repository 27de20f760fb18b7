//! Response rendering.
//!
//! Every response is one line. Session status, OUTPUT, and ENVLIST
//! carry client-controlled bytes and are rendered through the
//! byte-exact writer in [`crate::escape`]; error objects and DEPS
//! carry only daemon-controlled ASCII and go through serde.

use crate::escape::write_json_string;
use chrono::{SecondsFormat, Utc};
use lanthorn_session::SessionStatus;
use serde::Serialize;
use std::collections::BTreeMap;

/// Availability of one external helper, for DEPS.
#[derive(Debug, Clone, Serialize)]
pub struct DepStatus {
    pub name: &'static str,
    pub description: &'static str,
    pub available: bool,
    pub required: bool,
}

#[derive(Serialize)]
struct DepsBody<'a> {
    deps: &'a [DepStatus],
    all_satisfied: bool,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    ok: bool,
    error_code: &'a str,
    message: &'static str,
    time: String,
}

/// Incremental JSON object writer over raw bytes.
struct Obj {
    buf: Vec<u8>,
}

impl Obj {
    fn new() -> Self {
        Self { buf: vec![b'{'] }
    }

    fn key(&mut self, key: &str) {
        if self.buf.len() > 1 {
            self.buf.push(b',');
        }
        write_json_string(&mut self.buf, key.as_bytes());
        self.buf.push(b':');
    }

    fn str(&mut self, key: &str, value: &[u8]) {
        self.key(key);
        write_json_string(&mut self.buf, value);
    }

    fn uint(&mut self, key: &str, value: u64) {
        self.key(key);
        self.buf.extend_from_slice(value.to_string().as_bytes());
    }

    fn int_or_null(&mut self, key: &str, value: Option<i64>) {
        self.key(key);
        match value {
            Some(v) => self.buf.extend_from_slice(v.to_string().as_bytes()),
            None => self.buf.extend_from_slice(b"null"),
        }
    }

    fn bool(&mut self, key: &str, value: bool) {
        self.key(key);
        self.buf
            .extend_from_slice(if value { b"true" } else { b"false" });
    }

    fn nested_map(&mut self, key: &str, map: &BTreeMap<String, String>) {
        self.key(key);
        self.buf.push(b'{');
        for (i, (k, v)) in map.iter().enumerate() {
            if i > 0 {
                self.buf.push(b',');
            }
            write_json_string(&mut self.buf, k.as_bytes());
            self.buf.push(b':');
            write_json_string(&mut self.buf, v.as_bytes());
        }
        self.buf.push(b'}');
    }

    fn close(mut self) -> Vec<u8> {
        self.buf.push(b'}');
        self.buf
    }
}

fn terminated(mut buf: Vec<u8>) -> Vec<u8> {
    buf.push(b'\n');
    buf
}

/// Session JSON object, no terminator (shared by STATUS and LIST).
fn session_object(status: &SessionStatus) -> Vec<u8> {
    let mut obj = Obj::new();
    obj.str("id", status.id.as_bytes());
    obj.str("state", status.state.as_bytes());
    obj.int_or_null("pid", status.pid.map(i64::from));
    obj.int_or_null("debug_port", status.debug_port.map(i64::from));
    if status.is_bundle() {
        obj.bool("bundle", true);
        if let Some(exec_path) = &status.exec_path {
            obj.str("exec_path", exec_path.as_bytes());
        }
        if let Some(bundle_dir) = &status.bundle_dir {
            obj.str("bundle_dir", bundle_dir.as_bytes());
        }
    }
    if !status.args.is_empty() {
        obj.str("args", status.args.as_bytes());
    }
    if !status.env.is_empty() {
        obj.nested_map("env", &status.env);
    }
    obj.close()
}

/// STATUS (and most mutation) response.
#[must_use]
pub fn status_line(status: &SessionStatus) -> Vec<u8> {
    terminated(session_object(status))
}

/// LIST response: array of session objects.
#[must_use]
pub fn list_line(statuses: &[SessionStatus]) -> Vec<u8> {
    let mut buf = vec![b'['];
    for (i, status) in statuses.iter().enumerate() {
        if i > 0 {
            buf.push(b',');
        }
        buf.extend_from_slice(&session_object(status));
    }
    buf.push(b']');
    terminated(buf)
}

/// UPLOAD success response: id, state, and the admitted byte size.
#[must_use]
pub fn upload_line(status: &SessionStatus) -> Vec<u8> {
    let mut obj = Obj::new();
    obj.str("id", status.id.as_bytes());
    obj.str("state", status.state.as_bytes());
    obj.uint("size", status.size);
    if status.is_bundle() {
        obj.bool("bundle", true);
        if let Some(exec_path) = &status.exec_path {
            obj.str("exec_path", exec_path.as_bytes());
        }
    }
    terminated(obj.close())
}

/// ENVLIST response: the overrides as a bare object.
#[must_use]
pub fn env_line(env: &BTreeMap<String, String>) -> Vec<u8> {
    let mut buf = vec![b'{'];
    for (i, (k, v)) in env.iter().enumerate() {
        if i > 0 {
            buf.push(b',');
        }
        write_json_string(&mut buf, k.as_bytes());
        buf.push(b':');
        write_json_string(&mut buf, v.as_bytes());
    }
    buf.push(b'}');
    terminated(buf)
}

/// OUTPUT response: the captured slice plus ring coordinates.
#[must_use]
pub fn output_line(id: &str, data: &[u8], offset: usize, total: usize) -> Vec<u8> {
    let mut obj = Obj::new();
    obj.str("id", id.as_bytes());
    obj.str("output", data);
    obj.uint("offset", offset as u64);
    obj.uint("total", total as u64);
    terminated(obj.close())
}

/// DELETE response.
#[must_use]
pub fn deleted_line(id: &str) -> Vec<u8> {
    let mut obj = Obj::new();
    obj.str("id", id.as_bytes());
    obj.str("state", b"DELETED");
    terminated(obj.close())
}

/// SYSROOT header line preceding the raw tar bytes.
#[must_use]
pub fn sysroot_header(size: u64) -> Vec<u8> {
    format!("SYSROOT {size}\n").into_bytes()
}

/// Error response for a wire error code.
#[must_use]
pub fn error_line(code: &str) -> Vec<u8> {
    let body = ErrorBody {
        ok: false,
        error_code: code,
        message: error_message(code),
        time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    };
    // Serialization of a flat ASCII struct cannot fail.
    let mut buf = serde_json::to_vec(&body).unwrap_or_default();
    buf.push(b'\n');
    buf
}

/// DEPS response.
#[must_use]
pub fn deps_line(deps: &[DepStatus]) -> Vec<u8> {
    let all_satisfied = deps.iter().all(|d| d.available || !d.required);
    let body = DepsBody {
        deps,
        all_satisfied,
    };
    let mut buf = serde_json::to_vec(&body).unwrap_or_default();
    buf.push(b'\n');
    buf
}

/// Human-readable message for each wire error code.
#[must_use]
pub fn error_message(code: &str) -> &'static str {
    match code {
        "invalid_size" => "upload size must be > 0",
        "upload_in_progress" => "upload already in progress",
        "memfd_create_failed" => "memfd_create failed",
        "upload_write_failed" => "failed to write upload data",
        "invalid_elf" => "uploaded file is not a valid ELF",
        "max_sessions_reached" => "maximum session count reached",
        "max_total_bytes_reached" => "maximum total RAM usage reached",
        "not_found" => "session not found",
        "already_running" => "session is already running",
        "not_running" => "session is not running",
        "fork_failed" => "fork failed",
        "kill_failed" => "failed to signal process",
        "session_running" => "session must be stopped before delete",
        "unknown_command" => "unknown command",
        "invalid_exec_path" => "exec_path not found or not a valid ELF in bundle",
        "tmpfile_create_failed" => "failed to create temporary file",
        "tmpdir_create_failed" => "failed to create temporary directory",
        "extract_failed" => "failed to extract tar.gz bundle",
        "invalid_env" => "env format must be KEY=VALUE",
        "sysroot_tmpfile_failed" => "failed to create temp file for sysroot",
        "sysroot_no_libs" => "no lib directories found on host",
        "sysroot_tar_failed" => "failed to create sysroot tarball",
        _ => "unspecified error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ascii_status() -> SessionStatus {
        SessionStatus {
            id: "0b5e8a1c-0000-4000-8000-123456789abc".to_string(),
            state: "RUNNING",
            pid: Some(4242),
            debug_port: None,
            size: 16,
            bundle_dir: None,
            exec_path: None,
            args: String::new(),
            env: BTreeMap::new(),
        }
    }

    #[test]
    fn status_line_shape() {
        let line = status_line(&ascii_status());
        assert_eq!(*line.last().unwrap(), b'\n');
        let v: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(v["state"], "RUNNING");
        assert_eq!(v["pid"], 4242);
        assert!(v["debug_port"].is_null());
        assert!(v.get("args").is_none());
        assert!(v.get("env").is_none());
        assert!(v.get("bundle").is_none());
    }

    #[test]
    fn status_line_with_bundle_args_env() {
        let mut status = ascii_status();
        status.bundle_dir = Some("/tmp/lanthorn-bundle-x".to_string());
        status.exec_path = Some("bin/app".to_string());
        status.args = "a b".to_string();
        status.env.insert("X".to_string(), "1".to_string());

        let v: serde_json::Value = serde_json::from_slice(&status_line(&status)).unwrap();
        assert_eq!(v["bundle"], true);
        assert_eq!(v["exec_path"], "bin/app");
        assert_eq!(v["bundle_dir"], "/tmp/lanthorn-bundle-x");
        assert_eq!(v["args"], "a b");
        assert_eq!(v["env"]["X"], "1");
    }

    #[test]
    fn list_line_is_an_array() {
        let line = list_line(&[ascii_status(), ascii_status()]);
        let v: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(v.as_array().unwrap().len(), 2);

        let empty = list_line(&[]);
        assert_eq!(empty, b"[]\n");
    }

    #[test]
    fn upload_line_carries_size() {
        let v: serde_json::Value = serde_json::from_slice(&upload_line(&ascii_status())).unwrap();
        assert_eq!(v["size"], 16);
        assert!(v.get("pid").is_none());
    }

    #[test]
    fn output_line_escapes_payload() {
        let line = output_line("abc", b"hello\nworld\x01", 0, 12);
        let text = String::from_utf8(line).unwrap();
        assert!(text.contains(r"hello\nworld?"));
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["offset"], 0);
        assert_eq!(v["total"], 12);
    }

    #[test]
    fn error_line_shape() {
        let v: serde_json::Value = serde_json::from_slice(&error_line("not_found")).unwrap();
        assert_eq!(v["ok"], false);
        assert_eq!(v["error_code"], "not_found");
        assert_eq!(v["message"], "session not found");
        let time = v["time"].as_str().unwrap();
        assert!(time.ends_with('Z'));
    }

    #[test]
    fn deps_line_reports_satisfaction() {
        let deps = [
            DepStatus {
                name: "gdbserver",
                description: "debug stub",
                available: false,
                required: true,
            },
            DepStatus {
                name: "tar",
                description: "archive tool",
                available: false,
                required: false,
            },
        ];
        let v: serde_json::Value = serde_json::from_slice(&deps_line(&deps)).unwrap();
        assert_eq!(v["all_satisfied"], false);
        assert_eq!(v["deps"][0]["name"], "gdbserver");
    }

    #[test]
    fn env_line_is_a_bare_object() {
        let mut env = BTreeMap::new();
        env.insert("A".to_string(), "1".to_string());
        env.insert("B".to_string(), "two words".to_string());
        let v: serde_json::Value = serde_json::from_slice(&env_line(&env)).unwrap();
        assert_eq!(v["A"], "1");
        assert_eq!(v["B"], "two words");

        assert_eq!(env_line(&BTreeMap::new()), b"{}\n");
    }
}
