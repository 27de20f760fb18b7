//! End-to-end tests: a live daemon on an ephemeral port, driven over
//! plain TCP like any client.
//!
//! Scenarios that need a real host executable (echo, env, sleep, seq)
//! skip with a note when the binary is missing.

use lanthorn_session::launcher::find_in_path;
use lanthorn_session::{ManagerConfig, SessionManager};
use lanthornd::Server;
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

const FAKE_ELF: [u8; 16] = [
    0x7f, b'E', b'L', b'F', 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
];

async fn spawn_daemon(cfg: ManagerConfig) -> SocketAddr {
    let manager = SessionManager::new(cfg);
    let server = Server::bind(SocketAddr::from(([127, 0, 0, 1], 0)), manager)
        .await
        .expect("bind ephemeral port");
    let addr = server.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    addr
}

async fn spawn_default_daemon() -> SocketAddr {
    spawn_daemon(ManagerConfig::default()).await
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer,
        }
    }

    async fn read_json(&mut self) -> Value {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.expect("read line");
        serde_json::from_str(&line).expect("valid JSON line")
    }

    async fn cmd(&mut self, line: &str) -> Value {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("write command");
        self.read_json().await
    }

    async fn upload(&mut self, payload: &[u8], entry: Option<&str>) -> Value {
        let header = match entry {
            Some(entry) => format!("UPLOAD {} {}\n", payload.len(), entry),
            None => format!("UPLOAD {}\n", payload.len()),
        };
        self.writer
            .write_all(header.as_bytes())
            .await
            .expect("write upload header");
        self.writer
            .write_all(payload)
            .await
            .expect("write upload payload");
        self.read_json().await
    }

    async fn wait_for_state(&mut self, id: &str, state: &str) -> bool {
        for _ in 0..300 {
            let status = self.cmd(&format!("STATUS {id}")).await;
            if status["state"] == state {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

fn host_binary(name: &str) -> Option<PathBuf> {
    let path = find_in_path(name);
    if path.is_none() {
        eprintln!("skipping: host binary {name:?} not found");
    }
    path
}

fn read_host_binary(name: &str) -> Option<Vec<u8>> {
    let path = host_binary(name)?;
    std::fs::read(path).ok()
}

// ============================================================================
// Upload admission
// ============================================================================

#[tokio::test]
async fn upload_creates_loaded_session_and_list_sees_it() {
    let addr = spawn_default_daemon().await;
    let mut client = Client::connect(addr).await;

    let created = client.upload(&FAKE_ELF, None).await;
    assert_eq!(created["state"], "LOADED");
    assert_eq!(created["size"], 16);
    let id = created["id"].as_str().expect("id").to_string();
    assert!(!id.is_empty());

    let list = client.cmd("LIST").await;
    let sessions = list.as_array().expect("array");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["id"], id.as_str());
    assert_eq!(sessions[0]["state"], "LOADED");
}

#[tokio::test]
async fn upload_rejects_zero_size_bad_magic_and_escaping_entry() {
    let addr = spawn_default_daemon().await;
    let mut client = Client::connect(addr).await;

    let err = client.cmd("UPLOAD 0").await;
    assert_eq!(err["ok"], false);
    assert_eq!(err["error_code"], "invalid_size");

    let err = client.upload(b"MZNOTELF00000000", None).await;
    assert_eq!(err["error_code"], "invalid_elf");
    assert!(err["time"].as_str().is_some());

    let err = client.cmd("UPLOAD 16 ../escape").await;
    assert_eq!(err["error_code"], "invalid_exec_path");

    // None of the rejected uploads created a session.
    let list = client.cmd("LIST").await;
    assert_eq!(list.as_array().expect("array").len(), 0);
}

#[tokio::test]
async fn upload_respects_session_cap() {
    let addr = spawn_daemon(ManagerConfig {
        max_sessions: 1,
        max_total_bytes: 1 << 20,
    })
    .await;
    let mut client = Client::connect(addr).await;

    let first = client.upload(&FAKE_ELF, None).await;
    assert_eq!(first["state"], "LOADED");

    let err = client.upload(&FAKE_ELF, None).await;
    assert_eq!(err["error_code"], "max_sessions_reached");

    let list = client.cmd("LIST").await;
    assert_eq!(list.as_array().expect("array").len(), 1);
}

#[tokio::test]
async fn upload_respects_byte_cap_until_delete_refunds() {
    let addr = spawn_daemon(ManagerConfig {
        max_sessions: 8,
        max_total_bytes: 20,
    })
    .await;
    let mut client = Client::connect(addr).await;

    let first = client.upload(&FAKE_ELF, None).await;
    assert_eq!(first["state"], "LOADED");

    let err = client.upload(&FAKE_ELF, None).await;
    assert_eq!(err["error_code"], "max_total_bytes_reached");

    let id = first["id"].as_str().expect("id").to_string();
    let deleted = client.cmd(&format!("DELETE {id}")).await;
    assert_eq!(deleted["state"], "DELETED");

    let again = client.upload(&FAKE_ELF, None).await;
    assert_eq!(again["state"], "LOADED");
}

// ============================================================================
// Lifecycle with a fake ELF (exec fails, surfaces as immediate exit)
// ============================================================================

#[tokio::test]
async fn fake_elf_runs_then_stops_then_restarts_with_debug() {
    let addr = spawn_default_daemon().await;
    let mut client = Client::connect(addr).await;

    let id = client.upload(&FAKE_ELF, None).await["id"]
        .as_str()
        .expect("id")
        .to_string();

    let started = client.cmd(&format!("START {id}")).await;
    assert_eq!(started["state"], "RUNNING");
    assert!(started["pid"].as_i64().expect("pid") > 0);

    // The payload is not a runnable program; exec failure arrives as
    // a normal exit event.
    assert!(client.wait_for_state(&id, "STOPPED").await);

    // Restart the same image under the debug stub.
    let debugged = client.cmd(&format!("START {id} --debug")).await;
    assert_eq!(debugged["state"], "DEBUGGING");
    let port = debugged["debug_port"].as_i64().expect("debug port");
    assert!((5500..5700).contains(&port));

    assert!(client.wait_for_state(&id, "STOPPED").await);

    let deleted = client.cmd(&format!("DELETE {id}")).await;
    assert_eq!(deleted["id"], id.as_str());
    assert_eq!(deleted["state"], "DELETED");
    let list = client.cmd("LIST").await;
    assert_eq!(list.as_array().expect("array").len(), 0);
}

#[tokio::test]
async fn start_errors_on_wrong_states() {
    let addr = spawn_default_daemon().await;
    let mut client = Client::connect(addr).await;

    let err = client.cmd("START 3b1a0000-dead-4000-8000-000000000000").await;
    assert_eq!(err["error_code"], "not_found");

    let err = client.cmd("STOP").await;
    assert_eq!(err["error_code"], "not_found");

    let id = client.upload(&FAKE_ELF, None).await["id"]
        .as_str()
        .expect("id")
        .to_string();

    // No live child yet.
    let err = client.cmd(&format!("STOP {id}")).await;
    assert_eq!(err["error_code"], "not_running");
    let err = client.cmd(&format!("KILL {id}")).await;
    assert_eq!(err["error_code"], "not_running");
    let err = client.cmd(&format!("DEBUG {id}")).await;
    assert_eq!(err["error_code"], "not_running");

    let err = client.cmd("NOPE").await;
    assert_eq!(err["error_code"], "unknown_command");
}

// ============================================================================
// ARGS / ENV round trips
// ============================================================================

#[tokio::test]
async fn args_and_env_round_trip_over_the_wire() {
    let addr = spawn_default_daemon().await;
    let mut client = Client::connect(addr).await;

    let id = client.upload(&FAKE_ELF, None).await["id"]
        .as_str()
        .expect("id")
        .to_string();

    let status = client.cmd(&format!(r#"ARGS {id} a b "c d""#)).await;
    assert_eq!(status["args"], r#"a b "c d""#);
    let status = client.cmd(&format!("STATUS {id}")).await;
    assert_eq!(status["args"], r#"a b "c d""#);

    client.cmd(&format!("ENV {id} X=1")).await;
    client.cmd(&format!("ENV {id} PATHY=/a/b:/c d")).await;
    let env = client.cmd(&format!("ENVLIST {id}")).await;
    assert_eq!(env["X"], "1");
    assert_eq!(env["PATHY"], "/a/b:/c d");

    client.cmd(&format!("ENVDEL {id} X")).await;
    let env = client.cmd(&format!("ENVLIST {id}")).await;
    assert!(env.get("X").is_none());
    assert_eq!(env["PATHY"], "/a/b:/c d");

    let err = client.cmd(&format!("ENV {id} NOEQUALS")).await;
    assert_eq!(err["error_code"], "invalid_env");
    let err = client.cmd(&format!("ENV {id} =value")).await;
    assert_eq!(err["error_code"], "invalid_env");
}

// ============================================================================
// Real host binaries
// ============================================================================

#[tokio::test]
async fn echo_output_is_captured_and_sliced() {
    let Some(payload) = read_host_binary("echo") else {
        return;
    };
    let addr = spawn_default_daemon().await;
    let mut client = Client::connect(addr).await;

    let id = client.upload(&payload, None).await["id"]
        .as_str()
        .expect("id")
        .to_string();
    client.cmd(&format!("ARGS {id} hello")).await;
    let started = client.cmd(&format!("START {id}")).await;
    assert_eq!(started["state"], "RUNNING");

    assert!(client.wait_for_state(&id, "STOPPED").await);

    let mut out = client.cmd(&format!("OUTPUT {id} 0")).await;
    for _ in 0..100 {
        if out["total"].as_u64() == Some(6) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        out = client.cmd(&format!("OUTPUT {id} 0")).await;
    }
    assert_eq!(out["output"], "hello\n");
    assert_eq!(out["total"], 6);
    assert_eq!(out["offset"], 0);

    // Reading from the returned total yields nothing new.
    let tail = client.cmd(&format!("OUTPUT {id} 6")).await;
    assert_eq!(tail["output"], "");
    assert_eq!(tail["total"], 6);
}

#[tokio::test]
async fn env_overrides_reach_the_child() {
    let Some(payload) = read_host_binary("env") else {
        return;
    };
    let addr = spawn_default_daemon().await;
    let mut client = Client::connect(addr).await;

    let id = client.upload(&payload, None).await["id"]
        .as_str()
        .expect("id")
        .to_string();
    client.cmd(&format!("ENV {id} LANTHORN_E2E=yes")).await;
    client.cmd(&format!("START {id}")).await;
    assert!(client.wait_for_state(&id, "STOPPED").await);

    let mut combined = String::new();
    for _ in 0..100 {
        let out = client.cmd(&format!("OUTPUT {id} 0")).await;
        combined = out["output"].as_str().unwrap_or_default().to_string();
        if combined.contains("LANTHORN_E2E=yes") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(
        combined.contains("LANTHORN_E2E=yes"),
        "child environment missing override: {combined}"
    );
}

#[tokio::test]
async fn kill_stops_eagerly_and_delete_is_gated_while_running() {
    let Some(payload) = read_host_binary("sleep") else {
        return;
    };
    let addr = spawn_default_daemon().await;
    let mut client = Client::connect(addr).await;

    let id = client.upload(&payload, None).await["id"]
        .as_str()
        .expect("id")
        .to_string();
    client.cmd(&format!("ARGS {id} 30")).await;
    let started = client.cmd(&format!("START {id}")).await;
    assert_eq!(started["state"], "RUNNING");

    let err = client.cmd(&format!("DELETE {id}")).await;
    assert_eq!(err["error_code"], "session_running");
    let status = client.cmd(&format!("STATUS {id}")).await;
    assert_eq!(status["state"], "RUNNING");

    // KILL reports STOPPED in its own reply, ahead of the exit event.
    let killed = client.cmd(&format!("KILL {id}")).await;
    assert_eq!(killed["state"], "STOPPED");
    assert!(killed["pid"].is_null());

    let deleted = client.cmd(&format!("DELETE {id}")).await;
    assert_eq!(deleted["state"], "DELETED");
}

#[tokio::test]
async fn stop_terminates_gracefully_after_replying_running() {
    let Some(payload) = read_host_binary("sleep") else {
        return;
    };
    let addr = spawn_default_daemon().await;
    let mut client = Client::connect(addr).await;

    let id = client.upload(&payload, None).await["id"]
        .as_str()
        .expect("id")
        .to_string();
    client.cmd(&format!("ARGS {id} 30")).await;
    client.cmd(&format!("START {id}")).await;

    // STOP replies with the pre-exit state; the transition follows
    // the exit event.
    let stopping = client.cmd(&format!("STOP {id}")).await;
    assert_eq!(stopping["state"], "RUNNING");
    assert!(client.wait_for_state(&id, "STOPPED").await);
}

#[tokio::test]
async fn output_ring_keeps_the_most_recent_256k() {
    let Some(payload) = read_host_binary("seq") else {
        return;
    };
    let addr = spawn_default_daemon().await;
    let mut client = Client::connect(addr).await;

    let id = client.upload(&payload, None).await["id"]
        .as_str()
        .expect("id")
        .to_string();
    // seq 1..=100000 emits well over 512 KiB of digits.
    client.cmd(&format!("ARGS {id} 1 100000")).await;
    client.cmd(&format!("START {id}")).await;
    assert!(client.wait_for_state(&id, "STOPPED").await);

    let mut out = client.cmd(&format!("OUTPUT {id} 0")).await;
    for _ in 0..200 {
        if out["output"]
            .as_str()
            .unwrap_or_default()
            .ends_with("100000\n")
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        out = client.cmd(&format!("OUTPUT {id} 0")).await;
    }

    assert_eq!(out["total"], 256 * 1024);
    let text = out["output"].as_str().expect("output");
    assert_eq!(text.len(), 256 * 1024);
    assert!(text.ends_with("100000\n"), "ring should keep the tail");
}

// ============================================================================
// Bundles
// ============================================================================

fn build_bundle(entry: &str, program: &[u8]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());

    let mut header = tar::Header::new_gnu();
    header.set_path(entry).expect("entry path");
    header.set_size(program.len() as u64);
    header.set_mode(0o755);
    header.set_cksum();
    builder.append(&header, program).expect("append entry");

    let companion = b"companion data\n";
    let mut header = tar::Header::new_gnu();
    header.set_path("data/hello.txt").expect("companion path");
    header.set_size(companion.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, companion.as_slice())
        .expect("append companion");

    let tar_data = builder.into_inner().expect("tar bytes");
    let mut encoder =
        flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    std::io::Write::write_all(&mut encoder, &tar_data).expect("gzip");
    encoder.finish().expect("gzip finish")
}

#[tokio::test]
async fn bundle_upload_runs_from_extraction_root_and_delete_removes_it() {
    let Some(program) = read_host_binary("true") else {
        return;
    };
    let addr = spawn_default_daemon().await;
    let mut client = Client::connect(addr).await;

    let bundle = build_bundle("run/app", &program);
    let created = client.upload(&bundle, Some("run/app")).await;
    assert_eq!(created["state"], "LOADED");
    assert_eq!(created["bundle"], true);
    assert_eq!(created["exec_path"], "run/app");
    let id = created["id"].as_str().expect("id").to_string();

    let status = client.cmd(&format!("STATUS {id}")).await;
    let bundle_dir = status["bundle_dir"].as_str().expect("bundle dir").to_string();
    assert!(std::path::Path::new(&bundle_dir).join("data/hello.txt").exists());

    let started = client.cmd(&format!("START {id}")).await;
    assert_eq!(started["state"], "RUNNING");
    assert!(client.wait_for_state(&id, "STOPPED").await);

    let deleted = client.cmd(&format!("DELETE {id}")).await;
    assert_eq!(deleted["state"], "DELETED");
    assert!(
        !std::path::Path::new(&bundle_dir).exists(),
        "bundle directory should be removed with the session"
    );
}

#[tokio::test]
async fn bundle_upload_with_wrong_entry_is_rejected_after_payload() {
    let addr = spawn_default_daemon().await;
    let mut client = Client::connect(addr).await;

    let bundle = build_bundle("run/app", b"#!/bin/sh\nexit 0\n");
    let err = client.upload(&bundle, Some("run/app")).await;
    // Present but not an ELF.
    assert_eq!(err["error_code"], "invalid_exec_path");

    let bundle = build_bundle("run/app", &FAKE_ELF);
    let err = client.upload(&bundle, Some("run/missing")).await;
    assert_eq!(err["error_code"], "invalid_exec_path");

    let list = client.cmd("LIST").await;
    assert_eq!(list.as_array().expect("array").len(), 0);
}

// ============================================================================
// DEPS
// ============================================================================

#[tokio::test]
async fn deps_reports_helper_availability() {
    let addr = spawn_default_daemon().await;
    let mut client = Client::connect(addr).await;

    let deps = client.cmd("DEPS").await;
    let entries = deps["deps"].as_array().expect("deps array");
    assert_eq!(entries.len(), 3);
    let names: Vec<_> = entries
        .iter()
        .map(|d| d["name"].as_str().expect("name"))
        .collect();
    assert_eq!(names, ["gdbserver", "tar", "gzip"]);
    assert!(deps["all_satisfied"].is_boolean());
}
