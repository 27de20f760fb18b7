//! Per-connection protocol handling.
//!
//! Each client connection owns a read buffer. Complete lines are
//! commands; an UPLOAD switches the connection into upload mode,
//! where every buffered byte is payload until the announced count is
//! consumed, then command mode resumes. One upload per connection at
//! a time.
//!
//! Closing the connection mid-upload releases the spool (memfd or
//! temp file) through drop.

use bytes::BytesMut;
use lanthorn_image::bundle::validate_entry_path;
use lanthorn_image::{sysroot, ImageError, PendingBundle, RawImage, ELF_MAGIC};
use lanthorn_protocol::response;
use lanthorn_protocol::{parse_command, Command};
use lanthorn_session::{SessionError, SessionManager};
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::deps;

/// An in-flight upload on this connection.
struct Upload {
    remaining: u64,
    total: u64,
    spool: Spool,
}

/// Where upload payload bytes land.
enum Spool {
    /// Raw ELF streamed straight into its memfd; the first four
    /// bytes are kept aside for the magic check.
    Raw {
        image: RawImage,
        magic: [u8; 4],
        filled: usize,
    },
    /// Bundle archive spooled to a temp file for extraction.
    Bundle { tmp: NamedTempFile, entry: String },
}

/// One client connection.
pub struct Connection {
    stream: TcpStream,
    buf: BytesMut,
    manager: Arc<SessionManager>,
    upload: Option<Upload>,
}

impl Connection {
    /// Wraps an accepted stream.
    #[must_use]
    pub fn new(stream: TcpStream, manager: Arc<SessionManager>) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(8 * 1024),
            manager,
            upload: None,
        }
    }

    /// Serves the connection until the client closes it or an I/O
    /// error ends it.
    pub async fn run(mut self) {
        loop {
            if self.process_buffer().await.is_err() {
                return;
            }
            match self.stream.read_buf(&mut self.buf).await {
                Ok(0) => {
                    trace!("client closed connection");
                    return;
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(%err, "connection read error");
                    return;
                }
            }
        }
    }

    /// Consumes everything currently buffered: payload bytes while in
    /// upload mode, complete command lines otherwise.
    async fn process_buffer(&mut self) -> std::io::Result<()> {
        loop {
            if self.upload.is_some() {
                if !self.consume_upload().await? {
                    // Payload still outstanding; read more first.
                    return Ok(());
                }
                continue;
            }

            let Some(pos) = self.buf.iter().position(|&b| b == b'\n') else {
                return Ok(());
            };
            let raw_line = self.buf.split_to(pos + 1);
            let line = String::from_utf8_lossy(&raw_line);
            let line = line.trim_end_matches(['\n', '\r']);
            self.dispatch(line).await?;
        }
    }

    /// Moves buffered bytes into the upload spool. Returns true when
    /// the payload is complete and the upload has been finished.
    async fn consume_upload(&mut self) -> std::io::Result<bool> {
        let upload = self.upload.as_mut().expect("in upload mode");
        #[allow(clippy::cast_possible_truncation)]
        let take = (upload.remaining.min(self.buf.len() as u64)) as usize;
        if take > 0 {
            let chunk = self.buf.split_to(take);
            if let Err(err) = upload.spool.write_chunk(&chunk) {
                debug!(%err, "upload spool write failed");
                self.send_error("upload_write_failed").await?;
                return Err(err);
            }
            upload.remaining -= take as u64;
        }
        if upload.remaining == 0 {
            let upload = self.upload.take().expect("in upload mode");
            self.finish_upload(upload).await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn dispatch(&mut self, line: &str) -> std::io::Result<()> {
        let cmd = match parse_command(line) {
            Ok(cmd) => cmd,
            Err(err) => return self.send_error(err.code()).await,
        };

        match cmd {
            Command::Upload { size, entry } => self.begin_upload(size, entry).await,
            Command::List => {
                let line = response::list_line(&self.manager.list());
                self.send(&line).await
            }
            Command::Status { id } => {
                let result = self.manager.status(id).map(|s| response::status_line(&s));
                self.respond(result).await
            }
            Command::Args { id, args } => {
                let result = self
                    .manager
                    .set_args(id, args)
                    .map(|s| response::status_line(&s));
                self.respond(result).await
            }
            Command::Env { id, kv } => match kv.find('=') {
                None | Some(0) => self.send_error("invalid_env").await,
                Some(eq) => {
                    let result = self
                        .manager
                        .set_env(id, &kv[..eq], &kv[eq + 1..])
                        .map(|s| response::status_line(&s));
                    self.respond(result).await
                }
            },
            Command::EnvDel { id, key } => {
                let result = self
                    .manager
                    .del_env(id, key)
                    .map(|s| response::status_line(&s));
                self.respond(result).await
            }
            Command::EnvList { id } => {
                let result = self.manager.env_list(id).map(|env| response::env_line(&env));
                self.respond(result).await
            }
            Command::Start { id, debug } => {
                let result = self
                    .manager
                    .start(id, debug)
                    .map(|s| response::status_line(&s));
                self.respond(result).await
            }
            Command::Stop { id } => {
                let result = self.manager.stop(id).map(|s| response::status_line(&s));
                self.respond(result).await
            }
            Command::Kill { id } => {
                let result = self
                    .manager
                    .kill(id)
                    .await
                    .map(|s| response::status_line(&s));
                self.respond(result).await
            }
            Command::Debug { id } => {
                let result = self
                    .manager
                    .attach_debug(id)
                    .map(|s| response::status_line(&s));
                self.respond(result).await
            }
            Command::Delete { id } => {
                let result = self.manager.delete(id).map(|id| response::deleted_line(&id));
                self.respond(result).await
            }
            Command::Output { id, offset } => {
                let result = self
                    .manager
                    .output_slice(id, offset)
                    .map(|(data, total)| response::output_line(id, &data, offset, total));
                self.respond(result).await
            }
            Command::Deps => {
                let line = response::deps_line(&deps::check());
                self.send(&line).await
            }
            Command::Sysroot => self.handle_sysroot().await,
        }
    }

    /// Validates an UPLOAD command and enters upload mode.
    async fn begin_upload(&mut self, size: u64, entry: Option<&str>) -> std::io::Result<()> {
        if self.upload.is_some() {
            return self.send_error("upload_in_progress").await;
        }

        let spool = match entry {
            Some(entry) => {
                if validate_entry_path(entry).is_err() {
                    return self.send_error("invalid_exec_path").await;
                }
                let tmp = match tempfile::Builder::new()
                    .prefix("lanthorn-upload-")
                    .tempfile()
                {
                    Ok(tmp) => tmp,
                    Err(err) => {
                        debug!(%err, "upload spool creation failed");
                        return self.send_error("tmpfile_create_failed").await;
                    }
                };
                Spool::Bundle {
                    tmp,
                    entry: entry.to_string(),
                }
            }
            None => match RawImage::create("lanthorn-upload") {
                Ok(image) => Spool::Raw {
                    image,
                    magic: [0; 4],
                    filled: 0,
                },
                Err(err) => return self.send_error(err.code()).await,
            },
        };

        trace!(size, bundle = entry.is_some(), "entering upload mode");
        self.upload = Some(Upload {
            remaining: size,
            total: size,
            spool,
        });
        Ok(())
    }

    /// Admits a completed upload payload.
    async fn finish_upload(&mut self, upload: Upload) -> std::io::Result<()> {
        match upload.spool {
            Spool::Raw { image, magic, filled } => {
                if filled < 4 || magic != ELF_MAGIC {
                    return self.send_error(ImageError::InvalidElf.code()).await;
                }
                let result = self
                    .manager
                    .admit_raw(image, upload.total)
                    .map(|s| response::upload_line(&s));
                self.respond(result).await
            }
            Spool::Bundle { tmp, entry } => {
                // Cheap cap check before paying for extraction; the
                // binding check happens at admission.
                if let Err(err) = self.manager.precheck_admission(upload.total) {
                    return self.send_error(err.code()).await;
                }
                let extracted = tokio::task::spawn_blocking(move || {
                    let pending = PendingBundle::extract(tmp.path(), &entry);
                    drop(tmp);
                    pending
                })
                .await;

                let pending = match extracted {
                    Ok(Ok(pending)) => pending,
                    Ok(Err(err)) => return self.send_error(err.code()).await,
                    Err(err) => {
                        debug!(%err, "bundle extraction task failed");
                        let io = std::io::Error::new(std::io::ErrorKind::Other, err);
                        return self.send_error(ImageError::Extract(io).code()).await;
                    }
                };
                let result = self
                    .manager
                    .admit_bundle(pending, upload.total)
                    .map(|s| response::upload_line(&s));
                self.respond(result).await
            }
        }
    }

    /// Builds and streams the sysroot: one header line, then the raw
    /// tar bytes. Archive creation runs on the blocking pool; the
    /// stream write applies normal backpressure.
    async fn handle_sysroot(&mut self) -> std::io::Result<()> {
        let result = tokio::task::spawn_blocking(|| {
            let dirs = sysroot::default_dirs();
            sysroot::build_archive(&dirs)
        })
        .await;

        match result {
            Ok(Ok((spool, size))) => {
                self.stream
                    .write_all(&response::sysroot_header(size))
                    .await?;
                let mut reader = tokio::fs::File::from_std(spool);
                tokio::io::copy(&mut reader, &mut self.stream).await?;
                Ok(())
            }
            Ok(Err(err)) => self.send_error(err.code()).await,
            Err(err) => {
                debug!(%err, "sysroot task failed");
                self.send_error("sysroot_tar_failed").await
            }
        }
    }

    async fn respond<E: ErrorCode>(
        &mut self,
        result: Result<Vec<u8>, E>,
    ) -> std::io::Result<()> {
        match result {
            Ok(line) => self.send(&line).await,
            Err(err) => self.send_error(err.wire_code()).await,
        }
    }

    async fn send(&mut self, line: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(line).await
    }

    async fn send_error(&mut self, code: &str) -> std::io::Result<()> {
        self.send(&response::error_line(code)).await
    }
}

impl Spool {
    fn write_chunk(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Raw {
                image,
                magic,
                filled,
            } => {
                if *filled < 4 {
                    let want = data.len().min(4 - *filled);
                    magic[*filled..*filled + want].copy_from_slice(&data[..want]);
                    *filled += want;
                }
                let mut file = image.file();
                file.write_all(data)
            }
            Self::Bundle { tmp, .. } => tmp.write_all(data),
        }
    }
}

/// Errors that carry a wire error code.
trait ErrorCode {
    fn wire_code(&self) -> &'static str;
}

impl ErrorCode for SessionError {
    fn wire_code(&self) -> &'static str {
        self.code()
    }
}

impl ErrorCode for ImageError {
    fn wire_code(&self) -> &'static str {
        self.code()
    }
}
