use anyhow::{bail, Context, Result};
use clap::Parser;
use lanthorn_session::{ManagerConfig, SessionManager};
use lanthornd::Server;
use std::net::{Ipv4Addr, SocketAddr};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "lanthornd")]
#[command(author, version, about = "Remote execution and debugging daemon", long_about = None)]
struct DaemonArgs {
    /// TCP port for the control channel.
    #[arg(long, default_value_t = 4444)]
    port: u16,

    /// Maximum number of concurrent sessions.
    #[arg(long, default_value_t = 32)]
    max_sessions: usize,

    /// Maximum aggregate bytes of stored images.
    #[arg(long, default_value_t = 512 * 1024 * 1024)]
    max_total_bytes: u64,

    /// Drop to this uid after binding the control socket.
    #[arg(long)]
    uid: Option<u32>,

    /// Drop to this gid after binding the control socket.
    #[arg(long)]
    gid: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lanthorn=info,lanthornd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = DaemonArgs::parse();

    let manager = SessionManager::new(ManagerConfig {
        max_sessions: args.max_sessions,
        max_total_bytes: args.max_total_bytes,
    });

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.port));
    let server = Server::bind(addr, manager)
        .await
        .with_context(|| format!("failed to bind control socket on {addr}"))?;

    drop_privileges(args.gid, args.uid)?;

    info!(port = args.port, "lanthornd listening");
    server.run().await.context("control server failed")
}

/// Drops group then user id, after the privileged bind.
fn drop_privileges(gid: Option<u32>, uid: Option<u32>) -> Result<()> {
    if let Some(gid) = gid {
        // SAFETY: plain syscall.
        if unsafe { libc::setgid(gid) } != 0 {
            bail!("setgid({gid}): {}", std::io::Error::last_os_error());
        }
    }
    if let Some(uid) = uid {
        // SAFETY: plain syscall.
        if unsafe { libc::setuid(uid) } != 0 {
            bail!("setuid({uid}): {}", std::io::Error::last_os_error());
        }
    }
    Ok(())
}
