//! TCP control server.

use crate::conn::Connection;
use lanthorn_session::SessionManager;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::debug;

/// Accepts control connections and serves each on its own task.
pub struct Server {
    listener: TcpListener,
    manager: Arc<SessionManager>,
}

impl Server {
    /// Binds the control socket.
    ///
    /// # Errors
    ///
    /// Returns the bind error.
    pub async fn bind(addr: SocketAddr, manager: Arc<SessionManager>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, manager })
    }

    /// The bound address (useful with an ephemeral port).
    ///
    /// # Errors
    ///
    /// Returns the socket error.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop; runs until the listener fails.
    ///
    /// # Errors
    ///
    /// Returns the accept error that ended the loop.
    pub async fn run(self) -> io::Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            debug!(%peer, "client connected");
            let manager = Arc::clone(&self.manager);
            tokio::spawn(async move {
                Connection::new(stream, manager).run().await;
            });
        }
    }
}
