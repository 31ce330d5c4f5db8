//! Per-connection protocol boundary.
//!
//! The core only guarantees isolation and cleanup around a
//! [`ConnectionHandler`]; what is spoken on the wire is up to the handler.
//! [`DrainHandler`] is the default: it reads one bounded payload and
//! discards it.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;

use crate::config::Settings;
use crate::connections::ActiveConnections;
use crate::store::ProfileStore;

/// Collaborators shared by every connection worker.
#[derive(Clone)]
pub struct ServerContext {
    /// Settings the server was started with.
    pub settings: Arc<Settings>,
    /// Data-store collaborator.
    pub store: Arc<dyn ProfileStore>,
    /// Live connection registry.
    pub connections: ActiveConnections,
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("settings", &self.settings)
            .field("connections", &self.connections)
            .finish_non_exhaustive()
    }
}

/// Services one accepted connection.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Handle `stream` until the conversation ends.
    fn handle(
        &self,
        stream: TcpStream,
        context: Arc<ServerContext>,
    ) -> BoxFuture<'static, anyhow::Result<()>>;
}

/// Largest payload accepted from a single client.
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1 MiB
/// How long a client may take to send its payload and close.
pub const CLIENT_READ_TIMEOUT_SECS: u64 = 5;

/// Read a single payload from `stream` until the peer closes it.
///
/// Returns the number of bytes read.
///
/// # Errors
/// Fails if reading times out, the socket errors, or the payload reaches
/// [`MAX_REQUEST_BYTES`].
pub async fn drain_client<S>(stream: S) -> anyhow::Result<usize>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(8 * 1024);
    let mut limited = stream.take(MAX_REQUEST_BYTES as u64);
    tokio::time::timeout(
        Duration::from_secs(CLIENT_READ_TIMEOUT_SECS),
        limited.read_to_end(&mut buffer),
    )
    .await
    .map_err(|_| anyhow::anyhow!("client read timed out"))??;
    if buffer.len() >= MAX_REQUEST_BYTES {
        anyhow::bail!("client payload exceeds {} bytes", MAX_REQUEST_BYTES);
    }
    Ok(buffer.len())
}

/// Default handler: drains one payload per connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct DrainHandler;

impl ConnectionHandler for DrainHandler {
    fn handle(
        &self,
        stream: TcpStream,
        _context: Arc<ServerContext>,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        async move {
            let peer = stream.peer_addr().ok();
            let bytes = drain_client(stream).await?;
            match peer {
                Some(peer) => tracing::debug!(%peer, bytes, "Client payload drained"),
                None => tracing::debug!(bytes, "Client payload drained"),
            }
            Ok(())
        }
        .boxed()
    }
}
