//! Connection worker for sw3d.
//!
//! Each accepted socket is serviced on its own task. Failures, including
//! panics in the protocol handler, stop at the task boundary and are logged;
//! the registry entry is released when the worker ends.

use futures::FutureExt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::connections::{ConnectionGuard, ConnectionId};
use crate::protocol::{ConnectionHandler, ServerContext};

/// Isolated unit of work servicing one accepted connection.
pub struct ConnectionWorker {
    stream: TcpStream,
    peer: SocketAddr,
    guard: ConnectionGuard,
    context: Arc<ServerContext>,
    handler: Arc<dyn ConnectionHandler>,
}

impl std::fmt::Debug for ConnectionWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionWorker")
            .field("id", &self.guard.id())
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl ConnectionWorker {
    /// Bind a worker to an accepted socket and its registry entry.
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        guard: ConnectionGuard,
        context: Arc<ServerContext>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Self {
        Self {
            stream,
            peer,
            guard,
            context,
            handler,
        }
    }

    /// Registry identifier of this worker.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.guard.id()
    }

    /// Start the worker on its own task.
    ///
    /// The task's abort handle is recorded in the registry so shutdown can
    /// force-close the connection after its grace period.
    pub fn spawn(self) -> JoinHandle<()> {
        let id = self.id();
        let connections = self.context.connections.clone();
        let handle = tokio::spawn(self.run());
        connections.attach(id, handle.abort_handle());
        handle
    }

    async fn run(self) {
        let Self {
            stream,
            peer,
            guard,
            context,
            handler,
        } = self;
        let id = guard.id();
        tracing::debug!(connection = %id, %peer, "Connection worker started");

        // The stream is owned by the handler future and closed when it ends.
        let outcome = AssertUnwindSafe(async move { handler.handle(stream, context).await })
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => tracing::debug!(connection = %id, %peer, "Connection closed"),
            Ok(Err(e)) => {
                tracing::warn!(connection = %id, %peer, error = %e, "Connection handling failed");
            }
            Err(_) => tracing::error!(connection = %id, %peer, "Connection handler panicked"),
        }
        drop(guard);
    }
}
