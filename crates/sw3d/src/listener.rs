//! TCP listener for sw3d.
//!
//! Accepts client connections on the bound [`ServerSocket`] and starts a
//! [`ConnectionWorker`] for each. Every accept waits at most one poll
//! timeout, so [`ListenerHandle::close`] takes effect within one interval.

use backon::{ExponentialBackoff, ExponentialBuilder};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinHandle};

use crate::protocol::{ConnectionHandler, ServerContext};
use crate::worker::ConnectionWorker;

/// Smallest pause after a failed accept.
const ACCEPT_RETRY_MIN_DELAY: Duration = Duration::from_millis(10);

struct SocketState {
    listener: Mutex<Option<Arc<TcpListener>>>,
    local_addr: SocketAddr,
    poll_timeout: Duration,
    closed: Notify,
}

/// The single listening endpoint, shared by the supervisor and listener.
#[derive(Clone)]
pub struct ServerSocket {
    state: Arc<SocketState>,
}

impl std::fmt::Debug for ServerSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSocket")
            .field("local_addr", &self.state.local_addr)
            .field("poll_timeout", &self.state.poll_timeout)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ServerSocket {
    /// Bind `addr`, bounding each accept by `poll_timeout`.
    ///
    /// # Errors
    /// Returns the bind error, e.g. when the port is in use.
    pub async fn bind(addr: SocketAddr, poll_timeout: Duration) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            state: Arc::new(SocketState {
                listener: Mutex::new(Some(Arc::new(listener))),
                local_addr,
                poll_timeout,
                closed: Notify::new(),
            }),
        })
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<TcpListener>>> {
        self.state
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> Option<Arc<TcpListener>> {
        self.slot().clone()
    }

    /// Address the socket is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.state.local_addr
    }

    /// Upper bound on a single accept wait.
    #[must_use]
    pub fn poll_timeout(&self) -> Duration {
        self.state.poll_timeout
    }

    /// Close the socket.
    ///
    /// Idempotent: returns `true` only for the call that closed it. A pending
    /// accept is woken immediately.
    pub fn close(&self) -> bool {
        let taken = self.slot().take();
        if taken.is_some() {
            self.state.closed.notify_waiters();
        }
        taken.is_some()
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.slot().is_none()
    }
}

/// Build a jittered exponential backoff for accept failures, capped at `max`.
fn backoff(max: Duration) -> ExponentialBackoff {
    backon::BackoffBuilder::build(
        ExponentialBuilder::default()
            .with_jitter()
            .with_min_delay(ACCEPT_RETRY_MIN_DELAY.min(max))
            .with_max_delay(max)
            .without_max_times(),
    )
}

/// Accept loop owning no state beyond what it shares with the supervisor.
pub struct Listener {
    socket: ServerSocket,
    context: Arc<ServerContext>,
    handler: Arc<dyn ConnectionHandler>,
    /// Number of upcoming accepts to fail before touching the socket.
    #[cfg(test)]
    accept_faults: Arc<std::sync::atomic::AtomicUsize>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("socket", &self.socket)
            .finish_non_exhaustive()
    }
}

impl Listener {
    /// Create a listener accepting on `socket`.
    pub fn new(
        socket: ServerSocket,
        context: Arc<ServerContext>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Self {
        Self {
            socket,
            context,
            handler,
            #[cfg(test)]
            accept_faults: Arc::default(),
        }
    }

    /// Run the accept loop on its own task.
    #[must_use]
    pub fn start(self) -> ListenerHandle {
        let done = Arc::new(AtomicBool::new(false));
        let socket = self.socket.clone();
        let task = tokio::spawn(self.run(Arc::clone(&done)));
        ListenerHandle { done, socket, task }
    }

    /// Accept connections until `done` is set.
    ///
    /// Poll timeouts and accept errors never end the loop; only the flag
    /// does.
    async fn run(self, done: Arc<AtomicBool>) {
        let poll = self.socket.poll_timeout();
        let mut accept_backoff = backoff(poll);
        tracing::info!(addr = %self.socket.local_addr(), "Now listening for connections");

        loop {
            // Created before the flag check so a close in between still wakes us.
            let closed = self.socket.state.closed.notified();
            if done.load(Ordering::Acquire) {
                break;
            }
            let Some(listener) = self.socket.current() else {
                // Socket already released; wait for the flag.
                tokio::time::sleep(poll).await;
                continue;
            };

            tokio::select! {
                () = closed => {}
                res = tokio::time::timeout(poll, self.accept(&listener)) => match res {
                    Err(_) => tracing::trace!("Accept poll timed out"),
                    Ok(Ok((stream, peer))) => {
                        accept_backoff = backoff(poll);
                        if done.load(Ordering::Acquire) {
                            tracing::debug!(%peer, "Dropping connection accepted during close");
                            break;
                        }
                        self.dispatch(stream, peer);
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "Failed to accept client connection");
                        let delay = accept_backoff.next().unwrap_or(poll);
                        tokio::time::sleep(delay).await;
                    }
                },
            }
        }
        tracing::info!("Listener shutting down");
    }

    async fn accept(&self, listener: &TcpListener) -> std::io::Result<(TcpStream, SocketAddr)> {
        #[cfg(test)]
        if self
            .accept_faults
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(std::io::Error::other("accept failed"));
        }
        listener.accept().await
    }

    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        let Some(guard) = self.context.connections.register(peer) else {
            tracing::info!(%peer, "Refusing connection while shutting down");
            return;
        };
        let worker = ConnectionWorker::new(
            stream,
            peer,
            guard,
            Arc::clone(&self.context),
            Arc::clone(&self.handler),
        );
        tracing::info!(connection = %worker.id(), %peer, "Accepted connection");
        // Detached: the registry tracks the worker from here on.
        drop(worker.spawn());
    }
}

/// Control handle for a running [`Listener`].
#[derive(Debug)]
pub struct ListenerHandle {
    done: Arc<AtomicBool>,
    socket: ServerSocket,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Stop accepting and release the socket.
    ///
    /// Idempotent and non-blocking; the loop exits within one poll timeout.
    pub fn close(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            tracing::info!("Closing network socket");
        }
        self.socket.close();
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Whether the accept loop has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the accept loop to exit.
    ///
    /// # Errors
    /// Returns the join error if the loop panicked or was aborted.
    pub async fn join(&mut self) -> Result<(), JoinError> {
        (&mut self.task).await
    }

    /// Abort the accept loop without waiting.
    pub fn abort(&self) {
        self.task.abort();
    }
}
