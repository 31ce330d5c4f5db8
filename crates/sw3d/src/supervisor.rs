//! Startup, control loop, and shutdown for sw3d.
//!
//! [`Supervisor::start`] boots the collaborators in dependency order
//! (configuration, data store, socket, listener, console). Any failure moves
//! the lifecycle to [`LifecycleSignal::StartupError`] and skips the remaining
//! steps; it never escapes `start`. [`Supervisor::run`] then serves until the
//! lifecycle reaches [`LifecycleSignal::Terminate`] and performs the shutdown
//! cascade exactly once.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncBufRead;
use tokio::task::JoinError;

use crate::config::{CliArgs, ConfigError, ConfigStore, ServerMode, Settings};
use crate::connections::ActiveConnections;
use crate::console::{self, Console, ConsoleCommand};
use crate::lifecycle::{Lifecycle, LifecycleSignal};
use crate::listener::{Listener, ListenerHandle, ServerSocket};
use crate::protocol::{ConnectionHandler, ServerContext};
use crate::store::{StoreConnector, StoreError};

/// Grace period used when settings never loaded.
const FALLBACK_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Time allowed for aborted workers to release their registry entries.
const ABORT_SETTLE: Duration = Duration::from_millis(500);
/// Longest a single console command may hold up the control loop.
const CONSOLE_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Failures that stop the server from serving.
#[derive(Debug, Error)]
pub enum StartupError {
    /// Configuration could not be loaded or interpreted.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The data store could not be reached.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The listening socket could not be bound.
    #[error("failed to bind server port {port}: {source}")]
    Bind {
        /// Configured port.
        port: u16,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Served until terminated.
    Clean,
    /// A default configuration was written; nothing was served.
    Reconfigure,
    /// Startup failed; nothing was served.
    StartupError,
}

impl RunOutcome {
    /// Process exit code for this outcome.
    #[must_use]
    pub fn exit_code(self) -> ExitCode {
        match self {
            Self::Clean | Self::Reconfigure => ExitCode::SUCCESS,
            Self::StartupError => ExitCode::FAILURE,
        }
    }
}

/// Operator input source.
pub type ConsoleInput = Box<dyn AsyncBufRead + Unpin + Send>;

/// External collaborators the supervisor wires together.
pub struct Collaborators {
    connector: Arc<dyn StoreConnector>,
    handler: Arc<dyn ConnectionHandler>,
    console_input: Option<ConsoleInput>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("console_input", &self.console_input.is_some())
            .finish_non_exhaustive()
    }
}

impl Collaborators {
    /// Use `connector` for the data store and `handler` for connections.
    ///
    /// The console reads standard input unless
    /// [`with_console_input`](Self::with_console_input) is used.
    pub fn new(connector: Arc<dyn StoreConnector>, handler: Arc<dyn ConnectionHandler>) -> Self {
        Self {
            connector,
            handler,
            console_input: None,
        }
    }

    /// Read console commands from `input` instead of standard input.
    #[must_use]
    pub fn with_console_input<R>(mut self, input: R) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        self.console_input = Some(Box::new(input));
        self
    }
}

/// Owns the lifecycle and every long-lived component.
pub struct Supervisor {
    lifecycle: Lifecycle,
    mode: ServerMode,
    settings: Option<Arc<Settings>>,
    context: Option<Arc<ServerContext>>,
    socket: Option<ServerSocket>,
    listener: Option<ListenerHandle>,
    console: Option<Console>,
    connections: ActiveConnections,
    startup_error: Option<StartupError>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("signal", &self.lifecycle.get())
            .field("mode", &self.mode)
            .field("socket", &self.socket)
            .field("connections", &self.connections)
            .finish_non_exhaustive()
    }
}

enum Event {
    Signal,
    Console(Option<ConsoleCommand>),
}

impl Supervisor {
    /// Boot every collaborator in dependency order.
    ///
    /// Logging must already be initialised. Never fails: a failed step is
    /// logged, the lifecycle moves to [`LifecycleSignal::StartupError`], and
    /// the remaining steps are skipped so [`run`](Self::run) exits cleanly.
    pub async fn start(args: &CliArgs, collaborators: Collaborators) -> Self {
        let mut supervisor = Self {
            lifecycle: Lifecycle::new(),
            mode: ServerMode::Daemon,
            settings: None,
            context: None,
            socket: None,
            listener: None,
            console: None,
            connections: ActiveConnections::new(),
            startup_error: None,
        };
        match supervisor.boot(args, collaborators).await {
            Ok(()) if supervisor.lifecycle.get() == LifecycleSignal::Running => {
                tracing::info!(mode = %supervisor.mode, "Server has started up");
            }
            Ok(()) => {}
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "An error occurred during startup; the server will now shut down",
                );
                supervisor.lifecycle.set(LifecycleSignal::StartupError);
                supervisor.startup_error = Some(e);
            }
        }
        supervisor
    }

    async fn boot(
        &mut self,
        args: &CliArgs,
        collaborators: Collaborators,
    ) -> Result<(), StartupError> {
        let store = args.apply(ConfigStore::load(&args.config, &self.lifecycle)?);
        let settings = Arc::new(Settings::from_store(&store)?);
        self.mode = settings.mode;
        self.settings = Some(Arc::clone(&settings));
        if self.lifecycle.get() == LifecycleSignal::NeedsReconfig {
            return Ok(());
        }

        let profiles = collaborators.connector.connect(&settings.db).await?;

        let port = settings.server_port;
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let socket = ServerSocket::bind(addr, settings.poll_timeout)
            .await
            .map_err(|source| StartupError::Bind { port, source })?;
        tracing::info!(addr = %socket.local_addr(), "Server socket bound");

        let context = Arc::new(ServerContext {
            settings: Arc::clone(&settings),
            store: profiles,
            connections: self.connections.clone(),
        });
        let listener = Listener::new(socket.clone(), Arc::clone(&context), collaborators.handler);
        self.listener = Some(listener.start());
        self.socket = Some(socket);
        self.context = Some(context);
        tracing::debug!("Listener task started");

        if self.mode == ServerMode::Active {
            let input = collaborators.console_input.unwrap_or_else(|| {
                let stdin = tokio::io::BufReader::new(tokio::io::stdin());
                Box::new(stdin) as ConsoleInput
            });
            self.console = Some(Console::spawn(input));
            tracing::debug!("Console started");
        }
        Ok(())
    }

    /// Shared lifecycle signal.
    #[must_use]
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Server mode, [`ServerMode::Daemon`] when settings never loaded.
    #[must_use]
    pub fn mode(&self) -> ServerMode {
        self.mode
    }

    /// Address of the bound socket, if startup got that far.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().map(ServerSocket::local_addr)
    }

    /// Live connection registry.
    #[must_use]
    pub fn connections(&self) -> &ActiveConnections {
        &self.connections
    }

    /// Whether the listener was started.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    /// Whether the console was started.
    #[must_use]
    pub fn has_console(&self) -> bool {
        self.console.is_some()
    }

    /// The error that stopped startup, if any.
    #[must_use]
    pub fn startup_error(&self) -> Option<&StartupError> {
        self.startup_error.as_ref()
    }

    /// Serve until terminated, then shut down.
    ///
    /// Returns immediately, after the cascade, when startup requested a
    /// reconfiguration or failed.
    pub async fn run(mut self) -> RunOutcome {
        let outcome = match self.lifecycle.get() {
            LifecycleSignal::NeedsReconfig => {
                tracing::warn!(
                    "A new config file was created. Server shutting down so you can configure",
                );
                self.lifecycle.terminate();
                RunOutcome::Reconfigure
            }
            LifecycleSignal::StartupError => {
                tracing::error!("Due to a critical startup error, the server will now shut down");
                self.lifecycle.terminate();
                RunOutcome::StartupError
            }
            LifecycleSignal::Running | LifecycleSignal::Terminate => {
                self.control_loop().await;
                RunOutcome::Clean
            }
        };
        self.shutdown().await;
        outcome
    }

    async fn control_loop(&mut self) {
        let mut signal_rx = self.lifecycle.subscribe();
        let os_signals = spawn_signal_handler(self.lifecycle.clone());

        while !self.lifecycle.is_terminating() {
            let event = tokio::select! {
                changed = signal_rx.changed() => match changed {
                    Ok(()) => Event::Signal,
                    Err(_) => break,
                },
                cmd = next_command(self.console.as_mut()) => Event::Console(cmd),
            };
            match event {
                Event::Signal => {
                    tracing::debug!(signal = %self.lifecycle.get(), "Lifecycle signal changed");
                }
                Event::Console(Some(cmd)) => self.run_command(&cmd).await,
                Event::Console(None) => {
                    tracing::info!("Console closed; continuing without operator input");
                    self.console = None;
                }
            }
        }
        os_signals.abort();
    }

    /// Execute `cmd`, abandoning it on termination or after
    /// [`CONSOLE_COMMAND_TIMEOUT`].
    async fn run_command(&self, cmd: &ConsoleCommand) {
        let Some(context) = &self.context else {
            return;
        };
        let store = context.store.as_ref();
        tokio::select! {
            () = self.lifecycle.wait_for_terminate() => {
                tracing::warn!(command = %cmd, "Abandoning console command on shutdown");
            }
            res = tokio::time::timeout(
                CONSOLE_COMMAND_TIMEOUT,
                console::execute(cmd, &self.lifecycle, store),
            ) => {
                if res.is_err() {
                    tracing::warn!(command = %cmd, "Console command timed out");
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        tracing::info!("Shutting down the server");
        if let Some(mut console) = self.console.take() {
            console.close();
        }

        if let Some(mut listener) = self.listener.take() {
            listener.close();
            let poll = self
                .socket
                .as_ref()
                .map_or(Duration::from_secs(1), ServerSocket::poll_timeout);
            match tokio::time::timeout(poll * 2, listener.join()).await {
                Ok(res) => log_listener_exit(&res),
                Err(_) => {
                    tracing::warn!("Listener did not stop within its poll interval; aborting");
                    listener.abort();
                }
            }
        }

        if let Some(socket) = self.socket.take()
            && socket.close()
        {
            tracing::debug!("Server socket closed");
        }

        self.drain_connections().await;
        tracing::info!("Server shut down");
    }

    /// Give outstanding workers the grace period, then abort the rest.
    async fn drain_connections(&self) {
        self.connections.close_for_new();
        let live = self.connections.len();
        if live == 0 {
            return;
        }
        let grace = self
            .settings
            .as_ref()
            .map_or(FALLBACK_SHUTDOWN_GRACE, |s| s.shutdown_grace);
        tracing::info!(
            live,
            grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
            "Waiting for open connections to finish",
        );
        if self.connections.wait_empty(grace).await {
            return;
        }
        let forced = self.connections.abort_all();
        tracing::warn!(forced, "Force-closing connections after the grace period");
        if !self.connections.wait_empty(ABORT_SETTLE).await {
            tracing::warn!(
                remaining = self.connections.len(),
                "Connections still registered after abort",
            );
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // Release the socket if `run` was never called.
        if let Some(listener) = self.listener.take() {
            listener.close();
        }
        if let Some(socket) = self.socket.take() {
            socket.close();
        }
    }
}

async fn next_command(console: Option<&mut Console>) -> Option<ConsoleCommand> {
    match console {
        Some(console) => console.next().await,
        None => std::future::pending().await,
    }
}

fn log_listener_exit(res: &Result<(), JoinError>) {
    match res {
        Ok(()) => tracing::debug!("Listener stopped"),
        Err(e) if e.is_cancelled() => {
            tracing::warn!(kind = "cancelled", error = %e, "Listener stopped abnormally");
        }
        Err(e) => tracing::error!(kind = "panic", error = %e, "Listener stopped abnormally"),
    }
}

/// Convert SIGINT and SIGTERM into [`LifecycleSignal::Terminate`].
#[cfg(unix)]
fn spawn_signal_handler(lifecycle: Lifecycle) -> tokio::task::JoinHandle<()> {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGINT handler");
                return;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => tracing::info!("SIGINT received"),
            _ = sigterm.recv() => tracing::info!("SIGTERM received"),
        }
        lifecycle.terminate();
    })
}

#[cfg(not(unix))]
fn spawn_signal_handler(lifecycle: Lifecycle) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => lifecycle.terminate(),
            Err(e) => tracing::error!(error = %e, "Failed to install Ctrl-C handler"),
        }
    })
}
