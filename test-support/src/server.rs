//! Helpers for driving a real server in tests.
//!
//! Provides temporary configuration files plus in-memory stand-ins for the
//! data store and the per-connection protocol handler.

#![expect(clippy::expect_used, reason = "simplify test setup")]

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use sw3_lib::Profile;
use sw3d::config::DbSettings;
use sw3d::protocol::{ConnectionHandler, ServerContext, drain_client};
use sw3d::store::{ProfileStore, StoreConnector, StoreError};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::sync::watch;

/// Flat configuration file contents used in server tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestConfig {
    /// Data-store host.
    pub dbhost: String,
    /// Data-store port.
    pub dbport: u16,
    /// Data-store user.
    pub dbuser: String,
    /// Data-store password.
    pub dbpass: String,
    /// Database name.
    pub db: String,
    /// `active` or `daemon`.
    pub servermode: String,
    /// Listening port; `0` lets the OS choose.
    pub serverport: u16,
    /// Accept poll timeout in milliseconds.
    pub polltimeoutms: u64,
    /// Shutdown grace period in milliseconds.
    pub shutdowngracems: u64,
}

/// Build a daemon-mode [`TestConfig`] on an ephemeral port.
///
/// Polls every 50 ms and allows 500 ms for connections to drain, keeping
/// shutdown quick.
pub fn temp_config() -> TestConfig {
    TestConfig {
        dbhost: "127.0.0.1".into(),
        dbport: 3306,
        dbuser: "test".into(),
        dbpass: "secret".into(),
        db: "giraf".into(),
        servermode: "daemon".into(),
        serverport: 0,
        polltimeoutms: 50,
        shutdowngracems: 500,
    }
}

impl TestConfig {
    /// Override the server mode and return the updated configuration.
    #[must_use]
    pub fn with_mode(mut self, mode: &str) -> Self {
        self.servermode = mode.into();
        self
    }

    /// Override the shutdown grace period (milliseconds) and return the
    /// updated configuration.
    #[must_use]
    pub fn with_shutdown_grace_ms(mut self, ms: u64) -> Self {
        self.shutdowngracems = ms;
        self
    }

    /// Write the configuration as `config.toml` inside `tmp`.
    pub fn write_to(&self, tmp: &TempDir) -> PathBuf {
        let path = tmp.path().join("config.toml");
        let body = toml::to_string(self).expect("render config");
        std::fs::write(&path, body).expect("write config");
        path
    }
}

/// In-memory [`ProfileStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    profiles: Vec<Profile>,
}

impl MemoryStore {
    /// Store holding `profiles`, listed in the given order.
    pub fn new(profiles: Vec<Profile>) -> Self {
        Self { profiles }
    }
}

impl ProfileStore for MemoryStore {
    fn list_profiles(&self) -> BoxFuture<'_, Result<Vec<Profile>, StoreError>> {
        let profiles = self.profiles.clone();
        async move { Ok(profiles) }.boxed()
    }
}

/// Connector handing out a [`MemoryStore`] and counting connections.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    store: MemoryStore,
    connects: AtomicUsize,
}

impl MemoryConnector {
    /// Connector whose store lists `profiles`.
    pub fn with_profiles(profiles: Vec<Profile>) -> Self {
        Self {
            store: MemoryStore::new(profiles),
            connects: AtomicUsize::new(0),
        }
    }

    /// Number of successful connects so far.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl StoreConnector for MemoryConnector {
    fn connect<'a>(
        &'a self,
        _settings: &'a DbSettings,
    ) -> BoxFuture<'a, Result<Arc<dyn ProfileStore>, StoreError>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let store = self.store.clone();
        async move { Ok(Arc::new(store) as Arc<dyn ProfileStore>) }.boxed()
    }
}

/// Store whose queries never complete.
#[derive(Debug, Default)]
pub struct StalledStore;

impl ProfileStore for StalledStore {
    fn list_profiles(&self) -> BoxFuture<'_, Result<Vec<Profile>, StoreError>> {
        std::future::pending().boxed()
    }
}

/// Connector that succeeds but hands out a [`StalledStore`].
#[derive(Debug, Default)]
pub struct StalledConnector;

impl StoreConnector for StalledConnector {
    fn connect<'a>(
        &'a self,
        _settings: &'a DbSettings,
    ) -> BoxFuture<'a, Result<Arc<dyn ProfileStore>, StoreError>> {
        async { Ok(Arc::new(StalledStore) as Arc<dyn ProfileStore>) }.boxed()
    }
}

/// Connector that always fails, as if the database were down.
#[derive(Debug, Default)]
pub struct FailingConnector {
    attempts: AtomicUsize,
}

impl FailingConnector {
    /// Number of connection attempts so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl StoreConnector for FailingConnector {
    fn connect<'a>(
        &'a self,
        settings: &'a DbSettings,
    ) -> BoxFuture<'a, Result<Arc<dyn ProfileStore>, StoreError>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        async move { Err(StoreError::connect(settings, "connection refused")) }.boxed()
    }
}

/// Handler that holds every connection open until released.
///
/// Connections accepted after [`release`](Self::release) are drained as
/// usual.
#[derive(Debug, Clone)]
pub struct GatedHandler {
    open: Arc<watch::Sender<bool>>,
    started: Arc<AtomicUsize>,
}

impl Default for GatedHandler {
    fn default() -> Self {
        let (open, _) = watch::channel(false);
        Self {
            open: Arc::new(open),
            started: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl GatedHandler {
    /// Let every held connection finish.
    pub fn release(&self) {
        self.open.send_replace(true);
    }

    /// Number of connections the handler has started servicing.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

impl ConnectionHandler for GatedHandler {
    fn handle(
        &self,
        stream: TcpStream,
        _context: Arc<ServerContext>,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let mut open = self.open.subscribe();
        async move {
            open.wait_for(|released| *released).await?;
            drain_client(stream).await?;
            Ok(())
        }
        .boxed()
    }
}

/// Handler that fails every connection immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingHandler;

impl ConnectionHandler for FailingHandler {
    fn handle(
        &self,
        stream: TcpStream,
        _context: Arc<ServerContext>,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        async move {
            drop(stream);
            anyhow::bail!("protocol violation")
        }
        .boxed()
    }
}

/// Handler that panics on every connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct PanickingHandler;

impl ConnectionHandler for PanickingHandler {
    fn handle(
        &self,
        stream: TcpStream,
        _context: Arc<ServerContext>,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        async move {
            drop(stream);
            explode()
        }
        .boxed()
    }
}

fn explode() -> anyhow::Result<()> {
    panic!("handler exploded")
}
