//! Data-store collaborator boundary.
//!
//! The daemon only needs to connect to a profile store and list its
//! profiles. [`StoreConnector`] and [`ProfileStore`] describe that boundary;
//! [`MySqlConnector`] is the production implementation backed by `sqlx`.

use futures::FutureExt;
use futures::future::BoxFuture;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use std::sync::Arc;
use std::time::Duration;
use sw3_lib::Profile;
use thiserror::Error;

use crate::config::DbSettings;

/// Boxed error from a concrete store implementation.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors reported by the data-store collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or rejected the credentials.
    #[error("failed to connect to the data store at {target}: {source}")]
    Connect {
        /// `host:port/database` being connected to.
        target: String,
        /// Underlying driver error.
        #[source]
        source: BoxError,
    },
    /// A query failed.
    #[error("profile query failed: {source}")]
    Query {
        /// Underlying driver error.
        #[source]
        source: BoxError,
    },
}

impl StoreError {
    /// Wrap a connection failure for `settings`.
    pub fn connect(settings: &DbSettings, source: impl Into<BoxError>) -> Self {
        Self::Connect {
            target: format!("{}:{}/{}", settings.host, settings.port, settings.database),
            source: source.into(),
        }
    }

    /// Wrap a query failure.
    pub fn query(source: impl Into<BoxError>) -> Self {
        Self::Query {
            source: source.into(),
        }
    }
}

/// Read access to stored profiles.
pub trait ProfileStore: Send + Sync {
    /// List every stored profile in the order the store returns them.
    fn list_profiles(&self) -> BoxFuture<'_, Result<Vec<Profile>, StoreError>>;
}

/// Opens a [`ProfileStore`] from configuration.
pub trait StoreConnector: Send + Sync {
    /// Connect using `settings`.
    fn connect<'a>(
        &'a self,
        settings: &'a DbSettings,
    ) -> BoxFuture<'a, Result<Arc<dyn ProfileStore>, StoreError>>;
}

/// Default time allowed for establishing the first connection.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
/// Pool size. Only the console issues queries.
const MAX_POOL_CONNECTIONS: u32 = 4;
const PROFILE_QUERY: &str = "SELECT id, name, age FROM profiles";

/// Connects to a `MySQL` server.
#[derive(Debug, Clone)]
pub struct MySqlConnector {
    connect_timeout: Duration,
}

impl Default for MySqlConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

impl MySqlConnector {
    /// Override the connection timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl StoreConnector for MySqlConnector {
    fn connect<'a>(
        &'a self,
        settings: &'a DbSettings,
    ) -> BoxFuture<'a, Result<Arc<dyn ProfileStore>, StoreError>> {
        async move {
            let options = MySqlConnectOptions::new()
                .host(&settings.host)
                .port(settings.port)
                .username(&settings.user)
                .password(&settings.password)
                .database(&settings.database);
            let pool = MySqlPoolOptions::new()
                .max_connections(MAX_POOL_CONNECTIONS)
                .acquire_timeout(self.connect_timeout)
                .connect_with(options)
                .await
                .map_err(|e| StoreError::connect(settings, e))?;
            tracing::info!(
                host = %settings.host,
                port = settings.port,
                database = %settings.database,
                "Connected to the data store",
            );
            Ok(Arc::new(MySqlProfileStore { pool }) as Arc<dyn ProfileStore>)
        }
        .boxed()
    }
}

/// [`ProfileStore`] over a `MySQL` connection pool.
#[derive(Debug, Clone)]
pub struct MySqlProfileStore {
    pool: MySqlPool,
}

impl ProfileStore for MySqlProfileStore {
    fn list_profiles(&self) -> BoxFuture<'_, Result<Vec<Profile>, StoreError>> {
        async move {
            let rows: Vec<(i64, String, i32)> = sqlx::query_as(PROFILE_QUERY)
                .fetch_all(&self.pool)
                .await
                .map_err(StoreError::query)?;
            Ok(rows
                .into_iter()
                .map(|(id, name, age)| Profile { id, name, age })
                .collect())
        }
        .boxed()
    }
}
