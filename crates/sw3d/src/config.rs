//! Configuration loading for the sw3d daemon.
//!
//! The configuration is a flat TOML file of `key = value` assignments,
//! `./config.toml` by default. Values may be overridden by environment
//! variables using the `SW3D_` prefix, and the server mode and port by
//! command-line flags. When no file exists a default one is written and the
//! lifecycle moves to [`LifecycleSignal::NeedsReconfig`] so the operator can
//! review it before the next start.

use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::lifecycle::{Lifecycle, LifecycleSignal};

/// Default location of the daemon configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "./config.toml";
/// Prefix of environment variables overriding file values.
pub const ENV_PREFIX: &str = "SW3D_";

/// Configuration key identifiers.
pub mod keys {
    /// Data-store host name.
    pub const DB_HOST: &str = "dbhost";
    /// Data-store TCP port.
    pub const DB_PORT: &str = "dbport";
    /// Data-store user name.
    pub const DB_USER: &str = "dbuser";
    /// Data-store password.
    pub const DB_PASS: &str = "dbpass";
    /// Data-store database name.
    pub const DB_NAME: &str = "db";
    /// `active` or `daemon`.
    pub const SERVER_MODE: &str = "servermode";
    /// TCP port the listener binds.
    pub const SERVER_PORT: &str = "serverport";
    /// Accept poll timeout in milliseconds.
    pub const POLL_TIMEOUT_MS: &str = "polltimeoutms";
    /// Grace period for outstanding connections at shutdown, in milliseconds.
    pub const SHUTDOWN_GRACE_MS: &str = "shutdowngracems";
}

/// Keys that must resolve before dependent collaborators initialise.
pub const REQUIRED_KEYS: [&str; 7] = [
    keys::DB_HOST,
    keys::DB_PORT,
    keys::DB_USER,
    keys::DB_PASS,
    keys::DB_NAME,
    keys::SERVER_MODE,
    keys::SERVER_PORT,
];

const DEFAULT_DB_HOST: &str = "localhost";
const DEFAULT_DB_USER: &str = "giraf_web";
const DEFAULT_DB_PASS: &str = "cookie";
const DEFAULT_DB_NAME: &str = "girafplace";
const DEFAULT_SERVER_MODE: &str = "active";
/// Default accept poll timeout in milliseconds.
const DEFAULT_POLL_TIMEOUT_MS: u64 = 500;
/// Upper bound on the accept poll timeout so closing stays prompt.
const MAX_POLL_TIMEOUT_MS: u64 = 1000;
/// Default grace period for outstanding connections at shutdown.
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5000;

const DEFAULTS_HEADER: &str = "# sw3d configuration, generated with default values.\n\
# Review every entry before starting the server again.\n\n";

/// Errors raised while loading or interpreting configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required key has no value.
    #[error("configuration key `{0}` is missing")]
    MissingKey(String),
    /// A key resolved to a value of the wrong shape.
    #[error("configuration key `{key}` has invalid value `{value}`: {reason}")]
    InvalidValue {
        /// Offending key.
        key: String,
        /// Raw value as found in the store.
        value: String,
        /// Why the value was rejected.
        reason: String,
    },
    /// The configuration file could not be parsed.
    #[error("failed to parse configuration at {path}: {source}")]
    Parse {
        /// File being read.
        path: PathBuf,
        /// Underlying figment error.
        #[source]
        source: Box<figment::Error>,
    },
    /// The default configuration could not be rendered.
    #[error("failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),
    /// The default configuration could not be written.
    #[error("failed to write configuration to {path}: {source}")]
    Write {
        /// Destination path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Any scalar a TOML file or environment variable may hold.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
}

impl std::fmt::Display for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Boolean(b) => write!(f, "{b}"),
        }
    }
}

/// Flat key/value configuration mapping.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigStore {
    values: BTreeMap<String, String>,
}

impl ConfigStore {
    /// Built-in defaults used when no configuration file exists.
    #[must_use]
    pub fn defaults() -> Self {
        let values = [
            (keys::DB_PORT, sw3_lib::DEFAULT_DB_PORT.to_string()),
            (keys::SERVER_MODE, DEFAULT_SERVER_MODE.to_owned()),
            (keys::DB_HOST, DEFAULT_DB_HOST.to_owned()),
            (keys::DB_USER, DEFAULT_DB_USER.to_owned()),
            (keys::DB_PASS, DEFAULT_DB_PASS.to_owned()),
            (keys::DB_NAME, DEFAULT_DB_NAME.to_owned()),
            (keys::SERVER_PORT, sw3_lib::DEFAULT_SERVER_PORT.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect();
        Self { values }
    }

    /// Load the configuration at `path`, bootstrapping defaults on first run.
    ///
    /// A missing file is replaced by the built-in defaults, which are written
    /// to `path`. Failing to write them is logged and otherwise ignored. In
    /// both cases `lifecycle` moves to [`LifecycleSignal::NeedsReconfig`] so
    /// the server exits instead of serving on defaults.
    ///
    /// # Errors
    /// Returns [`ConfigError::Parse`] if an existing file is malformed.
    pub fn load(path: &Path, lifecycle: &Lifecycle) -> Result<Self, ConfigError> {
        if path.exists() {
            tracing::debug!(path = %path.display(), "Config file already exists");
            return Self::from_file(path);
        }

        tracing::info!(path = %path.display(), "Creating new config file");
        let store = Self::defaults();
        match store.write(path) {
            Ok(()) => tracing::info!(path = %path.display(), "A new config file was written"),
            Err(e) => tracing::error!(error = %e, "Failed to save the default config file"),
        }
        lifecycle.set(LifecycleSignal::NeedsReconfig);
        Ok(store)
    }

    /// Read `path`, merging `SW3D_*` environment variables over file values.
    ///
    /// # Errors
    /// Returns [`ConfigError::Parse`] if the file is not a flat TOML table of
    /// scalars.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw: BTreeMap<String, Scalar> = Figment::new()
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                source: Box::new(e),
            })?;
        let mut values: BTreeMap<String, String> = raw
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
            .collect();
        // Env values stay verbatim so `007` is not read back as `7`.
        for (key, value) in Env::prefixed(ENV_PREFIX).iter() {
            values.insert(key.as_str().to_ascii_lowercase(), value);
        }
        Ok(Self { values })
    }

    /// Write the store to `path` as TOML.
    ///
    /// # Errors
    /// Returns an error if rendering or writing the file fails.
    pub fn write(&self, path: &Path) -> Result<(), ConfigError> {
        let body = toml::to_string(&self.values)?;
        std::fs::write(path, format!("{DEFAULTS_HEADER}{body}")).map_err(|source| {
            ConfigError::Write {
                path: path.to_path_buf(),
                source,
            }
        })
    }

    /// Look up `key`.
    ///
    /// # Errors
    /// Returns [`ConfigError::MissingKey`] when no value is present.
    pub fn get(&self, key: &str) -> Result<&str, ConfigError> {
        self.values
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| ConfigError::MissingKey(key.to_owned()))
    }

    /// Return a copy with `key` set to `value`.
    #[must_use]
    pub fn with_value(mut self, key: &str, value: impl Into<String>) -> Self {
        self.values.insert(key.to_owned(), value.into());
        self
    }

    /// Keys present in the store, in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Required keys with no value.
    #[must_use]
    pub fn missing_required(&self) -> Vec<&'static str> {
        REQUIRED_KEYS
            .into_iter()
            .filter(|k| !self.values.contains_key(*k))
            .collect()
    }
}

/// Whether the operator console is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    /// Interactive: operator commands are read from standard input.
    Active,
    /// Unattended: no console.
    Daemon,
}

/// Returned when a server mode string is neither `active` nor `daemon`.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown server mode `{0}`, expected `active` or `daemon`")]
pub struct UnknownMode(pub String);

impl FromStr for ServerMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("active") {
            Ok(Self::Active)
        } else if trimmed.eq_ignore_ascii_case("daemon") {
            Ok(Self::Daemon)
        } else {
            Err(UnknownMode(s.to_owned()))
        }
    }
}

impl std::fmt::Display for ServerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::Daemon => "daemon",
        })
    }
}

/// Connection parameters for the data store.
#[derive(Clone, PartialEq, Eq)]
pub struct DbSettings {
    /// Host name.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// User name.
    pub user: String,
    /// Password.
    pub password: String,
    /// Database name.
    pub database: String,
}

impl std::fmt::Debug for DbSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

/// Typed view of a [`ConfigStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Data-store connection parameters.
    pub db: DbSettings,
    /// Console availability.
    pub mode: ServerMode,
    /// Port the listener binds.
    pub server_port: u16,
    /// Upper bound on a single accept wait.
    pub poll_timeout: Duration,
    /// How long shutdown waits for outstanding connections.
    pub shutdown_grace: Duration,
}

impl Settings {
    /// Interpret `store`.
    ///
    /// # Errors
    /// Fails if a required key is missing, a port is not a valid `u16`, the
    /// mode is unknown, or an optional duration is not an integer.
    pub fn from_store(store: &ConfigStore) -> Result<Self, ConfigError> {
        if let Some(key) = store.missing_required().first() {
            return Err(ConfigError::MissingKey((*key).to_owned()));
        }
        let db = DbSettings {
            host: store.get(keys::DB_HOST)?.to_owned(),
            port: parse_value(store, keys::DB_PORT)?,
            user: store.get(keys::DB_USER)?.to_owned(),
            password: store.get(keys::DB_PASS)?.to_owned(),
            database: store.get(keys::DB_NAME)?.to_owned(),
        };
        let mode = parse_value(store, keys::SERVER_MODE)?;
        let server_port = parse_value(store, keys::SERVER_PORT)?;
        let poll_ms = optional_value(store, keys::POLL_TIMEOUT_MS, DEFAULT_POLL_TIMEOUT_MS)?
            .clamp(1, MAX_POLL_TIMEOUT_MS);
        let grace_ms = optional_value(store, keys::SHUTDOWN_GRACE_MS, DEFAULT_SHUTDOWN_GRACE_MS)?;
        Ok(Self {
            db,
            mode,
            server_port,
            poll_timeout: Duration::from_millis(poll_ms),
            shutdown_grace: Duration::from_millis(grace_ms),
        })
    }
}

fn parse_value<T>(store: &ConfigStore, key: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = store.get(key)?;
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_owned(),
        value: raw.to_owned(),
        reason: e.to_string(),
    })
}

fn optional_value(store: &ConfigStore, key: &str, default: u64) -> Result<u64, ConfigError> {
    match store.get(key) {
        Ok(_) => parse_value(store, key),
        Err(ConfigError::MissingKey(_)) => Ok(default),
        Err(e) => Err(e),
    }
}

/// Command-line arguments for the daemon.
#[derive(Debug, Default, Clone, Parser)]
#[command(name = "sw3d", about = "Profile server daemon")]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
    /// Override the server mode (`active` or `daemon`).
    #[arg(long)]
    pub mode: Option<ServerMode>,
    /// Override the listening port.
    #[arg(long)]
    pub port: Option<u16>,
}

impl CliArgs {
    /// Arguments pointing at `path` with no overrides.
    #[must_use]
    pub fn for_config(path: impl Into<PathBuf>) -> Self {
        Self {
            config: path.into(),
            ..Self::default()
        }
    }

    /// Apply command-line overrides on top of `store`.
    #[must_use]
    pub fn apply(&self, mut store: ConfigStore) -> ConfigStore {
        if let Some(mode) = self.mode {
            store = store.with_value(keys::SERVER_MODE, mode.to_string());
        }
        if let Some(port) = self.port {
            store = store.with_value(keys::SERVER_PORT, port.to_string());
        }
        store
    }
}
