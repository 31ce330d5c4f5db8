//! Logging setup for the server.
//!
//! Events go through `tracing`; the filter comes from `RUST_LOG` and defaults
//! to `info` when the variable is unset or invalid.

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, fmt};

/// Filter used when `RUST_LOG` is absent.
const DEFAULT_FILTER: &str = "info";

/// Install the global subscriber, writing to standard output.
///
/// Call once, before the supervisor starts.
///
/// # Examples
///
/// ```rust,no_run
/// sw3d::logging::init();
/// tracing::info!("Logging is initialized!");
/// ```
pub fn init() {
    init_with_writer(fmt::writer::BoxMakeWriter::new(std::io::stdout));
}

/// Install the global subscriber with a custom writer.
///
/// Does nothing if a global subscriber is already set.
pub fn init_with_writer<W>(writer: W)
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(writer)
        .try_init();
}
