//! Test support utilities for the sw3d workspace.
//!
//! Shared by the daemon's integration tests and the behavioural tests at the
//! workspace root.

pub mod env_guard;
pub mod logging;
pub mod server;
pub mod util;

pub use logging::LogCapture;
pub use server::{
    FailingConnector, FailingHandler, GatedHandler, MemoryConnector, PanickingHandler,
    StalledConnector, TestConfig, temp_config,
};

/// Wait until `check` holds, polling every [`util::POLL_INTERVAL`].
///
/// Re-exported from [`util`] for convenience in tests.
pub use util::eventually;
