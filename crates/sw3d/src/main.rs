//! Entry point for the sw3d daemon binary.
//!
//! Loads the configuration, serves client connections, and exits once the
//! operator quits or a termination signal arrives.

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use sw3d::config::CliArgs;
use sw3d::protocol::DrainHandler;
use sw3d::store::MySqlConnector;
use sw3d::supervisor::{Collaborators, Supervisor};

/// Time allowed for stray tasks (such as a blocked stdin read) after `run`.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

fn main() -> ExitCode {
    let args = CliArgs::parse();
    sw3d::logging::init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start the async runtime");
            return ExitCode::FAILURE;
        }
    };

    let outcome = runtime.block_on(async {
        let collaborators =
            Collaborators::new(Arc::new(MySqlConnector::default()), Arc::new(DrainHandler));
        Supervisor::start(&args, collaborators).await.run().await
    });
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    tracing::info!(?outcome, "sw3d exited");
    outcome.exit_code()
}
