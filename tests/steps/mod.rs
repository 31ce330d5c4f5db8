//! Step definitions for the behavioural tests.

mod server_steps;
mod startup_steps;

pub use server_steps::ServerWorld;
pub use startup_steps::StartupWorld;
