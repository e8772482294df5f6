//! flowspec CLI library: configuration, store setup, and the command
//! handlers the binary dispatches to.

pub mod commands;
pub mod config;
pub mod setup;
pub mod telemetry;

pub use config::Config;
pub use setup::{create_store, ensure_database_directory};
pub use telemetry::init_telemetry;
