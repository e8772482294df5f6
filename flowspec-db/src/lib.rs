//! SQLite persistence for the FlowSpec workflow engine.
//!
//! Implements every repository trait from `flowspec_core::repository` against
//! a single `SqliteStore`, backed by `sqlx` with WAL mode for file-backed
//! databases and in-memory mode for tests.
//!
//! # Usage
//!
//! ```rust
//! use flowspec_db::SqliteStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = SqliteStore::new(":memory:").await?;
//!     store.migrate().await?;
//!     Ok(())
//! }
//! ```

mod common;
mod sqlite;

pub use sqlite::SqliteStore;

pub use flowspec_core::{
    error::{FlowError, Result},
    models::*,
    repository::*,
};
