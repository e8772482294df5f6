use anyhow::{Context, Result};
use flowspec_db::SqliteStore;
use tracing::info;

use crate::config::Config;

/// Create a store from the complete configuration and run migrations.
pub async fn create_store(config: &Config) -> Result<SqliteStore> {
    let database_url = config.database_url();
    info!("Using database URL: {}", database_url);

    ensure_database_directory(&database_url)?;

    let store = SqliteStore::new(&database_url)
        .await
        .context("Failed to create SQLite store")?;

    info!("Running database migrations");
    store
        .migrate()
        .await
        .context("Failed to run database migrations")?;

    Ok(store)
}

/// Ensure the database directory exists
pub fn ensure_database_directory(database_url: &str) -> Result<()> {
    if let Some(db_path) = database_url.strip_prefix("sqlite://") {
        if db_path == ":memory:" || db_path.is_empty() {
            return Ok(());
        }
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                info!("Creating database directory: {}", parent.display());
                std::fs::create_dir_all(parent)
                    .context("Failed to create database directory")?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_database_directory_accepts_memory_url() {
        ensure_database_directory("sqlite://:memory:").unwrap();
    }

    #[test]
    fn ensure_database_directory_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("flowspec.sqlite");
        let url = format!("sqlite://{}", db_path.display());
        ensure_database_directory(&url).unwrap();
        assert!(db_path.parent().unwrap().exists());
    }
}
