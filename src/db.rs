//! Affiliation database connection.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::debug;

use crate::config::AffiliationsConfig;

/// Identity packs are written from several workers at once.
const MAX_CONNECTIONS: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Open (creating if needed) the SQLite file holding the affiliation tables.
pub async fn connect(config: &AffiliationsConfig) -> Result<SqlitePool> {
    let db_path = &config.db_path;

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("cannot create affiliation db directory {}", parent.display())
            })?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await
        .context("cannot open affiliation database")?;

    debug!(max_connections = MAX_CONNECTIONS, "affiliation database connected");
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn creates_missing_parent_directories() {
        let tmp = TempDir::new().unwrap();
        let cfg = AffiliationsConfig {
            db_path: tmp.path().join("nested/dir/affs.sqlite"),
            db_bulk_size: 10,
            legacy_uuid: false,
            validate_mx: false,
        };
        let pool = connect(&cfg).await.unwrap();
        let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&pool).await.unwrap();
        assert_eq!(one, 1);
        pool.close().await;
        assert!(cfg.db_path.exists());
    }
}
