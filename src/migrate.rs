use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::AffiliationsConfig;
use crate::db;

pub async fn run_migrations(config: &AffiliationsConfig) -> Result<()> {
    let pool = db::connect(config).await?;
    create_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the affiliation tables if they do not exist yet.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    // Unique identities
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS uidentities (
            uuid TEXT PRIMARY KEY,
            last_modified TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Per-source identities
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS identities (
            id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            name TEXT,
            email TEXT,
            username TEXT,
            uuid TEXT NOT NULL,
            last_modified TEXT NOT NULL,
            FOREIGN KEY (uuid) REFERENCES uidentities(uuid)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Profiles; gender and bot flags are curated outside this tool
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS profiles (
            uuid TEXT PRIMARY KEY,
            name TEXT,
            email TEXT,
            gender TEXT,
            gender_acc INTEGER,
            is_bot INTEGER,
            FOREIGN KEY (uuid) REFERENCES uidentities(uuid)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_identities_uuid ON identities(uuid)")
        .execute(pool)
        .await?;

    Ok(())
}
