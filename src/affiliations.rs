//! SQLite-backed [`AffiliationStore`].
//!
//! Identities are written with `INSERT OR IGNORE` inside one transaction
//! per pack, so replaying a pack is a no-op. Lookups join `identities`
//! with `profiles` in a single query.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use enrich_harness_core::models::{IdentityRow, NewIdentity, ProfileRow};
use enrich_harness_core::store::{AffiliationStore, StoredIdentity, UploadReport};

use crate::config::AffiliationsConfig;
use crate::{db, migrate};

pub struct SqliteAffiliationStore {
    pool: SqlitePool,
}

impl SqliteAffiliationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect and make sure the schema exists.
    pub async fn open(config: &AffiliationsConfig) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::create_schema(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("bad last_modified '{}'", raw))?
        .with_timezone(&Utc))
}

fn stored_from_row(row: &SqliteRow) -> Result<StoredIdentity> {
    let last_modified: String = row.try_get("last_modified")?;
    let identity = IdentityRow {
        id: row.try_get("id")?,
        source: row.try_get("source")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        username: row.try_get("username")?,
        uuid: row.try_get("uuid")?,
        last_modified: parse_ts(&last_modified)?,
    };
    let profile_uuid: Option<String> = row.try_get("profile_uuid")?;
    let profile = match profile_uuid {
        Some(uuid) => Some(ProfileRow {
            uuid,
            name: row.try_get("profile_name")?,
            email: row.try_get("profile_email")?,
            gender: row.try_get("gender")?,
            gender_acc: row.try_get("gender_acc")?,
            is_bot: row.try_get("is_bot")?,
        }),
        None => None,
    };
    Ok(StoredIdentity { identity, profile })
}

#[async_trait]
impl AffiliationStore for SqliteAffiliationStore {
    async fn lookup_identity(&self, id: &str) -> Result<Option<StoredIdentity>> {
        let row = sqlx::query(
            r#"
            SELECT i.id, i.source, i.name, i.email, i.username, i.uuid, i.last_modified,
                   p.uuid AS profile_uuid, p.name AS profile_name, p.email AS profile_email,
                   p.gender, p.gender_acc, p.is_bot
            FROM identities i
            LEFT JOIN profiles p ON p.uuid = i.uuid
            WHERE i.id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(stored_from_row).transpose()
    }

    async fn upload_identities(
        &self,
        pack: &[NewIdentity],
        dry_run: bool,
    ) -> Result<UploadReport> {
        let mut report = UploadReport::default();
        let mut tx = self.pool.begin().await?;

        for new in pack {
            let ts = new.identity.last_modified.to_rfc3339();

            let res = sqlx::query(
                "INSERT OR IGNORE INTO uidentities (uuid, last_modified) VALUES (?, ?)",
            )
            .bind(&new.identity.uuid)
            .bind(&ts)
            .execute(&mut *tx)
            .await?;
            report.uidentities += res.rows_affected();

            let res = sqlx::query(
                r#"
                INSERT OR IGNORE INTO identities (id, source, name, email, username, uuid, last_modified)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&new.identity.id)
            .bind(&new.identity.source)
            .bind(&new.identity.name)
            .bind(&new.identity.email)
            .bind(&new.identity.username)
            .bind(&new.identity.uuid)
            .bind(&ts)
            .execute(&mut *tx)
            .await?;
            report.identities += res.rows_affected();

            let res = sqlx::query(
                "INSERT OR IGNORE INTO profiles (uuid, name, email) VALUES (?, ?, ?)",
            )
            .bind(&new.profile.uuid)
            .bind(&new.profile.name)
            .bind(&new.profile.email)
            .execute(&mut *tx)
            .await?;
            report.profiles += res.rows_affected();
        }

        if dry_run {
            tx.rollback().await?;
        } else {
            tx.commit().await?;
            report.committed = true;
        }
        Ok(report)
    }
}
