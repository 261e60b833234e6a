//! Affiliation store abstraction.
//!
//! The [`AffiliationStore`] trait covers the two things the engine needs
//! from the identity database: a single-round-trip identity lookup and a
//! transactional, insert-ignore upload of new identities. The SQLite
//! backend lives in the `enrich-harness` crate; [`memory`] provides an
//! in-memory backend for tests.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{IdentityRow, NewIdentity, ProfileRow};

/// An identity row joined with its profile, if the profile exists.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredIdentity {
    pub identity: IdentityRow,
    pub profile: Option<ProfileRow>,
}

/// Rows affected by one identity upload pack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub uidentities: u64,
    pub identities: u64,
    pub profiles: u64,
    /// False when the transaction was rolled back (dry-run).
    pub committed: bool,
}

/// Backend for identity persistence and lookup.
///
/// Uploads are idempotent: every insert ignores rows whose primary key
/// already exists, so replaying a pack leaves all tables unchanged.
#[async_trait]
pub trait AffiliationStore: Send + Sync {
    /// Look up an identity by id together with its profile in one query.
    async fn lookup_identity(&self, id: &str) -> Result<Option<StoredIdentity>>;

    /// Insert a pack of identities in one transaction.
    ///
    /// With `dry_run` the statements execute and the transaction is then
    /// rolled back.
    async fn upload_identities(&self, pack: &[NewIdentity], dry_run: bool)
        -> Result<UploadReport>;
}

/// Organization enrollments for a unique identity at a point in time.
#[async_trait]
pub trait EnrollmentLookup: Send + Sync {
    async fn organizations(&self, uuid: &str, at: DateTime<Utc>) -> Result<Vec<String>>;
}

/// Enrollment source that knows no organizations.
pub struct NoEnrollments;

#[async_trait]
impl EnrollmentLookup for NoEnrollments {
    async fn organizations(&self, _uuid: &str, _at: DateTime<Utc>) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}
