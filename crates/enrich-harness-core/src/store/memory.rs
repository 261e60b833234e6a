//! In-memory [`AffiliationStore`] for tests.
//!
//! Uses `HashMap`s behind `std::sync::RwLock`. Counts lookups so callers
//! can assert how many round trips a resolver issued.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{IdentityRow, NewIdentity, ProfileRow};

use super::{AffiliationStore, StoredIdentity, UploadReport};

pub struct InMemoryAffiliationStore {
    uidentities: RwLock<HashMap<String, DateTime<Utc>>>,
    identities: RwLock<HashMap<String, IdentityRow>>,
    profiles: RwLock<HashMap<String, ProfileRow>>,
    lookups: AtomicUsize,
}

impl InMemoryAffiliationStore {
    pub fn new() -> Self {
        Self {
            uidentities: RwLock::new(HashMap::new()),
            identities: RwLock::new(HashMap::new()),
            profiles: RwLock::new(HashMap::new()),
            lookups: AtomicUsize::new(0),
        }
    }

    /// Number of `lookup_identity` calls served so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Row counts as `(uidentities, identities, profiles)`.
    pub fn counts(&self) -> (usize, usize, usize) {
        (
            read(&self.uidentities).len(),
            read(&self.identities).len(),
            read(&self.profiles).len(),
        )
    }

    pub fn profile(&self, uuid: &str) -> Option<ProfileRow> {
        read(&self.profiles).get(uuid).cloned()
    }
}

impl Default for InMemoryAffiliationStore {
    fn default() -> Self {
        Self::new()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl AffiliationStore for InMemoryAffiliationStore {
    async fn lookup_identity(&self, id: &str) -> Result<Option<StoredIdentity>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let identity = match read(&self.identities).get(id) {
            Some(row) => row.clone(),
            None => return Ok(None),
        };
        let profile = read(&self.profiles).get(&identity.uuid).cloned();
        Ok(Some(StoredIdentity { identity, profile }))
    }

    async fn upload_identities(
        &self,
        pack: &[NewIdentity],
        dry_run: bool,
    ) -> Result<UploadReport> {
        let mut uidentities = write(&self.uidentities);
        let mut identities = write(&self.identities);
        let mut profiles = write(&self.profiles);

        // Stage against copies so a dry run leaves nothing behind.
        let mut staged_u = uidentities.clone();
        let mut staged_i = identities.clone();
        let mut staged_p = profiles.clone();
        let mut report = UploadReport::default();

        for new in pack {
            let uuid = &new.identity.uuid;
            if !staged_u.contains_key(uuid) {
                staged_u.insert(uuid.clone(), new.identity.last_modified);
                report.uidentities += 1;
            }
            if !staged_i.contains_key(&new.identity.id) {
                staged_i.insert(new.identity.id.clone(), new.identity.clone());
                report.identities += 1;
            }
            if !staged_p.contains_key(&new.profile.uuid) {
                staged_p.insert(new.profile.uuid.clone(), new.profile.clone());
                report.profiles += 1;
            }
        }

        if !dry_run {
            *uidentities = staged_u;
            *identities = staged_i;
            *profiles = staged_p;
            report.committed = true;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_identity(id: &str) -> NewIdentity {
        let now = Utc::now();
        NewIdentity {
            identity: IdentityRow {
                id: id.to_string(),
                source: "git".to_string(),
                name: Some("John Doe".to_string()),
                email: None,
                username: Some("jdoe".to_string()),
                uuid: id.to_string(),
                last_modified: now,
            },
            profile: ProfileRow {
                uuid: id.to_string(),
                name: Some("John Doe".to_string()),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn upload_is_idempotent() {
        let store = InMemoryAffiliationStore::new();
        let pack = vec![new_identity("a"), new_identity("b")];
        let first = store.upload_identities(&pack, false).await.unwrap();
        assert_eq!(first.identities, 2);
        let second = store.upload_identities(&pack, false).await.unwrap();
        assert_eq!(second.identities, 0);
        assert_eq!(store.counts(), (2, 2, 2));
    }

    #[tokio::test]
    async fn dry_run_rolls_back() {
        let store = InMemoryAffiliationStore::new();
        let report = store
            .upload_identities(&[new_identity("a")], true)
            .await
            .unwrap();
        assert_eq!(report.identities, 1);
        assert!(!report.committed);
        assert_eq!(store.counts(), (0, 0, 0));
    }

    #[tokio::test]
    async fn lookup_joins_profile_and_counts() {
        let store = InMemoryAffiliationStore::new();
        store
            .upload_identities(&[new_identity("a")], false)
            .await
            .unwrap();
        let hit = store.lookup_identity("a").await.unwrap().unwrap();
        assert_eq!(hit.profile.unwrap().name.as_deref(), Some("John Doe"));
        assert!(store.lookup_identity("zzz").await.unwrap().is_none());
        assert_eq!(store.lookups(), 2);
    }
}
