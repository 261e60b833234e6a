//! Identity affiliation resolver.
//!
//! Maps an [`IdentityTuple`] seen in a rich item to the enrichment fields
//! of the person behind it. Each distinct `(email, name, username)` costs
//! at most one store round trip per resolver: hits and misses are both
//! cached for the resolver's lifetime. Concurrent first lookups of the
//! same key may both reach the store; the last one to finish fills the
//! cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::debug;

use enrich_harness_core::hash::IdentityHasher;
use enrich_harness_core::models::{
    email_domain, Affiliation, CanonicalPerson, IdentityTuple, UNKNOWN,
};
use enrich_harness_core::store::{AffiliationStore, EnrollmentLookup, StoredIdentity};

type CacheKey = (Option<String>, Option<String>, Option<String>);

pub struct AffiliationResolver {
    source: String,
    hasher: Arc<IdentityHasher>,
    store: Arc<dyn AffiliationStore>,
    enrollments: Arc<dyn EnrollmentLookup>,
    cache: Mutex<HashMap<CacheKey, Option<StoredIdentity>>>,
}

impl AffiliationResolver {
    pub fn new(
        source: &str,
        hasher: Arc<IdentityHasher>,
        store: Arc<dyn AffiliationStore>,
        enrollments: Arc<dyn EnrollmentLookup>,
    ) -> Self {
        Self {
            source: source.to_string(),
            hasher,
            store,
            enrollments,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Number of cached keys, positive and negative.
    pub fn cached(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn lookup(&self, tuple: &IdentityTuple) -> Result<Option<StoredIdentity>> {
        let key = (
            tuple.email.clone(),
            tuple.name.clone(),
            tuple.username.clone(),
        );
        let cached = self
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned();
        if let Some(hit) = cached {
            return Ok(hit);
        }

        let id = self.hasher.identity_id(
            &self.source,
            tuple.email.as_deref(),
            tuple.name.as_deref(),
            tuple.username.as_deref(),
        )?;
        let found = self
            .store
            .lookup_identity(&id)
            .await
            .with_context(|| format!("looking up identity {}", id))?;
        if found.is_none() {
            debug!(id = %id, "identity not in store");
        }
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, found.clone());
        Ok(found)
    }

    /// Resolve `tuple` acting as `role` on an item dated `at`.
    pub async fn resolve(
        &self,
        tuple: &IdentityTuple,
        role: &str,
        at: DateTime<Utc>,
    ) -> Result<Affiliation> {
        let stored = match self.lookup(tuple).await? {
            Some(stored) => stored,
            None => {
                debug!(role, "unresolved identity");
                return Ok(Affiliation::Unresolved);
            }
        };
        let StoredIdentity { identity, profile } = stored;
        let profile = profile.unwrap_or_default();

        let name = profile
            .name
            .clone()
            .or_else(|| identity.name.clone())
            .unwrap_or_default();
        let domain = identity
            .email
            .as_deref()
            .map(email_domain)
            .unwrap_or_default();

        let orgs = self
            .enrollments
            .organizations(&identity.uuid, at)
            .await
            .with_context(|| format!("enrollments of {}", identity.uuid))?;
        let (org_name, multi_org_names) = match orgs.first() {
            Some(first) => (first.clone(), orgs.clone()),
            None => (UNKNOWN.to_string(), vec![UNKNOWN.to_string()]),
        };

        Ok(Affiliation::Resolved(CanonicalPerson {
            id: identity.id,
            uuid: identity.uuid,
            name,
            username: identity.username.unwrap_or_default(),
            domain,
            gender: profile.gender.unwrap_or_else(|| UNKNOWN.to_string()),
            gender_acc: profile.gender_acc.unwrap_or(0),
            is_bot: profile.is_bot.unwrap_or(false),
            org_name,
            multi_org_names,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Datelike, TimeZone};
    use enrich_harness_core::models::{IdentityRow, NewIdentity, ProfileRow};
    use enrich_harness_core::store::memory::InMemoryAffiliationStore;
    use enrich_harness_core::store::NoEnrollments;

    struct FixedOrgs;

    #[async_trait]
    impl EnrollmentLookup for FixedOrgs {
        async fn organizations(&self, _uuid: &str, at: DateTime<Utc>) -> Result<Vec<String>> {
            if at.year() >= 2020 {
                Ok(vec!["Acme".into(), "Initech".into()])
            } else {
                Ok(vec![])
            }
        }
    }

    fn hasher() -> Arc<IdentityHasher> {
        Arc::new(IdentityHasher::for_mode(false))
    }

    async fn seeded(tuple: &IdentityTuple, profile: ProfileRow) -> (Arc<InMemoryAffiliationStore>, String) {
        let store = Arc::new(InMemoryAffiliationStore::new());
        let id = hasher()
            .identity_id(
                "git",
                tuple.email.as_deref(),
                tuple.name.as_deref(),
                tuple.username.as_deref(),
            )
            .unwrap();
        store
            .upload_identities(
                &[NewIdentity {
                    identity: IdentityRow {
                        id: id.clone(),
                        source: "git".into(),
                        name: tuple.name.clone(),
                        email: tuple.email.clone(),
                        username: tuple.username.clone(),
                        uuid: id.clone(),
                        last_modified: Utc::now(),
                    },
                    profile: ProfileRow {
                        uuid: id.clone(),
                        ..profile
                    },
                }],
                false,
            )
            .await
            .unwrap();
        (store, id)
    }

    fn when() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 3, 1, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn one_lookup_per_identity_hit_or_miss() {
        let known = IdentityTuple::new(Some("John Doe"), Some("jdoe"), Some("a@b.com"));
        let (store, _) = seeded(&known, ProfileRow::default()).await;
        let resolver = AffiliationResolver::new("git", hasher(), store.clone(), Arc::new(NoEnrollments));

        resolver.resolve(&known, "author", when()).await.unwrap();
        resolver.resolve(&known, "committer", when()).await.unwrap();
        assert_eq!(store.lookups(), 1);

        let stranger = IdentityTuple::new(None, Some("ghost"), None);
        assert_eq!(
            resolver.resolve(&stranger, "author", when()).await.unwrap(),
            Affiliation::Unresolved
        );
        assert_eq!(
            resolver.resolve(&stranger, "author", when()).await.unwrap(),
            Affiliation::Unresolved
        );
        assert_eq!(store.lookups(), 2);
        assert_eq!(resolver.cached(), 2);
    }

    #[tokio::test]
    async fn profile_overrides_and_defaults() {
        let tuple = IdentityTuple::new(Some("jd"), Some("jdoe"), Some("john@corp.com"));
        let (store, id) = seeded(
            &tuple,
            ProfileRow {
                name: Some("John Doe".into()),
                gender: Some("male".into()),
                ..Default::default()
            },
        )
        .await;
        let resolver = AffiliationResolver::new("git", hasher(), store, Arc::new(NoEnrollments));

        match resolver.resolve(&tuple, "author", when()).await.unwrap() {
            Affiliation::Resolved(p) => {
                assert_eq!(p.id, id);
                assert_eq!(p.name, "John Doe");
                assert_eq!(p.username, "jdoe");
                assert_eq!(p.domain, "corp.com");
                assert_eq!(p.gender, "male");
                assert_eq!(p.gender_acc, 0);
                assert!(!p.is_bot);
                assert_eq!(p.org_name, UNKNOWN);
                assert_eq!(p.multi_org_names, vec![UNKNOWN.to_string()]);
            }
            Affiliation::Unresolved => panic!("expected a resolved identity"),
        }
    }

    #[tokio::test]
    async fn enrollment_date_is_plumbed_through() {
        let tuple = IdentityTuple::new(Some("Ann"), None, None);
        let (store, _) = seeded(&tuple, ProfileRow::default()).await;
        let resolver = AffiliationResolver::new("git", hasher(), store, Arc::new(FixedOrgs));

        let Affiliation::Resolved(p) = resolver.resolve(&tuple, "author", when()).await.unwrap() else {
            panic!("expected a resolved identity");
        };
        assert_eq!(p.org_name, "Acme");
        assert_eq!(p.multi_org_names, vec!["Acme".to_string(), "Initech".to_string()]);
        assert_eq!(p.gender, UNKNOWN);
        assert_eq!(p.domain, "");
    }
}
