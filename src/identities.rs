//! Identity extraction, global dedup and upload.
//!
//! [`IdentityCollector`] is a [`PageHandler`] over raw items. The items of
//! a page are fanned out through a [`Dispatcher`]; each task asks the
//! connector for the item's identity tuples, keeps the ones this run has
//! not seen yet, and feeds them to a [`BulkSink`] whose writer is an
//! [`IdentityUploader`]. Each flushed batch becomes one store transaction.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use enrich_harness_core::hash::IdentityHasher;
use enrich_harness_core::models::{IdentityRow, IdentityTuple, Item, NewIdentity, ProfileRow};
use enrich_harness_core::store::{AffiliationStore, UploadReport};

use crate::bulk::{BulkSink, DocumentWriter};
use crate::connector::DataSource;
use crate::dispatch::Dispatcher;
use crate::email::EmailValidator;
use crate::scroll::PageHandler;

/// Turns identity tuples into upload packs for an [`AffiliationStore`].
pub struct IdentityUploader {
    source: String,
    hasher: Arc<IdentityHasher>,
    store: Arc<dyn AffiliationStore>,
    emails: Arc<EmailValidator>,
    dry_run: bool,
    totals: Mutex<UploadReport>,
}

impl IdentityUploader {
    pub fn new(
        source: &str,
        hasher: Arc<IdentityHasher>,
        store: Arc<dyn AffiliationStore>,
        emails: Arc<EmailValidator>,
        dry_run: bool,
    ) -> Self {
        Self {
            source: source.to_string(),
            hasher,
            store,
            emails,
            dry_run,
            totals: Mutex::new(UploadReport::default()),
        }
    }

    /// Rows inserted (or, in dry-run, that would have been) so far.
    pub fn totals(&self) -> UploadReport {
        *self.totals.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Build the rows one tuple produces.
    ///
    /// The id hashes the tuple exactly as extracted. A missing or empty
    /// email is backfilled on the profile only, from the username and
    /// then the name, when that value is itself a deliverable address.
    pub async fn new_identity(&self, tuple: &IdentityTuple) -> Result<NewIdentity> {
        let id = self
            .hasher
            .identity_id(
                &self.source,
                tuple.email.as_deref(),
                tuple.name.as_deref(),
                tuple.username.as_deref(),
            )
            .with_context(|| format!("cannot hash identity {:?}", tuple))?;

        let mut email = tuple.email.clone();
        if email.as_deref().map_or(true, str::is_empty) {
            for candidate in [tuple.username.as_deref(), tuple.name.as_deref()]
                .into_iter()
                .flatten()
            {
                if self.emails.is_valid(candidate).await {
                    email = Some(candidate.to_string());
                    break;
                }
            }
        }

        Ok(NewIdentity {
            identity: IdentityRow {
                id: id.clone(),
                source: self.source.clone(),
                name: tuple.name.clone(),
                email: tuple.email.clone(),
                username: tuple.username.clone(),
                uuid: id.clone(),
                last_modified: Utc::now(),
            },
            profile: ProfileRow {
                uuid: id,
                name: tuple.display_name().map(str::to_string),
                email,
                ..Default::default()
            },
        })
    }
}

#[async_trait]
impl DocumentWriter<IdentityTuple> for IdentityUploader {
    fn target(&self) -> &str {
        "affiliations"
    }

    async fn write_bulk(&self, batch: &[IdentityTuple]) -> Result<()> {
        let mut pack = Vec::with_capacity(batch.len());
        for tuple in batch.iter().filter(|t| !t.is_missing_all()) {
            pack.push(self.new_identity(tuple).await?);
        }
        if pack.is_empty() {
            return Ok(());
        }

        match self.store.upload_identities(&pack, self.dry_run).await {
            Ok(report) => {
                debug!(
                    identities = pack.len(),
                    inserted = report.identities,
                    committed = report.committed,
                    "identity pack uploaded"
                );
                let mut totals = self.totals.lock().unwrap_or_else(|e| e.into_inner());
                totals.uidentities += report.uidentities;
                totals.identities += report.identities;
                totals.profiles += report.profiles;
                totals.committed = report.committed;
                Ok(())
            }
            Err(e) if self.dry_run => {
                warn!(identities = pack.len(), error = %e, "identity pack failed in dry-run");
                Ok(())
            }
            Err(e) => Err(e.context(format!("uploading {} identities", pack.len()))),
        }
    }

    async fn write_one(&self, record: &IdentityTuple) -> Result<()> {
        self.write_bulk(std::slice::from_ref(record)).await
    }

    /// A pack is one transaction; splitting it would defeat the rollback.
    fn fallback(&self) -> bool {
        false
    }
}

/// Scan handler that extracts and deduplicates identities across a run.
pub struct IdentityCollector {
    ds: Arc<dyn DataSource>,
    dispatcher: Dispatcher,
    seen: Mutex<HashSet<IdentityTuple>>,
    sink: BulkSink<IdentityTuple>,
    items: AtomicU64,
}

impl IdentityCollector {
    pub fn new(
        ds: Arc<dyn DataSource>,
        dispatcher: Dispatcher,
        db_bulk_size: usize,
        uploader: Arc<IdentityUploader>,
    ) -> Self {
        Self {
            ds,
            dispatcher,
            seen: Mutex::new(HashSet::new()),
            sink: BulkSink::new(db_bulk_size, uploader),
            items: AtomicU64::new(0),
        }
    }

    /// Distinct tuples seen so far.
    pub fn unique(&self) -> usize {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn items(&self) -> u64 {
        self.items.load(Ordering::SeqCst)
    }

    /// Tuples of `item` not yet seen in this run.
    fn fresh(&self, item: &Item) -> Vec<IdentityTuple> {
        let tuples = self.ds.item_identities(item);
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        tuples
            .into_iter()
            .filter(|t| !t.is_missing_all())
            .filter(|t| seen.insert(t.clone()))
            .collect()
    }

    async fn collect_one(&self, item: Item) -> Result<()> {
        let fresh = self.fresh(&item);
        self.items.fetch_add(1, Ordering::SeqCst);
        self.sink.add_all(fresh).await
    }
}

#[async_trait]
impl PageHandler for IdentityCollector {
    async fn handle_page(&self, docs: Vec<Value>) -> Result<()> {
        let items = docs
            .into_iter()
            .map(|doc| serde_json::from_value::<Item>(doc).context("raw document is not a valid item"))
            .collect::<Result<Vec<_>>>()?;
        self.dispatcher
            .run(items, |item| self.collect_one(item))
            .await?;
        Ok(())
    }

    async fn flush(&self, last: bool) -> Result<()> {
        self.sink.flush(last).await?;
        if last {
            info!(
                source = self.ds.name(),
                items = self.items(),
                unique = self.unique(),
                "identity extraction finished"
            );
        }
        Ok(())
    }
}
