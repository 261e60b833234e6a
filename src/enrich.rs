//! Enrichment orchestrator.
//!
//! Drives one run for one data source through a fixed phase sequence:
//!
//! ```text
//! Idle ─▶ DetectResumePoint ─▶ FetchRaw ─▶ UploadIdentities ─▶ EnrichItems ─▶ Done
//!   │            (skipped by       (skipped by     (skipped by       (skipped by
//!   │             force_full)       no_raw)         no_identities)    only_identities)
//!   └──▶ RefreshAffiliations ─▶ Done                 (refresh_affs)
//!
//! any phase ──error──▶ Fatal
//! ```
//!
//! Flag combinations are validated before leaving `Idle`. Identity upload
//! and enrichment both scan the raw index from the rich index's resume
//! point, so items fetched in this run are picked up by both.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use enrich_harness_core::hash::IdentityHasher;
use enrich_harness_core::models::{Item, RichItem};
use enrich_harness_core::store::{AffiliationStore, EnrollmentLookup, NoEnrollments, UploadReport};

use crate::affiliations::SqliteAffiliationStore;
use crate::bulk::{BulkSink, IndexWriter};
use crate::config::{Config, EsConfig, RunConfig};
use crate::connector::{DataSource, RawItemSink};
use crate::connector_http::HttpJsonConnector;
use crate::dispatch::Dispatcher;
use crate::email::EmailValidator;
use crate::es::{OriginFilter, SearchIndex};
use crate::identities::{IdentityCollector, IdentityUploader};
use crate::progress::{NoProgress, ScanProgressReporter};
use crate::redact::Redactor;
use crate::request::{RequestClient, RequestPolicy};
use crate::resolver::AffiliationResolver;
use crate::scroll::{PageHandler, ResumePoint, ScrollQuery, ScrollSettings, Scroller};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    DetectResumePoint,
    FetchRaw,
    RefreshAffiliations,
    UploadIdentities,
    EnrichItems,
    Done,
    Fatal,
}

/// Phases a run with these flags walks through after `Idle`, excluding `Done`.
pub fn plan(run: &RunConfig) -> Vec<Phase> {
    if run.refresh_affs {
        return vec![Phase::RefreshAffiliations];
    }
    let mut phases = Vec::new();
    if !run.force_full {
        phases.push(Phase::DetectResumePoint);
    }
    if !run.no_raw {
        phases.push(Phase::FetchRaw);
    }
    if !run.no_identities {
        phases.push(Phase::UploadIdentities);
    }
    if !run.only_identities && run.enrich {
        phases.push(Phase::EnrichItems);
    }
    phases
}

/// Term restricting scans to this source's items in a shared index.
pub fn origin_filter(es: &EsConfig, ds: &dyn DataSource) -> Option<OriginFilter> {
    ds.resume_needs_origin().then(|| OriginFilter {
        field: es.origin_field(ds.tag().is_some()).to_string(),
        value: ds.tag().unwrap_or(ds.origin()).to_string(),
    })
}

/// The start point given explicitly in `[run]`, else the beginning.
pub fn configured_start(run: &RunConfig) -> Result<ResumePoint> {
    if let Some(date) = run.date_from()? {
        return Ok(ResumePoint::Date(date));
    }
    if let Some(offset) = run.offset_from {
        return Ok(ResumePoint::Offset(offset));
    }
    Ok(ResumePoint::Start)
}

/// Where a scan of `index` should resume: an explicit start from `[run]`
/// wins, otherwise the max date (or offset) already stored there.
pub async fn detect_resume_point(
    search: &SearchIndex,
    config: &Config,
    ds: &dyn DataSource,
    index: &str,
) -> Result<ResumePoint> {
    let start = configured_start(&config.run)?;
    if start != ResumePoint::Start {
        return Ok(start);
    }
    let es = &config.es;
    let origin = origin_filter(es, ds);
    let found = if ds.supports_offset_from() {
        search
            .last_offset(index, &es.offset_field, origin.as_ref())
            .await?
            .map(ResumePoint::Offset)
    } else {
        search
            .last_update(index, &es.date_field, origin.as_ref())
            .await?
            .map(ResumePoint::Date)
    };
    Ok(found.unwrap_or(ResumePoint::Start))
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub raw_from: ResumePoint,
    pub rich_from: ResumePoint,
    pub raw_fetched: u64,
    pub identity_items: u64,
    pub identities_unique: usize,
    pub uploaded: UploadReport,
    pub items_enriched: u64,
    pub rich_written: u64,
    pub scroll_restarts: u32,
    pub phases: Vec<Phase>,
}

impl RunSummary {
    fn new(run_id: String, start: ResumePoint) -> Self {
        Self {
            run_id,
            raw_from: start,
            rich_from: start,
            raw_fetched: 0,
            identity_items: 0,
            identities_unique: 0,
            uploaded: UploadReport::default(),
            items_enriched: 0,
            rich_written: 0,
            scroll_restarts: 0,
            phases: Vec::new(),
        }
    }
}

pub struct Enricher {
    config: Config,
    ds: Arc<dyn DataSource>,
    index: Arc<SearchIndex>,
    store: Arc<dyn AffiliationStore>,
    enrollments: Arc<dyn EnrollmentLookup>,
    hasher: Arc<IdentityHasher>,
    emails: Arc<EmailValidator>,
    progress: Arc<dyn ScanProgressReporter>,
    phases: Mutex<Vec<Phase>>,
}

impl Enricher {
    pub fn new(
        config: Config,
        ds: Arc<dyn DataSource>,
        index: Arc<SearchIndex>,
        store: Arc<dyn AffiliationStore>,
    ) -> Self {
        let hasher = Arc::new(IdentityHasher::for_mode(config.affiliations.legacy_uuid));
        let emails = Arc::new(EmailValidator::with_mx(config.affiliations.validate_mx));
        Self {
            config,
            ds,
            index,
            store,
            enrollments: Arc::new(NoEnrollments),
            hasher,
            emails,
            progress: Arc::new(NoProgress),
            phases: Mutex::new(vec![Phase::Idle]),
        }
    }

    pub fn with_enrollments(mut self, enrollments: Arc<dyn EnrollmentLookup>) -> Self {
        self.enrollments = enrollments;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ScanProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn hasher(&self) -> Arc<IdentityHasher> {
        self.hasher.clone()
    }

    /// Every phase entered so far, starting with `Idle`.
    pub fn phases(&self) -> Vec<Phase> {
        self.phases.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn phase(&self) -> Phase {
        self.phases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .copied()
            .unwrap_or(Phase::Idle)
    }

    fn enter(&self, phase: Phase) {
        info!(phase = ?phase, "entering phase");
        self.phases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(phase);
    }

    fn origin_filter(&self) -> Option<OriginFilter> {
        origin_filter(&self.config.es, self.ds.as_ref())
    }

    pub fn configured_start(&self) -> Result<ResumePoint> {
        configured_start(&self.config.run)
    }

    pub async fn detect_resume_point(&self, index: &str) -> Result<ResumePoint> {
        detect_resume_point(&self.index, &self.config, self.ds.as_ref(), index).await
    }

    fn raw_query(&self, from: ResumePoint) -> ScrollQuery {
        let es = &self.config.es;
        ScrollQuery {
            index: es.raw_index.clone(),
            date_field: es.date_field.clone(),
            offset_field: es.offset_field.clone(),
            origin: self.origin_filter(),
            from,
        }
    }

    fn resolver(&self) -> Arc<AffiliationResolver> {
        Arc::new(AffiliationResolver::new(
            self.ds.name(),
            self.hasher.clone(),
            self.store.clone(),
            self.enrollments.clone(),
        ))
    }

    /// Run every planned phase; on error the run ends in `Fatal`.
    pub async fn run(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("run", run_id = %run_id, source = self.ds.name());
        async {
            match self.run_phases(run_id.clone()).await {
                Ok(summary) => Ok(summary),
                Err(e) => {
                    self.enter(Phase::Fatal);
                    error!(error = %format!("{:#}", e), "run failed");
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_phases(&self, run_id: String) -> Result<RunSummary> {
        let run = &self.config.run;
        run.validate().context("invalid run configuration")?;

        let start = self.configured_start()?;
        let mut summary = RunSummary::new(run_id, start);
        let scroller = Scroller::new(self.index.clone(), ScrollSettings::from_es(&self.config.es))
            .with_progress(self.progress.clone());
        info!(
            hash = self.hasher.strategy_name(),
            dry_run = run.dry_run,
            concurrency = run.concurrency,
            "run started"
        );

        for phase in plan(run) {
            self.enter(phase);
            match phase {
                Phase::DetectResumePoint => {
                    if !run.no_raw {
                        summary.raw_from = self.detect_resume_point(&self.config.es.raw_index).await?;
                    }
                    summary.rich_from = self.detect_resume_point(&self.config.es.rich_index).await?;
                    info!(raw_from = ?summary.raw_from, rich_from = ?summary.rich_from, "resume points");
                }
                Phase::FetchRaw => {
                    summary.raw_fetched = self.fetch_raw(summary.raw_from).await?;
                }
                Phase::UploadIdentities => {
                    let (items, unique, report, restarts) =
                        self.upload_identities(&scroller, summary.rich_from).await?;
                    summary.identity_items = items;
                    summary.identities_unique = unique;
                    summary.uploaded = report;
                    summary.scroll_restarts += restarts;
                }
                Phase::EnrichItems | Phase::RefreshAffiliations => {
                    let from = if phase == Phase::RefreshAffiliations {
                        start
                    } else {
                        summary.rich_from
                    };
                    let (items, written, restarts) = self.enrich_items(&scroller, from).await?;
                    summary.items_enriched = items;
                    summary.rich_written = written;
                    summary.scroll_restarts += restarts;
                }
                Phase::Idle | Phase::Done | Phase::Fatal => {}
            }
        }

        self.enter(Phase::Done);
        summary.phases = self.phases();
        Ok(summary)
    }

    async fn fetch_raw(&self, from: ResumePoint) -> Result<u64> {
        let writer = Arc::new(IndexWriter::<Item>::new(
            self.index.clone(),
            &self.config.es.raw_index,
        ));
        let sink = RawItemSink::new(
            BulkSink::new(self.config.es.bulk_size, writer),
            self.hasher.clone(),
            self.ds.name(),
        );
        self.ds
            .fetch_raw(from, &sink)
            .await
            .with_context(|| format!("fetching raw items from {}", self.ds.name()))?;
        let fetched = sink.finish().await?;
        info!(fetched, from = ?from, "raw fetch finished");
        Ok(fetched)
    }

    async fn upload_identities(
        &self,
        scroller: &Scroller,
        from: ResumePoint,
    ) -> Result<(u64, usize, UploadReport, u32)> {
        let uploader = Arc::new(IdentityUploader::new(
            self.ds.name(),
            self.hasher.clone(),
            self.store.clone(),
            self.emails.clone(),
            self.config.run.dry_run,
        ));
        let collector = IdentityCollector::new(
            self.ds.clone(),
            Dispatcher::new(self.config.run.concurrency),
            self.config.affiliations.db_bulk_size,
            uploader.clone(),
        );
        let stats = scroller
            .scan("identities", &self.raw_query(from), &collector)
            .await?;
        Ok((
            collector.items(),
            collector.unique(),
            uploader.totals(),
            stats.restarts,
        ))
    }

    async fn enrich_items(&self, scroller: &Scroller, from: ResumePoint) -> Result<(u64, u64, u32)> {
        let writer = Arc::new(IndexWriter::<RichItem>::new(
            self.index.clone(),
            &self.config.es.rich_index,
        ));
        let handler = EnrichHandler {
            ds: self.ds.clone(),
            resolver: self.resolver(),
            dispatcher: Dispatcher::new(self.config.run.concurrency),
            sink: BulkSink::new(self.config.es.bulk_size, writer),
            items: AtomicU64::new(0),
        };
        let stats = scroller
            .scan("enrich", &self.raw_query(from), &handler)
            .await?;
        Ok((
            handler.items.load(Ordering::SeqCst),
            handler.sink.written(),
            stats.restarts,
        ))
    }
}

/// Enriches each page of raw items with bounded concurrency.
struct EnrichHandler {
    ds: Arc<dyn DataSource>,
    resolver: Arc<AffiliationResolver>,
    dispatcher: Dispatcher,
    sink: BulkSink<RichItem>,
    items: AtomicU64,
}

impl EnrichHandler {
    async fn enrich_one(&self, item: Item) -> Result<()> {
        let riches = self
            .ds
            .enrich_item(&item)
            .with_context(|| format!("enriching item {}", item.uuid))?;
        for mut rich in riches {
            for role in self.ds.roles(&item, &rich) {
                let Some(identity) = self.ds.role_identity(&item, &rich, &role) else {
                    continue;
                };
                let affiliation = self
                    .resolver
                    .resolve(&identity, &role, item.updated_on)
                    .await?;
                rich.extend(affiliation.to_fields(&role));
            }
            self.sink.add(rich).await?;
        }
        self.items.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl PageHandler for EnrichHandler {
    async fn handle_page(&self, docs: Vec<Value>) -> Result<()> {
        let items = docs
            .into_iter()
            .map(|doc| serde_json::from_value::<Item>(doc).context("raw document is not a valid item"))
            .collect::<Result<Vec<_>>>()?;
        self.dispatcher
            .run(items, |item| self.enrich_one(item))
            .await?;
        Ok(())
    }

    async fn flush(&self, last: bool) -> Result<()> {
        self.sink.flush(last).await
    }
}

fn search_index(config: &Config) -> (Arc<Redactor>, Arc<SearchIndex>, Arc<RequestClient>) {
    let redactor = Arc::new(Redactor::new());
    redactor.add_url_credentials(&config.es.url);
    redactor.add(&config.affiliations.db_path.display().to_string());
    let client = Arc::new(RequestClient::new(
        RequestPolicy::from_run(&config.run),
        redactor.clone(),
    ));
    let index = Arc::new(SearchIndex::new(client.clone(), &config.es.url));
    (redactor, index, client)
}

fn describe(point: ResumePoint) -> String {
    match point {
        ResumePoint::Start => "start".to_string(),
        ResumePoint::Date(d) => d.to_rfc3339(),
        ResumePoint::Offset(o) => format!("offset {}", o),
    }
}

/// `enrich run`: one full run of the configured connector.
pub async fn run_enrich(config: &Config, progress: Arc<dyn ScanProgressReporter>) -> Result<()> {
    let (redactor, index, client) = search_index(config);
    let store = Arc::new(SqliteAffiliationStore::open(&config.affiliations).await?);
    let ds = Arc::new(HttpJsonConnector::new(config.connector.clone(), client));
    let enricher = Enricher::new(config.clone(), ds, index, store.clone()).with_progress(progress);

    let result = enricher.run().await;
    store.close().await;
    let summary = result.map_err(|e| anyhow::anyhow!(redactor.filter(&format!("{:#}", e))))?;

    let mode = if config.run.dry_run { " (dry-run)" } else { "" };
    println!("run {}{}", config.connector.name, mode);
    println!("  run id: {}", summary.run_id);
    println!("  hash: {}", enricher.hasher().strategy_name());
    println!("  raw from: {}", describe(summary.raw_from));
    println!("  rich from: {}", describe(summary.rich_from));
    println!("  raw items fetched: {}", summary.raw_fetched);
    println!(
        "  identities: {} unique in {} items ({} new)",
        summary.identities_unique, summary.identity_items, summary.uploaded.identities
    );
    println!("  items enriched: {}", summary.items_enriched);
    println!("  rich items written: {}", summary.rich_written);
    if summary.scroll_restarts > 0 {
        println!("  scroll restarts: {}", summary.scroll_restarts);
    }
    println!("ok");
    Ok(())
}

/// `enrich resume`: print where the next run would start.
pub async fn run_resume(config: &Config) -> Result<()> {
    let (_, index, client) = search_index(config);
    let ds = HttpJsonConnector::new(config.connector.clone(), client);
    let raw = detect_resume_point(&index, config, &ds, &config.es.raw_index).await?;
    let rich = detect_resume_point(&index, config, &ds, &config.es.rich_index).await?;
    println!("{}  raw  {}", config.es.raw_index, describe(raw));
    println!("{}  rich  {}", config.es.rich_index, describe(rich));
    Ok(())
}
