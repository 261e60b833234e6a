//! Resumable scroll iterator.
//!
//! [`Scroller::scan`] walks every document of an index that matches an
//! origin filter and a resume point, ascending by the date field, one page
//! at a time. Each page goes to [`PageHandler::handle_page`] followed by
//! `flush(false)`; the end of the scan calls `flush(true)`.
//!
//! Failure handling:
//!
//! - An expired cursor switches the scroller to small pages with a long
//!   keep-alive for the rest of the run and restarts the same query.
//!   Writes downstream are keyed by id, so replayed pages are harmless.
//! - A backend refusing new cursors is waited out, up to a ceiling.
//! - Anything else is fatal.
//!
//! The cursor is released on every exit path; release failures are only
//! logged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::config::EsConfig;
use crate::error::ScrollError;
use crate::es::{OriginFilter, ScrollResponse, SearchIndex};
use crate::progress::{NoProgress, ScanProgressEvent, ScanProgressReporter};

/// Page size used after a cursor expired.
pub const RECOVERY_PAGE_SIZE: usize = 20;
/// Cursor keep-alive used after a cursor expired.
pub const RECOVERY_TTL: &str = "59m";

/// Lower bound of a scan. Date and offset bounds are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResumePoint {
    Start,
    Date(DateTime<Utc>),
    Offset(f64),
}

/// Receives the pages of a scan.
#[async_trait]
pub trait PageHandler: Send + Sync {
    /// Fold one page of `_source` documents into the handler's accumulator.
    async fn handle_page(&self, docs: Vec<Value>) -> Result<()>;

    /// Persist what has accumulated. `last` is set once, after the final page.
    async fn flush(&self, last: bool) -> Result<()>;
}

/// What to scan.
#[derive(Debug, Clone)]
pub struct ScrollQuery {
    pub index: String,
    pub date_field: String,
    pub offset_field: String,
    pub origin: Option<OriginFilter>,
    pub from: ResumePoint,
}

impl ScrollQuery {
    pub fn body(&self) -> Value {
        let mut filters = Vec::new();
        if let Some(origin) = &self.origin {
            let mut term = Map::new();
            term.insert(origin.field.clone(), Value::String(origin.value.clone()));
            filters.push(json!({ "term": term }));
        }
        let range = match self.from {
            ResumePoint::Start => None,
            ResumePoint::Date(date) => Some((
                self.date_field.clone(),
                json!({ "gte": date.to_rfc3339_opts(SecondsFormat::Micros, true) }),
            )),
            ResumePoint::Offset(offset) => {
                Some((self.offset_field.clone(), json!({ "gte": offset })))
            }
        };
        if let Some((field, bound)) = range {
            let mut r = Map::new();
            r.insert(field, bound);
            filters.push(json!({ "range": r }));
        }

        let mut sort = Map::new();
        sort.insert(self.date_field.clone(), json!({ "order": "asc" }));

        let mut body = json!({ "sort": [sort] });
        if !filters.is_empty() {
            body["query"] = json!({ "bool": { "filter": filters } });
        }
        body
    }
}

#[derive(Debug, Clone)]
pub struct ScrollSettings {
    pub page_size: usize,
    pub ttl: String,
    pub overload_wait: Duration,
    pub overload_max: Duration,
    /// Expiry restarts allowed per scan before giving up.
    pub max_expiry_restarts: u32,
}

impl ScrollSettings {
    pub fn from_es(es: &EsConfig) -> Self {
        Self {
            page_size: es.scroll_size,
            ttl: es.scroll_wait.clone(),
            overload_wait: Duration::from_secs(es.overload_wait_secs),
            overload_max: Duration::from_secs(es.overload_max_secs),
            max_expiry_restarts: es.max_expiry_restarts,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub pages: u64,
    pub docs: u64,
    pub restarts: u32,
}

enum WalkOutcome {
    Done,
    Expired,
}

pub struct Scroller {
    index: Arc<SearchIndex>,
    settings: ScrollSettings,
    recovery: AtomicBool,
    progress: Arc<dyn ScanProgressReporter>,
}

impl Scroller {
    pub fn new(index: Arc<SearchIndex>, settings: ScrollSettings) -> Self {
        Self {
            index,
            settings,
            recovery: AtomicBool::new(false),
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ScanProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Current `(page size, keep-alive)`.
    pub fn current(&self) -> (usize, String) {
        if self.recovery.load(Ordering::SeqCst) {
            (RECOVERY_PAGE_SIZE, RECOVERY_TTL.to_string())
        } else {
            (self.settings.page_size, self.settings.ttl.clone())
        }
    }

    pub fn in_recovery(&self) -> bool {
        self.recovery.load(Ordering::SeqCst)
    }

    pub async fn scan(
        &self,
        phase: &str,
        query: &ScrollQuery,
        handler: &dyn PageHandler,
    ) -> Result<ScanStats> {
        let mut stats = ScanStats::default();
        loop {
            let mut cursor: Option<String> = None;
            let outcome = self.walk(phase, query, handler, &mut cursor, &mut stats).await;
            if let Some(id) = cursor.take() {
                self.release(&id).await;
            }
            match outcome? {
                WalkOutcome::Done => break,
                WalkOutcome::Expired => {
                    stats.restarts += 1;
                    if stats.restarts > self.settings.max_expiry_restarts {
                        return Err(ScrollError::ExpiryRestartsExhausted {
                            restarts: stats.restarts - 1,
                        }
                        .into());
                    }
                    self.recovery.store(true, Ordering::SeqCst);
                    warn!(
                        phase,
                        index = %query.index,
                        restart = stats.restarts,
                        limit = self.settings.max_expiry_restarts,
                        page_size = RECOVERY_PAGE_SIZE,
                        ttl = RECOVERY_TTL,
                        "scroll cursor expired, restarting scan"
                    );
                }
            }
        }
        handler.flush(true).await?;
        self.progress.report(ScanProgressEvent::Done {
            phase: phase.to_string(),
            docs: stats.docs,
        });
        info!(phase, index = %query.index, pages = stats.pages, docs = stats.docs, "scan finished");
        Ok(stats)
    }

    async fn walk(
        &self,
        phase: &str,
        query: &ScrollQuery,
        handler: &dyn PageHandler,
        cursor: &mut Option<String>,
        stats: &mut ScanStats,
    ) -> Result<WalkOutcome> {
        let (size, ttl) = self.current();
        let body = query.body();
        let mut overloaded_since: Option<Instant> = None;
        debug!(phase, index = %query.index, size, ttl = %ttl, query = %body, "starting scan");

        loop {
            let resp = match cursor.as_deref() {
                None => self.index.scroll_start(&query.index, &body, size, &ttl).await,
                Some(id) => self.index.scroll_next(id, &ttl).await,
            }
            .map_err(ScrollError::from)?;

            match resp {
                ScrollResponse::Page { scroll_id, docs } => {
                    if scroll_id.is_some() {
                        *cursor = scroll_id;
                    }
                    if docs.is_empty() {
                        return Ok(WalkOutcome::Done);
                    }
                    stats.pages += 1;
                    stats.docs += docs.len() as u64;
                    handler.handle_page(docs).await?;
                    handler.flush(false).await?;
                    self.progress.report(ScanProgressEvent::Scanning {
                        phase: phase.to_string(),
                        pages: stats.pages,
                        docs: stats.docs,
                    });
                }
                ScrollResponse::Expired => return Ok(WalkOutcome::Expired),
                ScrollResponse::Overloaded if cursor.is_none() => {
                    let since = *overloaded_since.get_or_insert_with(Instant::now);
                    let waited = since.elapsed();
                    if waited >= self.settings.overload_max {
                        return Err(ScrollError::Overloaded {
                            waited_secs: waited.as_secs(),
                        }
                        .into());
                    }
                    warn!(
                        phase,
                        waited_secs = waited.as_secs(),
                        "too many scroll contexts, waiting"
                    );
                    tokio::time::sleep(self.settings.overload_wait).await;
                }
                ScrollResponse::Overloaded => {
                    return Err(ScrollError::Unexpected {
                        status: 0,
                        body: "too many scroll contexts while a cursor is open".to_string(),
                    }
                    .into())
                }
                ScrollResponse::Unexpected { status, body } => {
                    return Err(ScrollError::Unexpected { status, body }.into())
                }
            }
        }
    }

    async fn release(&self, scroll_id: &str) {
        if let Err(e) = self.index.clear_scroll(scroll_id).await {
            warn!(error = %e, "failed to release scroll cursor");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn query(from: ResumePoint, origin: bool) -> ScrollQuery {
        ScrollQuery {
            index: "idx".into(),
            date_field: "metadata__updated_on".into(),
            offset_field: "offset".into(),
            origin: origin.then(|| OriginFilter {
                field: "origin".into(),
                value: "https://x".into(),
            }),
            from,
        }
    }

    #[test]
    fn start_query_only_sorts() {
        let body = query(ResumePoint::Start, false).body();
        assert_eq!(
            body,
            json!({ "sort": [{ "metadata__updated_on": { "order": "asc" } }] })
        );
    }

    #[test]
    fn date_query_filters_origin_and_range() {
        let from = Utc.with_ymd_and_hms(2021, 1, 2, 3, 4, 5).unwrap();
        let body = query(ResumePoint::Date(from), true).body();
        let filters = body["query"]["bool"]["filter"].as_array().unwrap();
        assert_eq!(filters[0], json!({ "term": { "origin": "https://x" } }));
        assert_eq!(
            filters[1],
            json!({ "range": { "metadata__updated_on": { "gte": "2021-01-02T03:04:05.000000Z" } } })
        );
    }

    #[test]
    fn offset_query_ranges_offset_field() {
        let body = query(ResumePoint::Offset(42.0), false).body();
        assert_eq!(
            body["query"]["bool"]["filter"][0],
            json!({ "range": { "offset": { "gte": 42.0 } } })
        );
    }
}
