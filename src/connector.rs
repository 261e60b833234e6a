//! Data source capability interface.
//!
//! Every platform adapter implements [`DataSource`]. The engine only calls
//! these methods and never branches on which platform it is talking to.
//!
//! The built-in [`crate::connector_http::HttpJsonConnector`] covers
//! paginated JSON APIs; anything else is a custom `impl DataSource`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::info;

use enrich_harness_core::hash::IdentityHasher;
use enrich_harness_core::models::{IdentityTuple, Item, RichItem};

use crate::bulk::BulkSink;
use crate::scroll::ResumePoint;

/// A platform adapter.
///
/// # Example
///
/// ```rust
/// use anyhow::Result;
/// use async_trait::async_trait;
/// use chrono::{DateTime, Utc};
/// use serde_json::Value;
/// use enrich_harness::connector::{DataSource, RawItemSink};
/// use enrich_harness::scroll::ResumePoint;
/// use enrich_harness_core::models::{IdentityTuple, Item, RichItem};
///
/// struct Registry;
///
/// #[async_trait]
/// impl DataSource for Registry {
///     fn name(&self) -> &str { "registry" }
///     fn origin(&self) -> &str { "https://registry.example.com" }
///     fn category(&self) -> &str { "package" }
///
///     async fn fetch_raw(&self, _from: ResumePoint, _sink: &RawItemSink) -> Result<()> {
///         Ok(())
///     }
///     fn item_id(&self, raw: &Value) -> Result<String> {
///         Ok(raw["name"].as_str().unwrap_or_default().to_string())
///     }
///     fn item_updated_on(&self, _raw: &Value) -> Result<DateTime<Utc>> {
///         Ok(Utc::now())
///     }
///     fn item_identities(&self, _item: &Item) -> Vec<IdentityTuple> { vec![] }
///     fn enrich_item(&self, item: &Item) -> Result<Vec<RichItem>> {
///         Ok(vec![RichItem::from_item(item.uuid.clone(), item)])
///     }
///     fn roles(&self, _item: &Item, _rich: &RichItem) -> Vec<String> { vec![] }
///     fn role_identity(&self, _item: &Item, _rich: &RichItem, _role: &str) -> Option<IdentityTuple> {
///         None
///     }
/// }
/// ```
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Data source name; also the `source` of every identity it yields.
    fn name(&self) -> &str;

    /// Origin stamped on every item (usually the endpoint URL).
    fn origin(&self) -> &str;

    fn tag(&self) -> Option<&str> {
        None
    }

    /// Default category of fetched items.
    fn category(&self) -> &str;

    /// The index is shared by several origins, so scans filter by origin.
    fn resume_needs_origin(&self) -> bool {
        false
    }

    fn supports_date_from(&self) -> bool {
        true
    }

    fn supports_offset_from(&self) -> bool {
        false
    }

    /// Fetch raw payloads newer than `from` and push each into `sink`.
    async fn fetch_raw(&self, from: ResumePoint, sink: &RawItemSink) -> Result<()>;

    fn item_id(&self, raw: &Value) -> Result<String>;

    fn item_updated_on(&self, raw: &Value) -> Result<DateTime<Utc>>;

    fn item_category(&self, _raw: &Value) -> String {
        self.category().to_string()
    }

    fn item_offset(&self, _raw: &Value) -> Option<f64> {
        None
    }

    /// Every identity mentioned by a raw item.
    fn item_identities(&self, item: &Item) -> Vec<IdentityTuple>;

    /// Connector-specific rich items for one raw item, without affiliation data.
    fn enrich_item(&self, item: &Item) -> Result<Vec<RichItem>>;

    /// Roles to resolve for one rich item.
    fn roles(&self, item: &Item, rich: &RichItem) -> Vec<String>;

    fn role_identity(&self, item: &Item, rich: &RichItem, role: &str) -> Option<IdentityTuple>;

    /// Seconds to wait before the next call given the platform's rate-limit state.
    fn wait_seconds(&self, remaining: i64, reset_epoch_ms: i64) -> u64 {
        if remaining > 0 {
            return 0;
        }
        time_to_reset(reset_epoch_ms, Utc::now().timestamp_millis())
    }
}

/// Whole seconds until `reset_ms`, rounded up by one, never negative.
pub fn time_to_reset(reset_ms: i64, now_ms: i64) -> u64 {
    let secs = (reset_ms.saturating_sub(now_ms) / 1000).saturating_add(1);
    secs.max(0) as u64
}

/// Sleep out an exhausted rate limit.
pub async fn pace(ds: &dyn DataSource, remaining: i64, reset_epoch_ms: i64) {
    let wait = ds.wait_seconds(remaining, reset_epoch_ms);
    if wait > 0 {
        info!(source = ds.name(), wait_secs = wait, "rate limit exhausted, waiting");
        tokio::time::sleep(Duration::from_secs(wait)).await;
    }
}

/// Turns raw payloads into [`Item`]s and bulk-writes them to the raw index.
pub struct RawItemSink {
    sink: BulkSink<Item>,
    hasher: Arc<IdentityHasher>,
    backend_name: String,
    count: AtomicU64,
}

impl RawItemSink {
    pub fn new(sink: BulkSink<Item>, hasher: Arc<IdentityHasher>, backend_name: &str) -> Self {
        Self {
            sink,
            hasher,
            backend_name: backend_name.to_string(),
            count: AtomicU64::new(0),
        }
    }

    /// Wrap `raw` with standard metadata.
    pub fn make_item(&self, ds: &dyn DataSource, raw: Value) -> Result<Item> {
        let id = ds.item_id(&raw)?;
        let uuid = self
            .hasher
            .item_id(&[ds.origin(), &id])
            .with_context(|| format!("cannot hash item '{}'", id))?;
        Ok(Item {
            uuid,
            origin: ds.origin().to_string(),
            tag: ds.tag().unwrap_or(ds.origin()).to_string(),
            updated_on: ds.item_updated_on(&raw)?,
            timestamp: Utc::now(),
            offset: ds.item_offset(&raw),
            category: ds.item_category(&raw),
            backend_name: self.backend_name.clone(),
            data: raw,
            extra: Map::new(),
        })
    }

    pub async fn push(&self, ds: &dyn DataSource, raw: Value) -> Result<()> {
        let item = self.make_item(ds, raw)?;
        self.count.fetch_add(1, Ordering::SeqCst);
        self.sink.add(item).await
    }

    pub async fn finish(&self) -> Result<u64> {
        self.sink.flush(true).await?;
        Ok(self.count.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_rounds_up_and_clamps() {
        assert_eq!(time_to_reset(10_500, 10_000), 1);
        assert_eq!(time_to_reset(12_000, 10_000), 3);
        assert_eq!(time_to_reset(5_000, 10_000), 0);
    }

    #[test]
    fn reset_saturates_on_extreme_values() {
        assert_eq!(time_to_reset(i64::MAX, i64::MIN), (i64::MAX / 1000 + 1) as u64);
        assert_eq!(time_to_reset(i64::MIN, i64::MAX), 0);
        assert_eq!(time_to_reset(i64::MAX, 0), (i64::MAX / 1000 + 1) as u64);
    }
}
