//! Search index wire client.
//!
//! Thin mapping of the handful of index operations the engine uses onto
//! [`RequestClient`] calls: scroll start/next/clear, bulk and single
//! document writes, and the `max` aggregation used to find resume points.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::parse_date;
use crate::error::{truncate, RequestError};
use crate::request::{RequestClient, RequestSpec};

/// Body marker of a scroll cursor that expired server-side.
pub const NO_SEARCH_CONTEXT: &str = "No search context found";
/// Body marker of a backend refusing to open another scroll cursor.
pub const TOO_MANY_SCROLLS: &str = "Trying to create too many scroll contexts";

/// Classified reply to a scroll start or continuation.
#[derive(Debug, Clone, PartialEq)]
pub enum ScrollResponse {
    Page {
        scroll_id: Option<String>,
        /// `_source` of every hit, in server order.
        docs: Vec<Value>,
    },
    Expired,
    Overloaded,
    Unexpected {
        status: u16,
        body: String,
    },
}

/// Origin restriction applied to queries against multi-origin indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginFilter {
    pub field: String,
    pub value: String,
}

impl OriginFilter {
    fn term(&self) -> Value {
        let mut term = serde_json::Map::new();
        term.insert(self.field.clone(), Value::String(self.value.clone()));
        json!({ "term": term })
    }
}

pub struct SearchIndex {
    client: Arc<RequestClient>,
    url: String,
}

impl SearchIndex {
    pub fn new(client: Arc<RequestClient>, url: &str) -> Self {
        Self {
            client,
            url: url.trim_end_matches('/').to_string(),
        }
    }

    pub fn client(&self) -> &RequestClient {
        &self.client
    }

    pub async fn scroll_start(
        &self,
        index: &str,
        query: &Value,
        size: usize,
        ttl: &str,
    ) -> Result<ScrollResponse, RequestError> {
        let spec = RequestSpec::new(
            Method::POST,
            format!("{}/{}/_search?scroll={}&size={}", self.url, index, ttl, size),
        )
        .json_body(query);
        let resp = self.client.execute(&spec).await?;
        Ok(classify_scroll(resp.status, &resp.text()))
    }

    pub async fn scroll_next(&self, scroll_id: &str, ttl: &str) -> Result<ScrollResponse, RequestError> {
        let spec = RequestSpec::new(Method::POST, format!("{}/_search/scroll", self.url))
            .json_body(&json!({ "scroll": ttl, "scroll_id": scroll_id }));
        let resp = self.client.execute(&spec).await?;
        Ok(classify_scroll(resp.status, &resp.text()))
    }

    pub async fn clear_scroll(&self, scroll_id: &str) -> Result<(), RequestError> {
        let spec = RequestSpec::new(Method::DELETE, format!("{}/_search/scroll", self.url))
            .json_body(&json!({ "scroll_id": scroll_id }))
            .error_statuses(&[(400, 599)])
            .no_retry();
        self.client.execute(&spec).await.map(|_| ())
    }

    /// One bulk request indexing every `(id, doc)` pair.
    ///
    /// A 2xx reply whose body reports per-item errors is a failure too.
    pub async fn bulk(&self, index: &str, docs: &[(String, Value)]) -> Result<(), RequestError> {
        let mut payload = String::new();
        for (id, doc) in docs {
            payload.push_str(&json!({ "index": { "_id": id } }).to_string());
            payload.push('\n');
            payload.push_str(&doc.to_string());
            payload.push('\n');
        }
        let url = format!("{}/{}/_bulk?refresh=true", self.url, index);
        let spec = RequestSpec::new(Method::POST, url.clone())
            .body(payload.into_bytes(), "application/x-ndjson")
            .error_statuses(&[(400, 599)])
            .mutating();
        let resp = self.client.execute(&spec).await?;
        if let Ok(body) = resp.to_json() {
            if body.get("errors").and_then(Value::as_bool) == Some(true) {
                return Err(RequestError::NotSuccess {
                    method: "POST".to_string(),
                    url: format!("/{}/_bulk", index),
                    status: resp.status,
                    body: truncate(&resp.text(), 1024),
                });
            }
        }
        debug!(index, docs = docs.len(), "bulk indexed");
        Ok(())
    }

    pub async fn put_doc(&self, index: &str, id: &str, doc: &Value) -> Result<(), RequestError> {
        let spec = RequestSpec::new(Method::PUT, format!("{}/{}/_doc/{}", self.url, index, id))
            .json_body(doc)
            .error_statuses(&[(400, 599)])
            .ok_statuses(&[(200, 201)])
            .mutating();
        self.client.execute(&spec).await.map(|_| ())
    }

    async fn max_aggregation(
        &self,
        index: &str,
        field: &str,
        origin: Option<&OriginFilter>,
    ) -> Result<Option<Value>> {
        let mut body = json!({ "aggs": { "m": { "max": { "field": field } } } });
        if let Some(origin) = origin {
            body["query"] = json!({ "bool": { "filter": origin.term() } });
        }
        let spec = RequestSpec::new(Method::POST, format!("{}/{}/_search?size=0", self.url, index))
            .json_body(&body)
            .ok_statuses(&[(200, 200), (404, 404)]);
        let resp = self.client.execute(&spec).await?;
        if resp.status == 404 {
            debug!(index, "index missing, no resume point");
            return Ok(None);
        }
        let reply = resp
            .to_json()
            .with_context(|| format!("resume query on {} returned non-JSON", index))?;
        Ok(reply.pointer("/aggregations/m").cloned())
    }

    /// Max of `date_field`, or `None` for an empty or missing index.
    pub async fn last_update(
        &self,
        index: &str,
        date_field: &str,
        origin: Option<&OriginFilter>,
    ) -> Result<Option<DateTime<Utc>>> {
        let agg = self.max_aggregation(index, date_field, origin).await?;
        match agg.as_ref().and_then(|m| m.get("value_as_string")).and_then(Value::as_str) {
            Some(s) if !s.is_empty() => Ok(Some(
                parse_date(s).with_context(|| format!("bad max({}) '{}'", date_field, s))?,
            )),
            _ => Ok(None),
        }
    }

    /// Max of `offset_field`, or `None` for an empty or missing index.
    pub async fn last_offset(
        &self,
        index: &str,
        offset_field: &str,
        origin: Option<&OriginFilter>,
    ) -> Result<Option<f64>> {
        let agg = self.max_aggregation(index, offset_field, origin).await?;
        Ok(agg.as_ref().and_then(|m| m.get("value")).and_then(Value::as_f64))
    }
}

pub fn classify_scroll(status: u16, body: &str) -> ScrollResponse {
    if status == 200 {
        let parsed: Value = match serde_json::from_str(body) {
            Ok(v) => v,
            Err(_) => {
                return ScrollResponse::Unexpected {
                    status,
                    body: truncate(body, 1024),
                }
            }
        };
        let failed_shards = parsed
            .pointer("/_shards/failed")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if failed_shards > 0 && body.contains(NO_SEARCH_CONTEXT) {
            return ScrollResponse::Expired;
        }
        let hits = match parsed.pointer("/hits/hits").and_then(Value::as_array) {
            Some(hits) => hits,
            None => {
                return ScrollResponse::Unexpected {
                    status,
                    body: truncate(body, 1024),
                }
            }
        };
        let docs = hits
            .iter()
            .map(|h| h.get("_source").cloned().unwrap_or(Value::Null))
            .collect();
        let scroll_id = parsed
            .get("_scroll_id")
            .and_then(Value::as_str)
            .map(String::from);
        return ScrollResponse::Page { scroll_id, docs };
    }
    if body.contains(NO_SEARCH_CONTEXT) {
        ScrollResponse::Expired
    } else if body.contains(TOO_MANY_SCROLLS) {
        ScrollResponse::Overloaded
    } else {
        ScrollResponse::Unexpected {
            status,
            body: truncate(body, 1024),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_pages() {
        let body = r#"{"_scroll_id":"abc","hits":{"hits":[{"_id":"1","_source":{"a":1}}]}}"#;
        match classify_scroll(200, body) {
            ScrollResponse::Page { scroll_id, docs } => {
                assert_eq!(scroll_id.as_deref(), Some("abc"));
                assert_eq!(docs, vec![json!({"a": 1})]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn classifies_markers() {
        let expired = r#"{"error":{"root_cause":[{"type":"search_context_missing_exception","reason":"No search context found for id [12]"}]},"status":404}"#;
        assert_eq!(classify_scroll(404, expired), ScrollResponse::Expired);

        let overloaded = r#"{"error":{"reason":"Trying to create too many scroll contexts. Must be less than or equal to: [500]"}}"#;
        assert_eq!(classify_scroll(500, overloaded), ScrollResponse::Overloaded);

        assert!(matches!(
            classify_scroll(400, "bad query"),
            ScrollResponse::Unexpected { status: 400, .. }
        ));
        assert!(matches!(
            classify_scroll(200, r#"{"took":1}"#),
            ScrollResponse::Unexpected { status: 200, .. }
        ));
    }

    #[test]
    fn expired_shards_in_ok_reply() {
        let body = r#"{"_scroll_id":"x","_shards":{"failed":1,"failures":[{"reason":{"reason":"No search context found for id [3]"}}]},"hits":{"hits":[]}}"#;
        assert_eq!(classify_scroll(200, body), ScrollResponse::Expired);
    }
}
