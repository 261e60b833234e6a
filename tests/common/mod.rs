//! In-process stand-in for the search index and a paginated source API.
//!
//! Implements just enough of the index API for the engine: scroll
//! start/next/clear, `_bulk`, `_doc` writes and the `max` aggregation.
//! Scroll continuations can be scripted to report an expired cursor and
//! scroll starts to refuse new cursors.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use axum::extract::{Path as UrlPath, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use enrich_harness::config::{parse_config, Config};

#[derive(Default)]
pub struct IndexState {
    /// index -> (_id -> _source)
    pub indexes: BTreeMap<String, BTreeMap<String, Value>>,
    cursors: HashMap<String, (Vec<Value>, usize)>,
    next_cursor: u64,
    /// Number of upcoming scroll continuations to answer with an expired cursor.
    pub expire_next: usize,
    /// Number of upcoming scroll starts to refuse with too many open contexts.
    pub overload_next: usize,
    /// `(size, scroll)` of every scroll start.
    pub scroll_starts: Vec<(usize, String)>,
    pub bulk_requests: usize,
    pub cleared: usize,
}

#[derive(Clone, Default)]
pub struct FakeIndex {
    pub state: Arc<Mutex<IndexState>>,
}

impl FakeIndex {
    pub fn seed(&self, index: &str, id: &str, doc: Value) {
        self.state
            .lock()
            .unwrap()
            .indexes
            .entry(index.to_string())
            .or_default()
            .insert(id.to_string(), doc);
    }

    pub fn docs(&self, index: &str) -> BTreeMap<String, Value> {
        self.state
            .lock()
            .unwrap()
            .indexes
            .get(index)
            .cloned()
            .unwrap_or_default()
    }

    pub fn expire_next(&self, n: usize) {
        self.state.lock().unwrap().expire_next = n;
    }

    pub fn overload_next(&self, n: usize) {
        self.state.lock().unwrap().overload_next = n;
    }

    /// Number of cursor releases received.
    pub fn cleared(&self) -> usize {
        self.state.lock().unwrap().cleared
    }

    pub fn scroll_starts(&self) -> Vec<(usize, String)> {
        self.state.lock().unwrap().scroll_starts.clone()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/_search/scroll", post(scroll_next).delete(clear_scroll))
            .route("/{index}/_search", post(search))
            .route("/{index}/_bulk", post(bulk))
            .route("/{index}/_doc/{id}", put(put_doc))
            .with_state(self.clone())
    }
}

fn parse_ts(v: &Value) -> Option<DateTime<Utc>> {
    v.as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn date_lower_bound(query: &Value, field: &str) -> Option<DateTime<Utc>> {
    query
        .pointer("/query/bool/filter")?
        .as_array()?
        .iter()
        .find_map(|f| f.pointer(&format!("/range/{}/gte", field)))
        .and_then(parse_ts)
}

fn page(state: &mut IndexState, id: &str) -> Value {
    let (remaining, size) = state.cursors.get_mut(id).expect("known cursor");
    let take = (*size).min(remaining.len());
    let hits: Vec<Value> = remaining
        .drain(..take)
        .map(|doc| json!({ "_source": doc }))
        .collect();
    json!({ "_scroll_id": id, "_shards": { "failed": 0 }, "hits": { "hits": hits } })
}

async fn search(
    State(fake): State<FakeIndex>,
    UrlPath(index): UrlPath<String>,
    Query(params): Query<HashMap<String, String>>,
    body: String,
) -> (StatusCode, Json<Value>) {
    let query: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
    let mut state = fake.state.lock().unwrap();
    let Some(docs) = state.indexes.get(&index).cloned() else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": { "type": "index_not_found_exception" }, "status": 404 })),
        );
    };

    if params.get("size").map(String::as_str) == Some("0") {
        let field = query
            .pointer("/aggs/m/max/field")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let max = docs.values().filter_map(|d| d.get(&field)).max_by(|a, b| {
            match (parse_ts(a), parse_ts(b)) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => a
                    .as_f64()
                    .unwrap_or(0.0)
                    .total_cmp(&b.as_f64().unwrap_or(0.0)),
            }
        });
        let agg = match max {
            None => json!({ "value": null }),
            Some(v) => match parse_ts(v) {
                Some(d) => json!({
                    "value": d.timestamp_millis(),
                    "value_as_string": d.to_rfc3339()
                }),
                None => json!({ "value": v }),
            },
        };
        return (StatusCode::OK, Json(json!({ "aggregations": { "m": agg } })));
    }

    let size: usize = params.get("size").and_then(|s| s.parse().ok()).unwrap_or(10);
    let scroll = params.get("scroll").cloned().unwrap_or_default();
    state.scroll_starts.push((size, scroll));
    if state.overload_next > 0 {
        state.overload_next -= 1;
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": {
                    "type": "search_phase_execution_exception",
                    "reason": "Trying to create too many scroll contexts. Must be less than or equal to: [500]"
                },
                "status": 500
            })),
        );
    }

    let date_field = "metadata__updated_on";
    let from = date_lower_bound(&query, date_field);
    let mut selected: Vec<Value> = docs
        .into_values()
        .filter(|d| match (from, d.get(date_field).and_then(parse_ts)) {
            (Some(from), Some(at)) => at >= from,
            _ => true,
        })
        .collect();
    selected.sort_by_key(|d| d.get(date_field).and_then(parse_ts));

    state.next_cursor += 1;
    let id = format!("cursor-{}", state.next_cursor);
    state.cursors.insert(id.clone(), (selected, size));
    (StatusCode::OK, Json(page(&mut state, &id)))
}

async fn scroll_next(State(fake): State<FakeIndex>, body: String) -> (StatusCode, Json<Value>) {
    let req: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
    let id = req["scroll_id"].as_str().unwrap_or_default().to_string();
    let mut state = fake.state.lock().unwrap();
    if state.expire_next > 0 || !state.cursors.contains_key(&id) {
        state.expire_next = state.expire_next.saturating_sub(1);
        state.cursors.remove(&id);
        return (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": {
                    "root_cause": [{
                        "type": "search_context_missing_exception",
                        "reason": format!("No search context found for id [{}]", id)
                    }]
                },
                "status": 404
            })),
        );
    }
    (StatusCode::OK, Json(page(&mut state, &id)))
}

async fn clear_scroll(State(fake): State<FakeIndex>, body: String) -> Json<Value> {
    let req: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
    let mut state = fake.state.lock().unwrap();
    if let Some(id) = req["scroll_id"].as_str() {
        state.cursors.remove(id);
    }
    state.cleared += 1;
    Json(json!({ "succeeded": true }))
}

async fn bulk(
    State(fake): State<FakeIndex>,
    UrlPath(index): UrlPath<String>,
    body: String,
) -> Json<Value> {
    let mut state = fake.state.lock().unwrap();
    state.bulk_requests += 1;
    let mut lines = body.lines();
    let mut count = 0;
    while let (Some(header), Some(doc)) = (lines.next(), lines.next()) {
        let header: Value = serde_json::from_str(header).unwrap();
        let id = header["index"]["_id"].as_str().unwrap().to_string();
        let doc: Value = serde_json::from_str(doc).unwrap();
        state
            .indexes
            .entry(index.clone())
            .or_default()
            .insert(id, doc);
        count += 1;
    }
    Json(json!({ "errors": false, "items": count }))
}

async fn put_doc(
    State(fake): State<FakeIndex>,
    UrlPath((index, id)): UrlPath<(String, String)>,
    body: String,
) -> (StatusCode, Json<Value>) {
    let doc: Value = serde_json::from_str(&body).unwrap();
    fake.state
        .lock()
        .unwrap()
        .indexes
        .entry(index)
        .or_default()
        .insert(id, doc);
    (StatusCode::CREATED, Json(json!({ "result": "created" })))
}

/// One page of the fake issue tracker.
pub fn issue(n: u64) -> Value {
    json!({
        "number": n,
        "title": format!("issue {}", n),
        "updated_at": format!("2021-05-0{}T10:00:00Z", n),
        "user": { "login": format!("user{}", n % 2), "name": format!("User {}", n % 2) }
    })
}

async fn issues(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    let page: u64 = params.get("page").and_then(|p| p.parse().ok()).unwrap_or(1);
    let per_page: u64 = params
        .get("per_page")
        .and_then(|p| p.parse().ok())
        .unwrap_or(100);
    let all: Vec<Value> = (1..=3).map(issue).collect();
    let start = ((page - 1) * per_page) as usize;
    let items: Vec<Value> = all.into_iter().skip(start).take(per_page as usize).collect();
    Json(json!({ "items": items }))
}

pub fn tracker_router() -> Router {
    Router::new().route("/api/issues", get(issues))
}

pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Config pointing at the fake index and tracker, with fast retries.
pub fn config(es_url: &str, tracker_url: &str, db: &Path, extra_run: &str) -> Config {
    let toml = format!(
        r#"[es]
url = "{es_url}/"
raw_index = "tracker_raw"
rich_index = "tracker_rich"
bulk_size = 2
scroll_size = 2
overload_wait_secs = 0
overload_max_secs = 0

[affiliations]
db_path = "{db}"
db_bulk_size = 2
validate_mx = false

[run]
retries = 1
backoff_ms = 1
concurrency = 2
{extra_run}

[connector]
name = "tracker"
url = "{tracker_url}/api/issues"
origin = "https://tracker.example.com"
category = "issue"
items_pointer = "/items"
id_pointer = "/number"
date_pointer = "/updated_at"
per_page = 2

[connector.fields]
title = "/title"

[[connector.roles]]
role = "author"
name = "/user/name"
username = "/user/login"
"#,
        es_url = es_url,
        tracker_url = tracker_url,
        db = db.display(),
        extra_run = extra_run,
    );
    parse_config(&toml).unwrap()
}
