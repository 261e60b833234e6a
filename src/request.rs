//! Retry-aware HTTP request layer.
//!
//! Every outbound call goes through [`RequestClient::execute`]. A
//! [`RequestSpec`] carries three status-range sets: statuses whose body is
//! parsed as JSON, statuses that are errors, and statuses that count as
//! success (checked only when non-empty). Failed attempts are retried
//! after `(n+1)^2` backoff units, where `n` is the number of failures so
//! far, up to the configured retry count.
//!
//! Idempotent calls may ask for a TTL response cache. Mutating calls are
//! never cached and are not sent at all in dry-run mode.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reqwest::header::HeaderMap;
use reqwest::Method;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::error::{truncate, RequestError};
use crate::redact::{anonymize_url, Redactor};

const MAX_PAYLOAD_PRINT: usize = 1024;

/// Inclusive status ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusRanges(Vec<(u16, u16)>);

impl StatusRanges {
    pub fn new(ranges: &[(u16, u16)]) -> Self {
        Self(ranges.to_vec())
    }

    pub fn none() -> Self {
        Self(Vec::new())
    }

    pub fn contains(&self, status: u16) -> bool {
        self.0.iter().any(|(lo, hi)| status >= *lo && status <= *hi)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Description of one outbound call.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub payload: Option<Vec<u8>>,
    pub json_statuses: StatusRanges,
    pub error_statuses: StatusRanges,
    pub ok_statuses: StatusRanges,
    pub retry: bool,
    pub cache_for: Option<Duration>,
    /// Mutating call: skipped in dry-run mode, never cached.
    pub skip_in_dry_run: bool,
}

impl RequestSpec {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            payload: None,
            json_statuses: StatusRanges::none(),
            error_statuses: StatusRanges::none(),
            ok_statuses: StatusRanges::none(),
            retry: true,
            cache_for: None,
            skip_in_dry_run: false,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn json_body(self, body: &Value) -> Self {
        let bytes = body.to_string().into_bytes();
        self.body(bytes, "application/json")
    }

    pub fn body(mut self, bytes: Vec<u8>, content_type: &str) -> Self {
        self.payload = Some(bytes);
        self.header("Content-Type", content_type)
    }

    pub fn json_statuses(mut self, ranges: &[(u16, u16)]) -> Self {
        self.json_statuses = StatusRanges::new(ranges);
        self
    }

    pub fn error_statuses(mut self, ranges: &[(u16, u16)]) -> Self {
        self.error_statuses = StatusRanges::new(ranges);
        self
    }

    pub fn ok_statuses(mut self, ranges: &[(u16, u16)]) -> Self {
        self.ok_statuses = StatusRanges::new(ranges);
        self
    }

    pub fn no_retry(mut self) -> Self {
        self.retry = false;
        self
    }

    pub fn cache_for(mut self, ttl: Duration) -> Self {
        self.cache_for = Some(ttl);
        self
    }

    pub fn mutating(mut self) -> Self {
        self.skip_in_dry_run = true;
        self
    }

    fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.method.as_str().as_bytes());
        hasher.update(self.url.as_bytes());
        for (k, v) in &self.headers {
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
            hasher.update(b"\n");
        }
        if let Some(payload) = &self.payload {
            hasher.update(payload);
        }
        hex::encode(hasher.finalize())
    }

    fn payload_preview(&self) -> String {
        match &self.payload {
            Some(p) => truncate(&String::from_utf8_lossy(p), MAX_PAYLOAD_PRINT),
            None => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Json(Value),
    Raw(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Body,
    pub headers: HeaderMap,
}

impl HttpResponse {
    /// Placeholder returned for mutating calls skipped in dry-run mode.
    fn skipped() -> Self {
        Self {
            status: 200,
            body: Body::Raw(Vec::new()),
            headers: HeaderMap::new(),
        }
    }

    pub fn json(&self) -> Option<&Value> {
        match &self.body {
            Body::Json(v) => Some(v),
            Body::Raw(_) => None,
        }
    }

    /// Body as JSON, parsing raw bytes if the status was not in the JSON set.
    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        match &self.body {
            Body::Json(v) => Ok(v.clone()),
            Body::Raw(bytes) => serde_json::from_slice(bytes),
        }
    }

    pub fn text(&self) -> String {
        match &self.body {
            Body::Json(v) => v.to_string(),
            Body::Raw(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// TTL cache of successful responses keyed by request content.
#[derive(Default)]
pub struct ResponseCache {
    entries: Mutex<HashMap<String, (Instant, HttpResponse)>>,
}

impl ResponseCache {
    fn get(&self, key: &str) -> Option<HttpResponse> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some((expires, resp)) if *expires > Instant::now() => Some(resp.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn put(&self, key: String, ttl: Duration, resp: HttpResponse) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, (Instant::now() + ttl, resp));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Retry and dry-run policy shared by every call of a run.
#[derive(Debug, Clone)]
pub struct RequestPolicy {
    pub retries: u32,
    pub backoff_unit: Duration,
    pub dry_run: bool,
    pub no_cache: bool,
}

impl RequestPolicy {
    pub fn from_run(run: &RunConfig) -> Self {
        Self {
            retries: run.retries,
            backoff_unit: Duration::from_millis(run.backoff_ms),
            dry_run: run.dry_run,
            no_cache: run.no_cache,
        }
    }
}

pub struct RequestClient {
    http: reqwest::Client,
    policy: RequestPolicy,
    cache: ResponseCache,
    redactor: Arc<Redactor>,
}

impl RequestClient {
    pub fn new(policy: RequestPolicy, redactor: Arc<Redactor>) -> Self {
        Self {
            http: reqwest::Client::new(),
            policy,
            cache: ResponseCache::default(),
            redactor,
        }
    }

    pub fn policy(&self) -> &RequestPolicy {
        &self.policy
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    fn safe_url(&self, url: &str) -> String {
        self.redactor.filter(&anonymize_url(url))
    }

    pub async fn execute(&self, spec: &RequestSpec) -> Result<HttpResponse, RequestError> {
        if spec.skip_in_dry_run && self.policy.dry_run {
            debug!(
                method = %spec.method,
                url = %self.safe_url(&spec.url),
                payload_len = spec.payload.as_ref().map_or(0, |p| p.len()),
                "skipped in dry-run mode"
            );
            return Ok(HttpResponse::skipped());
        }

        let cache_key = match spec.cache_for {
            Some(_) if !self.policy.no_cache && !self.policy.dry_run && !spec.skip_in_dry_run => {
                Some(spec.cache_key())
            }
            _ => None,
        };
        if let Some(key) = &cache_key {
            if let Some(hit) = self.cache.get(key) {
                debug!(method = %spec.method, url = %self.safe_url(&spec.url), "response cache hit");
                return Ok(hit);
            }
        }

        let resp = if spec.retry {
            self.execute_with_retry(spec).await?
        } else {
            self.execute_once(spec).await?
        };

        if let (Some(key), Some(ttl)) = (cache_key, spec.cache_for) {
            if (200..300).contains(&resp.status) {
                self.cache.put(key, ttl, resp.clone());
            }
        }
        Ok(resp)
    }

    async fn execute_with_retry(&self, spec: &RequestSpec) -> Result<HttpResponse, RequestError> {
        let mut retry: u32 = 0;
        loop {
            match self.execute_once(spec).await {
                Ok(resp) => {
                    if retry > 0 {
                        info!(
                            method = %spec.method,
                            url = %self.safe_url(&spec.url),
                            retry,
                            "retry succeeded"
                        );
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    retry += 1;
                    if retry > self.policy.retries {
                        warn!(
                            method = %spec.method,
                            url = %self.safe_url(&spec.url),
                            retries = retry - 1,
                            error = %self.redactor.filter(&err.to_string()),
                            "request failed after retries"
                        );
                        return Err(err);
                    }
                    let factor = (retry + 1) * (retry + 1);
                    let delay = self.policy.backoff_unit * factor;
                    warn!(
                        method = %spec.method,
                        url = %self.safe_url(&spec.url),
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        error = %self.redactor.filter(&truncate(&err.to_string(), MAX_PAYLOAD_PRINT)),
                        "will retry request"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn execute_once(&self, spec: &RequestSpec) -> Result<HttpResponse, RequestError> {
        let method = spec.method.to_string();
        let url = self.safe_url(&spec.url);

        let mut req = self.http.request(spec.method.clone(), &spec.url);
        for (k, v) in &spec.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(payload) = &spec.payload {
            req = req.body(payload.clone());
        }

        let transport = |source: reqwest::Error| RequestError::Transport {
            method: method.clone(),
            url: url.clone(),
            source,
        };
        let resp = req.send().await.map_err(transport)?;
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let bytes = resp.bytes().await.map_err(transport)?.to_vec();

        let body = if spec.json_statuses.contains(status) {
            let value = serde_json::from_slice(&bytes).map_err(|source| RequestError::Decode {
                method: method.clone(),
                url: url.clone(),
                status,
                source,
            })?;
            Body::Json(value)
        } else {
            Body::Raw(bytes)
        };
        let resp = HttpResponse {
            status,
            body,
            headers,
        };

        let preview = || {
            self.redactor
                .filter(&truncate(&resp.text(), MAX_PAYLOAD_PRINT))
        };
        if spec.error_statuses.contains(status) {
            debug!(payload = %self.redactor.filter(&spec.payload_preview()), "error status payload");
            return Err(RequestError::Status {
                method,
                url,
                status,
                body: preview(),
            });
        }
        if !spec.ok_statuses.is_empty() && !spec.ok_statuses.contains(status) {
            return Err(RequestError::NotSuccess {
                method,
                url,
                status,
                body: preview(),
            });
        }
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serve;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn client(retries: u32, dry_run: bool) -> RequestClient {
        RequestClient::new(
            RequestPolicy {
                retries,
                backoff_unit: Duration::from_millis(1),
                dry_run,
                no_cache: false,
            },
            Arc::new(Redactor::new()),
        )
    }

    fn counting_router(status: StatusCode, hits: Arc<AtomicUsize>) -> Router {
        Router::new().route(
            "/r",
            get(move || {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    (status, "{\"ok\":true}")
                }
            })
            .post(|| async { "{}" }),
        )
    }

    #[test]
    fn status_ranges() {
        let r = StatusRanges::new(&[(200, 201), (404, 404)]);
        assert!(r.contains(200) && r.contains(201) && r.contains(404));
        assert!(!r.contains(202));
        assert!(StatusRanges::none().is_empty());
    }

    #[tokio::test]
    async fn always_failing_request_is_attempted_retries_plus_one() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(counting_router(StatusCode::INTERNAL_SERVER_ERROR, hits.clone())).await;
        let spec = RequestSpec::new(Method::GET, format!("{}/r", base)).error_statuses(&[(400, 599)]);

        let err = client(3, false).execute(&spec).await.unwrap_err();
        assert!(matches!(err, RequestError::Status { status: 500, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn no_retry_is_attempted_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(counting_router(StatusCode::BAD_GATEWAY, hits.clone())).await;
        let spec = RequestSpec::new(Method::GET, format!("{}/r", base))
            .ok_statuses(&[(200, 200)])
            .no_retry();

        let err = client(5, false).execute(&spec).await.unwrap_err();
        assert!(matches!(err, RequestError::NotSuccess { status: 502, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transport_errors_are_retried() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let spec = RequestSpec::new(Method::GET, format!("http://127.0.0.1:{}/r", port));
        let err = client(1, false).execute(&spec).await.unwrap_err();
        assert!(matches!(err, RequestError::Transport { .. }));
        assert_eq!(err.status(), None);
    }

    #[tokio::test]
    async fn json_statuses_parse_body() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(counting_router(StatusCode::OK, hits)).await;
        let spec = RequestSpec::new(Method::GET, format!("{}/r", base)).json_statuses(&[(200, 299)]);
        let resp = client(0, false).execute(&spec).await.unwrap();
        assert_eq!(resp.json().unwrap()["ok"], Value::Bool(true));
    }

    #[tokio::test]
    async fn cached_get_hits_server_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(counting_router(StatusCode::OK, hits.clone())).await;
        let spec = RequestSpec::new(Method::GET, format!("{}/r", base))
            .cache_for(Duration::from_secs(60));

        let c = client(0, false);
        c.execute(&spec).await.unwrap();
        c.execute(&spec).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(c.cache().len(), 1);
    }

    #[tokio::test]
    async fn cache_bypassed_in_dry_run() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(counting_router(StatusCode::OK, hits.clone())).await;
        let spec = RequestSpec::new(Method::GET, format!("{}/r", base))
            .cache_for(Duration::from_secs(60));

        let c = client(0, true);
        c.execute(&spec).await.unwrap();
        c.execute(&spec).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(c.cache().is_empty());
    }

    #[tokio::test]
    async fn mutating_request_skipped_in_dry_run() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/w",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    "{}"
                }
            }),
        );
        let base = serve(router).await;
        let spec = RequestSpec::new(Method::POST, format!("{}/w", base)).mutating();

        let resp = client(0, true).execute(&spec).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        client(0, false).execute(&spec).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
