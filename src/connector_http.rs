//! Built-in generic JSON-over-HTTP connector.
//!
//! Pages through `GET <url>?page=<n>&per_page=<size>[&since=<date>]` until
//! a short or empty page. Item fields, rich fields and role identities are
//! all located with JSON pointers taken from the `[connector]` section.
//! `X-RateLimit-Remaining` / `X-RateLimit-Reset` headers are honoured.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Method, Url};
use serde_json::Value;
use tracing::debug;

use enrich_harness_core::models::{IdentityTuple, Item, RichItem};

use crate::config::{parse_date, ConnectorConfig, RoleConfig};
use crate::connector::{pace, DataSource, RawItemSink};
use crate::request::{RequestClient, RequestSpec};
use crate::scroll::ResumePoint;

pub struct HttpJsonConnector {
    cfg: ConnectorConfig,
    origin: String,
    client: Arc<RequestClient>,
}

impl HttpJsonConnector {
    pub fn new(cfg: ConnectorConfig, client: Arc<RequestClient>) -> Self {
        let origin = cfg.origin.clone().unwrap_or_else(|| cfg.url.clone());
        Self {
            cfg,
            origin,
            client,
        }
    }

    fn page_url(&self, page: usize, since: Option<&str>) -> Result<Url> {
        let mut url = Url::parse(&self.cfg.url)
            .with_context(|| format!("invalid connector.url '{}'", self.cfg.url))?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("page", &page.to_string());
            q.append_pair("per_page", &self.cfg.per_page.to_string());
            if let Some(since) = since {
                q.append_pair("since", since);
            }
        }
        Ok(url)
    }

    fn role_config(&self, role: &str) -> Option<&RoleConfig> {
        self.cfg.roles.iter().find(|r| r.role == role)
    }
}

fn string_at(raw: &Value, pointer: Option<&str>) -> Option<String> {
    match raw.pointer(pointer?)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn identity_at(raw: &Value, role: &RoleConfig) -> IdentityTuple {
    IdentityTuple {
        name: string_at(raw, role.name.as_deref()),
        username: string_at(raw, role.username.as_deref()),
        email: string_at(raw, role.email.as_deref()),
    }
}

fn header_i64(resp: &crate::request::HttpResponse, name: &str) -> Option<i64> {
    resp.header(name).and_then(|v| v.trim().parse().ok())
}

/// `X-RateLimit-Reset` carries epoch seconds.
fn reset_epoch_ms(reset_secs: i64) -> i64 {
    reset_secs.saturating_mul(1000)
}

#[async_trait]
impl DataSource for HttpJsonConnector {
    fn name(&self) -> &str {
        &self.cfg.name
    }

    fn origin(&self) -> &str {
        &self.origin
    }

    fn tag(&self) -> Option<&str> {
        self.cfg.tag.as_deref()
    }

    fn category(&self) -> &str {
        &self.cfg.category
    }

    fn resume_needs_origin(&self) -> bool {
        self.cfg.multi_origin
    }

    fn supports_offset_from(&self) -> bool {
        self.cfg.offset_pointer.is_some()
    }

    async fn fetch_raw(&self, from: ResumePoint, sink: &RawItemSink) -> Result<()> {
        let since = match from {
            ResumePoint::Date(d) => Some(d.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ResumePoint::Start | ResumePoint::Offset(_) => None,
        };
        let mut page = 1;
        loop {
            let url = self.page_url(page, since.as_deref())?;
            let mut spec = RequestSpec::new(Method::GET, url.as_str())
                .header("Accept", "application/json")
                .json_statuses(&[(200, 299)])
                .error_statuses(&[(400, 599)]);
            if let Some(ttl) = self.cfg.cache_ttl_secs {
                spec = spec.cache_for(Duration::from_secs(ttl));
            }
            let resp = self.client.execute(&spec).await?;
            let body = resp
                .json()
                .ok_or_else(|| anyhow!("page {} of {} is not JSON", page, self.cfg.name))?;
            let items = body
                .pointer(&self.cfg.items_pointer)
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    anyhow!(
                        "page {} of {} has no item array at '{}'",
                        page,
                        self.cfg.name,
                        self.cfg.items_pointer
                    )
                })?;
            debug!(source = %self.cfg.name, page, items = items.len(), "fetched page");
            for raw in items {
                sink.push(self, raw.clone()).await?;
            }

            if let (Some(remaining), Some(reset)) = (
                header_i64(&resp, "X-RateLimit-Remaining"),
                header_i64(&resp, "X-RateLimit-Reset"),
            ) {
                pace(self, remaining, reset_epoch_ms(reset)).await;
            }

            if items.len() < self.cfg.per_page {
                break;
            }
            page += 1;
        }
        Ok(())
    }

    fn item_id(&self, raw: &Value) -> Result<String> {
        match string_at(raw, Some(&self.cfg.id_pointer)) {
            Some(id) if !id.is_empty() => Ok(id),
            _ => bail!("item has no id at '{}'", self.cfg.id_pointer),
        }
    }

    fn item_updated_on(&self, raw: &Value) -> Result<DateTime<Utc>> {
        let s = string_at(raw, Some(&self.cfg.date_pointer))
            .ok_or_else(|| anyhow!("item has no date at '{}'", self.cfg.date_pointer))?;
        parse_date(&s)
    }

    fn item_offset(&self, raw: &Value) -> Option<f64> {
        raw.pointer(self.cfg.offset_pointer.as_deref()?)?.as_f64()
    }

    fn item_identities(&self, item: &Item) -> Vec<IdentityTuple> {
        self.cfg
            .roles
            .iter()
            .map(|role| identity_at(&item.data, role))
            .filter(|t| !t.is_missing_all())
            .collect()
    }

    fn enrich_item(&self, item: &Item) -> Result<Vec<RichItem>> {
        let mut rich = RichItem::from_item(item.uuid.clone(), item);
        rich.set("category", Value::String(item.category.clone()));
        for (field, pointer) in &self.cfg.fields {
            rich.set(
                field.clone(),
                item.data.pointer(pointer).cloned().unwrap_or(Value::Null),
            );
        }
        Ok(vec![rich])
    }

    fn roles(&self, _item: &Item, _rich: &RichItem) -> Vec<String> {
        self.cfg.roles.iter().map(|r| r.role.clone()).collect()
    }

    fn role_identity(&self, item: &Item, _rich: &RichItem, role: &str) -> Option<IdentityTuple> {
        let identity = identity_at(&item.data, self.role_config(role)?);
        (!identity.is_missing_all()).then_some(identity)
    }
}
