use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub es: EsConfig,
    pub affiliations: AffiliationsConfig,
    #[serde(default)]
    pub run: RunConfig,
    pub connector: ConnectorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EsConfig {
    pub url: String,
    pub raw_index: String,
    pub rich_index: String,
    #[serde(default = "default_bulk_size")]
    pub bulk_size: usize,
    #[serde(default = "default_scroll_size")]
    pub scroll_size: usize,
    #[serde(default = "default_scroll_wait")]
    pub scroll_wait: String,
    #[serde(default = "default_date_field")]
    pub date_field: String,
    #[serde(default = "default_offset_field")]
    pub offset_field: String,
    /// Field holding the origin term; defaults to `tag` when the connector
    /// carries a tag and `origin` otherwise.
    #[serde(default)]
    pub origin_field: Option<String>,
    #[serde(default = "default_overload_wait_secs")]
    pub overload_wait_secs: u64,
    #[serde(default = "default_overload_max_secs")]
    pub overload_max_secs: u64,
    /// Expired-cursor restarts tolerated per scan.
    #[serde(default = "default_max_expiry_restarts")]
    pub max_expiry_restarts: u32,
}

fn default_bulk_size() -> usize {
    1000
}
fn default_scroll_size() -> usize {
    1000
}
fn default_scroll_wait() -> String {
    "10m".to_string()
}
fn default_date_field() -> String {
    "metadata__updated_on".to_string()
}
fn default_offset_field() -> String {
    "offset".to_string()
}
fn default_overload_wait_secs() -> u64 {
    10
}
fn default_overload_max_secs() -> u64 {
    1800
}
fn default_max_expiry_restarts() -> u32 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct AffiliationsConfig {
    pub db_path: PathBuf,
    #[serde(default = "default_db_bulk_size")]
    pub db_bulk_size: usize,
    #[serde(default)]
    pub legacy_uuid: bool,
    /// Resolve MX records when validating backfilled emails.
    #[serde(default = "default_true")]
    pub validate_mx: bool,
}

fn default_db_bulk_size() -> usize {
    1000
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct RunConfig {
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub force_full: bool,
    #[serde(default)]
    pub refresh_affs: bool,
    #[serde(default)]
    pub only_identities: bool,
    #[serde(default)]
    pub no_identities: bool,
    #[serde(default)]
    pub no_raw: bool,
    #[serde(default = "default_true")]
    pub enrich: bool,
    #[serde(default)]
    pub date_from: Option<String>,
    #[serde(default)]
    pub offset_from: Option<f64>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Unit of the `(n+1)^2` retry backoff.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default)]
    pub no_cache: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            force_full: false,
            refresh_affs: false,
            only_identities: false,
            no_identities: false,
            no_raw: false,
            enrich: true,
            date_from: None,
            offset_from: None,
            concurrency: default_concurrency(),
            retries: default_retries(),
            backoff_ms: default_backoff_ms(),
            no_cache: false,
        }
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
fn default_retries() -> u32 {
    5
}
fn default_backoff_ms() -> u64 {
    1000
}

impl RunConfig {
    /// Check that the phase flags and resume bounds are consistent.
    pub fn validate(&self) -> Result<()> {
        if self.date_from.is_some() && self.offset_from.is_some() {
            bail!("run.date_from and run.offset_from are mutually exclusive");
        }
        if self.only_identities && self.no_identities {
            bail!("run.only_identities and run.no_identities are mutually exclusive");
        }
        if self.refresh_affs && self.only_identities {
            bail!("run.refresh_affs cannot be combined with run.only_identities");
        }
        if self.concurrency == 0 {
            bail!("run.concurrency must be >= 1");
        }
        if let Some(date) = &self.date_from {
            parse_date(date).with_context(|| format!("invalid run.date_from '{}'", date))?;
        }
        Ok(())
    }

    pub fn date_from(&self) -> Result<Option<DateTime<Utc>>> {
        self.date_from.as_deref().map(parse_date).transpose()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConnectorConfig {
    /// Data source name, used as the identity source.
    pub name: String,
    pub url: String,
    /// Origin stamped on every item; defaults to `url`.
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default = "default_category")]
    pub category: String,
    /// JSON pointer to the array of items in each page ("" = whole body).
    #[serde(default)]
    pub items_pointer: String,
    pub id_pointer: String,
    pub date_pointer: String,
    #[serde(default)]
    pub offset_pointer: Option<String>,
    #[serde(default = "default_per_page")]
    pub per_page: usize,
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,
    /// Item is stored in an index shared by several origins.
    #[serde(default)]
    pub multi_origin: bool,
    /// Rich field name -> JSON pointer into the raw payload.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub roles: Vec<RoleConfig>,
}

fn default_category() -> String {
    "item".to_string()
}
fn default_per_page() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RoleConfig {
    pub role: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl EsConfig {
    pub fn origin_field(&self, has_tag: bool) -> &str {
        match &self.origin_field {
            Some(field) => field,
            None if has_tag => "tag",
            None => "origin",
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let mut config: Config =
        toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate es
    if config.es.url.trim().is_empty() {
        bail!("es.url must not be empty");
    }
    config.es.url = config.es.url.trim_end_matches('/').to_string();
    if config.es.raw_index.is_empty() || config.es.rich_index.is_empty() {
        bail!("es.raw_index and es.rich_index must not be empty");
    }
    if config.es.bulk_size == 0 {
        bail!("es.bulk_size must be > 0");
    }
    if config.es.scroll_size == 0 {
        bail!("es.scroll_size must be > 0");
    }
    parse_wait(&config.es.scroll_wait)
        .with_context(|| format!("invalid es.scroll_wait '{}'", config.es.scroll_wait))?;

    // Validate affiliations
    if config.affiliations.db_bulk_size == 0 {
        bail!("affiliations.db_bulk_size must be > 0");
    }

    // Validate connector
    if config.connector.name.is_empty() {
        bail!("connector.name must not be empty");
    }
    if config.connector.per_page == 0 {
        bail!("connector.per_page must be > 0");
    }

    config.run.validate()?;

    Ok(config)
}

/// Parse a scroll keep-alive such as `10m`, `59m`, `30s` or `1h` into seconds.
pub fn parse_wait(wait: &str) -> Result<u64> {
    let wait = wait.trim();
    let split = wait
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(wait.len());
    let (num, unit) = wait.split_at(split);
    let n: u64 = num
        .parse()
        .with_context(|| format!("missing number in '{}'", wait))?;
    let mult = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        other => bail!("unknown time unit '{}'", other),
    };
    Ok(n * mult)
}

/// Parse `YYYY-MM-DD`, `YYYY-MM-DD HH:MM:SS` or RFC 3339 as UTC.
pub fn parse_date(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(dt.and_utc());
        }
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("unrecognized date '{}'", s))?;
    Ok(date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[es]
url = "http://localhost:9200/"
raw_index = "sds-raw"
rich_index = "sds"

[affiliations]
db_path = "./data/affs.sqlite"

[connector]
name = "tracker"
url = "https://tracker.example.com/api/issues"
id_pointer = "/id"
date_pointer = "/updated_at"
"#;

    #[test]
    fn defaults_applied() {
        let cfg = parse_config(MINIMAL).unwrap();
        assert_eq!(cfg.es.url, "http://localhost:9200");
        assert_eq!(cfg.es.bulk_size, 1000);
        assert_eq!(cfg.es.scroll_size, 1000);
        assert_eq!(cfg.es.scroll_wait, "10m");
        assert_eq!(cfg.es.max_expiry_restarts, 10);
        assert_eq!(cfg.affiliations.db_bulk_size, 1000);
        assert_eq!(cfg.run.retries, 5);
        assert!(cfg.run.enrich);
        assert!(cfg.run.concurrency >= 1);
        assert_eq!(cfg.es.origin_field(false), "origin");
        assert_eq!(cfg.es.origin_field(true), "tag");
    }

    #[test]
    fn date_and_offset_conflict() {
        let content = format!("{}\n[run]\ndate_from = \"2020-01-01\"\noffset_from = 3.0\n", MINIMAL);
        let err = parse_config(&content).unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn identity_flags_conflict() {
        let content = format!(
            "{}\n[run]\nonly_identities = true\nno_identities = true\n",
            MINIMAL
        );
        assert!(parse_config(&content).is_err());
    }

    #[test]
    fn wait_units() {
        assert_eq!(parse_wait("10m").unwrap(), 600);
        assert_eq!(parse_wait("59m").unwrap(), 3540);
        assert_eq!(parse_wait("30s").unwrap(), 30);
        assert!(parse_wait("ten").is_err());
        assert!(parse_wait("10y").is_err());
    }

    #[test]
    fn date_formats() {
        let d = parse_date("2021-03-04").unwrap();
        assert_eq!(d.to_rfc3339(), "2021-03-04T00:00:00+00:00");
        let d = parse_date("2021-03-04 05:06:07").unwrap();
        assert_eq!(d.to_rfc3339(), "2021-03-04T05:06:07+00:00");
        let d = parse_date("2021-03-04T05:06:07+02:00").unwrap();
        assert_eq!(d.to_rfc3339(), "2021-03-04T03:06:07+00:00");
        assert!(parse_date("yesterday").is_err());
    }
}
