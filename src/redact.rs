//! Secret redaction for log lines and error messages.

use std::collections::BTreeSet;
use std::sync::{LazyLock, RwLock};

use regex::Regex;

pub const REDACTED: &str = "[redacted]";

static URL_CREDENTIALS: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(^.*)(://)(.*@)(.*$)").ok());

/// Set of known secrets replaced by [`REDACTED`] wherever they appear.
#[derive(Default)]
pub struct Redactor {
    secrets: RwLock<BTreeSet<String>>,
}

impl Redactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a secret. Values of three characters or fewer are ignored.
    pub fn add(&self, secret: &str) {
        if secret.len() > 3 {
            self.secrets
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(secret.to_string());
        }
    }

    /// Register the `user:password` part of a URL, if any.
    pub fn add_url_credentials(&self, url: &str) {
        if let Some((_, rest)) = url.split_once("://") {
            if let Some((creds, _)) = rest.rsplit_once('@') {
                self.add(creds);
                if let Some((_, password)) = creds.split_once(':') {
                    self.add(password);
                }
            }
        }
    }

    pub fn filter(&self, text: &str) -> String {
        let secrets = self.secrets.read().unwrap_or_else(|e| e.into_inner());
        // Longest first so a secret containing another is replaced whole.
        let mut ordered: Vec<&String> = secrets.iter().collect();
        ordered.sort_by_key(|s| std::cmp::Reverse(s.len()));
        let mut out = text.to_string();
        for secret in ordered {
            out = out.replace(secret.as_str(), REDACTED);
        }
        out
    }
}

/// Strip `user:password@` from a URL.
pub fn anonymize_url(url: &str) -> String {
    match URL_CREDENTIALS.as_ref() {
        Some(re) => re.replace_all(url, "$1$2$4").into_owned(),
        None => url.to_string(),
    }
}
