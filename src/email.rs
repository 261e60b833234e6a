//! Email address validation.
//!
//! An address is valid when it is 6 to 254 bytes long, matches the
//! address pattern, and its domain publishes at least one MX record.
//! Results for addresses and domains are cached for the process lifetime.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use regex::Regex;
use tracing::debug;

static EMAIL_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"^[\]\[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$",
    )
    .ok()
});

const MX_ATTEMPTS: u64 = 3;

/// Syntax check only.
pub fn matches_email_syntax(email: &str) -> bool {
    EMAIL_RE.as_ref().is_some_and(|re| re.is_match(email))
}

#[async_trait]
pub trait DomainValidator: Send + Sync {
    async fn has_mx(&self, domain: &str) -> bool;
}

/// Accepts every domain; used when MX checks are disabled.
pub struct AnyDomain;

#[async_trait]
impl DomainValidator for AnyDomain {
    async fn has_mx(&self, _domain: &str) -> bool {
        true
    }
}

/// Looks up MX records through the system resolver configuration.
pub struct MxValidator {
    resolver: TokioAsyncResolver,
}

impl MxValidator {
    pub fn new() -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        }
    }
}

impl Default for MxValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DomainValidator for MxValidator {
    async fn has_mx(&self, domain: &str) -> bool {
        for attempt in 1..=MX_ATTEMPTS {
            match self.resolver.mx_lookup(domain).await {
                Ok(lookup) => return lookup.iter().next().is_some(),
                Err(e) => {
                    if let ResolveErrorKind::NoRecordsFound { .. } = e.kind() {
                        return false;
                    }
                    debug!(domain, attempt, error = %e, "MX lookup failed");
                    if attempt < MX_ATTEMPTS {
                        tokio::time::sleep(Duration::from_secs(attempt)).await;
                    }
                }
            }
        }
        false
    }
}

pub struct EmailValidator {
    domains: Arc<dyn DomainValidator>,
    emails: RwLock<HashMap<String, bool>>,
    domain_cache: RwLock<HashMap<String, bool>>,
}

impl EmailValidator {
    pub fn new(domains: Arc<dyn DomainValidator>) -> Self {
        Self {
            domains,
            emails: RwLock::new(HashMap::new()),
            domain_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Validator that resolves MX records, or skips them when `check_mx` is off.
    pub fn with_mx(check_mx: bool) -> Self {
        if check_mx {
            Self::new(Arc::new(MxValidator::new()))
        } else {
            Self::new(Arc::new(AnyDomain))
        }
    }

    pub async fn is_valid(&self, email: &str) -> bool {
        let cached = read(&self.emails).get(email).copied();
        if let Some(hit) = cached {
            return hit;
        }
        let valid = self.check(email).await;
        write(&self.emails).insert(email.to_string(), valid);
        valid
    }

    async fn check(&self, email: &str) -> bool {
        if !(6..=254).contains(&email.len()) || !matches_email_syntax(email) {
            return false;
        }
        let domain = match email.split_once('@') {
            Some((_, d)) => d,
            None => return false,
        };
        let cached = read(&self.domain_cache).get(domain).copied();
        if let Some(hit) = cached {
            return hit;
        }
        let valid = self.domains.has_mx(domain).await;
        write(&self.domain_cache).insert(domain.to_string(), valid);
        valid
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}
