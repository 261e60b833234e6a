//! Deterministic content hashes for items and identities.
//!
//! Two interchangeable strategies exist. [`NativeHash`] is the current
//! algorithm. [`LegacyHash`] reproduces the identity and item ids written
//! by the historical Python tooling so previously stored rows keep their
//! primary keys. Both are SHA-1 over a `:`-joined string; they agree on
//! plain ASCII input and differ in how they treat non-ASCII text.
//!
//! [`IdentityHasher`] wraps a strategy and memoizes results for the
//! lifetime of the owning engine.

use std::collections::HashMap;
use std::sync::Mutex;

use sha1::{Digest, Sha1};
use thiserror::Error;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::models::{MISSING, NONE};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HashError {
    #[error("no arguments to hash")]
    NoArguments,
    #[error("empty argument at position {position} not allowed")]
    EmptyArgument { position: usize },
    #[error("identity source must not be empty")]
    EmptySource,
}

/// A versioned hashing algorithm.
pub trait HashStrategy: Send + Sync {
    /// Short label used in logs (`"native"`, `"legacy"`).
    fn name(&self) -> &'static str;

    /// Hash of ordered, non-empty item key parts.
    fn item_id(&self, args: &[&str]) -> Result<String, HashError>;

    /// Hash of `(source, email, name, username)`.
    ///
    /// `None` renders as `None`; `Some("")` stays empty.
    fn identity_id(
        &self,
        source: &str,
        email: Option<&str>,
        name: Option<&str>,
        username: Option<&str>,
    ) -> Result<String, HashError>;
}

/// Select a strategy by the run-wide compatibility flag.
pub fn strategy(legacy: bool) -> Box<dyn HashStrategy> {
    if legacy {
        Box::new(LegacyHash)
    } else {
        Box::new(NativeHash)
    }
}

fn sha1_hex(input: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// NFKD, then drop everything outside printable ASCII.
fn strip_printable_ascii(s: &str) -> String {
    s.nfkd().filter(|c| (' '..='~').contains(c)).collect()
}

/// NFD, then drop combining marks.
fn unaccent(s: &str) -> String {
    s.nfd().filter(|c| !is_combining_mark(*c)).collect()
}

fn identity_field(value: Option<&str>) -> &str {
    match value {
        None | Some(MISSING) => NONE,
        Some(v) => v,
    }
}

fn check_non_empty(args: &[&str]) -> Result<(), HashError> {
    if args.is_empty() {
        return Err(HashError::NoArguments);
    }
    match args.iter().position(|a| a.is_empty()) {
        Some(position) => Err(HashError::EmptyArgument { position }),
        None => Ok(()),
    }
}

pub struct NativeHash;

impl HashStrategy for NativeHash {
    fn name(&self) -> &'static str {
        "native"
    }

    fn item_id(&self, args: &[&str]) -> Result<String, HashError> {
        check_non_empty(args)?;
        let joined = args
            .iter()
            .map(|a| strip_printable_ascii(a))
            .collect::<Vec<_>>()
            .join(":");
        Ok(sha1_hex(&joined))
    }

    fn identity_id(
        &self,
        source: &str,
        email: Option<&str>,
        name: Option<&str>,
        username: Option<&str>,
    ) -> Result<String, HashError> {
        if source.is_empty() {
            return Err(HashError::EmptySource);
        }
        let joined = [
            source,
            identity_field(email),
            identity_field(name),
            identity_field(username),
        ]
        .iter()
        .map(|a| strip_printable_ascii(a))
        .collect::<Vec<_>>()
        .join(":");
        Ok(sha1_hex(&joined.to_lowercase()))
    }
}

pub struct LegacyHash;

impl HashStrategy for LegacyHash {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn item_id(&self, args: &[&str]) -> Result<String, HashError> {
        check_non_empty(args)?;
        Ok(sha1_hex(&args.join(":")))
    }

    fn identity_id(
        &self,
        source: &str,
        email: Option<&str>,
        name: Option<&str>,
        username: Option<&str>,
    ) -> Result<String, HashError> {
        if source.is_empty() {
            return Err(HashError::EmptySource);
        }
        let joined = format!(
            "{}:{}:{}:{}",
            source,
            identity_field(email),
            unaccent(identity_field(name)),
            identity_field(username)
        );
        Ok(sha1_hex(&joined.to_lowercase()))
    }
}

/// Memoizing front for a [`HashStrategy`].
pub struct IdentityHasher {
    strategy: Box<dyn HashStrategy>,
    items: Mutex<HashMap<Vec<String>, String>>,
    identities: Mutex<HashMap<IdentityKey, String>>,
}

type IdentityKey = (String, Option<String>, Option<String>, Option<String>);

impl IdentityHasher {
    pub fn new(strategy: Box<dyn HashStrategy>) -> Self {
        Self {
            strategy,
            items: Mutex::new(HashMap::new()),
            identities: Mutex::new(HashMap::new()),
        }
    }

    pub fn for_mode(legacy: bool) -> Self {
        Self::new(strategy(legacy))
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn item_id(&self, args: &[&str]) -> Result<String, HashError> {
        let key: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        if let Some(hit) = lock(&self.items).get(&key) {
            return Ok(hit.clone());
        }
        let id = self.strategy.item_id(args)?;
        lock(&self.items).insert(key, id.clone());
        Ok(id)
    }

    pub fn identity_id(
        &self,
        source: &str,
        email: Option<&str>,
        name: Option<&str>,
        username: Option<&str>,
    ) -> Result<String, HashError> {
        let key: IdentityKey = (
            source.to_string(),
            email.map(str::to_string),
            name.map(str::to_string),
            username.map(str::to_string),
        );
        if let Some(hit) = lock(&self.identities).get(&key) {
            return Ok(hit.clone());
        }
        let id = self.strategy.identity_id(source, email, name, username)?;
        lock(&self.identities).insert(key, id.clone());
        Ok(id)
    }

    /// Number of memoized identity hashes.
    pub fn cached_identities(&self) -> usize {
        lock(&self.identities).len()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_hash_known_values() {
        for s in [strategy(false), strategy(true)] {
            assert_eq!(
                s.identity_id("git", None, None, None).unwrap(),
                "a9d071f167dbd1e8a643dbf14fe00cad9cfb5d6a"
            );
            assert_eq!(
                s.identity_id("git", Some("a@b.com"), Some("John Doe"), Some("jdoe"))
                    .unwrap(),
                "fe83fb33e29c198f30dd1a21c6faf7a175c875a3"
            );
            assert_eq!(
                s.identity_id("git", Some(""), Some("John Doe"), Some("jdoe"))
                    .unwrap(),
                "de08c9e3201f3bcb71dec09339e1d381e0ddba8e"
            );
        }
    }

    #[test]
    fn nil_rendering_hashes_as_none() {
        let s = NativeHash;
        assert_eq!(
            s.identity_id("git", Some("<nil>"), Some("<nil>"), Some("<nil>"))
                .unwrap(),
            s.identity_id("git", None, None, None).unwrap()
        );
    }

    #[test]
    fn accented_names_agree_between_modes() {
        let native = NativeHash
            .identity_id("git", Some("a@b.com"), Some("José"), Some("jdoe"))
            .unwrap();
        let legacy = LegacyHash
            .identity_id("git", Some("a@b.com"), Some("José"), Some("jdoe"))
            .unwrap();
        assert_eq!(native, "b75f0938721f6ae560668de2219c1db229844372");
        assert_eq!(native, legacy);
    }

    #[test]
    fn non_latin_names_differ_between_modes() {
        let native = NativeHash
            .identity_id("git", Some("a@b.com"), Some("東京都"), Some("jdoe"))
            .unwrap();
        let legacy = LegacyHash
            .identity_id("git", Some("a@b.com"), Some("東京都"), Some("jdoe"))
            .unwrap();
        assert_ne!(native, legacy);
    }

    #[test]
    fn changing_a_field_changes_the_id() {
        let s = NativeHash;
        let a = s
            .identity_id("git", Some("a@b.com"), Some("x"), Some("y"))
            .unwrap();
        let b = s
            .identity_id("git", Some("a@b.com"), Some("x"), Some("z"))
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn empty_source_rejected() {
        assert_eq!(
            NativeHash.identity_id("", None, None, Some("x")),
            Err(HashError::EmptySource)
        );
        assert_eq!(
            LegacyHash.identity_id("", None, None, Some("x")),
            Err(HashError::EmptySource)
        );
    }

    #[test]
    fn item_hash() {
        assert_eq!(
            NativeHash
                .item_id(&["https://github.com/x/y", "123"])
                .unwrap(),
            "5adb1706565754139663f8c436e5d948929c04c5"
        );
        assert_eq!(
            LegacyHash.item_id(&["a", ""]),
            Err(HashError::EmptyArgument { position: 1 })
        );
        assert_eq!(NativeHash.item_id(&[]), Err(HashError::NoArguments));
    }

    #[test]
    fn hasher_memoizes() {
        let hasher = IdentityHasher::for_mode(false);
        let a = hasher
            .identity_id("git", Some("a@b.com"), None, Some("jdoe"))
            .unwrap();
        let b = hasher
            .identity_id("git", Some("a@b.com"), None, Some("jdoe"))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(hasher.cached_identities(), 1);
    }

    #[test]
    fn memo_keeps_colon_bearing_tuples_apart() {
        let hasher = IdentityHasher::for_mode(true);
        let first = hasher
            .identity_id("git", Some("a:é"), Some("x"), Some("y"))
            .unwrap();
        let second = hasher
            .identity_id("git", Some("a"), Some("é:x"), Some("y"))
            .unwrap();
        assert_eq!(
            first,
            LegacyHash
                .identity_id("git", Some("a:é"), Some("x"), Some("y"))
                .unwrap()
        );
        assert_eq!(
            second,
            LegacyHash
                .identity_id("git", Some("a"), Some("é:x"), Some("y"))
                .unwrap()
        );
        assert_ne!(first, second);
        assert_eq!(hasher.cached_identities(), 2);
    }
}
