//! # Enrich Harness Core
//!
//! Shared logic for Enrich Harness: record models, deterministic identity
//! hashing, and the affiliation store abstraction.
//!
//! This crate contains no tokio, sqlx, network or filesystem I/O. Storage
//! backends and the search-index client live in the `enrich-harness` crate.

pub mod hash;
pub mod models;
pub mod store;
