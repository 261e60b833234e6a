//! # Enrich Harness
//!
//! An ingestion and enrichment engine for collaboration-platform data.
//!
//! Enrich Harness fetches raw records from a data source into a search
//! index, extracts and deduplicates the contributor identities they
//! mention into an affiliation store, and writes enriched copies of every
//! record carrying the resolved identity and organization of each role.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌─────────────┐
//! │ DataSource  │──▶│  raw index   │──▶│  Scroller   │
//! │ fetch_raw   │   │  (bulk sink) │   │ resumable   │
//! └─────────────┘   └──────────────┘   └──────┬──────┘
//!                                             │
//!                      ┌──────────────────────┤
//!                      ▼                      ▼
//!              ┌───────────────┐     ┌─────────────────┐
//!              │  identities   │     │ enrich (bounded │
//!              │ dedup+upload  │     │  concurrency)   │
//!              └───────┬───────┘     └────────┬────────┘
//!                      ▼                      ▼
//!              ┌───────────────┐     ┌─────────────────┐
//!              │ affiliations  │◀────│    resolver     │
//!              │   (SQLite)    │     │  (cached)       │
//!              └───────────────┘     └─────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! enrich init                          # create the affiliation schema
//! enrich run                           # fetch, upload identities, enrich
//! enrich run --only-identities         # stop after the identity upload
//! enrich resume                        # show where the next run starts
//! enrich hash identity github --name "John Doe" --username jdoe
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Classified request and scroll errors |
//! | [`redact`] | Secret redaction |
//! | [`request`] | Retry-aware request layer and response cache |
//! | [`es`] | Search index wire client |
//! | [`scroll`] | Resumable scroll iterator |
//! | [`dispatch`] | Bounded concurrency dispatcher |
//! | [`bulk`] | Batch accumulator and bulk sink |
//! | [`email`] | Email syntax and MX validation |
//! | [`identities`] | Identity extraction, dedup and upload |
//! | [`resolver`] | Identity affiliation resolver |
//! | [`affiliations`] | SQLite affiliation store |
//! | [`connector`] | Data source capability trait |
//! | [`connector_http`] | Built-in JSON HTTP connector |
//! | [`enrich`] | Run orchestration |
//! | [`progress`] | Scan progress reporting |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

pub mod affiliations;
pub mod bulk;
pub mod config;
pub mod connector;
pub mod connector_http;
pub mod db;
pub mod dispatch;
pub mod email;
pub mod enrich;
pub mod error;
pub mod es;
pub mod identities;
pub mod migrate;
pub mod progress;
pub mod redact;
pub mod request;
pub mod resolver;
pub mod scroll;

#[cfg(test)]
mod test_support;
