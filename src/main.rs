//! # Enrich Harness CLI (`enrich`)
//!
//! ## Usage
//!
//! ```bash
//! enrich --config ./config/enrich.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `enrich init` | Create the affiliation database schema |
//! | `enrich run` | Fetch raw items, upload identities and enrich |
//! | `enrich resume` | Print the raw and rich resume points |
//! | `enrich hash identity <source>` | Print an identity hash |
//! | `enrich hash item <parts>...` | Print an item hash |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG`
//! (default `enrich_harness=info,enrich=info`).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use enrich_harness::config::{self, parse_date, Config};
use enrich_harness::progress::ProgressMode;
use enrich_harness::{enrich, migrate};
use enrich_harness_core::hash::IdentityHasher;

/// Enrich Harness CLI: ingest collaboration-platform records and enrich
/// them with contributor affiliations.
#[derive(Parser)]
#[command(
    name = "enrich",
    about = "Enrich Harness: ingestion and identity enrichment for collaboration-platform data",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/enrich.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the affiliation database schema.
    ///
    /// Idempotent: existing tables are left alone.
    Init,

    /// Run the phase sequence for the configured connector.
    ///
    /// Flags override the `[run]` section of the config file.
    Run {
        /// Execute database transactions but roll them back; skip index writes.
        #[arg(long)]
        dry_run: bool,

        /// Ignore stored resume points and start from the beginning.
        #[arg(long)]
        force_full: bool,

        /// Re-enrich from the configured start and stop.
        #[arg(long)]
        refresh_affs: bool,

        /// Stop after the identity upload.
        #[arg(long)]
        only_identities: bool,

        /// Skip the identity upload.
        #[arg(long)]
        no_identities: bool,

        /// Skip fetching raw items.
        #[arg(long)]
        no_raw: bool,

        /// Start from this date (YYYY-MM-DD, YYYY-MM-DD HH:MM:SS or RFC 3339).
        #[arg(long, conflicts_with = "offset_from")]
        date_from: Option<String>,

        /// Start from this numeric offset.
        #[arg(long)]
        offset_from: Option<f64>,

        /// Maximum items enriched concurrently.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Use the legacy identity hash.
        #[arg(long)]
        legacy_uuid: bool,

        /// Progress output on stderr. Default: human when stderr is a TTY.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Print the resume points of the raw and rich indexes.
    Resume,

    /// Compute content hashes.
    Hash {
        #[command(subcommand)]
        what: HashTarget,
    },
}

#[derive(Subcommand)]
enum HashTarget {
    /// Hash of `(source, email, name, username)`.
    Identity {
        source: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        legacy: bool,
    },
    /// Hash of ordered item key parts.
    Item {
        #[arg(required = true)]
        parts: Vec<String>,
        #[arg(long)]
        legacy: bool,
    },
}

#[tokio::main]
async fn main() {
    if std::env::var_os("RUST_BACKTRACE").is_none() {
        std::env::set_var("RUST_BACKTRACE", "1");
    }
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("enrich_harness=info,enrich=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Cli::parse()).await {
        error!(error = ?e, "fatal");
        eprintln!("Error: {:?}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Commands that don't require config
    if let Commands::Hash { what } = &cli.command {
        match what {
            HashTarget::Identity {
                source,
                email,
                name,
                username,
                legacy,
            } => {
                let hasher = IdentityHasher::for_mode(*legacy);
                let id = hasher.identity_id(
                    source,
                    email.as_deref(),
                    name.as_deref(),
                    username.as_deref(),
                )?;
                println!("{}", id);
            }
            HashTarget::Item { parts, legacy } => {
                let hasher = IdentityHasher::for_mode(*legacy);
                let args: Vec<&str> = parts.iter().map(String::as_str).collect();
                println!("{}", hasher.item_id(&args)?);
            }
        }
        return Ok(());
    }

    let mut cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg.affiliations).await?;
            println!("Affiliation database initialized successfully.");
        }
        Commands::Run {
            dry_run,
            force_full,
            refresh_affs,
            only_identities,
            no_identities,
            no_raw,
            date_from,
            offset_from,
            concurrency,
            legacy_uuid,
            progress,
        } => {
            let overrides = RunOverrides {
                dry_run,
                force_full,
                refresh_affs,
                only_identities,
                no_identities,
                no_raw,
                date_from,
                offset_from,
                concurrency,
                legacy_uuid,
            };
            overrides.apply(&mut cfg)?;
            let progress = progress.unwrap_or_else(ProgressMode::default_for_tty);
            enrich::run_enrich(&cfg, progress.reporter()).await?;
        }
        Commands::Resume => {
            enrich::run_resume(&cfg).await?;
        }
        Commands::Hash { .. } => {
            // Handled above (before config loading)
        }
    }

    Ok(())
}

struct RunOverrides {
    dry_run: bool,
    force_full: bool,
    refresh_affs: bool,
    only_identities: bool,
    no_identities: bool,
    no_raw: bool,
    date_from: Option<String>,
    offset_from: Option<f64>,
    concurrency: Option<usize>,
    legacy_uuid: bool,
}

impl RunOverrides {
    /// Flags only ever switch behaviour on; values replace the file's.
    fn apply(self, cfg: &mut Config) -> anyhow::Result<()> {
        let run = &mut cfg.run;
        run.dry_run |= self.dry_run;
        run.force_full |= self.force_full;
        run.refresh_affs |= self.refresh_affs;
        run.only_identities |= self.only_identities;
        run.no_identities |= self.no_identities;
        run.no_raw |= self.no_raw;
        if let Some(date) = self.date_from {
            parse_date(&date)?;
            run.date_from = Some(date);
            run.offset_from = None;
        }
        if let Some(offset) = self.offset_from {
            run.offset_from = Some(offset);
            run.date_from = None;
        }
        if let Some(n) = self.concurrency {
            run.concurrency = n;
        }
        cfg.affiliations.legacy_uuid |= self.legacy_uuid;
        run.validate()
    }
}
