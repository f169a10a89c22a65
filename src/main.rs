//! # Build Harvest CLI (`harvest`)
//!
//! The `harvest` binary is the primary interface for Build Harvest. It
//! provides commands for database initialization, guide listing, syncing
//! sources into the local store, periodic syncs, and cache and catalog
//! maintenance.
//!
//! ## Usage
//!
//! ```bash
//! harvest --config ./config/harvest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `harvest init` | Create the SQLite database and run schema migrations |
//! | `harvest sources` | List configured guide sources and their health |
//! | `harvest guides <source>` | List the guides a source publishes |
//! | `harvest sync <source>` | Ingest guides, planners and item usages |
//! | `harvest schedule <source> --every N` | Sync every N seconds |
//! | `harvest catalog check` | Load the item catalog and report rejected entries |
//! | `harvest cache status` | Show cache entry counts and ages |
//! | `harvest cache prune` | Delete expired cache entries |
//! | `harvest stats` | Summarize what the store holds |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! harvest init --config ./config/harvest.toml
//!
//! # Sync every configured source with 8 workers
//! harvest sync all --workers 8
//!
//! # Re-list guides ignoring the guide cache, then sync one guide
//! harvest sync web:maxroll --force-refresh
//! harvest sync web:maxroll --guide whirlwind-barbarian
//! ```

use std::path::PathBuf;
use std::time::Duration;

use build_harvest::ingest::{self, SyncOptions};
use build_harvest::progress::ProgressMode;
use build_harvest::{cache, catalog, config, logging, migrate, schedule, sources, stats};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Build Harvest CLI: ingest game build guides into a local item-usage store.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/harvest.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "harvest",
    about = "Build Harvest: ingest game build guides into a local item-usage store",
    version,
    long_about = "Build Harvest lists published build guides from guide sites, resolves the \
    planner documents each guide embeds, parses their profiles into item usages, enriches them \
    from a master item catalog, and stores the result in SQLite."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/harvest.toml`. Database, cache, HTTP, sync,
    /// catalog and source settings are read from this file.
    #[arg(long, global = true, default_value = "./config/harvest.toml")]
    config: PathBuf,

    /// Log at debug level (overridden by `RUST_LOG`).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the guides, profiles and
    /// item_usages tables. Running it more than once is safe.
    Init,

    /// List configured guide sources and their status.
    Sources,

    /// List the guides a source publishes.
    Guides {
        /// Source specifier: `all`, a label (`web:maxroll`) or a name.
        source: String,

        /// Ignore the guide cache and re-list from the site.
        #[arg(long)]
        force_refresh: bool,

        /// Search query passed to the site's search API.
        #[arg(long)]
        query: Option<String>,

        /// Print guides as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Ingest guides from a source.
    ///
    /// Lists guides, resolves their planner ids, fetches and parses planner
    /// payloads, enriches item usages from the catalog and stores them.
    /// A failure in one guide never aborts the others.
    Sync {
        /// Source specifier: `all`, a label (`web:maxroll`) or a name.
        source: String,

        /// Ignore the guide cache and re-list from the site.
        #[arg(long)]
        force_refresh: bool,

        /// Sync a single guide, by slug or URL.
        ///
        /// A slug shared by several listed guides is rejected; pass the URL.
        #[arg(long)]
        guide: Option<String>,

        /// Number of guides processed in parallel (overrides `[sync].workers`).
        #[arg(long)]
        workers: Option<usize>,

        /// Search query passed to the site's search API.
        #[arg(long)]
        query: Option<String>,

        /// Print results as JSON and report progress as JSON lines.
        #[arg(long)]
        json: bool,
    },

    /// Sync a source periodically, never overlapping runs.
    Schedule {
        /// Source specifier: `all`, a label (`web:maxroll`) or a name.
        source: String,

        /// Seconds between the starts of consecutive runs.
        #[arg(long)]
        every: u64,

        /// Stop after this many runs.
        #[arg(long)]
        max_runs: Option<u32>,

        /// Number of guides processed in parallel (overrides `[sync].workers`).
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Item catalog maintenance.
    Catalog {
        #[command(subcommand)]
        action: CatalogAction,
    },

    /// Cache maintenance.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Summarize guides, profiles and item usages in the store.
    Stats,

    /// Print shell completions to stdout.
    Completions {
        shell: Shell,
    },
}

/// Item catalog subcommands.
#[derive(Subcommand)]
enum CatalogAction {
    /// Load the configured catalog and list every rejected entry.
    Check,
}

/// Cache subcommands.
#[derive(Subcommand)]
enum CacheAction {
    /// Show entry counts, expired entries and oldest entry per cache area.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Delete expired and unreadable planner and catalog entries.
    Prune,
}

/// Cancel `token` on Ctrl-C so running syncs stop between guides.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; finishing in-flight guides");
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    // Commands that don't require config
    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "harvest", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sources => {
            sources::list_sources(&cfg)?;
        }
        Commands::Guides {
            source,
            force_refresh,
            query,
            json,
        } => {
            sources::list_guides(&cfg, &source, query.as_deref(), force_refresh, json).await?;
        }
        Commands::Sync {
            source,
            force_refresh,
            guide,
            workers,
            query,
            json,
        } => {
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            let opts = SyncOptions {
                force_refresh,
                guide,
                workers,
                query,
                json,
                progress: if json {
                    ProgressMode::Json
                } else {
                    ProgressMode::default_for_tty()
                },
            };
            ingest::run_sync(&cfg, &source, &opts, cancel).await?;
        }
        Commands::Schedule {
            source,
            every,
            max_runs,
            workers,
        } => {
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            let opts = SyncOptions {
                force_refresh: false,
                guide: None,
                workers,
                query: None,
                json: false,
                progress: ProgressMode::Off,
            };
            schedule::run_schedule(
                &cfg,
                &source,
                &opts,
                Duration::from_secs(every),
                max_runs,
                cancel,
            )
            .await?;
        }
        Commands::Catalog { action } => match action {
            CatalogAction::Check => {
                catalog::run_catalog_check(&cfg).await?;
            }
        },
        Commands::Cache { action } => match action {
            CacheAction::Status { json } => {
                cache::run_cache_status(&cfg.cache, json)?;
            }
            CacheAction::Prune => {
                cache::run_cache_prune(&cfg.cache)?;
            }
        },
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Completions { .. } => {
            // Handled above (before config loading)
        }
    }

    Ok(())
}
