//! # Comment Insights CLI (`insights`)
//!
//! ## Usage
//!
//! ```bash
//! insights --config ./config/insights.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `insights init` | Create the checkpoint and staging tables |
//! | `insights ingest <collection>` | Fetch, dedup and register new comments |
//! | `insights enrich` | Annotate pending comments and stage the relevant ones |
//! | `insights suggest` | Backfill feature suggestions for relevant comments |
//! | `insights merge` | Merge staging into the durable table |
//! | `insights run <collection>` | Ingest, enrich, suggest and merge |
//! | `insights status` | Show table counts and lease state |
//! | `insights completions <shell>` | Print shell completions |

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use comment_insights::progress::ProgressMode;
use comment_insights::{config, enrich, ingest, merge, migrate, pipeline, stats, suggest};

/// Comment Insights CLI: turn community comments into structured product
/// insights.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/insights.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "insights",
    about = "Comment Insights — dedup, annotate and merge community comments",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/insights.toml")]
    config: PathBuf,

    /// Progress output on stderr. Defaults to `human` when stderr is a
    /// terminal, otherwise `off`.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the checkpoint, lease and staging tables. Idempotent.
    Init,

    /// Fetch a collection, drop known comments and register the rest.
    Ingest {
        /// Collection (community) name.
        collection: String,

        /// Cap on items from the `hot` listing.
        #[arg(long)]
        hot: Option<usize>,

        /// Cap on items from the `new` listing.
        #[arg(long)]
        new: Option<usize>,

        /// Report counts without writing to the database.
        #[arg(long)]
        dry_run: bool,
    },

    /// Annotate every pending comment and stage the relevant set.
    Enrich {
        /// Remove a lease left behind by a killed run before starting.
        #[arg(long)]
        break_lease: bool,
    },

    /// Backfill feature suggestions for relevant comments.
    Suggest {
        /// Maximum number of comments to process.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Merge the staging table into the durable table.
    Merge,

    /// Run ingest, enrich, suggest and merge for one collection.
    Run {
        collection: String,

        #[arg(long)]
        break_lease: bool,
    },

    /// Show pipeline table counts.
    Status,

    /// Print shell completions to stdout.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("comment_insights=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "insights", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;
    let mode = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);
    let progress = mode.reporter();

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            collection,
            hot,
            new,
            dry_run,
        } => {
            ingest::run_ingest(&cfg, &collection, hot, new, dry_run).await?;
        }
        Commands::Enrich { break_lease } => {
            enrich::run_enrich(&cfg, break_lease, progress.as_ref()).await?;
        }
        Commands::Suggest { limit } => {
            suggest::run_suggest(&cfg, limit, progress.as_ref()).await?;
        }
        Commands::Merge => {
            merge::run_merge(&cfg).await?;
        }
        Commands::Run {
            collection,
            break_lease,
        } => {
            pipeline::run_collection(&cfg, &collection, break_lease, progress.as_ref()).await?;
        }
        Commands::Status => {
            stats::run_status(&cfg).await?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}
