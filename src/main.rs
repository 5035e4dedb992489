//! # ThreatScope CLI (`tscope`)
//!
//! The `tscope` binary is the primary interface for ThreatScope. It provides
//! commands for database initialization, report ingestion, retrieval,
//! grounded question answering, and index maintenance.
//!
//! ## Usage
//!
//! ```bash
//! tscope --config ./config/threatscope.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `tscope init` | Create the SQLite database and run schema migrations |
//! | `tscope ingest <paths…>` | Ingest report files (txt, log, pdf) |
//! | `tscope ask "<question>"` | Answer a question grounded in ingested reports |
//! | `tscope search "<query>"` | Retrieve ranked chunks for a query |
//! | `tscope analyze <file>` | One-shot analysis of a single report file |
//! | `tscope get <id>` | Print a document with chunks and annotations |
//! | `tscope delete <id>` | Delete a document and everything derived from it |
//! | `tscope iocs` | List extracted indicators of compromise |
//! | `tscope techniques` | List catalog techniques with corpus counts |
//! | `tscope embed pending` | Backfill missing or stale embeddings |
//! | `tscope embed rebuild` | Delete and regenerate all embeddings |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! tscope init --config ./config/threatscope.toml
//!
//! # Ingest a directory of incident reports
//! tscope ingest ./reports
//!
//! # Ask with a technique filter, JSON output
//! tscope ask "how did the attacker move laterally?" --technique T1021.001 --json
//!
//! # Search restricted to chunks that sight an IP indicator
//! tscope search "beacon traffic" --ioc-type ip --limit 10
//!
//! # Analyze one report without touching the database
//! tscope analyze ./reports/incident-042.txt --mode incident-response
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use threatscope::config::load_config;
use threatscope::generate::AnalysisMode;
use threatscope::models::IocType;
use threatscope::{db, embed_cmd, generate, ingest, inspect, migrate, retrieve};

/// ThreatScope CLI, a local-first retrieval-augmented analysis pipeline
/// for threat intelligence reports and incident logs.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/threatscope.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "tscope",
    about = "ThreatScope: retrieval-augmented analysis for threat reports and incident logs",
    version,
    long_about = "ThreatScope ingests threat intelligence reports and incident logs (txt, log, pdf), \
    annotates them with ATT&CK-style techniques and extracted indicators of compromise, embeds them \
    into a SQLite-backed vector index, and answers analyst questions with citations into the \
    ingested evidence."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/threatscope.toml`. Database, catalog, chunking,
    /// retrieval, embedding, and generation settings are read from this file.
    #[arg(long, global = true, default_value = "./config/threatscope.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (documents,
    /// chunks, technique_annotations, iocs, ioc_chunks, embeddings).
    /// This command is idempotent.
    Init,

    /// Ingest report files or directories.
    ///
    /// Directories are walked with the configured include/exclude globs;
    /// explicitly named files are always taken. Each document is normalized,
    /// chunked, annotated with techniques and IOCs, optionally embedded, and
    /// stored in one transaction. A failing document is reported and skipped;
    /// the rest of the batch still commits.
    Ingest {
        /// Files or directories to ingest.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Show what would be ingested without writing to the database.
        #[arg(long)]
        dry_run: bool,

        /// Maximum number of files to process.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Answer a question grounded in the ingested corpus.
    ///
    /// Retrieves the best-matching chunks, composes a mode-specific prompt,
    /// invokes the configured completion model, and validates that the answer
    /// cites retrieved chunks. Ungrounded answers are labeled as such.
    Ask {
        /// The analyst question.
        question: String,

        /// Analysis mode: `incident-response`, `threat-intel`, or `hybrid`.
        /// Auto-detected from the question when omitted.
        #[arg(long)]
        mode: Option<AnalysisMode>,

        /// Restrict retrieval to chunks annotated with this technique id.
        #[arg(long)]
        technique: Option<String>,

        /// Restrict retrieval to chunks sighting this indicator type
        /// (ip, domain, hash, cve, path, email).
        #[arg(long)]
        ioc_type: Option<IocType>,

        /// Number of chunks to ground the answer on.
        #[arg(long)]
        k: Option<usize>,

        /// Emit the full answer structure as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Retrieve ranked chunks for a query.
    ///
    /// Embeds the query, pre-filters by technique/IOC entities, re-ranks by
    /// semantic similarity plus entity overlap, and prints the surviving
    /// chunks with scores and provenance.
    Search {
        /// The search query string.
        query: String,

        /// Restrict to chunks annotated with this technique id.
        #[arg(long)]
        technique: Option<String>,

        /// Restrict to chunks sighting this indicator type.
        #[arg(long)]
        ioc_type: Option<IocType>,

        /// Maximum number of results to return.
        #[arg(long)]
        limit: Option<usize>,

        /// Minimum score in [0, 1]; results below it are dropped.
        #[arg(long)]
        min_score: Option<f64>,
    },

    /// Analyze a single report file without ingesting it.
    ///
    /// Normalizes and chunks the file in memory, reports its techniques and
    /// indicators, and (when a completion provider is configured) produces a
    /// summary grounded in the file's own chunks.
    Analyze {
        /// Report file to analyze.
        file: PathBuf,

        /// Analysis mode override; auto-detected from the content when omitted.
        #[arg(long)]
        mode: Option<AnalysisMode>,

        /// Emit results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print a document by id, with its chunks and their annotations.
    Get {
        /// Document id.
        id: String,
    },

    /// Delete a document and everything derived from it.
    ///
    /// Removes the document's chunks, technique annotations, IOC sightings,
    /// and vectors in one transaction. Indicators still sighted by other
    /// documents are kept.
    Delete {
        /// Document id.
        id: String,
    },

    /// List extracted indicators of compromise.
    Iocs {
        /// Only show indicators of this type.
        #[arg(long)]
        ioc_type: Option<IocType>,
    },

    /// List catalog techniques and how often each is seen in the corpus.
    Techniques,

    /// Manage embedding vectors.
    ///
    /// Requires an embedding provider to be configured in `[embedding]`.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },
}

/// Embedding management subcommands.
#[derive(Subcommand)]
enum EmbedAction {
    /// Embed chunks that are missing or have stale embeddings.
    Pending {
        /// Maximum number of chunks to embed in this run.
        #[arg(long)]
        limit: Option<usize>,

        /// Show counts without performing any embedding.
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete and regenerate all embeddings.
    ///
    /// The recovery path after switching embedding models or dimensions.
    Rebuild,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            paths,
            dry_run,
            limit,
        } => {
            ingest::run_ingest(&cfg, &paths, dry_run, limit).await?;
        }
        Commands::Ask {
            question,
            mode,
            technique,
            ioc_type,
            k,
            json,
        } => {
            generate::run_ask(&cfg, &question, mode, technique, ioc_type, k, json).await?;
        }
        Commands::Search {
            query,
            technique,
            ioc_type,
            limit,
            min_score,
        } => {
            retrieve::run_search(&cfg, &query, technique, ioc_type, limit, min_score).await?;
        }
        Commands::Analyze { file, mode, json } => {
            generate::run_analyze(&cfg, &file, mode, json).await?;
        }
        Commands::Get { id } => {
            inspect::run_get(&cfg, &id).await?;
        }
        Commands::Delete { id } => {
            inspect::run_delete(&cfg, &id).await?;
        }
        Commands::Iocs { ioc_type } => {
            inspect::run_iocs(&cfg, ioc_type).await?;
        }
        Commands::Techniques => {
            inspect::run_techniques(&cfg).await?;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending { limit, dry_run } => {
                embed_cmd::run_embed_pending(&cfg, limit, dry_run).await?;
            }
            EmbedAction::Rebuild => {
                embed_cmd::run_embed_rebuild(&cfg).await?;
            }
        },
    }

    Ok(())
}
