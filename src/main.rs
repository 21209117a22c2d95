//! # Gravity CLI
//!
//! The `gravity` binary drives the filing pipeline: database setup, polling
//! and backfill, question answering, replay of failed filings, and status
//! inspection.
//!
//! ## Usage
//!
//! ```bash
//! gravity --config ./config/gravity.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `gravity init` | Create the SQLite stores and run schema migrations |
//! | `gravity poll` | Run one ingestion cycle, then analyze and index each filing |
//! | `gravity backfill` | Pull recent historical filings through the full chain |
//! | `gravity ask "<question>"` | Answer a question over the indexed corpus |
//! | `gravity replay <accession>` | Replay a failed filing (auto/analysis/index) |
//! | `gravity filings` | List recently processed filings |
//! | `gravity status` | Show status counts, events, and recent failures |
//! | `gravity watchlist` | Manage per-user ticker watchlists |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use gravity::backfill::{run_backfill, BackfillRequest};
use gravity::confidence::{confidence_label, low_confidence_warning};
use gravity::config::load_config;
use gravity::migrate;
use gravity::notify::create_filing_notifications;
use gravity::orchestrator::Orchestrator;
use gravity::state_store::StateStore;
use gravity::stats::run_status;

/// Gravity — multi-market filing ingestion, analysis, and retrieval.
#[derive(Parser)]
#[command(
    name = "gravity",
    about = "Multi-market filing ingestion, analysis, and hybrid retrieval pipeline",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/gravity.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the SQLite stores.
    ///
    /// Creates the state, checkpoint, and chunk databases with all
    /// required tables. Idempotent.
    Init,

    /// Run one ingestion cycle for the configured (or given) tickers,
    /// then analyze and index each new filing.
    Poll {
        /// Tickers to poll; defaults to `[pipeline] tickers` from config.
        tickers: Vec<String>,
    },

    /// Backfill recent historical filings through the full chain.
    Backfill {
        /// Tickers to backfill.
        tickers: Vec<String>,

        /// Filings to pull per ticker.
        #[arg(long, default_value_t = 8)]
        limit: usize,

        /// Reprocess filings that are already recorded.
        #[arg(long)]
        include_existing: bool,

        /// Create watchlist notifications for backfilled filings.
        #[arg(long)]
        notify: bool,
    },

    /// Answer a question over the indexed corpus.
    Ask {
        /// The question to answer.
        question: String,

        /// Restrict retrieval to one ticker.
        #[arg(long)]
        ticker: Option<String>,
    },

    /// Replay a failed filing.
    Replay {
        /// Accession number of the filing to replay.
        accession: String,

        /// Replay mode: `auto`, `analysis`, or `index`.
        #[arg(long, default_value = "auto")]
        mode: String,
    },

    /// List recently processed filings.
    Filings {
        /// Maximum rows to show.
        #[arg(long, default_value_t = 25)]
        limit: i64,
    },

    /// Show pipeline status: counts, events, recent failures.
    Status {
        /// Event window in minutes.
        #[arg(long, default_value_t = 60)]
        window: i64,
    },

    /// Manage per-user ticker watchlists.
    Watchlist {
        #[command(subcommand)]
        action: WatchlistAction,
    },
}

#[derive(Subcommand)]
enum WatchlistAction {
    /// Add tickers to a user's watchlist.
    Add {
        tickers: Vec<String>,
        #[arg(long, default_value = "default")]
        user: String,
    },
    /// Remove tickers from a user's watchlist.
    Remove {
        tickers: Vec<String>,
        #[arg(long, default_value = "default")]
        user: String,
    },
    /// List a user's watchlist.
    List {
        #[arg(long, default_value = "default")]
        user: String,
    },
}

const DEFAULT_ORG: &str = "default";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("gravity=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&config).await?;
            println!("initialized");
        }

        Commands::Poll { tickers } => {
            let orchestrator = Orchestrator::connect(&config).await?;
            let tickers = if tickers.is_empty() {
                config.pipeline.tickers.clone()
            } else {
                tickers
            };
            let tickers: Vec<String> =
                tickers.iter().map(|t| t.trim().to_uppercase()).collect();

            let payloads = orchestrator
                .run_ingestion_cycle(&tickers, &config.pipeline.market, &config.pipeline.exchange)
                .await?;
            create_filing_notifications(orchestrator.state_store(), &payloads, DEFAULT_ORG).await?;

            let mut analyzed = 0usize;
            let mut indexed = 0usize;
            for payload in payloads.iter().cloned() {
                let accession = payload.accession_number.clone();
                if let Some(analysis) = orchestrator.analyze_filing(payload).await? {
                    analyzed += 1;
                    match orchestrator.index_analysis(&analysis).await {
                        Ok(receipt) => {
                            indexed += 1;
                            println!("  indexed {} ({} chunks)", accession, receipt.chunk_count);
                        }
                        Err(err) => {
                            eprintln!("  indexing failed for {}: {}", accession, err);
                        }
                    }
                } else {
                    println!("  dead-lettered {}", accession);
                }
            }

            println!("poll");
            println!("  filings found: {}", payloads.len());
            println!("  analyzed: {}", analyzed);
            println!("  indexed: {}", indexed);
            println!("ok");
        }

        Commands::Backfill {
            tickers,
            limit,
            include_existing,
            notify,
        } => {
            let orchestrator = Orchestrator::connect(&config).await?;
            let request = BackfillRequest {
                tickers,
                market: config.pipeline.market.clone(),
                exchange: config.pipeline.exchange.clone(),
                per_instrument_limit: limit,
                include_existing,
                notify,
                org_id: DEFAULT_ORG.to_string(),
            };
            let report = run_backfill(&orchestrator, &request).await?;
            println!("backfill {}", report.market);
            println!("  records found: {}", report.records_found);
            println!("  filings processed: {}", report.filings_processed);
            println!("  analyzed: {}", report.analyzed);
            println!("  indexed: {}", report.indexed);
            println!("ok");
        }

        Commands::Ask { question, ticker } => {
            let orchestrator = Orchestrator::connect(&config).await?;
            let answer = orchestrator
                .answer_question(&question, ticker.as_deref())
                .await?;

            println!("{}", answer.answer_markdown);
            println!();
            println!("{}", confidence_label(answer.confidence));
            let warning = low_confidence_warning(answer.confidence);
            if !warning.is_empty() {
                println!("{}", warning);
            }
            if !answer.citations.is_empty() {
                println!("citations: {}", answer.citations.join(", "));
            }
        }

        Commands::Replay { accession, mode } => {
            let orchestrator = Orchestrator::connect(&config).await?;
            let outcome = orchestrator.replay_filing(&accession, &mode).await?;
            println!("replay {}", accession);
            println!("  mode: {}", outcome.mode);
            println!("  status: {}", outcome.status);
            println!("  analyzed: {}", outcome.analyzed);
            println!("  indexed: {}", outcome.indexed);
        }

        Commands::Filings { limit } => {
            let orchestrator = Orchestrator::connect(&config).await?;
            let filings = orchestrator.state_store().list_recent_filings(limit).await?;
            if filings.is_empty() {
                println!("No filings.");
            }
            for filing in filings {
                println!(
                    "{:<28} {:<8} {:<22} {:<8} {}",
                    filing.accession_number,
                    filing.ticker,
                    filing.status,
                    filing.filing_type,
                    filing.updated_at
                );
            }
        }

        Commands::Status { window } => {
            let orchestrator = Orchestrator::connect(&config).await?;
            run_status(&orchestrator, window).await?;
        }

        Commands::Watchlist { action } => {
            migrate::run_migrations(&config).await?;
            let pool = gravity::db::connect(&config.db.state_path).await?;
            let store = StateStore::new(pool);
            match action {
                WatchlistAction::Add { tickers, user } => {
                    for ticker in &tickers {
                        store.add_watchlist_ticker(DEFAULT_ORG, &user, ticker).await?;
                    }
                    println!("added {} ticker(s) for {}", tickers.len(), user);
                }
                WatchlistAction::Remove { tickers, user } => {
                    for ticker in &tickers {
                        store
                            .remove_watchlist_ticker(DEFAULT_ORG, &user, ticker)
                            .await?;
                    }
                    println!("removed {} ticker(s) for {}", tickers.len(), user);
                }
                WatchlistAction::List { user } => {
                    let tickers = store.list_watchlist(DEFAULT_ORG, &user).await?;
                    if tickers.is_empty() {
                        println!("(empty)");
                    }
                    for ticker in tickers {
                        println!("{}", ticker);
                    }
                }
            }
        }
    }

    Ok(())
}
