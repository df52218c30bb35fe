//! CT Map Ingest
//!
//! Streams JSON-lines certificate records into the SQLite map database through
//! the sharded updater.

mod record;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ctmap_core::config::IngestConfig;
use ctmap_core::db::SqliteConn;
use ctmap_core::updater::{Manager, Stats, StatsFn, UpdaterError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::record::CertRecord;

#[derive(Parser)]
#[command(author, version, about = "CT Map - certificate ingestion into the map database")]
struct Args {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database file (overrides config and CTMAP_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Ingest one or more JSON-lines files
    Ingest {
        files: Vec<PathBuf>,
        /// Certificate workers (and as many domain workers)
        #[arg(short, long)]
        workers: Option<usize>,
        /// Rows per bulk write
        #[arg(short, long)]
        multi_insert_size: Option<usize>,
        /// Disable the presence cache
        #[arg(long)]
        no_cache: bool,
    },
    /// Print row counts of the database
    Summary,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let dotenv = dotenvy::dotenv();
    init_logging(args.verbose)?;
    if let Err(e) = dotenv {
        if !e.not_found() {
            tracing::warn!(error = %e, "ignoring unreadable .env");
        }
    }

    let mut config = match &args.config {
        Some(path) => IngestConfig::from_json_file(path)?,
        None => IngestConfig::default(),
    };
    config.apply_env()?;
    if let Some(db) = args.db {
        config.db_path = db;
    }

    match args.command {
        CliCommand::Ingest {
            files,
            workers,
            multi_insert_size,
            no_cache,
        } => {
            if let Some(workers) = workers {
                config.worker_count = workers;
            }
            if let Some(size) = multi_insert_size {
                config.multi_insert_size = size;
            }
            config.presence_cache &= !no_cache;
            config.validate()?;
            ingest(&config, &files).await
        }
        CliCommand::Summary => {
            let db = SqliteConn::open_at(&config.db_path)?;
            println!("{}", serde_json::to_string_pretty(&db.counts()?)?);
            Ok(())
        }
    }
}

fn init_logging(verbose: u8) -> anyhow::Result<()> {
    let level = match verbose {
        0 => std::env::var("RUST_LOG")
            .ok()
            .and_then(|s| s.parse::<Level>().ok())
            .unwrap_or(Level::INFO),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).context("failed to set subscriber")
}

fn log_stats() -> StatsFn {
    Arc::new(|stats: &Stats| {
        let snap = stats.snapshot();
        let elapsed = (chrono::Utc::now() - snap.last_start_time)
            .num_milliseconds()
            .max(1) as f64
            / 1000.0;
        tracing::info!(
            read = snap.read_certs,
            uncached = snap.uncached_certs,
            written = snap.written_certs,
            domains = snap.written_domains,
            mib = snap.written_bytes as f64 / 1_048_576.0,
            certs_per_sec = (snap.written_certs as f64 / elapsed).round(),
            "ingest progress"
        );
    })
}

async fn ingest(config: &IngestConfig, files: &[PathBuf]) -> anyhow::Result<()> {
    let conn = Arc::new(SqliteConn::open_at(&config.db_path)?);
    let mut manager = Manager::from_config(config, conn.clone(), Some(log_stats()))?;
    manager.resume()?;

    let mut skipped = 0usize;
    let mut fed = Ok(());
    for file in files {
        fed = feed_file(&manager, file, &mut skipped).await;
        if fed.is_err() {
            break;
        }
    }
    manager.close_incoming();

    // A pipeline failure explains why feeding stopped; report it first.
    manager.wait().await?;
    fed?;

    let counts = conn.counts()?;
    tracing::info!(
        skipped,
        certs = counts.certs,
        domains = counts.domains,
        dirty = counts.dirty,
        "ingest complete"
    );
    Ok(())
}

async fn feed_file(manager: &Manager, path: &Path, skipped: &mut usize) -> anyhow::Result<()> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();
    let mut line_no = 0usize;
    tracing::info!(file = %path.display(), "reading records");

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let chain = match CertRecord::parse(&line).and_then(CertRecord::into_chain) {
            Ok(chain) => chain,
            Err(e) => {
                tracing::warn!(
                    file = %path.display(),
                    line = line_no,
                    error = %format!("{e:#}"),
                    "skipping record"
                );
                *skipped += 1;
                continue;
            }
        };
        for cert in chain.unfold() {
            match manager.send(cert).await {
                Ok(()) => {}
                Err(UpdaterError::IncomingClosed) => {
                    anyhow::bail!("updater stopped at {}:{line_no}", path.display())
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(())
}
