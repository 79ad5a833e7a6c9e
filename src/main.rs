use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use serde_json::json;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tutor_escrow::application::engine::SettlementEngine;
use tutor_escrow::application::reporting::{reconcile, summarize};
use tutor_escrow::application::sweeper::Sweeper;
use tutor_escrow::config::Config;
use tutor_escrow::domain::ports::{LedgerStore, LedgerStoreRef};
use tutor_escrow::infrastructure::in_memory::InMemoryLedgerStore;
use tutor_escrow::interfaces::csv::balance_writer::BalanceWriter;
use tutor_escrow::interfaces::csv::command_reader::CommandReader;
use tutor_escrow::interfaces::csv::dispatch::{Outcome, apply_command};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply a CSV batch of ledger commands and print final balances
    Process {
        /// Input commands CSV file
        input: PathBuf,
    },
    /// Release matured mentor earnings
    Sweep {
        /// Keep sweeping on the configured interval until Ctrl-C
        #[arg(long)]
        daemon: bool,
    },
    /// Print ledger totals and the reconciliation result as JSON
    Report,
}

#[cfg(feature = "storage-rocksdb")]
fn open_store(db_path: Option<&Path>) -> Result<LedgerStoreRef> {
    use tutor_escrow::infrastructure::rocksdb::RocksDBStore;

    match db_path {
        Some(path) => Ok(Arc::new(RocksDBStore::open(path).into_diagnostic()?)),
        None => Ok(Arc::new(InMemoryLedgerStore::new())),
    }
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_store(db_path: Option<&Path>) -> Result<LedgerStoreRef> {
    if let Some(path) = db_path {
        warn!(
            path = %path.display(),
            "Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to in-memory storage."
        );
    }
    Ok(Arc::new(InMemoryLedgerStore::new()))
}

async fn process(engine: &SettlementEngine, input: &Path, exponent: u32) -> Result<()> {
    let file = File::open(input).into_diagnostic()?;
    let reader = CommandReader::new(file);
    let (mut applied, mut skipped) = (0usize, 0usize);

    for (index, cmd_result) in reader.commands().enumerate() {
        // Header is line 1.
        let line = index + 2;
        let cmd = match cmd_result {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!(line, error = %e, "unreadable row skipped");
                skipped += 1;
                continue;
            }
        };
        let op = cmd.op;
        match apply_command(engine, cmd, exponent).await {
            Ok(Outcome::Replayed) => info!(line, ?op, "row already applied"),
            Ok(_) => applied += 1,
            Err(e) => {
                warn!(line, ?op, error = %e, "row rejected");
                skipped += 1;
            }
        }
    }
    info!(applied, skipped, "batch processed");

    let store = engine.store();
    let wallets = store.all_wallets().await.into_diagnostic()?;
    let earnings = store.all_mentor_earnings().await.into_diagnostic()?;
    let summary = summarize(store.as_ref()).await.into_diagnostic()?;

    let stdout = io::stdout();
    let mut writer = BalanceWriter::new(stdout.lock(), exponent);
    writer
        .write_balances(&wallets, &earnings, &summary)
        .into_diagnostic()?;
    Ok(())
}

async fn report(engine: &SettlementEngine) -> Result<()> {
    let store = engine.store().as_ref();
    let summary = summarize(store).await.into_diagnostic()?;
    let reconciliation = reconcile(store).await.into_diagnostic()?;
    let report = json!({
        "currency": engine.currency(),
        "summary": summary,
        "internal_total": summary.internal_total(),
        "net_gateway_inflow": summary.net_gateway_inflow(),
        "conserved": summary.is_conserved(),
        "reconciliation": reconciliation,
        "consistent": reconciliation.is_consistent(),
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&report).into_diagnostic()?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path).into_diagnostic()?,
        None => Config::default(),
    };
    if cli.db_path.is_some() {
        config.db_path = cli.db_path;
    }

    let store = open_store(config.db_path.as_deref())?;
    let engine = Arc::new(SettlementEngine::new(store, &config));

    match cli.command {
        Command::Process { input } => {
            process(&engine, &input, config.minor_unit_exponent).await?;
        }
        Command::Sweep { daemon: false } => {
            let released = engine.sweep_due_releases().await.into_diagnostic()?;
            println!("released {}", released);
        }
        Command::Sweep { daemon: true } => {
            let sweeper = Sweeper::spawn(Arc::clone(&engine), config.sweep_interval());
            tokio::signal::ctrl_c().await.into_diagnostic()?;
            sweeper.shutdown().await;
        }
        Command::Report => report(&engine).await?,
    }

    Ok(())
}
