use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{Level, event};
use tracing_subscriber::EnvFilter;
use tradevault::{
    BackupLedger, BackupService, CollectorConfig, DirectorySource, Environment, RestoreReader,
    RestoredArtifact,
};

#[derive(Parser)]
#[command(name = "tradevault")]
#[command(about = "Backup and snapshot engine for the market-data collector")]
struct Cli {
    /// Collector configuration file.
    #[arg(long, global = true, default_value = "configs/collector.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Recover from any unclean shutdown, then back up until Ctrl-C.
    Run,
    /// Validate the configuration and print the active profile.
    CheckConfig,
    /// List recorded backups of a collection.
    Ledger {
        #[arg(long)]
        collection: String,
        #[arg(long)]
        json: bool,
    },
    /// Write the payload of a recorded backup to a file.
    Restore {
        #[arg(long)]
        record_id: u64,
        #[arg(long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = CollectorConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config '{}'", cli.config.display()))?;
    init_tracing(config.environment);

    match cli.command {
        Command::Run => run(config).await,
        Command::CheckConfig => check_config(&config),
        Command::Ledger { collection, json } => list_ledger(&config, &collection, json).await,
        Command::Restore { record_id, out } => restore(&config, record_id, &out).await,
    }
}

fn init_tracing(environment: Environment) {
    let fallback = match environment {
        Environment::Development => "debug",
        Environment::Production => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

async fn run(config: CollectorConfig) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let source = Arc::new(DirectorySource::new(&config.source_dir));
    let service = BackupService::open(&config, source, shutdown_rx)
        .await
        .context("Failed to start backup service")?;

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            event!(Level::INFO, "shutdown requested, finishing in-flight work");
            let _ = shutdown_tx.send(true);
        }
    });

    let report = service.run().await.context("Backup service halted")?;
    if let Some(crash) = report.crash {
        event!(
            Level::INFO,
            crash_id = crash.crash_id,
            recovered = report.recovered,
            "run finished after handling a crash"
        );
    }
    Ok(())
}

fn check_config(config: &CollectorConfig) -> Result<()> {
    let profile = config.active_profile();
    println!("environment:      {}", profile.mode);
    println!("snapshot cadence: {}", profile.snapshot_cadence);
    println!("stream cadence:   {}", profile.stream_cadence);
    println!("safe margin:      {}s", profile.safe_margin.as_secs());
    println!("backend:          {}", config.backend.kind());
    println!("compression:      {}", config.compression.default);
    for collection in &config.collections {
        println!("  {} ({})", collection.name, collection.kind);
    }
    for name in &config.overwrite_collections {
        println!("  {} (overwrite)", name);
    }
    Ok(())
}

async fn list_ledger(config: &CollectorConfig, collection: &str, json: bool) -> Result<()> {
    let ledger = BackupLedger::open(&config.ledger.backup_ledger_path)
        .await
        .context("Failed to open backup ledger")?;
    let records = ledger.list(collection).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("no backups recorded for '{}'", collection);
        return Ok(());
    }
    for record in records {
        println!(
            "{:>6}  {}  {:<11}  v{}  {:>10} B  {}",
            record.record_id,
            record.created_at.to_rfc3339(),
            record.kind.as_str(),
            record.schema_version,
            record.byte_size,
            record.backend_location
        );
    }
    Ok(())
}

async fn restore(config: &CollectorConfig, record_id: u64, out: &Path) -> Result<()> {
    let ledger = BackupLedger::open(&config.ledger.backup_ledger_path)
        .await
        .context("Failed to open backup ledger")?;
    let record = ledger
        .get(record_id)
        .await
        .ok_or_else(|| anyhow!("record {} is not in the ledger", record_id))?;

    let (archive, overwrite) = tradevault::backend::open_targets(&config.backend).await?;
    let codec = Arc::new(tradevault::Codec::new(&config.compression)?);
    let reader = RestoreReader::new(codec, archive, overwrite);

    let bytes = match reader.restore(&record).await? {
        RestoredArtifact::Snapshot(bytes) => bytes,
        RestoredArtifact::Deltas(deltas) => {
            let mut lines = Vec::new();
            for delta in deltas {
                let line = serde_json::json!({
                    "seq": delta.seq,
                    "committed_at": delta.committed_at,
                    "record": serde_json::from_slice::<serde_json::Value>(&delta.payload)
                        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(&delta.payload).into_owned())),
                });
                lines.extend(serde_json::to_vec(&line)?);
                lines.push(b'\n');
            }
            lines
        }
    };

    std::fs::write(out, &bytes).with_context(|| format!("Failed to write '{}'", out.display()))?;
    println!(
        "restored record {} ({} bytes) to {}",
        record.record_id,
        bytes.len(),
        out.display()
    );
    Ok(())
}
