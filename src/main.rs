use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ingestd::core::{DeviceEvent, Ledger, Orchestrator, VolumeOutcome};
use ingestd::{adapters, config, context, logging};
use serde::Serialize;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "ingestd")]
#[command(
    about = "Copies newly attached removable volumes into a local archive",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./ingestd.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch for removable volumes and ingest them
    Daemon(ServerArgs),
    /// Scan attached volumes once and exit
    Scan(ServerArgs),
    /// Print the ingestion ledger
    Ledger {
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Args, Serialize)]
struct ServerArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    destination_root: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    ledger_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    sync_files: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    simulation: Option<bool>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ingestd: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config_file = cli.config.as_deref();

    let config = match &cli.command {
        Commands::Daemon(args) | Commands::Scan(args) => {
            config::AppConfig::new(config_file, Some(args))?
        }
        _ => config::AppConfig::new(config_file, None::<&ServerArgs>)?,
    };

    match cli.command {
        Commands::Daemon(_) => {
            logging::init(logging::LogConfig::from(&config));
            let adapter = adapters::get_adapter(&config)?;
            let ctx = context::AppContext::new(config);
            Orchestrator::new(ctx, adapter)
                .start()
                .await
                .context("Failed to start daemon")?
        }
        Commands::Scan(_) => {
            logging::init(logging::LogConfig::from(&config));
            run_scan(config).await?
        }
        Commands::Ledger { json } => print_ledger(&config, json)?,
        Commands::Config => print!("{}", config.to_toml()?),
    }

    Ok(())
}

async fn run_scan(config: config::AppConfig) -> Result<()> {
    let adapter = adapters::get_adapter(&config)?;
    let ctx = context::AppContext::new(config);
    let mut orchestrator = Orchestrator::new(ctx, adapter);

    let summary = tokio::task::spawn_blocking(move || {
        orchestrator.on_device_change_event(DeviceEvent::Arrival)
    })
    .await
    .context("Scan panicked")?;

    for (root, outcome) in &summary.outcomes {
        match outcome {
            VolumeOutcome::Ingested { destination, report } => info!(
                root = %root.display(),
                destination = %destination.display(),
                complete = report.is_complete(),
                "Ingested"
            ),
            VolumeOutcome::AlreadyIngested => info!(root = %root.display(), "Already ingested"),
            VolumeOutcome::Skipped(e) | VolumeOutcome::CopyAborted(e) => {
                error!(root = %root.display(), error = %e, "Not ingested")
            }
            VolumeOutcome::Unrecorded { error: e, .. } => {
                error!(root = %root.display(), error = %e, "Ingested but not recorded")
            }
        }
    }
    info!(
        removable = summary.outcomes.len(),
        ingested = summary.ingested(),
        "Scan finished"
    );

    Ok(())
}

fn print_ledger(config: &config::AppConfig, json: bool) -> Result<()> {
    let entries = Ledger::at(&config.ledger_path).entries()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else if entries.is_empty() {
        println!("Ledger {} is empty", config.ledger_path.display());
    } else {
        for entry in &entries {
            println!("{}", entry);
        }
    }
    Ok(())
}
