use anyhow::{bail, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};

use dose_buddy::config;
use dose_buddy::db;
use dose_buddy::model::DispenserStatus;
use dose_buddy::store::Store;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Write dispenser status the way the device reports it"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Set the online flag, keeping the last dispense result
    Status {
        #[arg(long, conflicts_with = "offline")]
        online: bool,
        #[arg(long)]
        offline: bool,
    },
    /// Report a dispense attempt
    Dispense {
        /// Medication the attempt was for
        #[arg(long)]
        medication: Option<String>,
        /// The attempt failed
        #[arg(long)]
        failed: bool,
        /// Attempt time as shown to the user; defaults to now
        #[arg(long)]
        at: Option<String>,
    },
    /// Print the current status document
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let store = Store::new(pool, cfg.chamber_pool());

    match args.command {
        Command::Status { online, offline } => {
            if online == offline {
                bail!("pass exactly one of --online or --offline");
            }
            let mut status = store.dispenser_status().await?.unwrap_or(DispenserStatus {
                is_online: online,
                last_dispense_time: None,
                last_dispense_successful: true,
            });
            status.is_online = online;
            store.put_dispenser_status(&status).await?;
            info!(online, "dispenser status written");
        }
        Command::Dispense {
            medication,
            failed,
            at,
        } => {
            let at = at.unwrap_or_else(|| Local::now().format("%Y-%m-%d %H:%M").to_string());
            let found = store
                .record_dispense(medication.as_deref(), !failed, &at)
                .await?;
            if !found {
                warn!(medication = ?medication, "dispense reported for unknown medication");
            }
            info!(successful = !failed, at = %at, "dispense recorded");
        }
        Command::Show => {
            let status = store.dispenser_status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }
    Ok(())
}
