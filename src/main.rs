use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use dose_buddy::config;
use dose_buddy::db;
use dose_buddy::emitter::NotificationCenter;
use dose_buddy::monitor::DoseMonitor;
use dose_buddy::notify::PermissionGate;
use dose_buddy::store::Store;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Print an example config and exit
    #[arg(long)]
    print_example_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if args.print_example_config {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let store =
        Store::new(pool, cfg.chamber_pool()).with_poll_interval(cfg.watch_poll_interval());
    let gate = PermissionGate::from_config(&cfg)?;
    let permission = gate.request_permission().await;
    info!(?permission, "notification permission");

    let center = NotificationCenter::new(store.clone(), gate, cfg.notifications.icon.clone());
    let monitor = DoseMonitor::new(
        store,
        center,
        cfg.match_policy(),
        Duration::from_millis(cfg.app.tick_interval_ms),
    )
    .await?;

    let shutdown = CancellationToken::new();
    let worker = tokio::spawn(monitor.run(shutdown.clone()));

    info!(chambers = cfg.dispenser.chamber_count, "dose-buddy running");
    tokio::signal::ctrl_c().await?;
    info!("ctrl-c received, stopping");
    shutdown.cancel();

    match worker.await {
        Ok(Ok(monitor)) => {
            info!(
                notifications = monitor.center().notifications().len(),
                unread = monitor.center().unread_count(),
                "dose monitor stopped"
            );
        }
        Ok(Err(err)) => error!(?err, "dose monitor failed"),
        Err(err) => error!(?err, "dose monitor task panicked"),
    }
    Ok(())
}
