use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::PathBuf;
use tracing::{error, info};

use dose_buddy::config;
use dose_buddy::db;
use dose_buddy::emitter::NotificationFilter;
use dose_buddy::error::DoseError;
use dose_buddy::medications::MedicationService;
use dose_buddy::model::MedicationRecord;
use dose_buddy::schedule::format_dose_time;
use dose_buddy::store::Store;
use dose_buddy::validation::{MedicationForm, DATE_FORMAT};

#[derive(Debug, Parser)]
#[command(author, version, about = "Manage the medications loaded into the dispenser")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Add one medication into the lowest free chamber
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        pills: String,
        #[arg(long)]
        hour: String,
        #[arg(long)]
        minute: String,
        /// First day, YYYY-MM-DD
        #[arg(long)]
        from: String,
        /// Last day, YYYY-MM-DD
        #[arg(long)]
        to: String,
        #[arg(long)]
        conditions: Option<String>,
    },
    /// Save several rows at once from a YAML or JSON list of form rows
    Submit { file: PathBuf },
    /// List medications by chamber
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Edit an existing medication
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        pills: Option<u32>,
        #[arg(long)]
        chamber: Option<u8>,
        #[arg(long)]
        hour: Option<u8>,
        #[arg(long)]
        minute: Option<u8>,
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
        #[arg(long)]
        conditions: Option<String>,
    },
    /// Delete a medication and free its chamber
    Remove { id: String },
    /// Show free chambers
    Chambers,
    /// Show stored notifications, newest first
    Notifications {
        #[arg(long, value_enum, default_value_t = FilterArg::All)]
        filter: FilterArg,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FilterArg {
    All,
    Reminders,
    System,
}

impl From<FilterArg> for NotificationFilter {
    fn from(arg: FilterArg) -> Self {
        match arg {
            FilterArg::All => NotificationFilter::All,
            FilterArg::Reminders => NotificationFilter::Reminders,
            FilterArg::System => NotificationFilter::System,
        }
    }
}

/// Log the full error and surface the user-facing text.
fn report(err: DoseError) -> anyhow::Error {
    error!(?err, "request failed");
    anyhow!(err.user_message())
}

fn print_record(record: &MedicationRecord) {
    let window = match (record.from_date, record.to_date) {
        (Some(from), Some(to)) => format!(
            "{} to {}",
            from.format(DATE_FORMAT),
            to.format(DATE_FORMAT)
        ),
        _ => "every day".to_string(),
    };
    println!(
        "chamber {}  {:<20} {} pill(s) at {}  {}  {}{}",
        record.chamber,
        record.name,
        record.pills,
        format_dose_time(record.hour, record.minute),
        window,
        record.id,
        record
            .conditions
            .as_deref()
            .map(|c| format!("  ({})", c))
            .unwrap_or_default()
    );
}

fn parse_day(value: &str) -> Result<chrono::NaiveDate> {
    chrono::NaiveDate::parse_from_str(value, DATE_FORMAT)
        .with_context(|| format!("invalid date {}", value))
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
    let service = MedicationService::new(store.clone());

    match args.command {
        Command::Add {
            name,
            pills,
            hour,
            minute,
            from,
            to,
            conditions,
        } => {
            let form = MedicationForm {
                name: Some(name),
                pills: Some(pills),
                hour: Some(hour),
                minute: Some(minute),
                from_date: Some(from),
                to_date: Some(to),
                conditions,
            };
            let record = service.add_medication(&form).await.map_err(report)?;
            print_record(&record);
        }
        Command::Submit { file } => {
            let content = fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let forms: Vec<MedicationForm> =
                serde_yaml::from_str(&content).context("failed to parse form rows")?;
            let outcome = service.submit_batch(&forms).await.map_err(report)?;
            for record in &outcome.saved {
                print_record(record);
            }
            info!(
                saved = outcome.saved.len(),
                dropped = outcome.dropped,
                "batch submitted"
            );
            if outcome.dropped > 0 {
                println!("{} incomplete row(s) skipped", outcome.dropped);
            }
        }
        Command::List { json } => {
            let records = service.list().await.map_err(report)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("no medications");
            } else {
                records.iter().for_each(print_record);
            }
        }
        Command::Update {
            id,
            name,
            pills,
            chamber,
            hour,
            minute,
            from,
            to,
            conditions,
        } => {
            let mut record = store
                .medication(&id)
                .await?
                .ok_or_else(|| report(DoseError::NotFound(id.clone())))?;
            if let Some(name) = name {
                record.name = name;
            }
            if let Some(pills) = pills {
                record.pills = pills;
            }
            if let Some(chamber) = chamber {
                record.chamber = chamber;
            }
            if let Some(hour) = hour {
                record.hour = hour;
            }
            if let Some(minute) = minute {
                record.minute = minute;
            }
            if let Some(from) = from.as_deref() {
                record.from_date = Some(parse_day(from)?);
            }
            if let Some(to) = to.as_deref() {
                record.to_date = Some(parse_day(to)?);
            }
            if let Some(conditions) = conditions {
                let trimmed = conditions.trim();
                record.conditions = (!trimmed.is_empty()).then(|| trimmed.to_string());
            }
            service.update_medication(&record).await.map_err(report)?;
            print_record(&record);
        }
        Command::Remove { id } => {
            service.delete_medication(&id).await.map_err(report)?;
            println!("removed {}", id);
        }
        Command::Chambers => {
            let free = service.available_chambers().await.map_err(report)?;
            println!(
                "{} of {} chambers free: {:?}",
                free.len(),
                cfg.dispenser.chamber_count,
                free
            );
            match free.first() {
                Some(next) => println!("next medication goes into chamber {}", next),
                None => println!("{}", DoseError::NoCapacity.user_message()),
            }
        }
        Command::Notifications { filter } => {
            let filter = NotificationFilter::from(filter);
            let events = store.notifications().await?;
            for event in events.iter().filter(|e| filter.matches(e)) {
                println!(
                    "[{}] {}  {}  ({})",
                    event.kind.as_str(),
                    event.title,
                    event.message,
                    event.time
                );
            }
        }
    }
    Ok(())
}
