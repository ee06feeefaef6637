//! Khata CLI - Offline-first farm logbook
//!
//! Record activities, costs and income locally, then sync with a
//! khata-server instance when connectivity allows.

mod http;

use std::env;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use khata_core::shadow::{ShadowRecord, SqliteShadowStore};
use khata_core::sync::{SessionError, SyncSession};
use khata_core::{EntryId, EntryPayload};
use serde::Serialize;
use thiserror::Error;

use http::HttpTransport;

#[derive(Parser)]
#[command(name = "khata")]
#[command(about = "Farm logbook that works offline and syncs when it can")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Optional path to local database file
    #[arg(long, value_name = "PATH")]
    db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a new logbook entry
    #[command(alias = "new")]
    Add {
        /// Activity category, e.g. "sowing" or "irrigation"
        activity: String,
        /// Activity date (YYYY-MM-DD, defaults to today)
        #[arg(long, value_name = "DATE")]
        date: Option<String>,
        /// Free-text description
        #[arg(short, long)]
        description: Option<String>,
        /// Cost in rupees, e.g. "125.50"
        #[arg(long, default_value = "0")]
        cost: String,
        /// Income in rupees
        #[arg(long, default_value = "0")]
        income: String,
        /// Object key of an attached photo (repeatable)
        #[arg(long = "image", value_name = "KEY")]
        images: Vec<String>,
    },
    /// List logbook entries
    List {
        /// Number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Include entries deleted locally but not yet synced
        #[arg(long)]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Edit an existing entry
    Edit {
        /// Entry ID or unique ID prefix
        id: String,
        /// New activity category
        #[arg(long)]
        activity: Option<String>,
        /// New activity date (YYYY-MM-DD)
        #[arg(long, value_name = "DATE")]
        date: Option<String>,
        /// New description
        #[arg(short, long)]
        description: Option<String>,
        /// New cost in rupees
        #[arg(long)]
        cost: Option<String>,
        /// New income in rupees
        #[arg(long)]
        income: Option<String>,
    },
    /// Delete an entry
    Delete {
        /// Entry ID or unique ID prefix
        id: String,
    },
    /// Push local changes and pull the latest from the server
    Sync,
    /// Show local database and sync state
    Status,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Core(#[from] khata_core::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("Entry ID cannot be empty")]
    EmptyEntryId,
    #[error("Entry not found for id/prefix: {0}")]
    EntryNotFound(String),
    #[error("{0}")]
    AmbiguousEntryId(String),
    #[error("Invalid amount '{0}': expected rupees like 125 or 125.50")]
    InvalidAmount(String),
    #[error("Invalid date '{0}': expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("Nothing to change; pass at least one of --activity, --date, --description, --cost, --income")]
    NothingToChange,
    #[error(
        "Sync is not configured. Set KHATA_SERVER_URL and KHATA_TOKEN to enable `khata sync`."
    )]
    SyncNotConfigured,
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("khata_cli=info".parse().unwrap())
                .add_directive("khata_core=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);

    match cli.command {
        Commands::Add {
            activity,
            date,
            description,
            cost,
            income,
            images,
        } => run_add(
            &db_path,
            &activity,
            date.as_deref(),
            description,
            &cost,
            &income,
            images,
        ),
        Commands::List { limit, all, json } => run_list(&db_path, limit, all, json),
        Commands::Edit {
            id,
            activity,
            date,
            description,
            cost,
            income,
        } => run_edit(
            &db_path,
            &id,
            activity,
            date.as_deref(),
            description,
            cost.as_deref(),
            income.as_deref(),
        ),
        Commands::Delete { id } => run_delete(&db_path, &id),
        Commands::Sync => run_sync(&db_path).await,
        Commands::Status => run_status(&db_path),
    }
}

fn run_add(
    db_path: &Path,
    activity: &str,
    date: Option<&str>,
    description: Option<String>,
    cost: &str,
    income: &str,
    images: Vec<String>,
) -> Result<(), CliError> {
    let payload = EntryPayload {
        date: parse_entry_date(date)?,
        activity: activity.trim().to_string(),
        description: description.and_then(|text| {
            let trimmed = text.trim().to_string();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed)
            }
        }),
        cost: parse_amount(cost)?,
        income: parse_amount(income)?,
        images,
    };

    let store = SqliteShadowStore::open(db_path)?;
    let record = store.insert_local(&payload)?;
    println!("{}", record.id);
    Ok(())
}

#[derive(Debug, Serialize)]
struct EntryListItem {
    id: String,
    date: String,
    activity: String,
    description: Option<String>,
    cost: i64,
    income: i64,
    images: Vec<String>,
    synced: bool,
}

fn run_list(db_path: &Path, limit: usize, all: bool, as_json: bool) -> Result<(), CliError> {
    let store = SqliteShadowStore::open(db_path)?;
    let listed = if all { store.list_all()? } else { store.list()? };
    let records: Vec<ShadowRecord> = listed.into_iter().take(limit).collect();

    if as_json {
        let items = records
            .iter()
            .map(record_to_list_item)
            .collect::<Vec<EntryListItem>>();
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else {
        for line in format_entry_lines(&records) {
            println!("{line}");
        }
    }
    Ok(())
}

fn run_edit(
    db_path: &Path,
    id: &str,
    activity: Option<String>,
    date: Option<&str>,
    description: Option<String>,
    cost: Option<&str>,
    income: Option<&str>,
) -> Result<(), CliError> {
    if activity.is_none()
        && date.is_none()
        && description.is_none()
        && cost.is_none()
        && income.is_none()
    {
        return Err(CliError::NothingToChange);
    }

    let store = SqliteShadowStore::open(db_path)?;
    let record = resolve_entry(&store, id)?;

    let mut payload = record.payload;
    if let Some(activity) = activity {
        payload.activity = activity.trim().to_string();
    }
    if let Some(date) = date {
        payload.date = parse_entry_date(Some(date))?;
    }
    if let Some(description) = description {
        let trimmed = description.trim().to_string();
        payload.description = if trimmed.is_empty() { None } else { Some(trimmed) };
    }
    if let Some(cost) = cost {
        payload.cost = parse_amount(cost)?;
    }
    if let Some(income) = income {
        payload.income = parse_amount(income)?;
    }

    store.update_local(&record.id, &payload)?;
    println!("{}", record.id);
    Ok(())
}

fn run_delete(db_path: &Path, id: &str) -> Result<(), CliError> {
    let store = SqliteShadowStore::open(db_path)?;
    let record = resolve_entry(&store, id)?;
    store.delete_local(&record.id)?;
    println!("{}", record.id);
    Ok(())
}

async fn run_sync(db_path: &Path) -> Result<(), CliError> {
    let Some(transport) = HttpTransport::from_env() else {
        return Err(CliError::SyncNotConfigured);
    };

    let store = SqliteShadowStore::open(db_path)?;
    let mut session = SyncSession::new(&transport, &store);
    let report = session.run().await?;

    if report.pushed > 0 {
        println!(
            "Pushed {} change(s): {} accepted, {} conflict(s), {} rejected, {} to retry",
            report.pushed, report.accepted, report.conflicts, report.rejected, report.transient
        );
        for id in &report.conflicted_ids {
            println!("Conflict: entry {id} now holds the server copy; edit it again if your change still applies");
        }
    }
    println!(
        "Pulled {} change(s) in {} page(s)",
        report.pulled_entries, report.pulled_pages
    );
    Ok(())
}

fn run_status(db_path: &Path) -> Result<(), CliError> {
    let store = SqliteShadowStore::open(db_path)?;
    let dirty = store.dirty_count()?;
    let cursor = khata_core::shadow::ShadowStore::cursor(&store)?;

    println!("Database: {}", db_path.display());
    println!("Pending changes: {dirty}");
    match cursor {
        Some(cursor) => println!("Synced through: {}", cursor.last_modified),
        None => println!("Synced through: never"),
    }
    if HttpTransport::from_env().is_some() {
        println!("Server: configured");
    } else {
        println!("Server: not configured (set KHATA_SERVER_URL and KHATA_TOKEN)");
    }
    Ok(())
}

fn resolve_entry(store: &SqliteShadowStore, query: &str) -> Result<ShadowRecord, CliError> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(CliError::EmptyEntryId);
    }

    if let Ok(id) = trimmed.parse::<EntryId>() {
        if let Some(record) = store.get(&id)? {
            return Ok(record);
        }
    }

    let mut matches = store.find_by_prefix(trimmed)?;
    match matches.len() {
        0 => Err(CliError::EntryNotFound(trimmed.to_string())),
        1 => Ok(matches.remove(0)),
        _ => {
            let options = matches
                .iter()
                .take(3)
                .map(|record| record.id.as_str().chars().take(13).collect::<String>())
                .collect::<Vec<_>>()
                .join(", ");
            Err(CliError::AmbiguousEntryId(format!(
                "ID prefix '{trimmed}' is ambiguous; matches: {options}"
            )))
        }
    }
}

fn format_entry_lines(records: &[ShadowRecord]) -> Vec<String> {
    records
        .iter()
        .map(|record| {
            let id = record.id.as_str();
            let short_id = id.chars().take(13).collect::<String>();
            let marker = if record.dirty { "*" } else { " " };
            let money = format!(
                "cost {} / income {}",
                format_amount(record.payload.cost),
                format_amount(record.payload.income)
            );
            format!(
                "{short_id:<13}{marker} {}  {:<20}  {money}",
                record.payload.date, record.payload.activity
            )
        })
        .collect()
}

fn record_to_list_item(record: &ShadowRecord) -> EntryListItem {
    EntryListItem {
        id: record.id.as_str(),
        date: record.payload.date.format("%Y-%m-%d").to_string(),
        activity: record.payload.activity.clone(),
        description: record.payload.description.clone(),
        cost: record.payload.cost,
        income: record.payload.income,
        images: record.payload.images.clone(),
        synced: !record.dirty,
    }
}

/// Parse a rupee amount like "125" or "125.50" into paise
fn parse_amount(text: &str) -> Result<i64, CliError> {
    let trimmed = text.trim();
    let (rupees, fraction) = match trimmed.split_once('.') {
        // A trailing dot like "12." is a typo, not zero paise
        Some((_, "")) => return Err(CliError::InvalidAmount(text.to_string())),
        Some(parts) => parts,
        None => (trimmed, ""),
    };

    let valid_digits = |part: &str| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit());
    if !valid_digits(rupees) || rupees.len() > 10 {
        return Err(CliError::InvalidAmount(text.to_string()));
    }
    if !fraction.is_empty() && (fraction.len() > 2 || !valid_digits(fraction)) {
        return Err(CliError::InvalidAmount(text.to_string()));
    }

    let rupee_part: i64 = rupees
        .parse()
        .map_err(|_| CliError::InvalidAmount(text.to_string()))?;
    let paise_part: i64 = match fraction.len() {
        0 => 0,
        1 => {
            fraction
                .parse::<i64>()
                .map_err(|_| CliError::InvalidAmount(text.to_string()))?
                * 10
        }
        _ => fraction
            .parse()
            .map_err(|_| CliError::InvalidAmount(text.to_string()))?,
    };
    Ok(rupee_part * 100 + paise_part)
}

fn format_amount(paise: i64) -> String {
    format!("\u{20b9}{}.{:02}", paise / 100, paise % 100)
}

fn parse_entry_date(date: Option<&str>) -> Result<NaiveDate, CliError> {
    match date {
        Some(text) => NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
            .map_err(|_| CliError::InvalidDate(text.to_string())),
        None => Ok(Local::now().date_naive()),
    }
}

fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("KHATA_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("khata")
        .join("shadow.db")
}
