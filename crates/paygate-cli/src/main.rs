// ============================================================================
// paygate - meter server and database tool
// ============================================================================
// Usage:
//   paygate serve [--bind ADDR] [--cap N]     Run the meter HTTP endpoints
//   paygate stats                             Show meter statistics
//   paygate peek --identity KEY [--day DAY]   Show one identity's count
//   paygate list [--day DAY]                  List meter records
//   paygate export --format json              Export all records as JSON
//   paygate prune --older-than 30             Delete records older than N days
// ============================================================================

use anyhow::{Context, Result};
use chrono::{Days, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use paygate_core::{
    AccessGate, Directory, EntitlementResolver, GateConfig, IdentityResolver, MeterDb,
    MeterServer, MeterState, MeteringStore, SystemClock, DAY_FORMAT,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Metered content access gate
#[derive(Parser)]
#[command(name = "paygate", version, about = "Serve and inspect the daily free-read meter")]
struct Cli {
    /// Path to the database file (default: ~/.paygate/meter.redb)
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Daily free-read cap (default: PAYGATE_DAILY_CAP or 5)
    #[arg(long, global = true)]
    cap: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the meter HTTP endpoints
    Serve {
        /// Listen address (default: PAYGATE_BIND or 127.0.0.1:8787)
        #[arg(long)]
        bind: Option<String>,

        /// JSON file with accounts and content flags
        #[arg(long)]
        directory: Option<PathBuf>,
    },

    /// Show meter statistics (records, reads, exhausted identities per day)
    Stats,

    /// Show the count for one identity key (e.g. ip:203.0.113.7)
    Peek {
        #[arg(long)]
        identity: String,

        /// Day as YYYY-MM-DD (default: today in the reference timezone)
        #[arg(long)]
        day: Option<String>,
    },

    /// List meter records
    List {
        /// Only this day (YYYY-MM-DD)
        #[arg(long)]
        day: Option<String>,
    },

    /// Export all meter records
    Export {
        /// Output format (currently only json is supported)
        #[arg(long, default_value = "json")]
        format: String,
    },

    /// Delete meter records older than a number of days
    Prune {
        /// Delete records for days older than this many days
        #[arg(long, default_value = "30")]
        older_than: u64,

        /// Show what would be pruned without actually deleting
        #[arg(long)]
        dry_run: bool,
    },
}

fn parse_day(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, DAY_FORMAT)
        .with_context(|| format!("Invalid day '{}'. Expected YYYY-MM-DD", s))
}

fn init_logging() {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in ["paygate=info", "paygate_core=debug"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: Could not load .env file: {}", e);
        }
    }
    init_logging();

    let cli = Cli::parse();
    let config = load_config(&cli, |name| std::env::var(name).ok())?;
    let db = MeterDb::open(config.db_path.as_deref())?;

    match cli.command {
        Commands::Serve { .. } => cmd_serve(db, &config).await,
        Commands::Stats => cmd_stats(&db, &config),
        Commands::Peek { identity, day } => cmd_peek(&db, &config, &identity, day.as_deref()),
        Commands::List { day } => cmd_list(&db, day.as_deref()),
        Commands::Export { format } => cmd_export(&db, &config, &format),
        Commands::Prune {
            older_than,
            dry_run,
        } => cmd_prune(&db, &config, older_than, dry_run),
    }
}

/// Environment config with CLI flags applied. A variable that a flag
/// overrides is never parsed, so a bad value there cannot fail the command.
fn load_config(cli: &Cli, lookup: impl Fn(&str) -> Option<String>) -> Result<GateConfig> {
    let (bind, directory) = match &cli.command {
        Commands::Serve { bind, directory } => (bind.clone(), directory.clone()),
        _ => (None, None),
    };

    let mut config = GateConfig::from_lookup(|name| {
        let overridden = match name {
            "PAYGATE_DB_PATH" => cli.db_path.is_some(),
            "PAYGATE_DAILY_CAP" => cli.cap.is_some(),
            "PAYGATE_BIND" => bind.is_some(),
            "PAYGATE_DIRECTORY_PATH" => directory.is_some(),
            _ => false,
        };
        if overridden {
            None
        } else {
            lookup(name)
        }
    })?;

    if let Some(path) = &cli.db_path {
        config.db_path = Some(path.clone());
    }
    if let Some(cap) = cli.cap {
        config.daily_cap = cap;
    }
    if let Some(bind) = bind {
        config.bind_addr = bind;
    }
    if let Some(directory) = directory {
        config.directory_path = Some(directory);
    }
    Ok(config)
}

fn today(config: &GateConfig) -> Result<NaiveDate> {
    Ok(config.day_bucket()?.day_of(Utc::now()))
}

async fn cmd_serve(db: MeterDb, config: &GateConfig) -> Result<()> {
    let directory = match &config.directory_path {
        Some(path) => Directory::load(path)?,
        None => {
            warn!("No directory configured (PAYGATE_DIRECTORY_PATH) - every content id is unknown");
            Directory::default()
        }
    };
    let directory = Arc::new(directory);

    let gate = AccessGate::new(Arc::new(db), EntitlementResolver::new(directory.clone()))
        .with_store_timeout(config.store_timeout());
    let resolver = IdentityResolver::new(config.day_bucket()?, Arc::new(SystemClock));
    let state = MeterState::new(gate, resolver, directory, config.daily_cap);

    let server = MeterServer::bind(&config.bind_addr, state)?;
    let shutdown = server.shutdown_handle();
    info!(
        "Starting paygate on {} (cap {} per day, UTC{:+}m)",
        config.bind_addr, config.daily_cap, config.utc_offset_minutes
    );

    let serving = tokio::spawn(server.run());
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    shutdown.shutdown();
    serving.await.context("Server task panicked")??;
    Ok(())
}

fn cmd_stats(db: &MeterDb, config: &GateConfig) -> Result<()> {
    let stats = db.stats(config.daily_cap)?;

    println!("=== Paygate Meter Stats ===");
    match db.path() {
        Some(path) => println!("Database: {}", path.display()),
        None => println!("Database: (in-memory)"),
    }
    println!("Daily cap: {}", stats.cap);
    println!();
    println!("Records:  {}", stats.total_records);
    println!("Reads:    {}", stats.total_reads);
    if !stats.days.is_empty() {
        println!();
        println!("{:<12}  {:>10}  {:>8}  {:>9}", "DAY", "IDENTITIES", "READS", "EXHAUSTED");
        for (day, totals) in &stats.days {
            println!(
                "{:<12}  {:>10}  {:>8}  {:>9}",
                day, totals.identities, totals.reads, totals.exhausted
            );
        }
    }

    Ok(())
}

fn cmd_peek(db: &MeterDb, config: &GateConfig, identity: &str, day: Option<&str>) -> Result<()> {
    let day = match day {
        Some(d) => parse_day(d)?,
        None => today(config)?,
    };
    let count = db.peek(identity, day)?;
    println!(
        "{} on {}: {} of {} free reads used",
        identity, day, count, config.daily_cap
    );
    Ok(())
}

fn cmd_list(db: &MeterDb, day: Option<&str>) -> Result<()> {
    let filter = day.map(parse_day).transpose()?;
    let records = db.list_records(filter)?;

    if records.is_empty() {
        println!("No meter records found.");
        return Ok(());
    }

    println!("{:<12}  {:>5}  {}", "DAY", "COUNT", "IDENTITY");
    println!("{}", "-".repeat(60));
    for record in &records {
        println!(
            "{:<12}  {:>5}  {}",
            record.day.format(DAY_FORMAT),
            record.count,
            record.identity
        );
    }

    println!("\nTotal: {} records", records.len());
    Ok(())
}

fn cmd_export(db: &MeterDb, config: &GateConfig, format: &str) -> Result<()> {
    if format != "json" {
        anyhow::bail!("Unsupported format '{}'. Only 'json' is supported.", format);
    }

    let records = db.list_records(None)?;
    let stats = db.stats(config.daily_cap)?;

    let export = serde_json::json!({
        "exported_at": Utc::now().to_rfc3339(),
        "stats": stats,
        "records": records,
    });

    println!("{}", serde_json::to_string_pretty(&export)?);
    Ok(())
}

fn prune_cutoff(today: NaiveDate, older_than: u64) -> Result<NaiveDate> {
    today
        .checked_sub_days(Days::new(older_than))
        .ok_or_else(|| anyhow::anyhow!("--older-than {} reaches past the earliest date", older_than))
}

fn cmd_prune(db: &MeterDb, config: &GateConfig, older_than: u64, dry_run: bool) -> Result<()> {
    let cutoff = prune_cutoff(today(config)?, older_than)?;

    if dry_run {
        println!("=== DRY RUN - no data will be deleted ===\n");

        let pruneable = db.records_before(cutoff)?;
        println!(
            "Would prune {} meter records before {}",
            pruneable.len(),
            cutoff
        );
        for record in &pruneable {
            println!("  - {} {} ({})", record.day, record.identity, record.count);
        }
    } else {
        let pruned = db.prune_before(cutoff)?;
        println!("Pruned {} meter records (before {})", pruned, cutoff);
    }

    Ok(())
}
