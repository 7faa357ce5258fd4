//! Stockpipe CLI: configuration, crawl, and checkpoint commands.
//!
//! Commands:
//! - `init-config`: write a sample `stockpipe.toml`
//! - `crawl`: seed reference data, refresh entities, crawl daily bars
//! - `checkpoint show`: print the persisted crawl cursor
//! - `checkpoint reset`: forget the cursor so the next crawl starts over

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stockpipe_core::checkpoint::CheckpointStore;
use stockpipe_core::market::{CircuitBreaker, Pacer, SsiClient, ThreadPacer};
use stockpipe_core::store::{MemoryStore, SqlServerStore, Store, TiberiusConnection};
use stockpipe_core::timeseries::{InfluxClient, MemoryTimeSeries, TimeSeriesStore};
use stockpipe_runner::{AppConfig, CrawlReport, Crawler, StageStatus, DEFAULT_CONFIG_FILE};

#[derive(Parser)]
#[command(
    name = "stockpipe",
    about = "Stockpipe: SSI market data into SQL Server and InfluxDB"
)]
struct Cli {
    /// Debug-level logging (RUST_LOG takes precedence).
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a sample configuration file.
    InitConfig {
        /// Where to write it.
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        path: PathBuf,

        /// Overwrite an existing file.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Run the crawl: reference seed, entity merge, time-series crawl.
    Crawl {
        /// Path to the TOML config file.
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,

        /// Skip reference seeding and the entity merge.
        #[arg(long, default_value_t = false)]
        skip_relational: bool,

        /// Skip the daily-bar crawl.
        #[arg(long, default_value_t = false)]
        skip_time_series: bool,

        /// Write to in-memory stores instead of SQL Server and InfluxDB.
        #[arg(long, default_value_t = false)]
        dry_run: bool,

        /// Print the crawl report as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Inspect or reset the persisted crawl cursor.
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Print the next (window, symbol) the crawl will process.
    Show {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
    /// Delete the cursor; the next crawl starts from `crawl.default_start`.
    Reset {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if cli.verbose { "debug" } else { "info" })
    });
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    match cli.command {
        Commands::InitConfig { path, force } => run_init_config(&path, force),
        Commands::Crawl {
            config,
            skip_relational,
            skip_time_series,
            dry_run,
            json,
        } => run_crawl(&config, skip_relational, skip_time_series, dry_run, json),
        Commands::Checkpoint { action } => match action {
            CheckpointAction::Show { config } => run_checkpoint_show(&config),
            CheckpointAction::Reset { config } => run_checkpoint_reset(&config),
        },
    }
}

fn load_config(path: &Path) -> Result<AppConfig> {
    let config = AppConfig::from_file(path)
        .with_context(|| format!("loading {} (run `stockpipe init-config` first?)", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn connect_store(config: &AppConfig) -> Result<SqlServerStore<TiberiusConnection>> {
    let connection = TiberiusConnection::connect(&config.relational).with_context(|| {
        format!(
            "connecting to SQL Server at {}:{}",
            config.relational.server, config.relational.port
        )
    })?;
    Ok(SqlServerStore::new(connection))
}

fn run_init_config(path: &Path, force: bool) -> Result<()> {
    AppConfig::write_template(path, force)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn run_crawl(
    config_path: &Path,
    skip_relational: bool,
    skip_time_series: bool,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if skip_relational {
        config.crawl.enable_relational = false;
    }
    if skip_time_series {
        config.crawl.enable_time_series = false;
    }

    let pacer: Arc<dyn Pacer> = Arc::new(ThreadPacer);
    let api = SsiClient::new(
        config.ssi.clone(),
        Arc::new(CircuitBreaker::for_market_data()),
        Arc::clone(&pacer),
    )?
    .with_cool_down(config.crawl.cool_down());

    let (store, series): (Box<dyn Store>, Box<dyn TimeSeriesStore>) = if dry_run {
        tracing::info!("dry run: writing to in-memory stores");
        (
            Box::new(MemoryStore::new()),
            Box::new(MemoryTimeSeries::with_bucket(&config.time_series.bucket)),
        )
    } else {
        let store = connect_store(&config)?;
        let series = InfluxClient::new(config.time_series.influx())?;
        (Box::new(store), Box::new(series))
    };

    let mut crawler = Crawler::new(config, store, api, series, pacer);
    let report = crawler.run();
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }

    if !report.succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_summary(report: &CrawlReport) {
    println!("\n=== Crawl {} ===", report.final_state);
    for stage in &report.stages {
        let status = match stage.status {
            StageStatus::Completed => "ok",
            StageStatus::Skipped => "skipped",
            StageStatus::Failed => "FAILED",
        };
        println!("  {:<26} {status}", stage.stage.to_string());
    }
    for seed in &report.seeded {
        println!("  seeded {:<19} {:?}", seed.table, seed.action);
    }
    println!("  pages fetched:   {}", report.pages_fetched);
    println!("  rows staged:     {}", report.rows_staged);
    println!("  units processed: {}", report.units_processed);
    println!("  points written:  {}", report.points_written);
    if let Some(reason) = &report.failure {
        eprintln!("Error: {reason}");
    }
}

fn run_checkpoint_show(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let mut store = connect_store(&config)?;
    match CheckpointStore::new(config.general.database.as_str()).load(&mut store)? {
        Some(cp) => println!(
            "Next unit: window starting {} at symbol {}",
            cp.window_start.date(),
            cp.symbol
        ),
        None => println!(
            "No checkpoint; the next crawl starts at {}",
            config.crawl.default_start
        ),
    }
    Ok(())
}

fn run_checkpoint_reset(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let mut store = connect_store(&config)?;
    let removed = CheckpointStore::new(config.general.database.as_str()).reset(&mut store)?;
    println!("Removed {removed} checkpoint row(s)");
    Ok(())
}
