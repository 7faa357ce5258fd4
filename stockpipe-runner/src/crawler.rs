//! Crawl orchestrator.
//!
//! A run walks `Init → SeedReference → StageAndMergeEntities →
//! TimeSeriesCrawl → Done`. Any stage error moves the run to `Failed`; nothing
//! is rolled back, and the next run resumes from the persisted checkpoint.

use std::collections::HashMap;
use std::fmt;

use chrono::{Local, NaiveDate};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use stockpipe_core::checkpoint::CheckpointStore;
use stockpipe_core::market::{ApiError, MarketDataApi, Pacer};
use stockpipe_core::schema::{self, SECURITY};
use stockpipe_core::sql::{Condition, SelectQuery};
use stockpipe_core::store::{Store, StoreError};
use stockpipe_core::timeseries::{Point, TimeSeriesError, TimeSeriesStore};

use crate::config::{AppConfig, ConfigError};
use crate::entities::{market_ids, stage_and_merge, EntityOutcome};
use crate::fetch::PagedFetcher;
use crate::points::bar_point;
use crate::seed::{seed_reference, SeedOutcome};
use crate::windows::{next_checkpoint, windows};

/// Errors that end a crawl run.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("relational store: {0}")]
    Store(#[from] StoreError),

    #[error("market data: {0}")]
    Api(#[from] ApiError),

    #[error("time series: {0}")]
    TimeSeries(#[from] TimeSeriesError),

    #[error("time-series bucket \"{0}\" does not exist")]
    BucketMissing(String),
}

/// Orchestrator states. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum CrawlState {
    #[default]
    Init,
    SeedReference,
    StageAndMergeEntities,
    TimeSeriesCrawl,
    Done,
    Failed,
}

impl CrawlState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CrawlState::Done | CrawlState::Failed)
    }

    fn next(self) -> Self {
        match self {
            CrawlState::Init => CrawlState::SeedReference,
            CrawlState::SeedReference => CrawlState::StageAndMergeEntities,
            CrawlState::StageAndMergeEntities => CrawlState::TimeSeriesCrawl,
            CrawlState::TimeSeriesCrawl | CrawlState::Done => CrawlState::Done,
            CrawlState::Failed => CrawlState::Failed,
        }
    }
}

impl fmt::Display for CrawlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CrawlState::Init => "init",
            CrawlState::SeedReference => "seed-reference",
            CrawlState::StageAndMergeEntities => "stage-and-merge-entities",
            CrawlState::TimeSeriesCrawl => "time-series-crawl",
            CrawlState::Done => "done",
            CrawlState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StageStatus {
    Completed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageOutcome {
    pub stage: CrawlState,
    pub status: StageStatus,
}

/// Summary of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CrawlReport {
    pub final_state: CrawlState,
    pub stages: Vec<StageOutcome>,
    pub seeded: Vec<SeedOutcome>,
    pub entities: Option<EntityOutcome>,
    /// Market-data API calls, one per page.
    pub pages_fetched: u64,
    pub rows_staged: u64,
    /// (window, symbol) pairs completed.
    pub units_processed: u64,
    pub points_written: u64,
    pub failure: Option<String>,
}

impl CrawlReport {
    pub fn succeeded(&self) -> bool {
        self.final_state == CrawlState::Done
    }

    pub fn status_of(&self, stage: CrawlState) -> Option<StageStatus> {
        self.stages
            .iter()
            .find(|o| o.stage == stage)
            .map(|o| o.status)
    }
}

/// An active entity and the market symbol it trades on.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Entity {
    symbol: String,
    market: String,
}

/// Holds every collaborator of one crawl.
pub struct Crawler<S, A, T, P> {
    config: AppConfig,
    store: S,
    api: A,
    series: T,
    pacer: P,
    today: NaiveDate,
    state: CrawlState,
    report: CrawlReport,
}

impl<S, A, T, P> Crawler<S, A, T, P>
where
    S: Store,
    A: MarketDataApi,
    T: TimeSeriesStore,
    P: Pacer,
{
    pub fn new(config: AppConfig, store: S, api: A, series: T, pacer: P) -> Self {
        Self {
            config,
            store,
            api,
            series,
            pacer,
            today: Local::now().date_naive(),
            state: CrawlState::Init,
            report: CrawlReport::default(),
        }
    }

    /// Crawl up to `today` instead of the local date.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn state(&self) -> CrawlState {
        self.state
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn series(&self) -> &T {
        &self.series
    }

    pub fn pacer(&self) -> &P {
        &self.pacer
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Drive the state machine to a terminal state.
    pub fn run(&mut self) -> CrawlReport {
        info!(
            store = self.store.name(),
            api = self.api.name(),
            series = self.series.name(),
            until = %self.today,
            "crawl starting"
        );
        while !self.state.is_terminal() {
            let stage = self.state;
            debug!(%stage, "entering stage");
            match self.step(stage) {
                Ok(status) => {
                    self.report.stages.push(StageOutcome { stage, status });
                    self.state = stage.next();
                }
                Err(e) => {
                    error!(%stage, error = %e, "crawl failed");
                    self.report.stages.push(StageOutcome {
                        stage,
                        status: StageStatus::Failed,
                    });
                    self.report.failure = Some(e.to_string());
                    self.state = CrawlState::Failed;
                }
            }
        }
        self.report.final_state = self.state;
        info!(
            state = %self.state,
            pages = self.report.pages_fetched,
            staged = self.report.rows_staged,
            units = self.report.units_processed,
            points = self.report.points_written,
            "crawl finished"
        );
        self.report.clone()
    }

    fn step(&mut self, stage: CrawlState) -> Result<StageStatus, CrawlError> {
        let relational = self.config.crawl.enable_relational;
        let time_series = self.config.crawl.enable_time_series;
        match stage {
            CrawlState::Init => self.init(),
            CrawlState::SeedReference if relational => self.seed(),
            CrawlState::StageAndMergeEntities if relational => self.refresh_entities(),
            CrawlState::TimeSeriesCrawl if time_series => self.crawl_time_series(),
            CrawlState::SeedReference
            | CrawlState::StageAndMergeEntities
            | CrawlState::TimeSeriesCrawl => {
                warn!(%stage, "stage disabled by configuration");
                Ok(StageStatus::Skipped)
            }
            CrawlState::Done | CrawlState::Failed => Ok(StageStatus::Completed),
        }
    }

    // ── Init ─────────────────────────────────────────────────────────

    fn init(&mut self) -> Result<StageStatus, CrawlError> {
        self.config.validate()?;
        let database = self.config.general.database.clone();

        // Doubles as the connectivity probe.
        let exists = self.store.database_exists(&database)?;

        if self.config.crawl.enable_time_series {
            let bucket = &self.config.time_series.bucket;
            if !self.series.bucket_exists(bucket)? {
                return Err(CrawlError::BucketMissing(bucket.clone()));
            }
        }
        if !self.api.is_available() {
            return Err(ApiError::CircuitBreakerTripped.into());
        }

        if !exists {
            self.store.create_database(&database)?;
        }
        for table in schema::all_tables() {
            if self.store.create_table(&database, &table)? {
                info!(table = %table.name, "table created");
            }
        }
        Ok(StageStatus::Completed)
    }

    // ── Relational stages ────────────────────────────────────────────

    fn seed(&mut self) -> Result<StageStatus, CrawlError> {
        let outcomes = seed_reference(&mut self.store, &self.config.general.database)?;
        self.report.seeded = outcomes;
        Ok(StageStatus::Completed)
    }

    fn refresh_entities(&mut self) -> Result<StageStatus, CrawlError> {
        let crawl = &self.config.crawl;
        let mut fetcher =
            PagedFetcher::new(&self.api, &self.pacer, crawl.cool_down(), crawl.page_size);
        let listing = fetcher.securities(None);
        self.report.pages_fetched += fetcher.calls();
        let listing = listing?;

        let outcome = stage_and_merge(
            &mut self.store,
            &self.config.general.database,
            &listing.rows,
            listing.is_complete(),
        )?;
        self.report.rows_staged += outcome.staged;
        self.report.entities = Some(outcome);
        Ok(StageStatus::Completed)
    }

    // ── Time series ──────────────────────────────────────────────────

    /// Non-delisted entities ordered by symbol.
    fn active_entities(&mut self) -> Result<Vec<Entity>, StoreError> {
        let database = &self.config.general.database;
        let markets: HashMap<i64, String> = market_ids(&mut self.store, database)?
            .into_iter()
            .map(|(symbol, id)| (id, symbol))
            .collect();
        let rows = self.store.select(
            database,
            SECURITY,
            &SelectQuery::all()
                .columns(["Symbol", "Market_ID"])
                .filter(Condition::is_null("DelistDate"))
                .order_by("Symbol"),
        )?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(Entity {
                    symbol: row.get_str("Symbol")?.to_string(),
                    market: row
                        .get_i64("Market_ID")
                        .and_then(|id| markets.get(&id).cloned())
                        .unwrap_or_default(),
                })
            })
            .collect())
    }

    fn crawl_time_series(&mut self) -> Result<StageStatus, CrawlError> {
        let entities = self.active_entities()?;
        if entities.is_empty() {
            warn!("no active entities; nothing to crawl");
            return Ok(StageStatus::Completed);
        }
        let symbols: Vec<String> = entities.iter().map(|e| e.symbol.clone()).collect();

        let crawl = &self.config.crawl;
        let checkpoints = CheckpointStore::new(self.config.general.database.as_str());
        let (start, resume_at) = match checkpoints.load(&mut self.store)? {
            Some(cp) => match symbols.iter().position(|s| *s == cp.symbol) {
                Some(i) => {
                    info!(window = %cp.window_start.date(), symbol = %cp.symbol, "resuming");
                    (cp.window_start.date(), i)
                }
                None => {
                    warn!(symbol = %cp.symbol, "checkpoint symbol is not active; starting over");
                    (crawl.default_start, 0)
                }
            },
            None => (crawl.default_start, 0),
        };

        let bucket = self.config.time_series.bucket.as_str();
        let measurement = self.config.time_series.measurement.as_str();
        let mut fetcher =
            PagedFetcher::new(&self.api, &self.pacer, crawl.cool_down(), crawl.page_size);
        let pages_before = self.report.pages_fetched;

        for (n, window) in windows(start, crawl.window_days, self.today).iter().enumerate() {
            let skip = if n == 0 { resume_at } else { 0 };
            for (i, entity) in entities.iter().enumerate().skip(skip) {
                let bars = fetcher.daily_bars(&entity.symbol, window.start, window.end);
                self.report.pages_fetched = pages_before + fetcher.calls();
                let bars = bars?;

                let points: Vec<Point> = bars
                    .iter()
                    .map(|bar| bar_point(bar, measurement, &entity.market))
                    .collect();
                if points.is_empty() {
                    debug!(symbol = %entity.symbol, from = %window.start, "no bars");
                } else {
                    let written = self.series.write(bucket, &points)?;
                    self.report.points_written += written as u64;
                }

                if let Some(next) = next_checkpoint(window, crawl.window_days, &symbols, i) {
                    checkpoints.save(&mut self.store, &next)?;
                }
                self.report.units_processed += 1;
            }
            info!(from = %window.start, to = %window.end, open = window.open, "window crawled");
        }
        Ok(StageStatus::Completed)
    }
}
