//! Stockpipe Runner: configuration, reference seeding, entity refresh and the
//! resumable time-series crawl.

pub mod config;
pub mod crawler;
pub mod entities;
pub mod fetch;
pub mod points;
pub mod seed;
pub mod windows;

pub use config::{AppConfig, ConfigError, CrawlConfig, DEFAULT_CONFIG_FILE};
pub use crawler::{CrawlError, CrawlReport, CrawlState, Crawler, StageOutcome, StageStatus};
pub use entities::{entity_merge, stage_and_merge, EntityOutcome, ReferenceIds};
pub use fetch::{Fetched, PagedFetcher};
pub use seed::{seed_reference, SeedAction, SeedOutcome};
pub use windows::{next_checkpoint, windows, Window};
