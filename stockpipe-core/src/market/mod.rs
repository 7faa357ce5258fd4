//! Market-data collaborator: the SSI FastConnect client, its pacing and
//! circuit breaker, and the canonical reference rows.

pub mod circuit_breaker;
pub mod pacing;
pub mod provider;
pub mod reference;
pub mod scripted;
pub mod ssi;

pub use circuit_breaker::CircuitBreaker;
pub use pacing::{Pacer, RecordingPacer, ThreadPacer, DEFAULT_COOL_DOWN, MIN_COOL_DOWN};
pub use provider::{
    page_count, ApiError, DailyBar, DailyOhlcRequest, MarketDataApi, Page, PageRequest, PageSize,
    SecuritiesRequest, SecurityListing, MAX_PAGE_INDEX,
};
pub use reference::{reference_sets, ReferenceRow, ReferenceSet, MARKETS, SECURITY_TYPES};
pub use scripted::{ApiCall, ScriptedApi};
pub use ssi::{SsiClient, SsiSettings};
