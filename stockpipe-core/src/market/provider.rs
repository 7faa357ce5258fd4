//! Market-data API trait, paging contract and structured error types.
//!
//! The [`MarketDataApi`] trait abstracts over the SSI FastConnect client so
//! the crawl can be driven by a scripted API in tests.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::warn;

/// The API rejects page indexes above this.
pub const MAX_PAGE_INDEX: u32 = 10;

/// Structured error types for market-data calls.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("hard stop: market-data API has blocked requests (circuit breaker tripped)")]
    CircuitBreakerTripped,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request rejected (status {status}): {message}")]
    Rejected { status: String, message: String },

    #[error("api error: {0}")]
    Other(String),
}

impl ApiError {
    /// Errors after which no further call can succeed in this run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ApiError::CircuitBreakerTripped
                | ApiError::AuthenticationFailed(_)
                | ApiError::NetworkUnreachable(_)
        )
    }
}

/// Page sizes the API accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum PageSize {
    Ten,
    Twenty,
    Fifty,
    Hundred,
    Thousand,
}

impl PageSize {
    pub fn get(self) -> u32 {
        match self {
            PageSize::Ten => 10,
            PageSize::Twenty => 20,
            PageSize::Fifty => 50,
            PageSize::Hundred => 100,
            PageSize::Thousand => 1000,
        }
    }
}

impl TryFrom<u32> for PageSize {
    type Error = ApiError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            10 => Ok(PageSize::Ten),
            20 => Ok(PageSize::Twenty),
            50 => Ok(PageSize::Fifty),
            100 => Ok(PageSize::Hundred),
            1000 => Ok(PageSize::Thousand),
            other => Err(ApiError::InvalidRequest(format!(
                "page size {other} is not one of 10, 20, 50, 100, 1000"
            ))),
        }
    }
}

impl From<PageSize> for u32 {
    fn from(size: PageSize) -> Self {
        size.get()
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

/// 1-based page index plus page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub index: u32,
    pub size: PageSize,
}

impl PageRequest {
    pub fn first(size: PageSize) -> Self {
        Self { index: 1, size }
    }

    pub fn page(index: u32, size: PageSize) -> Self {
        Self { index, size }
    }

    pub fn validate(&self) -> Result<(), ApiError> {
        if (1..=MAX_PAGE_INDEX).contains(&self.index) {
            Ok(())
        } else {
            Err(ApiError::InvalidRequest(format!(
                "page index {} outside 1..={MAX_PAGE_INDEX}",
                self.index
            )))
        }
    }
}

/// Number of pages to fetch for `total` records: ceiling division, capped at
/// the API's page-index limit.
pub fn page_count(total: u64, size: PageSize) -> u32 {
    let size = u64::from(size.get());
    let pages = total.div_ceil(size);
    if pages > u64::from(MAX_PAGE_INDEX) {
        warn!(
            total,
            pages,
            limit = MAX_PAGE_INDEX,
            "more pages than the API serves; records beyond the limit are skipped"
        );
        MAX_PAGE_INDEX
    } else {
        pages as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecuritiesRequest {
    pub page: PageRequest,
    pub market: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyOhlcRequest {
    pub page: PageRequest,
    pub symbol: String,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub ascending: bool,
}

impl DailyOhlcRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        self.page.validate()?;
        if self.symbol.is_empty() {
            return Err(ApiError::InvalidRequest("empty symbol".into()));
        }
        if self.from > self.to {
            return Err(ApiError::InvalidRequest(format!(
                "fromDate {} is after toDate {}",
                self.from, self.to
            )));
        }
        Ok(())
    }
}

/// One page of a paginated response.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub message: String,
    pub status: String,
    pub total_record: u64,
    pub data: Vec<T>,
}

impl<T> Page<T> {
    pub fn is_empty(&self) -> bool {
        self.total_record == 0 || self.data.is_empty()
    }
}

/// A listed security as the securities endpoint reports it.
///
/// The detail fields are only present when the API includes them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityListing {
    pub market: String,
    pub symbol: String,
    pub name: Option<String>,
    pub en_name: Option<String>,
    /// Security-type symbol, e.g. `ST` or `CW`.
    pub security_type: Option<String>,
    pub listed_share: Option<i64>,
    pub market_capitalization: Option<i64>,
}

/// One daily OHLC bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBar {
    pub symbol: String,
    pub market: String,
    pub trading_date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    pub value: f64,
}

/// Trait for market-data sources.
pub trait MarketDataApi: Send + Sync {
    /// Human-readable name of this source.
    fn name(&self) -> &str;

    /// One page of the security listing.
    fn securities(&self, request: &SecuritiesRequest) -> Result<Page<SecurityListing>, ApiError>;

    /// One page of daily bars for a symbol over a date range.
    fn daily_ohlc(&self, request: &DailyOhlcRequest) -> Result<Page<DailyBar>, ApiError>;

    /// Whether requests are currently allowed (not blocked by the breaker).
    fn is_available(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_whitelist() {
        assert_eq!(PageSize::try_from(1000).unwrap(), PageSize::Thousand);
        assert!(PageSize::try_from(500).is_err());
    }

    #[test]
    fn page_count_is_ceiling_and_capped() {
        assert_eq!(page_count(0, PageSize::Hundred), 0);
        assert_eq!(page_count(1, PageSize::Hundred), 1);
        assert_eq!(page_count(100, PageSize::Hundred), 1);
        assert_eq!(page_count(101, PageSize::Hundred), 2);
        assert_eq!(page_count(5000, PageSize::Hundred), MAX_PAGE_INDEX);
    }

    #[test]
    fn page_index_bounds() {
        assert!(PageRequest::page(0, PageSize::Ten).validate().is_err());
        assert!(PageRequest::page(10, PageSize::Ten).validate().is_ok());
        assert!(PageRequest::page(11, PageSize::Ten).validate().is_err());
    }

    #[test]
    fn ohlc_request_rejects_reversed_dates() {
        let req = DailyOhlcRequest {
            page: PageRequest::first(PageSize::Thousand),
            symbol: "FPT".into(),
            from: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            to: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            ascending: true,
        };
        assert!(req.validate().is_err());
    }
}
