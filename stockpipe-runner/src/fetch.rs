//! Paced, paginated reads from the market-data API.
//!
//! Every call, successful or not, is followed by the configured cool-down.
//! The first page of a listing tells how many pages to request after it.
//! Results carry the record total the API reported, so callers can tell a
//! capped or truncated listing from a complete one.

use std::time::Duration;

use chrono::NaiveDate;
use tracing::{debug, warn};

use stockpipe_core::market::{
    page_count, ApiError, DailyBar, DailyOhlcRequest, MarketDataApi, Page, PageRequest, PageSize,
    Pacer, SecuritiesRequest, SecurityListing,
};

/// Rows gathered across pages, with the total the first page announced.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub rows: Vec<T>,
    pub total_record: u64,
}

impl<T> Fetched<T> {
    /// Every announced record arrived.
    pub fn is_complete(&self) -> bool {
        self.rows.len() as u64 >= self.total_record
    }
}

pub struct PagedFetcher<'a, A: ?Sized, P: ?Sized> {
    api: &'a A,
    pacer: &'a P,
    cool_down: Duration,
    page_size: PageSize,
    calls: u64,
}

impl<'a, A: MarketDataApi + ?Sized, P: Pacer + ?Sized> PagedFetcher<'a, A, P> {
    pub fn new(api: &'a A, pacer: &'a P, cool_down: Duration, page_size: PageSize) -> Self {
        Self {
            api,
            pacer,
            cool_down,
            page_size,
            calls: 0,
        }
    }

    /// API calls made so far.
    pub fn calls(&self) -> u64 {
        self.calls
    }

    fn paced<T>(
        &mut self,
        call: impl FnOnce(&A) -> Result<Page<T>, ApiError>,
    ) -> Result<Page<T>, ApiError> {
        let result = call(self.api);
        self.calls += 1;
        self.pacer.pause(self.cool_down);
        result
    }

    /// Fetch page 1, then the remaining pages it announces.
    fn all_pages<T>(
        &mut self,
        what: &str,
        mut fetch: impl FnMut(&A, PageRequest) -> Result<Page<T>, ApiError>,
    ) -> Result<Fetched<T>, ApiError> {
        let size = self.page_size;
        let first = self.paced(|api| fetch(api, PageRequest::first(size)))?;
        if first.is_empty() {
            debug!(what, "no records");
            return Ok(Fetched {
                rows: Vec::new(),
                total_record: 0,
            });
        }
        let pages = page_count(first.total_record, size);
        let mut rows = first.data;
        for index in 2..=pages {
            let page = self.paced(|api| fetch(api, PageRequest::page(index, size)))?;
            if page.data.is_empty() {
                warn!(what, index, pages, "page came back empty; stopping early");
                break;
            }
            rows.extend(page.data);
        }
        let fetched = Fetched {
            rows,
            total_record: first.total_record,
        };
        if fetched.is_complete() {
            debug!(what, pages, rows = fetched.rows.len(), "fetched");
        } else {
            warn!(
                what,
                rows = fetched.rows.len(),
                total = fetched.total_record,
                "fewer records than announced"
            );
        }
        Ok(fetched)
    }

    /// Every listed security, optionally restricted to one market.
    pub fn securities(
        &mut self,
        market: Option<&str>,
    ) -> Result<Fetched<SecurityListing>, ApiError> {
        let market = market.map(str::to_string);
        self.all_pages("securities", |api, page| {
            api.securities(&SecuritiesRequest {
                page,
                market: market.clone(),
            })
        })
    }

    /// Daily bars of `symbol` between `from` and `to`, oldest first.
    pub fn daily_bars(
        &mut self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyBar>, ApiError> {
        self.all_pages(symbol, |api, page| {
            api.daily_ohlc(&DailyOhlcRequest {
                page,
                symbol: symbol.to_string(),
                from,
                to,
                ascending: true,
            })
        })
        .map(|fetched| fetched.rows)
    }
}
