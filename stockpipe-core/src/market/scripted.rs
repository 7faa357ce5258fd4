//! Canned market-data API that serves fixed listings and bars, paged the way
//! the real API pages them, and records every call.

use super::provider::{
    ApiError, DailyBar, DailyOhlcRequest, MarketDataApi, Page, SecuritiesRequest, SecurityListing,
};
use chrono::NaiveDate;
use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    Securities { page: u32 },
    DailyOhlc { symbol: String, from: NaiveDate, to: NaiveDate, page: u32 },
}

#[derive(Debug, Default)]
pub struct ScriptedApi {
    securities: Mutex<Vec<SecurityListing>>,
    bars: Vec<DailyBar>,
    failing: BTreeSet<String>,
    calls: Mutex<Vec<ApiCall>>,
}

impl ScriptedApi {
    pub fn new(securities: Vec<SecurityListing>, bars: Vec<DailyBar>) -> Self {
        Self {
            securities: Mutex::new(securities),
            bars,
            ..Self::default()
        }
    }

    /// Daily bars for `symbol` fail with a connectivity error.
    pub fn failing_on(mut self, symbol: &str) -> Self {
        self.failing.insert(symbol.to_string());
        self
    }

    /// Replace the listing served from now on.
    pub fn set_securities(&self, securities: Vec<SecurityListing>) {
        *lock(&self.securities) = securities;
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        lock(&self.calls).clone()
    }

    /// `(symbol, from)` of every daily-bar call, in order.
    pub fn ohlc_calls(&self) -> Vec<(String, NaiveDate)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ApiCall::DailyOhlc { symbol, from, .. } => Some((symbol, from)),
                ApiCall::Securities { .. } => None,
            })
            .collect()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn paged<T: Clone>(rows: &[T], index: u32, size: u32) -> Page<T> {
    let start = ((index - 1) * size) as usize;
    let data = rows.iter().skip(start).take(size as usize).cloned().collect();
    Page {
        message: "Success".into(),
        status: "200".into(),
        total_record: rows.len() as u64,
        data,
    }
}

impl MarketDataApi for ScriptedApi {
    fn name(&self) -> &str {
        "scripted"
    }

    fn securities(&self, request: &SecuritiesRequest) -> Result<Page<SecurityListing>, ApiError> {
        request.page.validate()?;
        lock(&self.calls).push(ApiCall::Securities {
            page: request.page.index,
        });
        let rows: Vec<SecurityListing> = lock(&self.securities)
            .iter()
            .filter(|s| request.market.as_ref().map_or(true, |m| &s.market == m))
            .cloned()
            .collect();
        Ok(paged(&rows, request.page.index, request.page.size.get()))
    }

    fn daily_ohlc(&self, request: &DailyOhlcRequest) -> Result<Page<DailyBar>, ApiError> {
        request.validate()?;
        lock(&self.calls).push(ApiCall::DailyOhlc {
            symbol: request.symbol.clone(),
            from: request.from,
            to: request.to,
            page: request.page.index,
        });
        if self.failing.contains(&request.symbol) {
            return Err(ApiError::NetworkUnreachable(format!(
                "scripted failure for {}",
                request.symbol
            )));
        }
        let mut rows: Vec<DailyBar> = self
            .bars
            .iter()
            .filter(|b| {
                b.symbol == request.symbol
                    && b.trading_date >= request.from
                    && b.trading_date <= request.to
            })
            .cloned()
            .collect();
        rows.sort_by_key(|b| b.trading_date);
        if !request.ascending {
            rows.reverse();
        }
        Ok(paged(&rows, request.page.index, request.page.size.get()))
    }

    fn is_available(&self) -> bool {
        true
    }
}
