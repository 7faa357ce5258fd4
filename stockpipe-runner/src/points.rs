//! Daily bars as time-series points.

use chrono::{NaiveTime, TimeZone, Utc};
use stockpipe_core::market::DailyBar;
use stockpipe_core::timeseries::{FieldValue, Point};

/// One point per bar, stamped at midnight UTC of the trading date and tagged
/// with symbol and market. A bar without a market takes `market`.
pub fn bar_point(bar: &DailyBar, measurement: &str, market: &str) -> Point {
    let time = Utc.from_utc_datetime(&bar.trading_date.and_time(NaiveTime::MIN));
    let market = if bar.market.trim().is_empty() {
        market
    } else {
        bar.market.trim()
    };
    Point::new(measurement, time)
        .tag("symbol", bar.symbol.as_str())
        .tag("market", market)
        .field("open", FieldValue::Float(bar.open))
        .field("high", FieldValue::Float(bar.high))
        .field("low", FieldValue::Float(bar.low))
        .field("close", FieldValue::Float(bar.close))
        .field("volume", FieldValue::Integer(bar.volume))
        .field("value", FieldValue::Float(bar.value))
}
