//! Time-series store collaborator: batched point writes, a single
//! range + measurement read, and a bucket probe.

pub mod influx;
pub mod line_protocol;
pub mod memory;

pub use influx::{InfluxClient, InfluxSettings};
pub use memory::MemoryTimeSeries;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TimeSeriesError {
    #[error("time-series store unreachable: {0}")]
    Unreachable(String),

    #[error("bucket \"{0}\" does not exist")]
    BucketMissing(String),

    #[error("no points to write")]
    NoPoints,

    #[error("invalid time range: {0}")]
    InvalidRange(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("cannot parse response: {0}")]
    Parse(String),
}

impl TimeSeriesError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, TimeSeriesError::Unreachable(_))
    }
}

/// A field value as stored by the time-series engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Text(String),
    Bool(bool),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Integer(v) => write!(f, "{v}"),
            FieldValue::Text(v) => f.write_str(v),
            FieldValue::Bool(v) => write!(f, "{v}"),
        }
    }
}

/// One measurement sample: tags, at least one field, a timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub time: DateTime<Utc>,
}

impl Point {
    pub fn new(measurement: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            time,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

/// One (time, field) value read back, flattened like a Flux record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesRecord {
    pub time: DateTime<Utc>,
    pub measurement: String,
    pub field: String,
    pub value: FieldValue,
    pub tags: BTreeMap<String, String>,
}

/// A range boundary: absolute instant or a duration before now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeBound {
    At(DateTime<Utc>),
    Ago(Duration),
}

impl RangeBound {
    pub fn resolve(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            RangeBound::At(t) => *t,
            RangeBound::Ago(d) => now - *d,
        }
    }

    /// Flux literal: RFC 3339 instant or a negative duration in seconds.
    pub fn to_flux(&self) -> String {
        match self {
            RangeBound::At(t) => t.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            RangeBound::Ago(d) => format!("-{}s", d.num_seconds()),
        }
    }
}

/// `range(start: ..., stop: ...)`; no stop means "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: RangeBound,
    pub stop: Option<RangeBound>,
}

impl TimeRange {
    pub fn between(start: DateTime<Utc>, stop: DateTime<Utc>) -> Self {
        Self {
            start: RangeBound::At(start),
            stop: Some(RangeBound::At(stop)),
        }
    }

    pub fn last(duration: Duration) -> Self {
        Self {
            start: RangeBound::Ago(duration),
            stop: None,
        }
    }

    pub fn validate(&self) -> Result<(), TimeSeriesError> {
        let now = Utc::now();
        let start = self.start.resolve(now);
        let stop = self.stop.map_or(now, |s| s.resolve(now));
        if start < stop {
            Ok(())
        } else {
            Err(TimeSeriesError::InvalidRange(format!(
                "start {} is not before stop {}",
                self.start.to_flux(),
                self.stop.map_or_else(|| "now()".to_string(), |s| s.to_flux())
            )))
        }
    }

    pub fn contains(&self, t: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let stop = self.stop.map_or(now, |s| s.resolve(now));
        t >= self.start.resolve(now) && t < stop
    }
}

/// Write/read access to buckets of a time-series database.
pub trait TimeSeriesStore: Send + Sync {
    fn name(&self) -> &str;

    /// Probe with a trivial query.
    fn bucket_exists(&self, bucket: &str) -> Result<bool, TimeSeriesError>;

    /// Write all points in one batch; returns the number written.
    fn write(&self, bucket: &str, points: &[Point]) -> Result<usize, TimeSeriesError>;

    /// Every field value of `measurement` inside `range`.
    fn read(
        &self,
        bucket: &str,
        range: &TimeRange,
        measurement: &str,
    ) -> Result<Vec<SeriesRecord>, TimeSeriesError>;
}

impl<T: TimeSeriesStore + ?Sized> TimeSeriesStore for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }
    fn bucket_exists(&self, bucket: &str) -> Result<bool, TimeSeriesError> {
        (**self).bucket_exists(bucket)
    }
    fn write(&self, bucket: &str, points: &[Point]) -> Result<usize, TimeSeriesError> {
        (**self).write(bucket, points)
    }
    fn read(
        &self,
        bucket: &str,
        range: &TimeRange,
        measurement: &str,
    ) -> Result<Vec<SeriesRecord>, TimeSeriesError> {
        (**self).read(bucket, range, measurement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn range_rejects_reversed_bounds() {
        let a = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(TimeRange::between(b, a).validate().is_ok());
        assert!(matches!(
            TimeRange::between(a, b).validate(),
            Err(TimeSeriesError::InvalidRange(_))
        ));
    }

    #[test]
    fn flux_bounds() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 7, 0, 0).unwrap();
        assert_eq!(RangeBound::At(t).to_flux(), "2024-03-01T07:00:00Z");
        assert_eq!(RangeBound::Ago(Duration::days(1)).to_flux(), "-86400s");
    }
}
