//! In-process time-series store for tests and `--dry-run`.

use super::{Point, SeriesRecord, TimeRange, TimeSeriesError, TimeSeriesStore};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
pub struct MemoryTimeSeries {
    buckets: Mutex<BTreeMap<String, Vec<Point>>>,
    offline: bool,
}

impl MemoryTimeSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store holding one empty bucket.
    pub fn with_bucket(bucket: &str) -> Self {
        let store = Self::default();
        store.create_bucket(bucket);
        store
    }

    /// A store whose every call fails with a connectivity error.
    pub fn unreachable() -> Self {
        Self {
            offline: true,
            ..Self::default()
        }
    }

    pub fn create_bucket(&self, bucket: &str) {
        self.lock().entry(bucket.to_string()).or_default();
    }

    /// Snapshot of every point written to `bucket`.
    pub fn points(&self, bucket: &str) -> Vec<Point> {
        self.lock().get(bucket).cloned().unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Vec<Point>>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn online(&self) -> Result<(), TimeSeriesError> {
        if self.offline {
            Err(TimeSeriesError::Unreachable("memory time series is unreachable".into()))
        } else {
            Ok(())
        }
    }
}

impl TimeSeriesStore for MemoryTimeSeries {
    fn name(&self) -> &str {
        "memory"
    }

    fn bucket_exists(&self, bucket: &str) -> Result<bool, TimeSeriesError> {
        self.online()?;
        Ok(self.lock().contains_key(bucket))
    }

    fn write(&self, bucket: &str, points: &[Point]) -> Result<usize, TimeSeriesError> {
        self.online()?;
        if points.is_empty() {
            return Err(TimeSeriesError::NoPoints);
        }
        let mut buckets = self.lock();
        let stored = buckets
            .get_mut(bucket)
            .ok_or_else(|| TimeSeriesError::BucketMissing(bucket.to_string()))?;
        for point in points.iter().filter(|p| !p.fields.is_empty()) {
            // Same series and timestamp overwrite, as in InfluxDB.
            stored.retain(|p| {
                !(p.measurement == point.measurement && p.tags == point.tags && p.time == point.time)
            });
            stored.push(point.clone());
        }
        Ok(points.len())
    }

    fn read(
        &self,
        bucket: &str,
        range: &TimeRange,
        measurement: &str,
    ) -> Result<Vec<SeriesRecord>, TimeSeriesError> {
        self.online()?;
        range.validate()?;
        let now = Utc::now();
        let buckets = self.lock();
        let stored = buckets
            .get(bucket)
            .ok_or_else(|| TimeSeriesError::BucketMissing(bucket.to_string()))?;
        let mut records: Vec<SeriesRecord> = stored
            .iter()
            .filter(|p| p.measurement == measurement && range.contains(p.time, now))
            .flat_map(|p| {
                p.fields.iter().map(move |(field, value)| SeriesRecord {
                    time: p.time,
                    measurement: p.measurement.clone(),
                    field: field.clone(),
                    value: value.clone(),
                    tags: p.tags.clone(),
                })
            })
            .collect();
        records.sort_by(|a, b| a.field.cmp(&b.field).then(a.time.cmp(&b.time)));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeseries::FieldValue;
    use chrono::{Duration, TimeZone};

    fn point(day: u32, close: f64) -> Point {
        Point::new("ssi_stocks", Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap())
            .tag("symbol", "FPT")
            .field("close", FieldValue::Float(close))
    }

    #[test]
    fn write_requires_bucket() {
        let ts = MemoryTimeSeries::new();
        assert!(matches!(
            ts.write("root", &[point(1, 1.0)]),
            Err(TimeSeriesError::BucketMissing(_))
        ));
    }

    #[test]
    fn rewrite_replaces_same_timestamp() {
        let ts = MemoryTimeSeries::with_bucket("root");
        ts.write("root", &[point(1, 1.0), point(2, 2.0)]).unwrap();
        ts.write("root", &[point(2, 3.0)]).unwrap();
        assert_eq!(ts.points("root").len(), 2);
    }

    #[test]
    fn read_filters_range_and_measurement() {
        let ts = MemoryTimeSeries::with_bucket("root");
        ts.write("root", &[point(1, 1.0), point(5, 5.0)]).unwrap();
        let range = TimeRange::between(
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 9, 0, 0, 0).unwrap(),
        );
        let records = ts.read("root", &range, "ssi_stocks").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, FieldValue::Float(5.0));
        assert!(ts.read("root", &range, "other").unwrap().is_empty());
        assert!(ts
            .read("root", &TimeRange::last(Duration::seconds(1)), "ssi_stocks")
            .unwrap()
            .is_empty());
    }
}
