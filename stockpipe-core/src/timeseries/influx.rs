//! InfluxDB v2 over its HTTP API: line-protocol writes and Flux reads
//! returned as CSV carrying the `#datatype` annotation.

use super::{
    line_protocol, FieldValue, Point, SeriesRecord, TimeRange, TimeSeriesError, TimeSeriesStore,
};
use chrono::{DateTime, Utc};
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error, info};

/// Connection settings of an InfluxDB v2 instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfluxSettings {
    pub url: String,
    pub org: String,
    pub token: String,
}

impl Default for InfluxSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:8086".into(),
            org: String::new(),
            token: String::new(),
        }
    }
}

pub struct InfluxClient {
    client: Client,
    settings: InfluxSettings,
}

/// `from(bucket: "b") |> range(start: -1s)`
pub fn probe_query(bucket: &str) -> String {
    format!("from(bucket: \"{}\")\n  |> range(start: -1s)", flux_string(bucket))
}

/// Range + measurement read.
pub fn read_query(bucket: &str, range: &TimeRange, measurement: &str) -> String {
    let stop = range
        .stop
        .map(|s| format!(", stop: {}", s.to_flux()))
        .unwrap_or_default();
    format!(
        "from(bucket: \"{}\")\n  |> range(start: {}{stop})\n  |> filter(fn: (r) => r[\"_measurement\"] == \"{}\")",
        flux_string(bucket),
        range.start.to_flux(),
        flux_string(measurement)
    )
}

fn flux_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Decode a `_value` cell by its `#datatype` annotation. Without one the
/// cell is guessed, integers first.
fn parse_field_value(raw: &str, datatype: Option<&str>) -> Result<FieldValue, TimeSeriesError> {
    let bad = |e: &dyn std::fmt::Display| {
        TimeSeriesError::Parse(format!("_value {raw:?} as {}: {e}", datatype.unwrap_or("?")))
    };
    match datatype {
        Some("double") => raw.parse::<f64>().map(FieldValue::Float).map_err(|e| bad(&e)),
        Some("long") => raw.parse::<i64>().map(FieldValue::Integer).map_err(|e| bad(&e)),
        Some("unsignedLong") => raw
            .parse::<u64>()
            .map_err(|e| bad(&e))
            .and_then(|v| i64::try_from(v).map_err(|e| bad(&e)))
            .map(FieldValue::Integer),
        Some("boolean") => raw.parse::<bool>().map(FieldValue::Bool).map_err(|e| bad(&e)),
        Some(_) => Ok(FieldValue::Text(raw.to_string())),
        None => Ok(if let Ok(v) = raw.parse::<i64>() {
            FieldValue::Integer(v)
        } else if let Ok(v) = raw.parse::<f64>() {
            FieldValue::Float(v)
        } else if let Ok(v) = raw.parse::<bool>() {
            FieldValue::Bool(v)
        } else {
            FieldValue::Text(raw.to_string())
        }),
    }
}

const SYSTEM_COLUMNS: [&str; 3] = ["", "result", "table"];
const DATATYPE_ANNOTATION: &str = "#datatype";

/// Parse Flux CSV. Tables are separated by blank lines; each starts with an
/// optional `#datatype` row followed by the header.
pub fn parse_csv(body: &str) -> Result<Vec<SeriesRecord>, TimeSeriesError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body.as_bytes());

    let mut datatypes: Option<Vec<String>> = None;
    let mut header: Option<Vec<String>> = None;
    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| TimeSeriesError::Parse(e.to_string()))?;
        if row.iter().all(str::is_empty) {
            datatypes = None;
            header = None;
            continue;
        }
        if row.get(0) == Some(DATATYPE_ANNOTATION) {
            datatypes = Some(row.iter().map(str::to_string).collect());
            header = None;
            continue;
        }
        if row.get(0).is_some_and(|c| c.starts_with('#')) {
            continue;
        }
        if row.iter().any(|c| c == "_time") && row.iter().any(|c| c == "_value") {
            header = Some(row.iter().map(str::to_string).collect());
            continue;
        }
        let Some(columns) = header.as_ref() else {
            return Err(TimeSeriesError::Parse("data row before header".into()));
        };

        let mut time = None;
        let mut measurement = String::new();
        let mut field = String::new();
        let mut value = None;
        let mut tags = BTreeMap::new();
        for (i, (name, cell)) in columns.iter().zip(row.iter()).enumerate() {
            match name.as_str() {
                "_time" => {
                    time = Some(
                        DateTime::parse_from_rfc3339(cell)
                            .map_err(|e| TimeSeriesError::Parse(format!("_time {cell}: {e}")))?
                            .with_timezone(&Utc),
                    )
                }
                "_measurement" => measurement = cell.to_string(),
                "_field" => field = cell.to_string(),
                "_value" => {
                    let datatype = datatypes.as_ref().and_then(|d| d.get(i)).map(String::as_str);
                    value = Some(parse_field_value(cell, datatype)?);
                }
                n if n.starts_with('_') || SYSTEM_COLUMNS.contains(&n) => {}
                n => {
                    tags.insert(n.to_string(), cell.to_string());
                }
            }
        }
        match (time, value) {
            (Some(time), Some(value)) => records.push(SeriesRecord {
                time,
                measurement,
                field,
                value,
                tags,
            }),
            _ => return Err(TimeSeriesError::Parse("row without _time or _value".into())),
        }
    }
    Ok(records)
}

impl InfluxClient {
    pub fn new(settings: InfluxSettings) -> Result<Self, TimeSeriesError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TimeSeriesError::Unreachable(e.to_string()))?;
        Ok(Self { client, settings })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/v2/{path}", self.settings.url.trim_end_matches('/'))
    }

    fn auth(&self) -> String {
        format!("Token {}", self.settings.token)
    }

    fn send_query(&self, flux: &str) -> Result<Response, TimeSeriesError> {
        debug!(flux, "influx query");
        let body = json!({
            "query": flux,
            "type": "flux",
            "dialect": { "header": true, "annotations": ["datatype"], "delimiter": "," },
        });
        self.client
            .post(self.endpoint("query"))
            .query(&[("org", self.settings.org.as_str())])
            .header("Authorization", self.auth())
            .header("Accept", "application/csv")
            .json(&body)
            .send()
            .map_err(|e| TimeSeriesError::Unreachable(e.to_string()))
    }

    fn require_bucket(&self, bucket: &str) -> Result<(), TimeSeriesError> {
        if self.bucket_exists(bucket)? {
            Ok(())
        } else {
            error!(bucket, "bucket does not exist");
            Err(TimeSeriesError::BucketMissing(bucket.to_string()))
        }
    }
}

fn http_error(resp: Response) -> TimeSeriesError {
    let status = resp.status().as_u16();
    let body = resp.text().unwrap_or_default();
    TimeSeriesError::Http { status, body }
}

impl TimeSeriesStore for InfluxClient {
    fn name(&self) -> &str {
        "influxdb"
    }

    fn bucket_exists(&self, bucket: &str) -> Result<bool, TimeSeriesError> {
        let resp = self.send_query(&probe_query(bucket))?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(http_error(resp)),
        }
    }

    fn write(&self, bucket: &str, points: &[Point]) -> Result<usize, TimeSeriesError> {
        if points.is_empty() {
            return Err(TimeSeriesError::NoPoints);
        }
        self.require_bucket(bucket)?;
        let body = line_protocol::encode(points);
        let resp = self
            .client
            .post(self.endpoint("write"))
            .query(&[
                ("org", self.settings.org.as_str()),
                ("bucket", bucket),
                ("precision", "s"),
            ])
            .header("Authorization", self.auth())
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .map_err(|e| TimeSeriesError::Unreachable(e.to_string()))?;
        if !resp.status().is_success() {
            let e = http_error(resp);
            error!(bucket, "cannot write points: {e}");
            return Err(e);
        }
        info!(bucket, points = points.len(), "wrote points");
        Ok(points.len())
    }

    fn read(
        &self,
        bucket: &str,
        range: &TimeRange,
        measurement: &str,
    ) -> Result<Vec<SeriesRecord>, TimeSeriesError> {
        range.validate()?;
        self.require_bucket(bucket)?;
        let resp = self.send_query(&read_query(bucket, range, measurement))?;
        if !resp.status().is_success() {
            return Err(http_error(resp));
        }
        let body = resp
            .text()
            .map_err(|e| TimeSeriesError::Parse(e.to_string()))?;
        let records = parse_csv(&body)?;
        info!(bucket, records = records.len(), "read records");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn probe_is_trivial_range() {
        assert_eq!(
            probe_query("root"),
            "from(bucket: \"root\")\n  |> range(start: -1s)"
        );
    }

    #[test]
    fn read_query_has_stop_and_filter() {
        let range = TimeRange::between(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
        );
        assert_eq!(
            read_query("root", &range, "ssi_stocks"),
            "from(bucket: \"root\")\n  |> range(start: 2024-01-01T00:00:00Z, stop: 2024-02-01T00:00:00Z)\n  \
             |> filter(fn: (r) => r[\"_measurement\"] == \"ssi_stocks\")"
        );
    }

    #[test]
    fn parses_multi_table_csv_by_declared_type() {
        let body = "#datatype,string,long,dateTime:RFC3339,dateTime:RFC3339,dateTime:RFC3339,double,string,string,string,string\r\n\
,result,table,_start,_stop,_time,_value,_field,_measurement,market,symbol\r\n\
,_result,0,2024-01-01T00:00:00Z,2024-02-01T00:00:00Z,2024-01-02T00:00:00Z,95000,close,ssi_stocks,HOSE,FPT\r\n\
\r\n\
#datatype,string,long,dateTime:RFC3339,dateTime:RFC3339,dateTime:RFC3339,long,string,string,string,string\r\n\
,result,table,_start,_stop,_time,_value,_field,_measurement,market,symbol\r\n\
,_result,1,2024-01-01T00:00:00Z,2024-02-01T00:00:00Z,2024-01-02T00:00:00Z,1234567,volume,ssi_stocks,HOSE,FPT\r\n";
        let records = parse_csv(body).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].field, "close");
        assert_eq!(records[0].value, FieldValue::Float(95000.0));
        assert_eq!(records[1].value, FieldValue::Integer(1_234_567));
        assert_eq!(records[1].tags.get("symbol").map(String::as_str), Some("FPT"));
        assert!(!records[0].tags.contains_key("table"));
    }

    #[test]
    fn unannotated_csv_guesses_value_type() {
        let body = ",result,table,_time,_value,_field,_measurement\r\n\
,_result,0,2024-01-02T00:00:00Z,1.5,value,ssi_stocks\r\n";
        let records = parse_csv(body).unwrap();
        assert_eq!(records[0].value, FieldValue::Float(1.5));
    }

    #[test]
    fn value_not_matching_declared_type_is_parse_error() {
        let body = "#datatype,string,long,dateTime:RFC3339,double,string,string\r\n\
,result,table,_time,_value,_field,_measurement\r\n\
,_result,0,2024-01-02T00:00:00Z,high,close,ssi_stocks\r\n";
        assert!(matches!(parse_csv(body), Err(TimeSeriesError::Parse(_))));
    }

    #[test]
    fn empty_body_is_no_records() {
        assert!(parse_csv("").unwrap().is_empty());
    }
}
