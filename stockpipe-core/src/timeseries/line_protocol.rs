//! InfluxDB line protocol encoding at second precision.

use super::{FieldValue, Point};

/// Measurement names escape commas and spaces.
fn escape_measurement(s: &str) -> String {
    escape(s, &[',', ' '])
}

/// Tag keys, tag values and field keys also escape `=`.
fn escape_key(s: &str) -> String {
    escape(s, &[',', '=', ' '])
}

fn escape(s: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn encode_field(value: &FieldValue) -> String {
    match value {
        FieldValue::Float(v) => {
            let s = v.to_string();
            // Integral floats must keep a decimal point or they read back as integers.
            if s.contains(['.', 'e', 'E']) || !v.is_finite() {
                s
            } else {
                format!("{s}.0")
            }
        }
        FieldValue::Integer(v) => format!("{v}i"),
        FieldValue::Bool(v) => v.to_string(),
        FieldValue::Text(v) => format!("\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")),
    }
}

/// `measurement,tag=v field=v <unix seconds>`. Empty tag values are dropped.
pub fn encode_point(point: &Point) -> String {
    let mut line = escape_measurement(&point.measurement);
    for (key, value) in &point.tags {
        if value.is_empty() {
            continue;
        }
        line.push(',');
        line.push_str(&escape_key(key));
        line.push('=');
        line.push_str(&escape_key(value));
    }
    let fields: Vec<String> = point
        .fields
        .iter()
        .map(|(k, v)| format!("{}={}", escape_key(k), encode_field(v)))
        .collect();
    line.push(' ');
    line.push_str(&fields.join(","));
    line.push(' ');
    line.push_str(&point.time.timestamp().to_string());
    line
}

/// One line per point. Points without fields are skipped.
pub fn encode(points: &[Point]) -> String {
    points
        .iter()
        .filter(|p| !p.fields.is_empty())
        .map(encode_point)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn point() -> Point {
        Point::new("ssi_stocks", Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap())
            .tag("symbol", "FPT")
            .tag("market", "HOSE")
            .field("close", FieldValue::Float(95000.0))
            .field("volume", FieldValue::Integer(1200))
    }

    #[test]
    fn encodes_sorted_tags_and_fields() {
        assert_eq!(
            encode_point(&point()),
            "ssi_stocks,market=HOSE,symbol=FPT close=95000.0,volume=1200i 1704153600"
        );
    }

    #[test]
    fn escapes_special_characters() {
        let p = Point::new("my meas,x", Utc.timestamp_opt(0, 0).unwrap())
            .tag("k=1", "a b")
            .field("note", FieldValue::Text("say \"hi\"".into()));
        assert_eq!(
            encode_point(&p),
            "my\\ meas\\,x,k\\=1=a\\ b note=\"say \\\"hi\\\"\" 0"
        );
    }

    #[test]
    fn skips_empty_tags_and_fieldless_points() {
        let bare = Point::new("m", Utc.timestamp_opt(0, 0).unwrap()).tag("t", "");
        assert_eq!(encode(&[bare, point()]).lines().count(), 1);
    }
}
