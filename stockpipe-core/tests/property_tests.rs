//! Property tests for literal escaping, statement rendering and line protocol.
//!
//! Uses proptest to verify:
//! 1. NVARCHAR literals always parse back to the input text
//! 2. Rendering substitutes every placeholder, however many there are
//! 3. Stored text selects back unchanged through the memory store
//! 4. Line-protocol tag values never leak unescaped separators

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use stockpipe_core::sql::builder::build_insert;
use stockpipe_core::sql::{format_value, Condition, Record, SelectQuery, SqlValue};
use stockpipe_core::store::{MemoryStore, Store};
use stockpipe_core::timeseries::line_protocol::encode_point;
use stockpipe_core::timeseries::{FieldValue, Point};

/// Undo `N'...'` quoting: strip the wrapper, collapse doubled quotes.
fn unquote(literal: &str) -> Option<String> {
    let inner = literal.strip_prefix("N'")?.strip_suffix('\'')?;
    let mut out = String::new();
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\'' {
            // A lone quote would have terminated the literal.
            if chars.next() != Some('\'') {
                return None;
            }
        }
        out.push(c);
    }
    Some(out)
}

// ── 1. Escaping ──────────────────────────────────────────────────────

proptest! {
    #[test]
    fn nvarchar_literal_round_trips(text in ".*") {
        let literal = format_value(&SqlValue::text(text.clone()));
        prop_assert_eq!(unquote(&literal), Some(text));
    }
}

// ── 2. Rendering ─────────────────────────────────────────────────────

proptest! {
    #[test]
    fn render_replaces_every_placeholder(values in prop::collection::vec(-1000i32..1000, 1..40)) {
        let records: Vec<Record> = values.iter().map(|v| Record::new().set("V", *v)).collect();
        let statements = build_insert("DB", "T", &records).unwrap();
        prop_assert_eq!(statements.len(), 1);
        let statement = &statements[0];
        prop_assert_eq!(statement.params.len(), values.len());

        let rendered = statement.render();
        prop_assert!(!rendered.contains("@P"));
        let expected: Vec<String> = values.iter().map(|v| format!("    ({v})")).collect();
        let body = rendered.split_once("VALUES\n").map(|(_, b)| b).unwrap_or_default();
        prop_assert_eq!(body, expected.join(",\n"));
    }
}

// ── 3. Stored text ───────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn text_selects_back_unchanged(name in "[a-zA-Z0-9 '%_\\[\\]]{1,60}") {
        let mut store = MemoryStore::new();
        store.create_database("DB").unwrap();
        store.create_table("DB", &stockpipe_core::schema::market_table()).unwrap();
        store
            .insert(
                "DB",
                "Market",
                &[Record::new()
                    .set("Symbol", "X")
                    .set("Name", name.as_str())
                    .set("EnName", name.as_str())
                    .set("CreateDate", SqlValue::raw("GETDATE()"))],
            )
            .unwrap();
        let rows = store
            .select("DB", "Market", &SelectQuery::all().filter(Condition::eq("Name", name.as_str())))
            .unwrap();
        prop_assert_eq!(rows.len(), 1);
        prop_assert_eq!(rows[0].get_str("EnName"), Some(name.as_str()));
    }
}

// ── 4. Line protocol ─────────────────────────────────────────────────

proptest! {
    #[test]
    fn tag_values_stay_escaped(value in "[a-z ,=]{1,20}") {
        let point = Point::new("ssi_stocks", Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap())
            .tag("symbol", value.as_str())
            .field("close", FieldValue::Float(1.0));
        let line = encode_point(&point);
        // Exactly two unescaped spaces: after the tag set and before the timestamp.
        let bytes = line.as_bytes();
        let unescaped_spaces = bytes
            .iter()
            .enumerate()
            .filter(|(i, b)| **b == b' ' && (*i == 0 || bytes[i - 1] != b'\\'))
            .count();
        prop_assert_eq!(unescaped_spaces, 2);
        prop_assert!(line.ends_with(" 1704153600"));
    }
}
