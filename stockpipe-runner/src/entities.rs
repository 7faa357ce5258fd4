//! Entity refresh: snapshot the listing into the staging table, then merge it
//! into `Security`.
//!
//! The merge never removes rows. Securities missing from a complete snapshot
//! get a `DelistDate`; securities that reappear have it cleared. A snapshot
//! holding fewer rows than the API reported only inserts and updates.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, info, warn};

use stockpipe_core::market::SecurityListing;
use stockpipe_core::schema::{
    security_staging_table, MARKET, SECURITY, SECURITY_STAGING, SECURITY_TYPE, SYMBOL_MAX_LEN,
};
use stockpipe_core::sql::{Assignment, MergeAction, MergeSpec, Record, SelectQuery, SqlValue};
use stockpipe_core::store::{Store, StoreError};

/// Rows handed to one insert statement.
const STAGING_CHUNK: usize = 1000;

/// Columns copied from staging on both insert and update.
const LISTING_COLUMNS: [&str; 6] = [
    "Name",
    "EnName",
    "ListedShare",
    "MarketCapitalization",
    "Market_ID",
    "SecurityType_ID",
];

/// Outcome of one staging + merge pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EntityOutcome {
    pub listed: usize,
    pub staged: u64,
    pub skipped: usize,
    pub merged: bool,
    /// Whether absent securities were delisted.
    pub delisted_missing: bool,
}

/// Staging → `Security`, matching on `Symbol`. `delist_missing` adds the
/// clause that stamps `DelistDate` on securities absent from staging.
pub fn entity_merge(delist_missing: bool) -> MergeSpec {
    let now = || SqlValue::raw("GETDATE()");
    let mut update: Vec<Assignment> = LISTING_COLUMNS
        .iter()
        .map(|c| Assignment::same_column(c))
        .collect();
    update.push(Assignment::value("UpdateDate", now()));
    update.push(Assignment::value("DelistDate", SqlValue::Null));

    let mut insert = vec![Assignment::same_column("Symbol")];
    insert.extend(LISTING_COLUMNS.iter().map(|c| Assignment::same_column(c)));
    insert.push(Assignment::value("CreateDate", now()));

    let spec = MergeSpec::new(SECURITY_STAGING, SECURITY, "Symbol")
        .when_matched(MergeAction::Update(update))
        .when_not_matched_by_target(MergeAction::Insert(insert));
    if delist_missing {
        spec.when_not_matched_by_source(MergeAction::Update(vec![Assignment::value(
            "DelistDate",
            now(),
        )]))
    } else {
        spec
    }
}

fn symbol_ids<S: Store + ?Sized>(
    store: &mut S,
    database: &str,
    table: &str,
) -> Result<HashMap<String, i64>, StoreError> {
    let rows = store.select(database, table, &SelectQuery::all().columns(["ID", "Symbol"]))?;
    Ok(rows
        .iter()
        .filter_map(|r| Some((r.get_str("Symbol")?.to_string(), r.get_i64("ID")?)))
        .collect())
}

/// `Market.Symbol` → `Market.ID`.
pub fn market_ids<S: Store + ?Sized>(
    store: &mut S,
    database: &str,
) -> Result<HashMap<String, i64>, StoreError> {
    symbol_ids(store, database, MARKET)
}

/// `SecurityType.Symbol` → `SecurityType.ID`.
pub fn security_type_ids<S: Store + ?Sized>(
    store: &mut S,
    database: &str,
) -> Result<HashMap<String, i64>, StoreError> {
    symbol_ids(store, database, SECURITY_TYPE)
}

/// Reference ids a listing is resolved against.
#[derive(Debug, Clone, Default)]
pub struct ReferenceIds {
    pub markets: HashMap<String, i64>,
    pub security_types: HashMap<String, i64>,
}

impl ReferenceIds {
    pub fn load<S: Store + ?Sized>(store: &mut S, database: &str) -> Result<Self, StoreError> {
        Ok(Self {
            markets: market_ids(store, database)?,
            security_types: security_type_ids(store, database)?,
        })
    }
}

fn optional_text(value: &Option<String>) -> SqlValue {
    value.as_deref().map_or(SqlValue::Null, SqlValue::text)
}

fn optional_number(value: Option<i64>) -> SqlValue {
    value.map_or(SqlValue::Null, SqlValue::from)
}

/// Staging record for a listing, or `None` when it cannot be stored.
///
/// An unknown security type is stored as NULL.
pub fn staging_record(listing: &SecurityListing, ids: &ReferenceIds) -> Option<Record> {
    let symbol = listing.symbol.trim();
    if symbol.is_empty() || symbol.chars().count() > usize::from(SYMBOL_MAX_LEN) {
        warn!(symbol, "symbol is empty or too long; skipped");
        return None;
    }
    let Some(&market_id) = ids.markets.get(listing.market.trim()) else {
        warn!(symbol, market = %listing.market, "unknown market; skipped");
        return None;
    };
    let security_type = listing.security_type.as_deref().and_then(|t| {
        let id = ids.security_types.get(t.trim().to_ascii_uppercase().as_str()).copied();
        if id.is_none() {
            debug!(symbol, security_type = t, "unknown security type");
        }
        id
    });
    Some(
        Record::new()
            .set("Symbol", symbol)
            .set("Name", optional_text(&listing.name))
            .set("EnName", optional_text(&listing.en_name))
            .set("ListedShare", optional_number(listing.listed_share))
            .set("MarketCapitalization", optional_number(listing.market_capitalization))
            .set("Market_ID", market_id)
            .set("SecurityType_ID", optional_number(security_type))
            .set("CreateDate", SqlValue::raw("GETDATE()")),
    )
}

/// Replace the staging contents with `listings` and merge them into `Security`.
///
/// `complete` says whether `listings` holds every record the API reported.
/// When it does not, nothing is delisted. An empty snapshot is treated as
/// missing data and nothing is merged.
pub fn stage_and_merge<S: Store + ?Sized>(
    store: &mut S,
    database: &str,
    listings: &[SecurityListing],
    complete: bool,
) -> Result<EntityOutcome, StoreError> {
    let mut outcome = EntityOutcome {
        listed: listings.len(),
        ..EntityOutcome::default()
    };

    store.create_table(database, &security_staging_table())?;
    store.truncate_table(database, SECURITY_STAGING)?;

    let ids = ReferenceIds::load(store, database)?;
    let records: Vec<Record> = listings
        .iter()
        .filter_map(|l| staging_record(l, &ids))
        .collect();
    outcome.skipped = listings.len() - records.len();

    if records.is_empty() {
        warn!(listed = listings.len(), "nothing to stage; merge skipped");
        return Ok(outcome);
    }
    for chunk in records.chunks(STAGING_CHUNK) {
        outcome.staged += store.insert(database, SECURITY_STAGING, chunk)?;
    }
    if !complete {
        warn!(
            listed = listings.len(),
            "listing snapshot is partial; absent securities keep their state"
        );
    }
    outcome.delisted_missing = complete;
    outcome.merged = store.merge(database, &entity_merge(complete))?;
    info!(
        staged = outcome.staged,
        skipped = outcome.skipped,
        delisted_missing = outcome.delisted_missing,
        "entities merged"
    );
    Ok(outcome)
}
