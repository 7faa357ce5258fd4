//! Reference-table seeding.
//!
//! A table counts as seeded when it holds exactly the canonical symbols,
//! no more and no fewer. Anything else is purged and written again.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{info, warn};

use stockpipe_core::market::{reference_sets, ReferenceSet};
use stockpipe_core::sql::SelectQuery;
use stockpipe_core::store::{Store, StoreError};

/// What seeding did to one reference table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SeedAction {
    Unchanged,
    Reseeded { deleted: u64, inserted: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeedOutcome {
    pub table: String,
    pub action: SeedAction,
}

/// Whether `table` already holds exactly the canonical rows of `set`.
pub fn is_seeded<S: Store + ?Sized>(
    store: &mut S,
    database: &str,
    set: &ReferenceSet,
) -> Result<bool, StoreError> {
    let rows = store.select(database, set.table, &SelectQuery::all().columns(["Symbol"]))?;
    let existing: BTreeSet<&str> = rows.iter().filter_map(|r| r.get_str("Symbol")).collect();
    let canonical: BTreeSet<&str> = set.symbols().collect();
    Ok(rows.len() == set.rows.len() && existing == canonical)
}

/// Bring one reference table to its canonical rows.
pub fn seed_set<S: Store + ?Sized>(
    store: &mut S,
    database: &str,
    set: &ReferenceSet,
) -> Result<SeedOutcome, StoreError> {
    if is_seeded(store, database, set)? {
        info!(table = set.table, rows = set.rows.len(), "reference table already seeded");
        return Ok(SeedOutcome {
            table: set.table.to_string(),
            action: SeedAction::Unchanged,
        });
    }

    let deleted = store.delete(database, set.table, &[])?;
    if deleted > 0 {
        warn!(table = set.table, deleted, "reference rows differ from canonical set; purged");
    }
    let inserted = store.insert(database, set.table, &set.records())?;
    info!(table = set.table, inserted, "reference table seeded");
    Ok(SeedOutcome {
        table: set.table.to_string(),
        action: SeedAction::Reseeded { deleted, inserted },
    })
}

/// Seed every reference table, in dependency order.
pub fn seed_reference<S: Store + ?Sized>(
    store: &mut S,
    database: &str,
) -> Result<Vec<SeedOutcome>, StoreError> {
    reference_sets()
        .iter()
        .map(|set| seed_set(store, database, set))
        .collect()
}
