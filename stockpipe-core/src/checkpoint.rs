//! Persisted crawl cursor: one row naming the next (window, symbol) to crawl.

use crate::schema::{checkpoint_table, CRAWL_CHECKPOINT};
use crate::sql::{Condition, Record, SelectQuery, SqlValue};
use crate::store::{Store, StoreError};
use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::{info, warn};

/// The next unit of work of the time-series crawl.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Checkpoint {
    pub window_start: NaiveDateTime,
    pub symbol: String,
}

impl Checkpoint {
    pub fn new(window_start: NaiveDateTime, symbol: impl Into<String>) -> Self {
        Self {
            window_start,
            symbol: symbol.into(),
        }
    }
}

/// Reads and writes the single `CrawlCheckpoint` row of one database.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    database: String,
}

impl CheckpointStore {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
        }
    }

    /// Create the table if it is missing.
    pub fn ensure<S: Store + ?Sized>(&self, store: &mut S) -> Result<(), StoreError> {
        store.create_table(&self.database, &checkpoint_table())?;
        Ok(())
    }

    /// `None` when nothing has been persisted yet.
    pub fn load<S: Store + ?Sized>(&self, store: &mut S) -> Result<Option<Checkpoint>, StoreError> {
        let rows = store.select(
            &self.database,
            CRAWL_CHECKPOINT,
            &SelectQuery::all()
                .columns(["CurrentStartInterval", "CurrentSymbol"])
                .limit(1)
                .order_by("ID"),
        )?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        match (
            row.get_datetime("CurrentStartInterval"),
            row.get_str("CurrentSymbol"),
        ) {
            (Some(window_start), Some(symbol)) => Ok(Some(Checkpoint::new(window_start, symbol))),
            _ => {
                warn!("checkpoint row is incomplete; ignoring it");
                Ok(None)
            }
        }
    }

    /// Insert the row on first use, overwrite it afterwards.
    pub fn save<S: Store + ?Sized>(
        &self,
        store: &mut S,
        checkpoint: &Checkpoint,
    ) -> Result<(), StoreError> {
        let existing = store.select(
            &self.database,
            CRAWL_CHECKPOINT,
            &SelectQuery::all().columns(["ID"]).limit(1).order_by("ID"),
        )?;
        let values = Record::new()
            .set("CurrentStartInterval", checkpoint.window_start)
            .set("CurrentSymbol", checkpoint.symbol.as_str())
            .set("UpdateDate", SqlValue::raw("GETDATE()"));

        match existing.first().and_then(|row| row.get_i64("ID")) {
            Some(id) => {
                store.update(
                    &self.database,
                    CRAWL_CHECKPOINT,
                    &values,
                    None,
                    &[Condition::eq("ID", id)],
                )?;
            }
            None => {
                store.insert(&self.database, CRAWL_CHECKPOINT, &[values])?;
            }
        }
        info!(
            window = %checkpoint.window_start.date(),
            symbol = %checkpoint.symbol,
            "checkpoint saved"
        );
        Ok(())
    }

    /// Forget the cursor; the next crawl starts from the default start date.
    pub fn reset<S: Store + ?Sized>(&self, store: &mut S) -> Result<u64, StoreError> {
        store.delete(&self.database, CRAWL_CHECKPOINT, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::NaiveDate;

    fn day(d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn store() -> (MemoryStore, CheckpointStore) {
        let mut store = MemoryStore::new();
        store.create_database("DB").unwrap();
        let checkpoints = CheckpointStore::new("DB");
        checkpoints.ensure(&mut store).unwrap();
        (store, checkpoints)
    }

    #[test]
    fn empty_until_saved() {
        let (mut store, checkpoints) = store();
        assert_eq!(checkpoints.load(&mut store).unwrap(), None);
    }

    #[test]
    fn save_overwrites_single_row() {
        let (mut store, checkpoints) = store();
        checkpoints.save(&mut store, &Checkpoint::new(day(1), "AAA")).unwrap();
        checkpoints.save(&mut store, &Checkpoint::new(day(2), "BBB")).unwrap();
        assert_eq!(store.row_count("DB", CRAWL_CHECKPOINT), Some(1));
        assert_eq!(
            checkpoints.load(&mut store).unwrap(),
            Some(Checkpoint::new(day(2), "BBB"))
        );
    }

    #[test]
    fn reset_clears() {
        let (mut store, checkpoints) = store();
        checkpoints.save(&mut store, &Checkpoint::new(day(1), "AAA")).unwrap();
        assert_eq!(checkpoints.reset(&mut store).unwrap(), 1);
        assert_eq!(checkpoints.load(&mut store).unwrap(), None);
    }

    #[test]
    fn ensure_is_idempotent() {
        let (mut store, checkpoints) = store();
        checkpoints.ensure(&mut store).unwrap();
        assert!(store.table_exists("DB", CRAWL_CHECKPOINT).unwrap());
    }
}
