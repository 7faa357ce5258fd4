//! Catalog checks shared by every backend. They only read the catalog; the
//! caller issues the statement once they pass.

use super::{Store, StoreError};
use crate::sql::{JoinSpec, MergeSpec, TableDescriptor};
use tracing::{error, warn};

pub fn require_database<S: Store + ?Sized>(
    store: &mut S,
    database: &str,
    action: &str,
) -> Result<(), StoreError> {
    if store.database_exists(database)? {
        Ok(())
    } else {
        warn!(database, "cannot {action}: database does not exist");
        Err(StoreError::database_missing(database))
    }
}

pub fn require_table<S: Store + ?Sized>(
    store: &mut S,
    database: &str,
    table: &str,
    action: &str,
) -> Result<(), StoreError> {
    require_database(store, database, action)?;
    if store.table_exists(database, table)? {
        Ok(())
    } else {
        warn!(database, table, "cannot {action}: table does not exist");
        Err(StoreError::table_missing(database, table))
    }
}

/// Runs the create-table checks in order, each short-circuiting the rest.
/// `Ok(false)` means the table already exists and nothing should be created.
pub fn check_create_table<S: Store + ?Sized>(
    store: &mut S,
    database: &str,
    table: &TableDescriptor,
) -> Result<bool, StoreError> {
    if let Err(e) = table.check_column_names() {
        error!(table = %table.name, "cannot create table: {e}");
        return Err(e);
    }
    require_database(store, database, "create table")?;
    if store.table_exists(database, &table.name)? {
        warn!(database, table = %table.name, "table already exists");
        return Ok(false);
    }
    for fk in &table.foreign_keys {
        if !store.table_exists(database, &fk.referenced_table)? {
            error!(
                database,
                table = %table.name,
                referenced = %fk.referenced_table,
                "cannot create table: referenced table does not exist"
            );
            return Err(StoreError::ForeignKeyTableMissing {
                table: table.name.clone(),
                referenced: fk.referenced_table.clone(),
            });
        }
    }
    if table.key().is_none() {
        error!(
            table = %table.name,
            key = %table.key_column,
            "cannot create table: key column is not among the columns"
        );
        return Err(StoreError::KeyColumnMissing {
            table: table.name.clone(),
            column: table.key_column.clone(),
        });
    }
    Ok(true)
}

/// Every table a join names must exist.
pub fn check_join<S: Store + ?Sized>(
    store: &mut S,
    database: &str,
    join: &JoinSpec,
) -> Result<(), StoreError> {
    for table in join.referenced_tables() {
        if !store.table_exists(database, table)? {
            error!(database, table, "join references a table that does not exist");
            return Err(StoreError::table_missing(database, table));
        }
    }
    Ok(())
}

/// Database, source and target must exist. `Ok(false)` when the merge has no
/// action and must not be executed.
pub fn check_merge<S: Store + ?Sized>(
    store: &mut S,
    database: &str,
    spec: &MergeSpec,
) -> Result<bool, StoreError> {
    require_table(store, database, &spec.source, "merge")?;
    require_table(store, database, &spec.target, "merge")?;
    if spec.is_noop() {
        warn!(
            source = %spec.source,
            target = %spec.target,
            "merge has no action; nothing to execute"
        );
        return Ok(false);
    }
    if let Err(e) = spec.validate_actions() {
        error!(target = %spec.target, "invalid merge: {e}");
        return Err(e);
    }
    Ok(true)
}
