//! SQL Server backend: every operation becomes T-SQL on a [`Connection`].

use super::validate::{check_create_table, check_join, check_merge, require_table};
use super::{Connection, Row, Store, StoreError};
use crate::sql::builder::{
    build_begin_transaction, build_commit_transaction, build_create_database, build_create_table,
    build_database_exists, build_delete, build_drop, build_insert, build_merge,
    build_rollback_transaction, build_select, build_table_exists, build_truncate, build_update,
    build_use_database,
};
use crate::sql::{Condition, JoinSpec, MergeSpec, Record, SelectQuery, Statement, TableDescriptor};
use tracing::{error, info, warn};

pub struct SqlServerStore<C: Connection> {
    connection: C,
    current_database: Option<String>,
}

impl<C: Connection> SqlServerStore<C> {
    pub fn new(connection: C) -> Self {
        Self {
            connection,
            current_database: None,
        }
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn into_connection(self) -> C {
        self.connection
    }

    fn execute(&mut self, statement: &Statement) -> Result<u64, StoreError> {
        self.connection.execute(statement).map_err(|e| {
            error!(sql = %statement.render(), "statement failed: {e}");
            e
        })
    }

    fn query(&mut self, statement: &Statement) -> Result<Vec<Row>, StoreError> {
        self.connection.query(statement).map_err(|e| {
            error!(sql = %statement.render(), "query failed: {e}");
            e
        })
    }

    fn batch(&mut self, statement: &Statement) -> Result<(), StoreError> {
        self.connection.batch(statement).map_err(|e| {
            error!(sql = %statement.render(), "batch failed: {e}");
            e
        })
    }
}

impl<C: Connection> Store for SqlServerStore<C> {
    fn name(&self) -> &str {
        "sqlserver"
    }

    fn current_database(&self) -> Option<&str> {
        self.current_database.as_deref()
    }

    fn database_exists(&mut self, database: &str) -> Result<bool, StoreError> {
        let rows = self.query(&build_database_exists(database))?;
        Ok(!rows.is_empty())
    }

    fn table_exists(&mut self, database: &str, table: &str) -> Result<bool, StoreError> {
        let rows = self.query(&build_table_exists(database, table))?;
        Ok(!rows.is_empty())
    }

    fn create_database(&mut self, database: &str) -> Result<bool, StoreError> {
        if self.database_exists(database)? {
            warn!(database, "database already exists");
            return Ok(false);
        }
        self.batch(&build_create_database(database))?;
        self.batch(&build_use_database(database))?;
        self.current_database = Some(database.to_string());
        info!(database, "created database");
        Ok(true)
    }

    fn create_table(&mut self, database: &str, table: &TableDescriptor) -> Result<bool, StoreError> {
        if !check_create_table(self, database, table)? {
            return Ok(false);
        }
        let statement = build_create_table(database, table)?;
        self.execute(&statement)?;
        info!(database, table = %table.name, "created table");
        Ok(true)
    }

    fn select(
        &mut self,
        database: &str,
        table: &str,
        query: &SelectQuery,
    ) -> Result<Vec<Row>, StoreError> {
        require_table(self, database, table, "select")?;
        let statement = build_select(database, table, query)?;
        self.query(&statement)
    }

    fn insert(
        &mut self,
        database: &str,
        table: &str,
        records: &[Record],
    ) -> Result<u64, StoreError> {
        if records.is_empty() {
            warn!(table, "no records to insert");
            return Err(StoreError::EmptyInsert {
                table: table.to_string(),
            });
        }
        require_table(self, database, table, "insert")?;
        let mut written = 0;
        for statement in build_insert(database, table, records)? {
            written += self.execute(&statement)?;
        }
        info!(table, rows = written, "inserted");
        Ok(written)
    }

    fn update(
        &mut self,
        database: &str,
        table: &str,
        assignments: &Record,
        join: Option<&JoinSpec>,
        conditions: &[Condition],
    ) -> Result<u64, StoreError> {
        require_table(self, database, table, "update")?;
        if let Some(join) = join {
            check_join(self, database, join)?;
        }
        let statement = build_update(database, table, assignments, join, conditions)?;
        let rows = self.execute(&statement)?;
        info!(table, rows, "updated");
        Ok(rows)
    }

    fn delete(
        &mut self,
        database: &str,
        table: &str,
        conditions: &[Condition],
    ) -> Result<u64, StoreError> {
        require_table(self, database, table, "delete")?;
        let statement = build_delete(database, table, conditions)?;
        let rows = self.execute(&statement)?;
        info!(table, rows, "deleted");
        Ok(rows)
    }

    fn truncate_table(&mut self, database: &str, table: &str) -> Result<(), StoreError> {
        require_table(self, database, table, "truncate")?;
        self.execute(&build_truncate(database, table))?;
        info!(table, "truncated");
        Ok(())
    }

    fn drop_table(&mut self, database: &str, table: &str) -> Result<(), StoreError> {
        require_table(self, database, table, "drop")?;
        self.execute(&build_drop(database, table))?;
        info!(table, "dropped");
        Ok(())
    }

    fn merge(&mut self, database: &str, spec: &MergeSpec) -> Result<bool, StoreError> {
        if !check_merge(self, database, spec)? {
            return Ok(false);
        }
        let Some(statement) = build_merge(database, spec)? else {
            return Ok(false);
        };
        let rows = self.execute(&statement)?;
        info!(source = %spec.source, target = %spec.target, rows, "merged");
        Ok(true)
    }

    fn begin_transaction(&mut self) -> Result<(), StoreError> {
        self.batch(&build_begin_transaction())
    }

    fn commit_transaction(&mut self) -> Result<(), StoreError> {
        self.batch(&build_commit_transaction())
    }

    fn rollback_transaction(&mut self) -> Result<(), StoreError> {
        self.batch(&build_rollback_transaction())
    }
}
