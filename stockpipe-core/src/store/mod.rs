//! Relational store: schema manager, record repository and merge engine.
//!
//! The [`Store`] trait is the full capability set. [`SqlServerStore`] turns
//! each call into T-SQL over a [`Connection`]; [`MemoryStore`] keeps tables in
//! process and applies the same validation, so the crawl can run (and be
//! tested) without a server.

pub mod connection;
pub mod memory;
pub mod sqlserver;
pub mod validate;

pub use connection::{Connection, SqlServerSettings, TiberiusConnection};
pub use memory::MemoryStore;
pub use sqlserver::SqlServerStore;

use crate::sql::{Condition, JoinSpec, MergeSpec, Record, SelectQuery, SqlValue, TableDescriptor};
use chrono::NaiveDateTime;
use thiserror::Error;

/// Errors raised by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("database [{database}] does not exist")]
    DatabaseMissing { database: String },

    #[error("table [{database}].[dbo].[{table}] does not exist")]
    TableMissing { database: String, table: String },

    #[error("table [{table}] references [{referenced}], which does not exist")]
    ForeignKeyTableMissing { table: String, referenced: String },

    #[error("key column '{column}' is not a column of table [{table}]")]
    KeyColumnMissing { table: String, column: String },

    #[error("column '{column}' is declared twice in table [{table}]")]
    DuplicateColumn { table: String, column: String },

    #[error("column '{column}' does not exist in table [{table}]")]
    UnknownColumn { table: String, column: String },

    #[error("operator {operator} on '{column}' cannot take {arity} value(s)")]
    InvalidCondition {
        column: String,
        operator: &'static str,
        arity: usize,
    },

    #[error("{action} is not allowed in '{clause}'")]
    InvalidMergeAction {
        clause: &'static str,
        action: &'static str,
    },

    #[error("no records to insert into [{table}]")]
    EmptyInsert { table: String },

    #[error("no columns to update in [{table}]")]
    EmptyAssignment { table: String },

    #[error("record for [{table}] has {found} columns, expected {expected}")]
    RecordShapeMismatch {
        table: String,
        expected: usize,
        found: usize,
    },

    #[error("cannot insert NULL into non-nullable column '{column}' of [{table}]")]
    NotNullViolation { table: String, column: String },

    #[error("cannot insert an explicit value for identity column '{column}' of [{table}]")]
    IdentityInsert { table: String, column: String },

    #[error("constraint violation on [{table}]: {detail}")]
    Constraint { table: String, detail: String },

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("unsupported by this backend: {0}")]
    Unsupported(String),

    #[error("statement failed: {detail}\n{statement}")]
    Execution { statement: String, detail: String },
}

impl StoreError {
    /// Connectivity failures end the run; everything else is local to one operation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }

    pub(crate) fn database_missing(database: &str) -> Self {
        StoreError::DatabaseMissing {
            database: database.to_string(),
        }
    }

    pub(crate) fn table_missing(database: &str, table: &str) -> Self {
        StoreError::TableMissing {
            database: database.to_string(),
            table: table.to_string(),
        }
    }
}

/// One result row: column names with their values, in select order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub columns: Vec<String>,
    pub values: Vec<SqlValue>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    /// Column lookup, case-insensitive like SQL Server's default collation.
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .map(|i| &self.values[i])
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(SqlValue::as_str)
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(SqlValue::as_i64)
    }

    pub fn get_datetime(&self, column: &str) -> Option<NaiveDateTime> {
        self.get(column).and_then(SqlValue::as_datetime)
    }
}

/// Capability set of a relational store. Every statement auto-commits unless
/// wrapped in an explicit transaction.
pub trait Store {
    /// Human-readable backend name for logs.
    fn name(&self) -> &str;

    /// Database selected by the last successful `create_database`, if any.
    fn current_database(&self) -> Option<&str>;

    fn database_exists(&mut self, database: &str) -> Result<bool, StoreError>;

    fn table_exists(&mut self, database: &str, table: &str) -> Result<bool, StoreError>;

    /// `Ok(false)` when the database already exists.
    fn create_database(&mut self, database: &str) -> Result<bool, StoreError>;

    /// `Ok(false)` when the table already exists.
    fn create_table(&mut self, database: &str, table: &TableDescriptor) -> Result<bool, StoreError>;

    fn select(
        &mut self,
        database: &str,
        table: &str,
        query: &SelectQuery,
    ) -> Result<Vec<Row>, StoreError>;

    /// Insert all records; returns the number of rows written.
    fn insert(&mut self, database: &str, table: &str, records: &[Record])
        -> Result<u64, StoreError>;

    /// No conditions updates every row.
    fn update(
        &mut self,
        database: &str,
        table: &str,
        assignments: &Record,
        join: Option<&JoinSpec>,
        conditions: &[Condition],
    ) -> Result<u64, StoreError>;

    /// No conditions deletes every row.
    fn delete(
        &mut self,
        database: &str,
        table: &str,
        conditions: &[Condition],
    ) -> Result<u64, StoreError>;

    fn truncate_table(&mut self, database: &str, table: &str) -> Result<(), StoreError>;

    fn drop_table(&mut self, database: &str, table: &str) -> Result<(), StoreError>;

    /// `Ok(false)` when the merge carries no action; nothing is executed then.
    fn merge(&mut self, database: &str, spec: &MergeSpec) -> Result<bool, StoreError>;

    fn begin_transaction(&mut self) -> Result<(), StoreError>;

    fn commit_transaction(&mut self) -> Result<(), StoreError>;

    fn rollback_transaction(&mut self) -> Result<(), StoreError>;
}

impl<S: Store + ?Sized> Store for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }
    fn current_database(&self) -> Option<&str> {
        (**self).current_database()
    }
    fn database_exists(&mut self, database: &str) -> Result<bool, StoreError> {
        (**self).database_exists(database)
    }
    fn table_exists(&mut self, database: &str, table: &str) -> Result<bool, StoreError> {
        (**self).table_exists(database, table)
    }
    fn create_database(&mut self, database: &str) -> Result<bool, StoreError> {
        (**self).create_database(database)
    }
    fn create_table(&mut self, database: &str, table: &TableDescriptor) -> Result<bool, StoreError> {
        (**self).create_table(database, table)
    }
    fn select(
        &mut self,
        database: &str,
        table: &str,
        query: &SelectQuery,
    ) -> Result<Vec<Row>, StoreError> {
        (**self).select(database, table, query)
    }
    fn insert(
        &mut self,
        database: &str,
        table: &str,
        records: &[Record],
    ) -> Result<u64, StoreError> {
        (**self).insert(database, table, records)
    }
    fn update(
        &mut self,
        database: &str,
        table: &str,
        assignments: &Record,
        join: Option<&JoinSpec>,
        conditions: &[Condition],
    ) -> Result<u64, StoreError> {
        (**self).update(database, table, assignments, join, conditions)
    }
    fn delete(
        &mut self,
        database: &str,
        table: &str,
        conditions: &[Condition],
    ) -> Result<u64, StoreError> {
        (**self).delete(database, table, conditions)
    }
    fn truncate_table(&mut self, database: &str, table: &str) -> Result<(), StoreError> {
        (**self).truncate_table(database, table)
    }
    fn drop_table(&mut self, database: &str, table: &str) -> Result<(), StoreError> {
        (**self).drop_table(database, table)
    }
    fn merge(&mut self, database: &str, spec: &MergeSpec) -> Result<bool, StoreError> {
        (**self).merge(database, spec)
    }
    fn begin_transaction(&mut self) -> Result<(), StoreError> {
        (**self).begin_transaction()
    }
    fn commit_transaction(&mut self) -> Result<(), StoreError> {
        (**self).commit_transaction()
    }
    fn rollback_transaction(&mut self) -> Result<(), StoreError> {
        (**self).rollback_transaction()
    }
}
