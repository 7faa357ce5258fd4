//! T-SQL statement builder: values, descriptors and the functions that turn
//! them into statements.

pub mod builder;
pub mod descriptor;
pub mod value;

pub use builder::{qualified_table, quote_column, Statement, SqlWriter};
pub use descriptor::{
    Assignment, ColumnDescriptor, Condition, Field, ForeignKey, JoinKind, JoinSpec, JoinStep,
    MergeAction, MergeClause, MergeSpec, Operator, Record, SelectQuery, TableDescriptor,
    ValueSource,
};
pub use value::{format_value, quote_ident, DataType, SqlValue};
