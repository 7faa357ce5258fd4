//! Typed descriptors consumed by the statement builder and the store backends.

use super::value::{DataType, SqlValue};
use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

// ── Schema ───────────────────────────────────────────────────────────

/// A column in a table definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }

    pub fn required(name: impl Into<String>, data_type: DataType) -> Self {
        Self::new(name, data_type, false)
    }

    pub fn optional(name: impl Into<String>, data_type: DataType) -> Self {
        Self::new(name, data_type, true)
    }
}

/// `FOREIGN KEY (column) REFERENCES table(referenced_column)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

impl ForeignKey {
    pub fn new(
        column: impl Into<String>,
        referenced_table: impl Into<String>,
        referenced_column: impl Into<String>,
    ) -> Self {
        Self {
            column: column.into(),
            referenced_table: referenced_table.into(),
            referenced_column: referenced_column.into(),
        }
    }
}

/// Full definition of a table: ordered columns, identity key, foreign keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    pub key_column: String,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableDescriptor {
    pub fn new(
        name: impl Into<String>,
        key_column: impl Into<String>,
        columns: Vec<ColumnDescriptor>,
    ) -> Self {
        Self {
            name: name.into(),
            columns,
            key_column: key_column.into(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn with_foreign_key(mut self, fk: ForeignKey) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    /// Same columns under a different name, without foreign keys.
    pub fn renamed_without_keys(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: self.columns.clone(),
            key_column: self.key_column.clone(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn key(&self) -> Option<&ColumnDescriptor> {
        self.column(&self.key_column)
    }

    /// Columns other than the key, in declaration order.
    pub fn non_key_columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.iter().filter(move |c| c.name != self.key_column)
    }

    /// Checks that need no catalog access: unique column names.
    pub fn check_column_names(&self) -> Result<(), StoreError> {
        let mut seen = HashSet::new();
        for column in &self.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(StoreError::DuplicateColumn {
                    table: self.name.clone(),
                    column: column.name.clone(),
                });
            }
        }
        Ok(())
    }
}

// ── Records ──────────────────────────────────────────────────────────

/// One (column, value) pair of a record. The value variant is the declared type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub column: String,
    pub value: SqlValue,
}

/// One row to write, as an ordered list of fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub fields: Vec<Field>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.fields.push(Field {
            column: column.into(),
            value: value.into(),
        });
        self
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.column.as_str())
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.fields
            .iter()
            .find(|f| f.column == column)
            .map(|f| &f.value)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

// ── Conditions ───────────────────────────────────────────────────────

/// Comparison operators accepted in a `WHERE` clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    Eq,
    Gt,
    Lt,
    Ge,
    Le,
    Ne,
    In,
    NotIn,
    Like,
    NotLike,
    Between,
    Is,
    IsNot,
}

impl Operator {
    pub fn as_sql(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::Ge => ">=",
            Operator::Le => "<=",
            Operator::Ne => "<>",
            Operator::In => "IN",
            Operator::NotIn => "NOT IN",
            Operator::Like => "LIKE",
            Operator::NotLike => "NOT LIKE",
            Operator::Between => "BETWEEN",
            Operator::Is => "IS",
            Operator::IsNot => "IS NOT",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// `column <op> value(s)`. Conditions in a list are joined with `AND`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub column: String,
    pub operator: Operator,
    pub values: Vec<SqlValue>,
}

impl Condition {
    pub fn new(column: impl Into<String>, operator: Operator, values: Vec<SqlValue>) -> Self {
        Self {
            column: column.into(),
            operator,
            values,
        }
    }

    pub fn compare(column: impl Into<String>, operator: Operator, value: impl Into<SqlValue>) -> Self {
        Self::new(column, operator, vec![value.into()])
    }

    pub fn eq(column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        Self::compare(column, Operator::Eq, value)
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Self::new(column, Operator::Is, vec![SqlValue::Null])
    }

    pub fn is_not_null(column: impl Into<String>) -> Self {
        Self::new(column, Operator::IsNot, vec![SqlValue::Null])
    }

    pub fn in_list(column: impl Into<String>, values: Vec<SqlValue>) -> Self {
        Self::new(column, Operator::In, values)
    }

    pub fn between(
        column: impl Into<String>,
        low: impl Into<SqlValue>,
        high: impl Into<SqlValue>,
    ) -> Self {
        Self::new(column, Operator::Between, vec![low.into(), high.into()])
    }

    pub fn like(column: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(column, Operator::Like, vec![SqlValue::Text(pattern.into())])
    }

    /// Operator/value arity check shared by every backend.
    pub fn validate(&self) -> Result<(), StoreError> {
        let ok = match self.operator {
            Operator::In | Operator::NotIn => !self.values.is_empty(),
            Operator::Between => self.values.len() == 2,
            Operator::Is | Operator::IsNot => self.values.len() == 1 && self.values[0].is_null(),
            _ => self.values.len() == 1,
        };
        if ok {
            Ok(())
        } else {
            Err(StoreError::InvalidCondition {
                column: self.column.clone(),
                operator: self.operator.as_sql(),
                arity: self.values.len(),
            })
        }
    }
}

// ── Joins ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

impl JoinKind {
    pub fn as_sql(self) -> &'static str {
        match self {
            JoinKind::Inner => "INNER",
            JoinKind::Left => "LEFT",
            JoinKind::Right => "RIGHT",
            JoinKind::Full => "FULL",
            JoinKind::Cross => "CROSS",
        }
    }
}

/// One `<kind> JOIN right ON left.left_column = right.right_column` step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinStep {
    pub kind: JoinKind,
    pub left_table: String,
    pub right_table: String,
    pub left_column: String,
    pub right_column: String,
}

/// `FROM base_table` followed by ordered join steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSpec {
    pub base_table: String,
    pub steps: Vec<JoinStep>,
}

impl JoinSpec {
    pub fn from_table(base_table: impl Into<String>) -> Self {
        Self {
            base_table: base_table.into(),
            steps: Vec::new(),
        }
    }

    pub fn join(
        mut self,
        kind: JoinKind,
        left: (&str, &str),
        right: (&str, &str),
    ) -> Self {
        self.steps.push(JoinStep {
            kind,
            left_table: left.0.to_string(),
            left_column: left.1.to_string(),
            right_table: right.0.to_string(),
            right_column: right.1.to_string(),
        });
        self
    }

    /// Every table named anywhere in the join, base table first, deduplicated.
    pub fn referenced_tables(&self) -> Vec<&str> {
        let mut tables: Vec<&str> = vec![self.base_table.as_str()];
        for step in &self.steps {
            for t in [step.left_table.as_str(), step.right_table.as_str()] {
                if !tables.contains(&t) {
                    tables.push(t);
                }
            }
        }
        tables
    }
}

// ── Updates and merges ───────────────────────────────────────────────

/// Right-hand side of an assignment in an UPDATE or MERGE action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValueSource {
    /// A column of the merge source (`S.column`).
    Source(String),
    /// A literal value.
    Value(SqlValue),
}

/// `target = source` inside an UPDATE/INSERT action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub target: String,
    pub source: ValueSource,
}

impl Assignment {
    pub fn from_source(target: impl Into<String>, source_column: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            source: ValueSource::Source(source_column.into()),
        }
    }

    /// `target = S.target`
    pub fn same_column(column: &str) -> Self {
        Self::from_source(column, column)
    }

    pub fn value(target: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        Self {
            target: target.into(),
            source: ValueSource::Value(value.into()),
        }
    }
}

/// Action taken by one `WHEN ... THEN` clause of a MERGE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MergeAction {
    Insert(Vec<Assignment>),
    Update(Vec<Assignment>),
    Delete,
}

impl MergeAction {
    fn name(&self) -> &'static str {
        match self {
            MergeAction::Insert(_) => "INSERT",
            MergeAction::Update(_) => "UPDATE",
            MergeAction::Delete => "DELETE",
        }
    }
}

/// The three MERGE clauses, in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeClause {
    Matched,
    NotMatchedByTarget,
    NotMatchedBySource,
}

impl MergeClause {
    pub fn as_sql(self) -> &'static str {
        match self {
            MergeClause::Matched => "WHEN MATCHED THEN",
            MergeClause::NotMatchedByTarget => "WHEN NOT MATCHED BY TARGET THEN",
            MergeClause::NotMatchedBySource => "WHEN NOT MATCHED BY SOURCE THEN",
        }
    }
}

/// `MERGE INTO target AS T USING source AS S ON (T.match = S.match) ...`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeSpec {
    pub source: String,
    pub target: String,
    pub match_column: String,
    pub when_matched: Option<MergeAction>,
    pub when_not_matched_by_target: Option<MergeAction>,
    pub when_not_matched_by_source: Option<MergeAction>,
}

impl MergeSpec {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        match_column: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            match_column: match_column.into(),
            when_matched: None,
            when_not_matched_by_target: None,
            when_not_matched_by_source: None,
        }
    }

    pub fn when_matched(mut self, action: MergeAction) -> Self {
        self.when_matched = Some(action);
        self
    }

    pub fn when_not_matched_by_target(mut self, action: MergeAction) -> Self {
        self.when_not_matched_by_target = Some(action);
        self
    }

    pub fn when_not_matched_by_source(mut self, action: MergeAction) -> Self {
        self.when_not_matched_by_source = Some(action);
        self
    }

    /// Present clauses in emission order.
    pub fn clauses(&self) -> Vec<(MergeClause, &MergeAction)> {
        [
            (MergeClause::Matched, self.when_matched.as_ref()),
            (MergeClause::NotMatchedByTarget, self.when_not_matched_by_target.as_ref()),
            (MergeClause::NotMatchedBySource, self.when_not_matched_by_source.as_ref()),
        ]
        .into_iter()
        .filter_map(|(clause, action)| action.map(|a| (clause, a)))
        .collect()
    }

    pub fn is_noop(&self) -> bool {
        self.clauses().is_empty()
    }

    /// T-SQL legality: only INSERT when not matched by target, never INSERT
    /// elsewhere, and no empty column lists.
    pub fn validate_actions(&self) -> Result<(), StoreError> {
        for (clause, action) in self.clauses() {
            let legal = match (clause, action) {
                (MergeClause::NotMatchedByTarget, MergeAction::Insert(cols)) => !cols.is_empty(),
                (MergeClause::NotMatchedByTarget, _) => false,
                (_, MergeAction::Insert(_)) => false,
                (_, MergeAction::Update(cols)) => !cols.is_empty(),
                (_, MergeAction::Delete) => true,
            };
            if !legal {
                return Err(StoreError::InvalidMergeAction {
                    clause: clause.as_sql(),
                    action: action.name(),
                });
            }
        }
        Ok(())
    }
}

// ── Select ───────────────────────────────────────────────────────────

/// Arguments of a SELECT. Invalid `columns` / `limit` values are not errors:
/// they are replaced by their defaults (all columns / no limit) with a warning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectQuery {
    pub columns: Option<Vec<String>>,
    pub limit: Option<i64>,
    pub conditions: Vec<Condition>,
    pub order_by: Vec<String>,
}

impl SelectQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn order_by(mut self, column: impl Into<String>) -> Self {
        self.order_by.push(column.into());
        self
    }

    /// Column list to project, or `None` for `*`. An empty list is ignored.
    pub fn effective_columns(&self, table: &str) -> Option<&[String]> {
        match &self.columns {
            Some(cols) if cols.is_empty() => {
                tracing::warn!(
                    table,
                    "invalid columns to SELECT (empty list); selecting all columns"
                );
                None
            }
            Some(cols) => Some(cols.as_slice()),
            None => None,
        }
    }

    /// Row limit, or `None` for no limit. Negative limits are ignored and
    /// zero means "no limit".
    pub fn effective_limit(&self, table: &str) -> Option<u64> {
        match self.limit {
            Some(n) if n < 0 => {
                tracing::warn!(table, limit = n, "invalid SELECT limit; no limit applied");
                None
            }
            Some(0) | None => None,
            Some(n) => Some(n as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_columns_rejected() {
        let table = TableDescriptor::new(
            "T",
            "ID",
            vec![
                ColumnDescriptor::required("ID", DataType::Int),
                ColumnDescriptor::required("ID", DataType::BigInt),
            ],
        );
        assert!(matches!(
            table.check_column_names(),
            Err(StoreError::DuplicateColumn { .. })
        ));
    }

    #[test]
    fn condition_arity() {
        assert!(Condition::eq("A", 1).validate().is_ok());
        assert!(Condition::is_null("A").validate().is_ok());
        assert!(Condition::between("A", 1, 2).validate().is_ok());
        assert!(Condition::in_list("A", vec![]).validate().is_err());
        assert!(Condition::new("A", Operator::Between, vec![SqlValue::Int(1)])
            .validate()
            .is_err());
        assert!(Condition::new("A", Operator::Is, vec![SqlValue::Int(1)])
            .validate()
            .is_err());
    }

    #[test]
    fn merge_clause_legality() {
        let ok = MergeSpec::new("S", "T", "Symbol")
            .when_matched(MergeAction::Delete)
            .when_not_matched_by_target(MergeAction::Insert(vec![Assignment::same_column("Symbol")]));
        assert!(ok.validate_actions().is_ok());

        let bad = MergeSpec::new("S", "T", "Symbol").when_not_matched_by_target(MergeAction::Delete);
        assert!(matches!(
            bad.validate_actions(),
            Err(StoreError::InvalidMergeAction { .. })
        ));

        let bad = MergeSpec::new("S", "T", "Symbol")
            .when_matched(MergeAction::Insert(vec![Assignment::same_column("Symbol")]));
        assert!(bad.validate_actions().is_err());
    }

    #[test]
    fn empty_merge_is_noop() {
        assert!(MergeSpec::new("S", "T", "Symbol").is_noop());
    }

    #[test]
    fn select_defaults_replace_invalid_arguments() {
        let q = SelectQuery::all().columns(Vec::<String>::new()).limit(-3);
        assert_eq!(q.effective_columns("T"), None);
        assert_eq!(q.effective_limit("T"), None);

        let q = SelectQuery::all().columns(["Symbol"]).limit(5);
        assert_eq!(q.effective_columns("T"), Some(&["Symbol".to_string()][..]));
        assert_eq!(q.effective_limit("T"), Some(5));
    }

    #[test]
    fn join_lists_tables_once() {
        let spec = JoinSpec::from_table("Security")
            .join(JoinKind::Inner, ("Security", "Market_ID"), ("Market", "ID"))
            .join(JoinKind::Left, ("Security", "SecurityType_ID"), ("SecurityType", "ID"));
        assert_eq!(
            spec.referenced_tables(),
            vec!["Security", "Market", "SecurityType"]
        );
    }
}
