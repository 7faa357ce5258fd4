//! In-process store with the same catalog validation as the SQL Server
//! backend. Used by tests and `--dry-run`.
//!
//! Emulated server behavior: identity keys start at 1 (TRUNCATE reseeds,
//! DELETE does not), `NOT NULL` and `NVARCHAR(n)` lengths are enforced,
//! foreign keys are checked on write and block DELETE / TRUNCATE / DROP of
//! referenced rows or tables, and `GETDATE()` evaluates to local time.
//! Text comparison is case-sensitive.

use super::validate::{check_create_table, check_join, check_merge, require_table};
use super::{Row, Store, StoreError};
use crate::sql::{
    Assignment, ColumnDescriptor, Condition, DataType, JoinKind, JoinSpec, MergeAction, MergeSpec,
    Operator, Record, SelectQuery, SqlValue, TableDescriptor, ValueSource,
};
use chrono::{Local, NaiveDateTime};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use tracing::{info, warn};

#[derive(Debug, Clone)]
struct MemoryTable {
    descriptor: TableDescriptor,
    rows: Vec<Vec<SqlValue>>,
    next_identity: i64,
}

impl MemoryTable {
    fn new(descriptor: TableDescriptor) -> Self {
        Self {
            descriptor,
            rows: Vec::new(),
            next_identity: 1,
        }
    }

    fn key_index(&self) -> usize {
        self.descriptor
            .columns
            .iter()
            .position(|c| c.name == self.descriptor.key_column)
            .unwrap_or(0)
    }

    /// Resolve `Col` or `Table.Col` against this table.
    fn column_index(&self, name: &str) -> Result<usize, StoreError> {
        let bare = match name.split_once('.') {
            Some((qualifier, column)) if qualifier == self.descriptor.name => column,
            Some(_) => return Err(self.unknown(name)),
            None => name,
        };
        self.descriptor
            .columns
            .iter()
            .position(|c| c.name == bare)
            .ok_or_else(|| self.unknown(name))
    }

    fn unknown(&self, column: &str) -> StoreError {
        StoreError::UnknownColumn {
            table: self.descriptor.name.clone(),
            column: column.to_string(),
        }
    }

    fn identity_value(&self, id: i64) -> Result<SqlValue, StoreError> {
        match self.key().data_type {
            DataType::Int => i32::try_from(id).map(SqlValue::Int).map_err(|_| {
                StoreError::Constraint {
                    table: self.descriptor.name.clone(),
                    detail: format!("identity value {id} is out of range for INT"),
                }
            }),
            _ => Ok(SqlValue::BigInt(id)),
        }
    }

    /// The next `count` identity values. Nothing is consumed on overflow.
    fn take_identities(&mut self, count: usize) -> Result<Vec<SqlValue>, StoreError> {
        let first = self.next_identity;
        let ids = (first..first.saturating_add(count as i64))
            .map(|id| self.identity_value(id))
            .collect::<Result<Vec<_>, _>>()?;
        self.next_identity = first.saturating_add(count as i64);
        Ok(ids)
    }

    fn key(&self) -> &ColumnDescriptor {
        &self.descriptor.columns[self.key_index()]
    }

    fn matches(
        &self,
        row: &[SqlValue],
        conditions: &[Condition],
        now: NaiveDateTime,
    ) -> Result<bool, StoreError> {
        for condition in conditions {
            let idx = self.column_index(&condition.column)?;
            if !eval_condition(&row[idx], condition, now)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryDatabase {
    tables: BTreeMap<String, MemoryTable>,
}

impl MemoryDatabase {
    fn table(&self, database: &str, table: &str) -> Result<&MemoryTable, StoreError> {
        self.tables
            .get(table)
            .ok_or_else(|| StoreError::table_missing(database, table))
    }

    /// Every non-null foreign-key value of `row` must exist in the referenced table.
    fn check_foreign_keys(&self, table: &MemoryTable, row: &[SqlValue]) -> Result<(), StoreError> {
        for fk in &table.descriptor.foreign_keys {
            let value = &row[table.column_index(&fk.column)?];
            if value.is_null() {
                continue;
            }
            let referenced = self.tables.get(&fk.referenced_table).ok_or_else(|| {
                StoreError::ForeignKeyTableMissing {
                    table: table.descriptor.name.clone(),
                    referenced: fk.referenced_table.clone(),
                }
            })?;
            let idx = referenced.column_index(&fk.referenced_column)?;
            if !referenced
                .rows
                .iter()
                .any(|r| r[idx].compare(value) == Some(Ordering::Equal))
            {
                return Err(StoreError::Constraint {
                    table: table.descriptor.name.clone(),
                    detail: format!(
                        "{} = {} has no match in {}.{}",
                        fk.column,
                        value.literal(),
                        fk.referenced_table,
                        fk.referenced_column
                    ),
                });
            }
        }
        Ok(())
    }

    /// Tables (other than `table` itself) holding a foreign key to `table`.
    fn referencing(&self, table: &str) -> Vec<(&MemoryTable, &crate::sql::ForeignKey)> {
        self.tables
            .values()
            .filter(|t| t.descriptor.name != table)
            .flat_map(|t| {
                t.descriptor
                    .foreign_keys
                    .iter()
                    .filter(|fk| fk.referenced_table == table)
                    .map(move |fk| (t, fk))
            })
            .collect()
    }
}

/// In-memory [`Store`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    databases: BTreeMap<String, MemoryDatabase>,
    current_database: Option<String>,
    snapshot: Option<BTreeMap<String, MemoryDatabase>>,
    writes: usize,
    offline: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose every call fails with a connectivity error.
    pub fn unreachable() -> Self {
        Self {
            offline: true,
            ..Self::default()
        }
    }

    /// Number of successful mutating operations so far.
    pub fn write_count(&self) -> usize {
        self.writes
    }

    /// Row count of a table, `None` if it does not exist.
    pub fn row_count(&self, database: &str, table: &str) -> Option<usize> {
        self.databases
            .get(database)
            .and_then(|db| db.tables.get(table))
            .map(|t| t.rows.len())
    }

    fn online(&self) -> Result<(), StoreError> {
        if self.offline {
            Err(StoreError::Connection("memory store is unreachable".into()))
        } else {
            Ok(())
        }
    }

    fn database(&self, database: &str) -> Result<&MemoryDatabase, StoreError> {
        self.databases
            .get(database)
            .ok_or_else(|| StoreError::database_missing(database))
    }

    fn database_mut(&mut self, database: &str) -> Result<&mut MemoryDatabase, StoreError> {
        self.databases
            .get_mut(database)
            .ok_or_else(|| StoreError::database_missing(database))
    }

    fn table_mut(&mut self, database: &str, table: &str) -> Result<&mut MemoryTable, StoreError> {
        self.database_mut(database)?
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::table_missing(database, table))
    }

    /// Reject removal of rows or tables that other tables still reference.
    fn check_not_referenced(
        &self,
        database: &str,
        table: &str,
        removed: &[&Vec<SqlValue>],
        whole_table: bool,
    ) -> Result<(), StoreError> {
        let db = self.database(database)?;
        let target = db.table(database, table)?;
        for (referencing, fk) in db.referencing(table) {
            let in_use = if whole_table {
                true
            } else {
                let src = referencing.column_index(&fk.column)?;
                let dst = target.column_index(&fk.referenced_column)?;
                removed.iter().any(|row| {
                    referencing
                        .rows
                        .iter()
                        .any(|r| r[src].compare(&row[dst]) == Some(Ordering::Equal))
                })
            };
            if in_use {
                return Err(StoreError::Constraint {
                    table: table.to_string(),
                    detail: format!(
                        "referenced by {}.{}",
                        referencing.descriptor.name, fk.column
                    ),
                });
            }
        }
        Ok(())
    }
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Evaluate server-side fragments the memory backend understands.
fn resolve(value: &SqlValue, now: NaiveDateTime) -> Result<SqlValue, StoreError> {
    match value {
        SqlValue::Raw(sql) if sql.trim().eq_ignore_ascii_case("GETDATE()") => {
            Ok(SqlValue::DateTime(now))
        }
        SqlValue::Raw(sql) => Err(StoreError::Unsupported(format!("raw SQL `{sql}`"))),
        other => Ok(other.clone()),
    }
}

/// Convert a value to the column's declared type, as an implicit conversion would.
fn coerce(
    table: &str,
    column: &ColumnDescriptor,
    value: SqlValue,
    now: NaiveDateTime,
) -> Result<SqlValue, StoreError> {
    let value = resolve(&value, now)?;
    let mismatch = |value: &SqlValue| StoreError::Constraint {
        table: table.to_string(),
        detail: format!(
            "value {} does not fit column {} {}",
            value.literal(),
            column.name,
            column.data_type
        ),
    };
    Ok(match (&column.data_type, value) {
        (_, SqlValue::Null) => SqlValue::Null,
        (DataType::Raw(_), v) => v,
        (DataType::Int, SqlValue::Int(v)) => SqlValue::Int(v),
        (DataType::Int, SqlValue::BigInt(v)) => {
            SqlValue::Int(i32::try_from(v).map_err(|_| mismatch(&SqlValue::BigInt(v)))?)
        }
        (DataType::BigInt, v @ (SqlValue::Int(_) | SqlValue::BigInt(_))) => {
            SqlValue::BigInt(v.as_i64().unwrap_or_default())
        }
        (
            DataType::NVarChar(limit),
            v @ (SqlValue::Text(_) | SqlValue::Int(_) | SqlValue::BigInt(_)),
        ) => {
            let text = v.literal();
            if let Some(n) = limit {
                if text.chars().count() > usize::from(*n) {
                    return Err(StoreError::Constraint {
                        table: table.to_string(),
                        detail: format!(
                            "string or binary data would be truncated in column {}",
                            column.name
                        ),
                    });
                }
            }
            SqlValue::Text(text)
        }
        (DataType::DateTime, SqlValue::DateTime(dt)) => SqlValue::DateTime(dt),
        (_, v) => return Err(mismatch(&v)),
    })
}

/// `%` matches any run, `_` any single character.
fn like_match(text: &str, pattern: &str) -> bool {
    fn go(t: &[char], p: &[char]) -> bool {
        match p.split_first() {
            None => t.is_empty(),
            Some(('%', rest)) => (0..=t.len()).any(|i| go(&t[i..], rest)),
            Some(('_', rest)) => !t.is_empty() && go(&t[1..], rest),
            Some((c, rest)) => t.first() == Some(c) && go(&t[1..], rest),
        }
    }
    let t: Vec<char> = text.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    go(&t, &p)
}

/// SQL three-valued logic collapsed to bool: unknown is false.
fn eval_condition(
    actual: &SqlValue,
    condition: &Condition,
    now: NaiveDateTime,
) -> Result<bool, StoreError> {
    condition.validate()?;
    let values = condition
        .values
        .iter()
        .map(|v| resolve(v, now))
        .collect::<Result<Vec<_>, _>>()?;
    let cmp = |v: &SqlValue| actual.compare(v);
    Ok(match condition.operator {
        Operator::Eq => cmp(&values[0]) == Some(Ordering::Equal),
        Operator::Ne => matches!(cmp(&values[0]), Some(o) if o != Ordering::Equal),
        Operator::Gt => cmp(&values[0]) == Some(Ordering::Greater),
        Operator::Lt => cmp(&values[0]) == Some(Ordering::Less),
        Operator::Ge => matches!(cmp(&values[0]), Some(Ordering::Greater | Ordering::Equal)),
        Operator::Le => matches!(cmp(&values[0]), Some(Ordering::Less | Ordering::Equal)),
        Operator::In => values.iter().any(|v| cmp(v) == Some(Ordering::Equal)),
        Operator::NotIn => values
            .iter()
            .all(|v| matches!(cmp(v), Some(o) if o != Ordering::Equal)),
        Operator::Between => {
            matches!(cmp(&values[0]), Some(Ordering::Greater | Ordering::Equal))
                && matches!(cmp(&values[1]), Some(Ordering::Less | Ordering::Equal))
        }
        Operator::Like | Operator::NotLike => {
            let (Some(text), Some(pattern)) = (actual.as_str(), values[0].as_str()) else {
                return Ok(false);
            };
            like_match(text, pattern) == (condition.operator == Operator::Like)
        }
        Operator::Is => actual.is_null(),
        Operator::IsNot => !actual.is_null(),
    })
}

/// Non-key columns must be present unless nullable.
fn check_not_null(table: &MemoryTable, row: &[SqlValue]) -> Result<(), StoreError> {
    let key = table.key_index();
    for (i, column) in table.descriptor.columns.iter().enumerate() {
        if i != key && !column.nullable && row[i].is_null() {
            return Err(StoreError::NotNullViolation {
                table: table.descriptor.name.clone(),
                column: column.name.clone(),
            });
        }
    }
    Ok(())
}

// ── Joins ────────────────────────────────────────────────────────────

/// One joined row: for each table in join order, the row index (None for the
/// unmatched side of a LEFT join).
type JoinedRow<'a> = Vec<(&'a MemoryTable, Option<usize>)>;

fn joined_value<'a>(joined: &JoinedRow<'a>, column: &str) -> Result<SqlValue, StoreError> {
    let (qualifier, bare) = match column.split_once('.') {
        Some((q, c)) => (Some(q), c),
        None => (None, column),
    };
    for (table, row) in joined {
        if qualifier.is_some_and(|q| q != table.descriptor.name) {
            continue;
        }
        if let Ok(idx) = table.column_index(bare) {
            return Ok(row.map_or(SqlValue::Null, |r| table.rows[r][idx].clone()));
        }
    }
    Err(StoreError::UnknownColumn {
        table: qualifier.unwrap_or("<join>").to_string(),
        column: column.to_string(),
    })
}

fn join_rows<'a>(
    db: &'a MemoryDatabase,
    database: &str,
    join: &JoinSpec,
) -> Result<Vec<JoinedRow<'a>>, StoreError> {
    let base = db.table(database, &join.base_table)?;
    let mut joined: Vec<JoinedRow<'a>> = (0..base.rows.len()).map(|i| vec![(base, Some(i))]).collect();
    for step in &join.steps {
        let right = db.table(database, &step.right_table)?;
        let right_idx = right.column_index(&step.right_column)?;
        let mut next = Vec::new();
        for combo in joined {
            let left_value = if step.kind == JoinKind::Cross {
                SqlValue::Null
            } else {
                joined_value(&combo, &format!("{}.{}", step.left_table, step.left_column))?
            };
            let mut matched = false;
            for (r, row) in right.rows.iter().enumerate() {
                let hit = step.kind == JoinKind::Cross
                    || left_value.compare(&row[right_idx]) == Some(Ordering::Equal);
                if hit {
                    matched = true;
                    let mut extended = combo.clone();
                    extended.push((right, Some(r)));
                    next.push(extended);
                }
            }
            match step.kind {
                JoinKind::Left if !matched => {
                    let mut extended = combo;
                    extended.push((right, None));
                    next.push(extended);
                }
                JoinKind::Right | JoinKind::Full => {
                    return Err(StoreError::Unsupported(format!(
                        "{} JOIN in the memory store",
                        step.kind.as_sql()
                    )))
                }
                _ => {}
            }
        }
        joined = next;
    }
    Ok(joined)
}

// ── Store ────────────────────────────────────────────────────────────

impl Store for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn current_database(&self) -> Option<&str> {
        self.current_database.as_deref()
    }

    fn database_exists(&mut self, database: &str) -> Result<bool, StoreError> {
        self.online()?;
        Ok(self.databases.contains_key(database))
    }

    fn table_exists(&mut self, database: &str, table: &str) -> Result<bool, StoreError> {
        self.online()?;
        Ok(self
            .databases
            .get(database)
            .is_some_and(|db| db.tables.contains_key(table)))
    }

    fn create_database(&mut self, database: &str) -> Result<bool, StoreError> {
        if self.database_exists(database)? {
            warn!(database, "database already exists");
            return Ok(false);
        }
        self.databases
            .insert(database.to_string(), MemoryDatabase::default());
        self.current_database = Some(database.to_string());
        self.writes += 1;
        info!(database, "created database");
        Ok(true)
    }

    fn create_table(&mut self, database: &str, table: &TableDescriptor) -> Result<bool, StoreError> {
        if !check_create_table(self, database, table)? {
            return Ok(false);
        }
        if let Some(key) = table.key() {
            if !matches!(key.data_type, DataType::Int | DataType::BigInt) {
                return Err(StoreError::Constraint {
                    table: table.name.clone(),
                    detail: format!("identity column {} must be INT or BIGINT", key.name),
                });
            }
        }
        self.database_mut(database)?
            .tables
            .insert(table.name.clone(), MemoryTable::new(table.clone()));
        self.writes += 1;
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
        let now = now();
        let t = self.database(database)?.table(database, table)?;

        let projection: Vec<usize> = match query.effective_columns(table) {
            Some(columns) => columns
                .iter()
                .map(|c| t.column_index(c))
                .collect::<Result<_, _>>()?,
            None => (0..t.descriptor.columns.len()).collect(),
        };
        let order: Vec<usize> = query
            .order_by
            .iter()
            .map(|c| t.column_index(c))
            .collect::<Result<_, _>>()?;

        let mut rows = Vec::new();
        for row in &t.rows {
            if t.matches(row, &query.conditions, now)? {
                rows.push(row);
            }
        }
        // NULL sorts first, as on the server.
        rows.sort_by(|a, b| {
            order
                .iter()
                .map(|&i| match (a[i].is_null(), b[i].is_null()) {
                    (true, true) => Ordering::Equal,
                    (true, false) => Ordering::Less,
                    (false, true) => Ordering::Greater,
                    _ => a[i].compare(&b[i]).unwrap_or(Ordering::Equal),
                })
                .find(|o| *o != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });
        if let Some(limit) = query.effective_limit(table) {
            rows.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        }

        let columns: Vec<String> = projection
            .iter()
            .map(|&i| t.descriptor.columns[i].name.clone())
            .collect();
        Ok(rows
            .into_iter()
            .map(|row| {
                Row::new(
                    columns.clone(),
                    projection.iter().map(|&i| row[i].clone()).collect(),
                )
            })
            .collect())
    }

    fn insert(
        &mut self,
        database: &str,
        table: &str,
        records: &[Record],
    ) -> Result<u64, StoreError> {
        let Some(first) = records.first() else {
            warn!(table, "no records to insert");
            return Err(StoreError::EmptyInsert {
                table: table.to_string(),
            });
        };
        require_table(self, database, table, "insert")?;
        let now = now();

        let db = self.database(database)?;
        let t = db.table(database, table)?;
        let key = t.key_index();
        let shape: Vec<&str> = first.columns().collect();
        let mut prepared = Vec::with_capacity(records.len());
        for record in records {
            if record.columns().ne(shape.iter().copied()) {
                return Err(StoreError::RecordShapeMismatch {
                    table: table.to_string(),
                    expected: shape.len(),
                    found: record.len(),
                });
            }
            let mut row = vec![SqlValue::Null; t.descriptor.columns.len()];
            for field in &record.fields {
                let idx = t.column_index(&field.column)?;
                if idx == key {
                    return Err(StoreError::IdentityInsert {
                        table: table.to_string(),
                        column: field.column.clone(),
                    });
                }
                row[idx] = coerce(table, &t.descriptor.columns[idx], field.value.clone(), now)?;
            }
            check_not_null(t, &row)?;
            db.check_foreign_keys(t, &row)?;
            prepared.push(row);
        }

        let t = self.table_mut(database, table)?;
        let written = prepared.len() as u64;
        let ids = t.take_identities(prepared.len())?;
        for (mut row, id) in prepared.into_iter().zip(ids) {
            row[key] = id;
            t.rows.push(row);
        }
        self.writes += 1;
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
        if assignments.is_empty() {
            return Err(StoreError::EmptyAssignment {
                table: table.to_string(),
            });
        }
        let now = now();

        let db = self.database(database)?;
        let t = db.table(database, table)?;
        let mut targets: Vec<(usize, SqlValue)> = Vec::new();
        for field in &assignments.fields {
            let idx = t.column_index(&field.column)?;
            let value = coerce(table, &t.descriptor.columns[idx], field.value.clone(), now)?;
            targets.push((idx, value));
        }

        let mut hit: Vec<usize> = Vec::new();
        match join {
            None => {
                for (i, row) in t.rows.iter().enumerate() {
                    if t.matches(row, conditions, now)? {
                        hit.push(i);
                    }
                }
            }
            Some(join) => {
                for joined in join_rows(db, database, join)? {
                    let Some(row) = joined
                        .iter()
                        .find(|(jt, _)| jt.descriptor.name == table)
                        .and_then(|(_, r)| *r)
                    else {
                        continue;
                    };
                    let mut ok = true;
                    for condition in conditions {
                        let value = joined_value(&joined, &condition.column)?;
                        if !eval_condition(&value, condition, now)? {
                            ok = false;
                            break;
                        }
                    }
                    if ok && !hit.contains(&row) {
                        hit.push(row);
                    }
                }
            }
        }

        let mut updated = Vec::with_capacity(hit.len());
        for &i in &hit {
            let mut row = t.rows[i].clone();
            for (idx, value) in &targets {
                row[*idx] = value.clone();
            }
            check_not_null(t, &row)?;
            db.check_foreign_keys(t, &row)?;
            updated.push((i, row));
        }

        let t = self.table_mut(database, table)?;
        for (i, row) in updated {
            t.rows[i] = row;
        }
        self.writes += 1;
        info!(table, rows = hit.len(), "updated");
        Ok(hit.len() as u64)
    }

    fn delete(
        &mut self,
        database: &str,
        table: &str,
        conditions: &[Condition],
    ) -> Result<u64, StoreError> {
        require_table(self, database, table, "delete")?;
        let now = now();
        let t = self.database(database)?.table(database, table)?;
        let mut doomed = HashSet::new();
        for (i, row) in t.rows.iter().enumerate() {
            if t.matches(row, conditions, now)? {
                doomed.insert(i);
            }
        }
        let removed: Vec<&Vec<SqlValue>> = doomed.iter().map(|&i| &t.rows[i]).collect();
        self.check_not_referenced(database, table, &removed, false)?;

        let t = self.table_mut(database, table)?;
        let mut i = 0;
        t.rows.retain(|_| {
            let keep = !doomed.contains(&i);
            i += 1;
            keep
        });
        self.writes += 1;
        info!(table, rows = doomed.len(), "deleted");
        Ok(doomed.len() as u64)
    }

    fn truncate_table(&mut self, database: &str, table: &str) -> Result<(), StoreError> {
        require_table(self, database, table, "truncate")?;
        self.check_not_referenced(database, table, &[], true)?;
        let t = self.table_mut(database, table)?;
        t.rows.clear();
        t.next_identity = 1;
        self.writes += 1;
        info!(table, "truncated");
        Ok(())
    }

    fn drop_table(&mut self, database: &str, table: &str) -> Result<(), StoreError> {
        require_table(self, database, table, "drop")?;
        self.check_not_referenced(database, table, &[], true)?;
        self.database_mut(database)?.tables.remove(table);
        self.writes += 1;
        info!(table, "dropped");
        Ok(())
    }

    fn merge(&mut self, database: &str, spec: &MergeSpec) -> Result<bool, StoreError> {
        if !check_merge(self, database, spec)? {
            return Ok(false);
        }
        let now = now();
        let db = self.database(database)?;
        let source = db.table(database, &spec.source)?;
        let target = db.table(database, &spec.target)?;
        let s_key = source.column_index(&spec.match_column)?;
        let t_key = target.column_index(&spec.match_column)?;

        // Pair each target row with its matching source row.
        let mut pairs: Vec<(usize, usize)> = Vec::new();
        let mut matched_sources = HashSet::new();
        for (ti, trow) in target.rows.iter().enumerate() {
            let hits: Vec<usize> = source
                .rows
                .iter()
                .enumerate()
                .filter(|(_, srow)| srow[s_key].compare(&trow[t_key]) == Some(Ordering::Equal))
                .map(|(si, _)| si)
                .collect();
            if hits.len() > 1 {
                return Err(StoreError::Constraint {
                    table: spec.target.clone(),
                    detail: format!(
                        "MERGE matched {} = {} more than once",
                        spec.match_column,
                        trow[t_key].literal()
                    ),
                });
            }
            if let Some(&si) = hits.first() {
                pairs.push((ti, si));
                matched_sources.insert(si);
            }
        }
        let matched_targets: HashSet<usize> = pairs.iter().map(|(ti, _)| *ti).collect();

        let assign = |row: &mut Vec<SqlValue>,
                      assignments: &[Assignment],
                      srow: Option<&Vec<SqlValue>>|
         -> Result<(), StoreError> {
            for a in assignments {
                let idx = target.column_index(&a.target)?;
                let value = match &a.source {
                    ValueSource::Value(v) => v.clone(),
                    ValueSource::Source(column) => {
                        let srow = srow.ok_or_else(|| {
                            StoreError::Unsupported(format!(
                                "source column {column} in WHEN NOT MATCHED BY SOURCE"
                            ))
                        })?;
                        srow[source.column_index(column)?].clone()
                    }
                };
                row[idx] = coerce(&spec.target, &target.descriptor.columns[idx], value, now)?;
            }
            Ok(())
        };

        let mut rows: Vec<Option<Vec<SqlValue>>> = target.rows.iter().cloned().map(Some).collect();
        let mut changed = 0u64;
        if let Some(action) = &spec.when_matched {
            for &(ti, si) in &pairs {
                match action {
                    MergeAction::Update(assignments) => {
                        if let Some(row) = rows[ti].as_mut() {
                            assign(row, assignments, Some(&source.rows[si]))?;
                        }
                    }
                    MergeAction::Delete => rows[ti] = None,
                    MergeAction::Insert(_) => {}
                }
                changed += 1;
            }
        }
        if let Some(action) = &spec.when_not_matched_by_source {
            for ti in (0..target.rows.len()).filter(|ti| !matched_targets.contains(ti)) {
                match action {
                    MergeAction::Update(assignments) => {
                        if let Some(row) = rows[ti].as_mut() {
                            assign(row, assignments, None)?;
                        }
                    }
                    MergeAction::Delete => rows[ti] = None,
                    MergeAction::Insert(_) => {}
                }
                changed += 1;
            }
        }
        let mut inserts = Vec::new();
        if let Some(MergeAction::Insert(assignments)) = &spec.when_not_matched_by_target {
            if assignments.iter().any(|a| a.target == target.descriptor.key_column) {
                return Err(StoreError::IdentityInsert {
                    table: spec.target.clone(),
                    column: target.descriptor.key_column.clone(),
                });
            }
            for (si, srow) in source.rows.iter().enumerate() {
                if matched_sources.contains(&si) {
                    continue;
                }
                let mut row = vec![SqlValue::Null; target.descriptor.columns.len()];
                assign(&mut row, assignments, Some(srow))?;
                inserts.push(row);
            }
        }

        let removed: Vec<&Vec<SqlValue>> = target
            .rows
            .iter()
            .zip(&rows)
            .filter(|(_, kept)| kept.is_none())
            .map(|(row, _)| row)
            .collect();
        if !removed.is_empty() {
            self.check_not_referenced(database, &spec.target, &removed, false)?;
        }

        let kept: Vec<Vec<SqlValue>> = rows.into_iter().flatten().collect();
        for row in kept.iter().chain(inserts.iter()) {
            check_not_null(target, row)?;
            db.check_foreign_keys(target, row)?;
        }
        changed += inserts.len() as u64;

        let key = target.key_index();
        let t = self.table_mut(database, &spec.target)?;
        let ids = t.take_identities(inserts.len())?;
        t.rows = kept;
        for (mut row, id) in inserts.into_iter().zip(ids) {
            row[key] = id;
            t.rows.push(row);
        }
        self.writes += 1;
        info!(source = %spec.source, target = %spec.target, rows = changed, "merged");
        Ok(true)
    }

    fn begin_transaction(&mut self) -> Result<(), StoreError> {
        self.online()?;
        if self.snapshot.is_some() {
            return Err(StoreError::Transaction("a transaction is already open".into()));
        }
        self.snapshot = Some(self.databases.clone());
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<(), StoreError> {
        self.online()?;
        self.snapshot
            .take()
            .map(|_| ())
            .ok_or_else(|| StoreError::Transaction("no open transaction to commit".into()))
    }

    fn rollback_transaction(&mut self) -> Result<(), StoreError> {
        self.online()?;
        let snapshot = self
            .snapshot
            .take()
            .ok_or_else(|| StoreError::Transaction("no open transaction to roll back".into()))?;
        self.databases = snapshot;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_identity_overflow_is_an_error() {
        let mut table = MemoryTable::new(crate::schema::market_table());
        table.next_identity = i64::from(i32::MAX) - 1;
        assert!(matches!(
            table.take_identities(3),
            Err(StoreError::Constraint { .. })
        ));
        assert_eq!(table.next_identity, i64::from(i32::MAX) - 1);
        assert_eq!(
            table.take_identities(2).unwrap(),
            vec![SqlValue::Int(i32::MAX - 1), SqlValue::Int(i32::MAX)]
        );
    }

    #[test]
    fn like_patterns() {
        assert!(like_match("FPT", "F%"));
        assert!(like_match("FPT", "_PT"));
        assert!(like_match("FPT", "%"));
        assert!(!like_match("FPT", "F_"));
        assert!(!like_match("VNM", "F%"));
    }

    #[test]
    fn getdate_resolves() {
        let t = now();
        assert_eq!(
            resolve(&SqlValue::raw("GETDATE()"), t).unwrap(),
            SqlValue::DateTime(t)
        );
        assert!(resolve(&SqlValue::raw("NEWID()"), t).is_err());
    }

    #[test]
    fn coerce_enforces_length() {
        let column = ColumnDescriptor::required("Symbol", DataType::nvarchar(3));
        assert!(coerce("T", &column, SqlValue::text("FPT"), now()).is_ok());
        assert!(matches!(
            coerce("T", &column, SqlValue::text("FPTS"), now()),
            Err(StoreError::Constraint { .. })
        ));
    }

    #[test]
    fn null_comparisons_are_unknown() {
        let t = now();
        assert!(!eval_condition(&SqlValue::Null, &Condition::eq("A", 1), t).unwrap());
        assert!(eval_condition(&SqlValue::Null, &Condition::is_null("A"), t).unwrap());
        assert!(!eval_condition(
            &SqlValue::Int(3),
            &Condition::new("A", Operator::NotIn, vec![SqlValue::Int(1), SqlValue::Null]),
            t
        )
        .unwrap());
    }
}
