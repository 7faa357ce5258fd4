//! Pure functions turning descriptors into T-SQL statements.
//!
//! Literal values are emitted as `@P<n>` placeholders and carried next to the
//! text in [`Statement::params`]; `NULL` and raw fragments are inlined with
//! [`format_value`]. Nothing here touches a connection: catalog validation
//! (database, table and foreign-key existence) happens in the store before
//! these functions are called.

use super::descriptor::{
    Assignment, Condition, JoinKind, JoinSpec, MergeAction, MergeSpec, Operator, Record, SelectQuery,
    TableDescriptor, ValueSource,
};
use super::value::{format_value, quote_ident, SqlValue};
use crate::store::StoreError;
use std::fmt;

/// SQL Server accepts at most 1000 row value expressions per `INSERT ... VALUES`.
pub const MAX_ROWS_PER_INSERT: usize = 1000;

/// SQL Server's limit is 2100 parameters per request; keep a margin.
pub const MAX_PARAMS_PER_STATEMENT: usize = 2000;

/// SQL text plus its bound parameters (`@P1` is `params[0]`).
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn text(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// The statement with every placeholder replaced by its literal, for logs.
    /// Substituted literals are never rescanned.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.sql.len());
        let mut rest = self.sql.as_str();
        while let Some(at) = rest.find("@P") {
            out.push_str(&rest[..at]);
            let after = &rest[at + 2..];
            let digits = after.bytes().take_while(u8::is_ascii_digit).count();
            let bound = after[..digits]
                .parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .and_then(|i| self.params.get(i));
            match bound {
                Some(value) => out.push_str(&format_value(value)),
                None => out.push_str(&rest[at..at + 2 + digits]),
            }
            rest = &after[digits..];
        }
        out.push_str(rest);
        out
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Accumulates SQL text and numbers placeholders as values are pushed.
#[derive(Debug, Default)]
pub struct SqlWriter {
    sql: String,
    params: Vec<SqlValue>,
}

impl SqlWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, text: &str) -> &mut Self {
        self.sql.push_str(text);
        self
    }

    /// Emit a value: a fresh placeholder when bindable, its literal otherwise.
    pub fn value(&mut self, value: &SqlValue) -> &mut Self {
        if value.is_bindable() {
            self.params.push(value.clone());
            let placeholder = format!("@P{}", self.params.len());
            self.sql.push_str(&placeholder);
        } else {
            self.sql.push_str(&format_value(value));
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }

    pub fn finish(self) -> Statement {
        Statement {
            sql: self.sql,
            params: self.params,
        }
    }
}

// ── Naming ───────────────────────────────────────────────────────────

/// `[db].[dbo].[table]`
pub fn qualified_table(database: &str, table: &str) -> String {
    format!("{}.[dbo].{}", quote_ident(database), quote_ident(table))
}

/// Quote a possibly table-qualified column: `Security.Symbol` → `[Security].[Symbol]`.
pub fn quote_column(path: &str) -> String {
    path.split('.').map(quote_ident).collect::<Vec<_>>().join(".")
}

fn column_list<'a>(columns: impl Iterator<Item = &'a str>) -> String {
    columns.map(quote_ident).collect::<Vec<_>>().join(", ")
}

// ── Fragments ────────────────────────────────────────────────────────

fn write_condition(w: &mut SqlWriter, condition: &Condition) -> Result<(), StoreError> {
    condition.validate()?;
    w.push(&quote_column(&condition.column))
        .push(" ")
        .push(condition.operator.as_sql())
        .push(" ");
    match condition.operator {
        Operator::In | Operator::NotIn => {
            w.push("(");
            for (i, v) in condition.values.iter().enumerate() {
                if i > 0 {
                    w.push(", ");
                }
                w.value(v);
            }
            w.push(")");
        }
        Operator::Between => {
            w.value(&condition.values[0])
                .push(" AND ")
                .value(&condition.values[1]);
        }
        _ => {
            w.value(&condition.values[0]);
        }
    }
    Ok(())
}

/// Append `\nWHERE c1 AND c2 ...`; appends nothing for an empty list.
pub fn write_where(w: &mut SqlWriter, conditions: &[Condition]) -> Result<(), StoreError> {
    if conditions.is_empty() {
        return Ok(());
    }
    w.push("\nWHERE ");
    for (i, condition) in conditions.iter().enumerate() {
        if i > 0 {
            w.push(" AND ");
        }
        write_condition(w, condition)?;
    }
    Ok(())
}

/// `WHERE ...` fragment on its own. Empty SQL when there are no conditions.
pub fn build_condition(conditions: &[Condition]) -> Result<Statement, StoreError> {
    let mut w = SqlWriter::new();
    write_where(&mut w, conditions)?;
    let mut stmt = w.finish();
    stmt.sql = stmt.sql.trim_start().to_string();
    Ok(stmt)
}

/// `FROM <base>` followed by one `<KIND> JOIN` line per step.
pub fn build_join(database: &str, join: &JoinSpec) -> String {
    let mut out = format!("FROM {}", qualified_table(database, &join.base_table));
    for step in &join.steps {
        out.push('\n');
        out.push_str(step.kind.as_sql());
        out.push_str(" JOIN ");
        out.push_str(&qualified_table(database, &step.right_table));
        if step.kind != JoinKind::Cross {
            out.push_str(&format!(
                " ON {}.{} = {}.{}",
                quote_ident(&step.left_table),
                quote_ident(&step.left_column),
                quote_ident(&step.right_table),
                quote_ident(&step.right_column)
            ));
        }
    }
    out
}

// ── DDL ──────────────────────────────────────────────────────────────

/// `CREATE TABLE` with the key column first as an identity primary key.
pub fn build_create_table(database: &str, table: &TableDescriptor) -> Result<Statement, StoreError> {
    table.check_column_names()?;
    let key = table.key().ok_or_else(|| StoreError::KeyColumnMissing {
        table: table.name.clone(),
        column: table.key_column.clone(),
    })?;

    let mut lines = vec![format!(
        "{} {} IDENTITY(1,1) PRIMARY KEY NOT NULL",
        quote_ident(&key.name),
        key.data_type
    )];
    for column in table.non_key_columns() {
        lines.push(format!(
            "{} {} {}",
            quote_ident(&column.name),
            column.data_type,
            if column.nullable { "NULL" } else { "NOT NULL" }
        ));
    }
    for fk in &table.foreign_keys {
        lines.push(format!(
            "FOREIGN KEY ({}) REFERENCES {}({})",
            quote_ident(&fk.column),
            qualified_table(database, &fk.referenced_table),
            quote_ident(&fk.referenced_column)
        ));
    }

    Ok(Statement::text(format!(
        "CREATE TABLE {} (\n    {}\n)",
        qualified_table(database, &table.name),
        lines.join(",\n    ")
    )))
}

pub fn build_create_database(database: &str) -> Statement {
    Statement::text(format!("CREATE DATABASE {}", quote_ident(database)))
}

pub fn build_use_database(database: &str) -> Statement {
    Statement::text(format!("USE {}", quote_ident(database)))
}

pub fn build_truncate(database: &str, table: &str) -> Statement {
    Statement::text(format!("TRUNCATE TABLE {}", qualified_table(database, table)))
}

pub fn build_drop(database: &str, table: &str) -> Statement {
    Statement::text(format!("DROP TABLE {}", qualified_table(database, table)))
}

// ── Catalog probes ───────────────────────────────────────────────────

/// Returns one row when the database exists.
pub fn build_database_exists(database: &str) -> Statement {
    Statement {
        sql: "SELECT 1 AS [Exists] FROM sys.databases WHERE name = @P1".to_string(),
        params: vec![SqlValue::text(database)],
    }
}

/// Returns one row when the user table exists.
pub fn build_table_exists(database: &str, table: &str) -> Statement {
    Statement {
        sql: "SELECT 1 AS [Exists] WHERE OBJECT_ID(@P1, N'U') IS NOT NULL".to_string(),
        params: vec![SqlValue::text(qualified_table(database, table))],
    }
}

// ── DML ──────────────────────────────────────────────────────────────

pub fn build_select(
    database: &str,
    table: &str,
    query: &SelectQuery,
) -> Result<Statement, StoreError> {
    let mut w = SqlWriter::new();
    w.push("SELECT ");
    if let Some(limit) = query.effective_limit(table) {
        w.push(&format!("TOP ({limit}) "));
    }
    match query.effective_columns(table) {
        Some(columns) => w.push(&column_list(columns.iter().map(String::as_str))),
        None => w.push("*"),
    };
    w.push("\nFROM ").push(&qualified_table(database, table));
    write_where(&mut w, &query.conditions)?;
    if !query.order_by.is_empty() {
        let order: Vec<String> = query.order_by.iter().map(|c| quote_column(c)).collect();
        w.push("\nORDER BY ").push(&order.join(", "));
    }
    Ok(w.finish())
}

/// Multi-row INSERT, split so every statement stays within the row and
/// parameter limits. Columns come from the first record.
pub fn build_insert(
    database: &str,
    table: &str,
    records: &[Record],
) -> Result<Vec<Statement>, StoreError> {
    let first = records.first().ok_or_else(|| StoreError::EmptyInsert {
        table: table.to_string(),
    })?;
    if first.is_empty() {
        return Err(StoreError::EmptyInsert {
            table: table.to_string(),
        });
    }

    let width = first.len();
    let rows_per_statement = (MAX_PARAMS_PER_STATEMENT / width).clamp(1, MAX_ROWS_PER_INSERT);
    let header = format!(
        "INSERT INTO {} ({})\nVALUES\n",
        qualified_table(database, table),
        column_list(first.columns())
    );

    let mut statements = Vec::new();
    for chunk in records.chunks(rows_per_statement) {
        let mut w = SqlWriter::new();
        w.push(&header);
        for (i, record) in chunk.iter().enumerate() {
            if record.len() != width {
                return Err(StoreError::RecordShapeMismatch {
                    table: table.to_string(),
                    expected: width,
                    found: record.len(),
                });
            }
            if i > 0 {
                w.push(",\n");
            }
            w.push("    (");
            for (j, field) in record.fields.iter().enumerate() {
                if j > 0 {
                    w.push(", ");
                }
                w.value(&field.value);
            }
            w.push(")");
        }
        statements.push(w.finish());
    }
    Ok(statements)
}

/// `UPDATE ... SET ... [FROM ... JOIN ...] [WHERE ...]`.
pub fn build_update(
    database: &str,
    table: &str,
    assignments: &Record,
    join: Option<&JoinSpec>,
    conditions: &[Condition],
) -> Result<Statement, StoreError> {
    if assignments.is_empty() {
        return Err(StoreError::EmptyAssignment {
            table: table.to_string(),
        });
    }
    let mut w = SqlWriter::new();
    w.push("UPDATE ")
        .push(&qualified_table(database, table))
        .push("\nSET ");
    for (i, field) in assignments.fields.iter().enumerate() {
        if i > 0 {
            w.push(",\n    ");
        }
        w.push(&quote_column(&field.column)).push(" = ").value(&field.value);
    }
    if let Some(join) = join {
        w.push("\n").push(&build_join(database, join));
    }
    write_where(&mut w, conditions)?;
    Ok(w.finish())
}

pub fn build_delete(
    database: &str,
    table: &str,
    conditions: &[Condition],
) -> Result<Statement, StoreError> {
    let mut w = SqlWriter::new();
    w.push("DELETE FROM ").push(&qualified_table(database, table));
    write_where(&mut w, conditions)?;
    Ok(w.finish())
}

fn write_assignment_value(w: &mut SqlWriter, assignment: &Assignment) {
    match &assignment.source {
        ValueSource::Source(column) => {
            w.push("S.").push(&quote_ident(column));
        }
        ValueSource::Value(value) => {
            w.value(value);
        }
    }
}

fn write_merge_action(w: &mut SqlWriter, action: &MergeAction) {
    match action {
        MergeAction::Insert(assignments) => {
            w.push("INSERT (")
                .push(&column_list(assignments.iter().map(|a| a.target.as_str())))
                .push(")\n    VALUES (");
            for (i, assignment) in assignments.iter().enumerate() {
                if i > 0 {
                    w.push(", ");
                }
                write_assignment_value(w, assignment);
            }
            w.push(")");
        }
        MergeAction::Update(assignments) => {
            w.push("UPDATE SET ");
            for (i, assignment) in assignments.iter().enumerate() {
                if i > 0 {
                    w.push(", ");
                }
                w.push("T.").push(&quote_ident(&assignment.target)).push(" = ");
                write_assignment_value(w, assignment);
            }
        }
        MergeAction::Delete => {
            w.push("DELETE");
        }
    }
}

/// Three-way MERGE. Returns `Ok(None)` when the merge carries no action.
pub fn build_merge(database: &str, spec: &MergeSpec) -> Result<Option<Statement>, StoreError> {
    if spec.is_noop() {
        return Ok(None);
    }
    spec.validate_actions()?;

    let mut w = SqlWriter::new();
    w.push("MERGE INTO ")
        .push(&qualified_table(database, &spec.target))
        .push(" AS T\nUSING ")
        .push(&qualified_table(database, &spec.source))
        .push(" AS S\nON (T.")
        .push(&quote_ident(&spec.match_column))
        .push(" = S.")
        .push(&quote_ident(&spec.match_column))
        .push(")");
    for (clause, action) in spec.clauses() {
        w.push("\n").push(clause.as_sql()).push("\n    ");
        write_merge_action(&mut w, action);
    }
    w.push(";");
    Ok(Some(w.finish()))
}

pub fn build_begin_transaction() -> Statement {
    Statement::text("BEGIN TRANSACTION")
}

pub fn build_commit_transaction() -> Statement {
    Statement::text("COMMIT TRANSACTION")
}

pub fn build_rollback_transaction() -> Statement {
    Statement::text("ROLLBACK TRANSACTION")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{ColumnDescriptor, DataType, ForeignKey};

    #[test]
    fn where_clause_absent_without_conditions() {
        let stmt = build_condition(&[]).unwrap();
        assert!(stmt.sql.is_empty());
        assert!(stmt.params.is_empty());
    }

    #[test]
    fn where_clause_numbers_params_in_order() {
        let stmt = build_condition(&[
            Condition::eq("Symbol", "FPT"),
            Condition::between("ID", 1, 10),
            Condition::is_null("DelistDate"),
        ])
        .unwrap();
        assert_eq!(
            stmt.sql,
            "WHERE [Symbol] = @P1 AND [ID] BETWEEN @P2 AND @P3 AND [DelistDate] IS NULL"
        );
        assert_eq!(stmt.params.len(), 3);
        assert_eq!(
            stmt.render(),
            "WHERE [Symbol] = N'FPT' AND [ID] BETWEEN 1 AND 10 AND [DelistDate] IS NULL"
        );
    }

    #[test]
    fn in_list_is_parenthesized() {
        let stmt = build_condition(&[Condition::in_list(
            "Symbol",
            vec!["A".into(), "B".into()],
        )])
        .unwrap();
        assert_eq!(stmt.sql, "WHERE [Symbol] IN (@P1, @P2)");
    }

    #[test]
    fn render_does_not_confuse_p1_and_p10() {
        let values: Vec<SqlValue> = (1..=11).map(SqlValue::Int).collect();
        let stmt = build_condition(&[Condition::in_list("ID", values)]).unwrap();
        assert_eq!(
            stmt.render(),
            "WHERE [ID] IN (1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11)"
        );
    }

    #[test]
    fn create_table_ddl() {
        let table = TableDescriptor::new(
            "Security",
            "ID",
            vec![
                ColumnDescriptor::required("ID", DataType::Int),
                ColumnDescriptor::required("Symbol", DataType::nvarchar(12)),
                ColumnDescriptor::optional("Market_ID", DataType::Int),
            ],
        )
        .with_foreign_key(ForeignKey::new("Market_ID", "Market", "ID"));
        let stmt = build_create_table("SSI_STOCKS", &table).unwrap();
        assert_eq!(
            stmt.sql,
            "CREATE TABLE [SSI_STOCKS].[dbo].[Security] (\n    \
             [ID] INT IDENTITY(1,1) PRIMARY KEY NOT NULL,\n    \
             [Symbol] NVARCHAR(12) NOT NULL,\n    \
             [Market_ID] INT NULL,\n    \
             FOREIGN KEY ([Market_ID]) REFERENCES [SSI_STOCKS].[dbo].[Market]([ID])\n)"
        );
    }

    #[test]
    fn create_table_requires_key_column() {
        let table = TableDescriptor::new(
            "T",
            "ID",
            vec![ColumnDescriptor::required("Name", DataType::nvarchar(10))],
        );
        assert!(matches!(
            build_create_table("DB", &table),
            Err(StoreError::KeyColumnMissing { .. })
        ));
    }

    #[test]
    fn select_with_top_and_order() {
        let q = SelectQuery::all()
            .columns(["Symbol", "Name"])
            .limit(5)
            .filter(Condition::is_null("DelistDate"))
            .order_by("Symbol");
        let stmt = build_select("DB", "Security", &q).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT TOP (5) [Symbol], [Name]\nFROM [DB].[dbo].[Security]\n\
             WHERE [DelistDate] IS NULL\nORDER BY [Symbol]"
        );
    }

    #[test]
    fn insert_binds_values_and_inlines_null() {
        let records = vec![
            Record::new().set("Symbol", "HNX").set("EnName", SqlValue::Null),
            Record::new().set("Symbol", "O'X").set("EnName", "x"),
        ];
        let stmts = build_insert("DB", "Market", &records).unwrap();
        assert_eq!(stmts.len(), 1);
        assert_eq!(
            stmts[0].sql,
            "INSERT INTO [DB].[dbo].[Market] ([Symbol], [EnName])\nVALUES\n    \
             (@P1, NULL),\n    (@P2, @P3)"
        );
        assert!(stmts[0].render().contains("N'O''X'"));
    }

    #[test]
    fn render_does_not_rescan_substituted_text() {
        let mut w = SqlWriter::new();
        w.push("SELECT ")
            .value(&SqlValue::text("@P2 and @P10"))
            .push(", ")
            .value(&SqlValue::from(7i64));
        for n in 3..=10 {
            w.push(", ").value(&SqlValue::from(n as i64));
        }
        let rendered = w.finish().render();
        assert!(rendered.starts_with("SELECT N'@P2 and @P10', 7, 3, "), "{rendered}");
        assert!(rendered.ends_with(", 10"), "{rendered}");
    }

    #[test]
    fn render_keeps_unbound_placeholders() {
        let stmt = Statement::text("SELECT @P1, @Px");
        assert_eq!(stmt.render(), "SELECT @P1, @Px");
    }

    #[test]
    fn insert_is_chunked() {
        let records: Vec<Record> = (0..2500).map(|i| Record::new().set("ID", i)).collect();
        let stmts = build_insert("DB", "T", &records).unwrap();
        assert_eq!(stmts.len(), 3);
        assert!(stmts.iter().all(|s| s.params.len() <= MAX_PARAMS_PER_STATEMENT));

        let wide: Vec<Record> = (0..300)
            .map(|i| {
                (0..10).fold(Record::new(), |r, c| r.set(format!("C{c}"), i))
            })
            .collect();
        let stmts = build_insert("DB", "T", &wide).unwrap();
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0].params.len(), 2000);
    }

    #[test]
    fn insert_requires_records() {
        assert!(matches!(
            build_insert("DB", "T", &[]),
            Err(StoreError::EmptyInsert { .. })
        ));
    }

    #[test]
    fn update_with_join() {
        let join = JoinSpec::from_table("Security").join(
            JoinKind::Inner,
            ("Security", "Market_ID"),
            ("Market", "ID"),
        );
        let stmt = build_update(
            "DB",
            "Security",
            &Record::new().set("Security.Name", "x"),
            Some(&join),
            &[Condition::eq("Market.Symbol", "HOSE")],
        )
        .unwrap();
        assert_eq!(
            stmt.sql,
            "UPDATE [DB].[dbo].[Security]\nSET [Security].[Name] = @P1\n\
             FROM [DB].[dbo].[Security]\n\
             INNER JOIN [DB].[dbo].[Market] ON [Security].[Market_ID] = [Market].[ID]\n\
             WHERE [Market].[Symbol] = @P2"
        );
    }

    #[test]
    fn delete_without_conditions_purges() {
        let stmt = build_delete("DB", "Market", &[]).unwrap();
        assert_eq!(stmt.sql, "DELETE FROM [DB].[dbo].[Market]");
    }

    #[test]
    fn merge_text() {
        let spec = MergeSpec::new("SecurityStaging", "Security", "Symbol")
            .when_matched(MergeAction::Update(vec![
                Assignment::same_column("Name"),
                Assignment::value("DelistDate", SqlValue::Null),
            ]))
            .when_not_matched_by_target(MergeAction::Insert(vec![
                Assignment::same_column("Symbol"),
                Assignment::value("CreateDate", SqlValue::raw("GETDATE()")),
            ]))
            .when_not_matched_by_source(MergeAction::Update(vec![Assignment::value(
                "DelistDate",
                SqlValue::raw("GETDATE()"),
            )]));
        let stmt = build_merge("DB", &spec).unwrap().unwrap();
        assert_eq!(
            stmt.sql,
            "MERGE INTO [DB].[dbo].[Security] AS T\n\
             USING [DB].[dbo].[SecurityStaging] AS S\n\
             ON (T.[Symbol] = S.[Symbol])\n\
             WHEN MATCHED THEN\n    UPDATE SET T.[Name] = S.[Name], T.[DelistDate] = NULL\n\
             WHEN NOT MATCHED BY TARGET THEN\n    INSERT ([Symbol], [CreateDate])\n    \
             VALUES (S.[Symbol], GETDATE())\n\
             WHEN NOT MATCHED BY SOURCE THEN\n    UPDATE SET T.[DelistDate] = GETDATE();"
        );
        assert!(stmt.params.is_empty());
    }

    #[test]
    fn merge_without_actions_builds_nothing() {
        let spec = MergeSpec::new("S", "T", "Symbol");
        assert_eq!(build_merge("DB", &spec).unwrap(), None);
    }

    #[test]
    fn catalog_probes_bind_names() {
        let stmt = build_table_exists("SSI_STOCKS", "Market");
        assert_eq!(
            stmt.params,
            vec![SqlValue::text("[SSI_STOCKS].[dbo].[Market]")]
        );
        assert_eq!(
            build_database_exists("SSI_STOCKS").render(),
            "SELECT 1 AS [Exists] FROM sys.databases WHERE name = N'SSI_STOCKS'"
        );
    }
}
