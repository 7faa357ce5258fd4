//! Integration tests for the in-process store: schema manager, repository
//! and merge engine behaviour against the crawl tables.

use stockpipe_core::schema::{self, MARKET, SECURITY, SECURITY_STAGING};
use stockpipe_core::sql::{
    Assignment, ColumnDescriptor, Condition, DataType, ForeignKey, JoinKind, JoinSpec,
    MergeAction, MergeSpec, Record, SelectQuery, SqlValue, TableDescriptor,
};
use stockpipe_core::store::{MemoryStore, Store, StoreError};

const DB: &str = "SSI_STOCKS";

// ── Helpers ──────────────────────────────────────────────────────────

fn crawl_store() -> MemoryStore {
    let mut store = MemoryStore::new();
    store.create_database(DB).unwrap();
    for table in schema::all_tables() {
        assert!(store.create_table(DB, &table).unwrap());
    }
    store
}

fn market(symbol: &str) -> Record {
    Record::new()
        .set("Symbol", symbol)
        .set("Name", format!("{symbol} exchange"))
        .set("EnName", format!("{symbol} exchange"))
        .set("CreateDate", SqlValue::raw("GETDATE()"))
}

fn security(symbol: &str, market_id: i32) -> Record {
    Record::new()
        .set("Symbol", symbol)
        .set("Name", format!("CTCP {symbol}"))
        .set("EnName", format!("{symbol} JSC"))
        .set("Market_ID", market_id)
        .set("CreateDate", SqlValue::raw("GETDATE()"))
}

fn symbols(store: &mut MemoryStore, table: &str, query: SelectQuery) -> Vec<String> {
    store
        .select(DB, table, &query.columns(["Symbol"]).order_by("Symbol"))
        .unwrap()
        .iter()
        .filter_map(|r| r.get_str("Symbol").map(str::to_string))
        .collect()
}

fn entity_merge() -> MergeSpec {
    MergeSpec::new(SECURITY_STAGING, SECURITY, "Symbol")
        .when_matched(MergeAction::Update(vec![
            Assignment::same_column("Name"),
            Assignment::same_column("EnName"),
            Assignment::same_column("Market_ID"),
            Assignment::value("UpdateDate", SqlValue::raw("GETDATE()")),
            Assignment::value("DelistDate", SqlValue::Null),
        ]))
        .when_not_matched_by_target(MergeAction::Insert(vec![
            Assignment::same_column("Symbol"),
            Assignment::same_column("Name"),
            Assignment::same_column("EnName"),
            Assignment::same_column("Market_ID"),
            Assignment::value("CreateDate", SqlValue::raw("GETDATE()")),
        ]))
        .when_not_matched_by_source(MergeAction::Update(vec![Assignment::value(
            "DelistDate",
            SqlValue::raw("GETDATE()"),
        )]))
}

// ── Schema manager ───────────────────────────────────────────────────

#[test]
fn create_table_is_idempotent() {
    let mut store = crawl_store();
    assert!(!store.create_table(DB, &schema::market_table()).unwrap());
    assert_eq!(store.row_count(DB, MARKET), Some(0));
}

#[test]
fn create_database_twice_is_noop() {
    let mut store = MemoryStore::new();
    assert!(store.create_database(DB).unwrap());
    assert!(!store.create_database(DB).unwrap());
    assert_eq!(store.current_database(), Some(DB));
}

#[test]
fn foreign_key_tables_must_exist_first() {
    let a = TableDescriptor::new(
        "A",
        "ID",
        vec![ColumnDescriptor::required("ID", DataType::Int)],
    );
    let b = TableDescriptor::new(
        "B",
        "ID",
        vec![
            ColumnDescriptor::required("ID", DataType::Int),
            ColumnDescriptor::required("A_ID", DataType::Int),
        ],
    )
    .with_foreign_key(ForeignKey::new("A_ID", "A", "ID"));

    let mut store = MemoryStore::new();
    store.create_database(DB).unwrap();
    assert!(matches!(
        store.create_table(DB, &b),
        Err(StoreError::ForeignKeyTableMissing { referenced, .. }) if referenced == "A"
    ));
    assert!(store.create_table(DB, &a).unwrap());
    assert!(store.create_table(DB, &b).unwrap());
}

#[test]
fn create_table_checks_database_and_key() {
    let mut store = MemoryStore::new();
    assert!(matches!(
        store.create_table(DB, &schema::market_table()),
        Err(StoreError::DatabaseMissing { .. })
    ));
    store.create_database(DB).unwrap();
    let keyless = TableDescriptor::new(
        "T",
        "ID",
        vec![ColumnDescriptor::required("Symbol", DataType::nvarchar(5))],
    );
    assert!(matches!(
        store.create_table(DB, &keyless),
        Err(StoreError::KeyColumnMissing { .. })
    ));
}

#[test]
fn duplicate_columns_fail_before_catalog() {
    // No database: the duplicate check must win over DatabaseMissing.
    let mut store = MemoryStore::new();
    let table = TableDescriptor::new(
        "T",
        "ID",
        vec![
            ColumnDescriptor::required("ID", DataType::Int),
            ColumnDescriptor::required("ID", DataType::Int),
        ],
    );
    assert!(matches!(
        store.create_table(DB, &table),
        Err(StoreError::DuplicateColumn { .. })
    ));
}

// ── Repository ───────────────────────────────────────────────────────

#[test]
fn quoted_text_round_trips() {
    let mut store = crawl_store();
    store
        .insert(
            DB,
            MARKET,
            &[Record::new()
                .set("Symbol", "OB")
                .set("Name", "O'Brien")
                .set("EnName", "O'Brien's")
                .set("CreateDate", SqlValue::raw("GETDATE()"))],
        )
        .unwrap();
    let rows = store
        .select(DB, MARKET, &SelectQuery::all().filter(Condition::eq("Name", "O'Brien")))
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get_str("EnName"), Some("O'Brien's"));
    assert_eq!(rows[0].get_i64("ID"), Some(1));
    assert!(rows[0].get_datetime("CreateDate").is_some());
}

#[test]
fn select_substitutes_invalid_arguments() {
    let mut store = crawl_store();
    store
        .insert(DB, MARKET, &[market("HNX"), market("HOSE"), market("UPCOM")])
        .unwrap();

    let empty_columns = SelectQuery {
        columns: Some(vec![]),
        ..SelectQuery::all()
    };
    let rows = store.select(DB, MARKET, &empty_columns).unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows[0].get("CreateDate").is_some());

    let rows = store.select(DB, MARKET, &SelectQuery::all().limit(-5)).unwrap();
    assert_eq!(rows.len(), 3);
    let rows = store.select(DB, MARKET, &SelectQuery::all().limit(2)).unwrap();
    assert_eq!(rows.len(), 2);
}

#[test]
fn conditions_combine_with_and() {
    let mut store = crawl_store();
    store
        .insert(DB, MARKET, &[market("HNX"), market("HOSE"), market("UPCOM")])
        .unwrap();
    let query = SelectQuery::all()
        .filter(Condition::like("Symbol", "H%"))
        .filter(Condition::compare(
            "ID",
            stockpipe_core::sql::Operator::Gt,
            1,
        ));
    assert_eq!(symbols(&mut store, MARKET, query), vec!["HOSE"]);
    let query = SelectQuery::all().filter(Condition::in_list(
        "Symbol",
        vec![SqlValue::text("HNX"), SqlValue::text("UPCOM")],
    ));
    assert_eq!(symbols(&mut store, MARKET, query), vec!["HNX", "UPCOM"]);
}

#[test]
fn invalid_condition_arity_is_rejected() {
    let mut store = crawl_store();
    let bad = Condition::new("ID", stockpipe_core::sql::Operator::Between, vec![SqlValue::Int(1)]);
    assert!(matches!(
        store.select(DB, MARKET, &SelectQuery::all().filter(bad)),
        Err(StoreError::InvalidCondition { arity: 1, .. })
    ));
}

#[test]
fn writes_enforce_foreign_keys_and_not_null() {
    let mut store = crawl_store();
    assert!(matches!(
        store.insert(DB, SECURITY, &[security("FPT", 9)]),
        Err(StoreError::Constraint { .. })
    ));
    let no_name = Record::new()
        .set("Symbol", "HNX")
        .set("CreateDate", SqlValue::raw("GETDATE()"));
    assert!(matches!(
        store.insert(DB, MARKET, &[no_name]),
        Err(StoreError::NotNullViolation { .. })
    ));
    assert!(matches!(
        store.insert(DB, MARKET, &[]),
        Err(StoreError::EmptyInsert { .. })
    ));
}

#[test]
fn referenced_rows_cannot_be_removed() {
    let mut store = crawl_store();
    store.insert(DB, MARKET, &[market("HOSE")]).unwrap();
    store.insert(DB, SECURITY, &[security("FPT", 1)]).unwrap();
    assert!(store.delete(DB, MARKET, &[]).is_err());
    assert!(store.truncate_table(DB, MARKET).is_err());
    assert_eq!(store.delete(DB, SECURITY, &[]).unwrap(), 1);
    assert_eq!(store.delete(DB, MARKET, &[]).unwrap(), 1);
}

#[test]
fn update_through_join() {
    let mut store = crawl_store();
    store.insert(DB, MARKET, &[market("HNX"), market("HOSE")]).unwrap();
    store
        .insert(DB, SECURITY, &[security("SHS", 1), security("FPT", 2), security("VNM", 2)])
        .unwrap();
    let join = JoinSpec::from_table(SECURITY).join(
        JoinKind::Inner,
        (SECURITY, "Market_ID"),
        (MARKET, "ID"),
    );
    let updated = store
        .update(
            DB,
            SECURITY,
            &Record::new().set("ListedShare", 1_000_i64),
            Some(&join),
            &[Condition::eq("Market.Symbol", "HOSE")],
        )
        .unwrap();
    assert_eq!(updated, 2);
    let listed = SelectQuery::all().filter(Condition::is_not_null("ListedShare"));
    assert_eq!(symbols(&mut store, SECURITY, listed), vec!["FPT", "VNM"]);
}

#[test]
fn truncate_reseeds_identity() {
    let mut store = crawl_store();
    store
        .insert(DB, SECURITY_STAGING, &[security("A", 1), security("B", 1)])
        .unwrap();
    store.truncate_table(DB, SECURITY_STAGING).unwrap();
    store.insert(DB, SECURITY_STAGING, &[security("C", 1)]).unwrap();
    let rows = store.select(DB, SECURITY_STAGING, &SelectQuery::all()).unwrap();
    assert_eq!(rows[0].get_i64("ID"), Some(1));
}

#[test]
fn rollback_restores_rows() {
    let mut store = crawl_store();
    store.insert(DB, MARKET, &[market("HNX")]).unwrap();
    store.begin_transaction().unwrap();
    store.insert(DB, MARKET, &[market("HOSE")]).unwrap();
    store.rollback_transaction().unwrap();
    assert_eq!(store.row_count(DB, MARKET), Some(1));
    assert!(matches!(
        store.commit_transaction(),
        Err(StoreError::Transaction(_))
    ));
}

#[test]
fn unreachable_store_is_fatal() {
    let mut store = MemoryStore::unreachable();
    let err = store.database_exists(DB).unwrap_err();
    assert!(err.is_fatal());
}

// ── Merge engine ─────────────────────────────────────────────────────

#[test]
fn merge_without_actions_is_noop() {
    let mut store = crawl_store();
    let writes = store.write_count();
    let spec = MergeSpec::new(SECURITY_STAGING, SECURITY, "Symbol");
    assert!(!store.merge(DB, &spec).unwrap());
    assert_eq!(store.write_count(), writes);
}

#[test]
fn merge_requires_both_tables() {
    let mut store = crawl_store();
    let spec = MergeSpec::new("Missing", SECURITY, "Symbol").when_matched(MergeAction::Delete);
    assert!(matches!(
        store.merge(DB, &spec),
        Err(StoreError::TableMissing { .. })
    ));
}

#[test]
fn merge_rejects_illegal_clause_action() {
    let mut store = crawl_store();
    let spec = MergeSpec::new(SECURITY_STAGING, SECURITY, "Symbol")
        .when_not_matched_by_target(MergeAction::Delete);
    assert!(matches!(
        store.merge(DB, &spec),
        Err(StoreError::InvalidMergeAction { .. })
    ));
}

#[test]
fn merge_soft_deletes_missing_entities() {
    let mut store = crawl_store();
    store.insert(DB, MARKET, &[market("HOSE")]).unwrap();

    store
        .insert(DB, SECURITY_STAGING, &[security("FPT", 1), security("VNM", 1)])
        .unwrap();
    assert!(store.merge(DB, &entity_merge()).unwrap());
    assert_eq!(store.row_count(DB, SECURITY), Some(2));

    store.truncate_table(DB, SECURITY_STAGING).unwrap();
    store
        .insert(DB, SECURITY_STAGING, &[security("FPT", 1), security("HPG", 1)])
        .unwrap();
    assert!(store.merge(DB, &entity_merge()).unwrap());

    assert_eq!(store.row_count(DB, SECURITY), Some(3));
    let active = SelectQuery::all().filter(Condition::is_null("DelistDate"));
    assert_eq!(symbols(&mut store, SECURITY, active), vec!["FPT", "HPG"]);
    let delisted = SelectQuery::all().filter(Condition::is_not_null("DelistDate"));
    assert_eq!(symbols(&mut store, SECURITY, delisted), vec!["VNM"]);

    // Relisting clears the delist stamp.
    store.truncate_table(DB, SECURITY_STAGING).unwrap();
    store
        .insert(DB, SECURITY_STAGING, &[security("VNM", 1)])
        .unwrap();
    store.merge(DB, &entity_merge()).unwrap();
    let active = SelectQuery::all().filter(Condition::is_null("DelistDate"));
    assert_eq!(symbols(&mut store, SECURITY, active), vec!["VNM"]);
}

#[test]
fn merge_delete_of_referenced_row_is_rejected() {
    let mut store = crawl_store();
    store.insert(DB, MARKET, &[market("HOSE"), market("HNX")]).unwrap();
    store.insert(DB, SECURITY, &[security("FPT", 1)]).unwrap();

    let staging = TableDescriptor::new(
        "MarketStaging",
        "ID",
        vec![
            ColumnDescriptor::required("ID", DataType::Int),
            ColumnDescriptor::required("Symbol", DataType::nvarchar(5)),
        ],
    );
    store.create_table(DB, &staging).unwrap();
    store
        .insert(DB, "MarketStaging", &[Record::new().set("Symbol", "HNX")])
        .unwrap();

    let purge = MergeSpec::new("MarketStaging", MARKET, "Symbol")
        .when_not_matched_by_source(MergeAction::Delete);
    assert!(matches!(
        store.merge(DB, &purge),
        Err(StoreError::Constraint { table, .. }) if table == MARKET
    ));
    assert_eq!(store.row_count(DB, MARKET), Some(2));

    store
        .update(DB, SECURITY, &Record::new().set("Market_ID", 2), None, &[])
        .unwrap();
    assert!(store.merge(DB, &purge).unwrap());
    assert_eq!(symbols(&mut store, MARKET, SelectQuery::all()), vec!["HNX"]);
}
