//! Table definitions of the `SSI_STOCKS` database, in foreign-key order.

use crate::sql::{ColumnDescriptor, DataType, ForeignKey, TableDescriptor};

pub const DEFAULT_DATABASE: &str = "SSI_STOCKS";

pub const MARKET: &str = "Market";
pub const SECURITY_TYPE: &str = "SecurityType";
pub const SECURITY: &str = "Security";
pub const SECURITY_STAGING: &str = "SecurityStaging";
pub const CRAWL_CHECKPOINT: &str = "CrawlCheckpoint";

/// Longest symbol the entity and checkpoint tables accept.
pub const SYMBOL_MAX_LEN: u16 = 12;

fn audit_columns(columns: &mut Vec<ColumnDescriptor>, removal: &str) {
    columns.push(ColumnDescriptor::required("CreateDate", DataType::DateTime));
    columns.push(ColumnDescriptor::optional("UpdateDate", DataType::DateTime));
    columns.push(ColumnDescriptor::optional(removal, DataType::DateTime));
}

pub fn market_table() -> TableDescriptor {
    let mut columns = vec![
        ColumnDescriptor::required("ID", DataType::Int),
        ColumnDescriptor::required("Symbol", DataType::nvarchar(5)),
        ColumnDescriptor::required("Name", DataType::nvarchar(200)),
        ColumnDescriptor::required("EnName", DataType::nvarchar(200)),
    ];
    audit_columns(&mut columns, "DeleteDate");
    TableDescriptor::new(MARKET, "ID", columns)
}

pub fn security_type_table() -> TableDescriptor {
    let mut columns = vec![
        ColumnDescriptor::required("ID", DataType::Int),
        ColumnDescriptor::required("Symbol", DataType::nvarchar(2)),
        ColumnDescriptor::required("Name", DataType::nvarchar(30)),
        ColumnDescriptor::optional("EnName", DataType::nvarchar(30)),
    ];
    audit_columns(&mut columns, "DeleteDate");
    TableDescriptor::new(SECURITY_TYPE, "ID", columns)
}

pub fn security_table() -> TableDescriptor {
    let mut columns = vec![
        ColumnDescriptor::required("ID", DataType::Int),
        ColumnDescriptor::required("Symbol", DataType::nvarchar(SYMBOL_MAX_LEN)),
        ColumnDescriptor::optional("Name", DataType::nvarchar(200)),
        ColumnDescriptor::optional("EnName", DataType::nvarchar(200)),
        ColumnDescriptor::optional("ListedShare", DataType::BigInt),
        ColumnDescriptor::optional("MarketCapitalization", DataType::BigInt),
        ColumnDescriptor::required("Market_ID", DataType::Int),
        ColumnDescriptor::optional("SecurityType_ID", DataType::Int),
    ];
    audit_columns(&mut columns, "DelistDate");
    TableDescriptor::new(SECURITY, "ID", columns)
        .with_foreign_key(ForeignKey::new("Market_ID", MARKET, "ID"))
        .with_foreign_key(ForeignKey::new("SecurityType_ID", SECURITY_TYPE, "ID"))
}

/// Snapshot table for one crawl pass: the entity columns, no foreign keys.
pub fn security_staging_table() -> TableDescriptor {
    security_table().renamed_without_keys(SECURITY_STAGING)
}

pub fn checkpoint_table() -> TableDescriptor {
    TableDescriptor::new(
        CRAWL_CHECKPOINT,
        "ID",
        vec![
            ColumnDescriptor::required("ID", DataType::Int),
            ColumnDescriptor::required("CurrentStartInterval", DataType::DateTime),
            ColumnDescriptor::required("CurrentSymbol", DataType::nvarchar(SYMBOL_MAX_LEN)),
            ColumnDescriptor::optional("UpdateDate", DataType::DateTime),
        ],
    )
}

/// Every table, referenced tables before the tables that reference them.
pub fn all_tables() -> Vec<TableDescriptor> {
    vec![
        market_table(),
        security_type_table(),
        security_table(),
        security_staging_table(),
        checkpoint_table(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_are_in_foreign_key_order() {
        let tables = all_tables();
        for (i, table) in tables.iter().enumerate() {
            for fk in &table.foreign_keys {
                let pos = tables
                    .iter()
                    .position(|t| t.name == fk.referenced_table)
                    .unwrap();
                assert!(pos < i, "{} created before {}", table.name, fk.referenced_table);
            }
        }
    }

    #[test]
    fn staging_mirrors_entity_columns_without_keys() {
        let staging = security_staging_table();
        assert_eq!(staging.columns, security_table().columns);
        assert!(staging.foreign_keys.is_empty());
    }

    #[test]
    fn every_table_is_well_formed() {
        for table in all_tables() {
            table.check_column_names().unwrap();
            assert!(table.key().is_some());
        }
    }
}
