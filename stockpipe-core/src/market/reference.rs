//! Canonical reference rows: the markets and security types the API reports.

use crate::schema::{MARKET, SECURITY_TYPE};
use crate::sql::{Record, SqlValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceRow {
    pub symbol: &'static str,
    pub name: &'static str,
    pub en_name: &'static str,
}

impl ReferenceRow {
    const fn new(symbol: &'static str, name: &'static str, en_name: &'static str) -> Self {
        Self {
            symbol,
            name,
            en_name,
        }
    }

    /// Insert record, stamped with the server clock.
    pub fn to_record(&self) -> Record {
        Record::new()
            .set("Symbol", self.symbol)
            .set("Name", self.name)
            .set("EnName", self.en_name)
            .set("CreateDate", SqlValue::raw("GETDATE()"))
    }
}

pub const MARKETS: [ReferenceRow; 5] = [
    ReferenceRow::new("HNX", "Sở Giao dịch Chứng khoán Hà Nội", "Hanoi Stock Exchange"),
    ReferenceRow::new(
        "HOSE",
        "Sở Giao dịch Chứng khoán Thành phố Hồ Chí Minh",
        "Ho Chi Minh City Stock Exchange",
    ),
    ReferenceRow::new(
        "UPCOM",
        "Thị trường giao dịch chứng khoán của công ty đại chúng chưa niêm yết",
        "Unlisted Public Company Market",
    ),
    ReferenceRow::new("DER", "Thị trường chứng khoán phái sinh", "Derivatives Market"),
    ReferenceRow::new("BOND", "Thị trường trái phiếu", "Bond Market"),
];

pub const SECURITY_TYPES: [ReferenceRow; 7] = [
    ReferenceRow::new("ST", "Cổ phiếu", "Stock"),
    ReferenceRow::new("CW", "Chứng quyền có bảo đảm", "Covered Warrant"),
    ReferenceRow::new("FU", "Hợp đồng tương lai", "Futures"),
    ReferenceRow::new("EF", "Chứng chỉ quỹ ETF", "ETF"),
    ReferenceRow::new("BO", "Trái phiếu", "Bond"),
    ReferenceRow::new("OF", "Quỹ mở", "Open-ended Fund"),
    ReferenceRow::new("MF", "Quỹ tương hỗ", "Mutual Fund"),
];

/// One reference table and its canonical rows.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceSet {
    pub table: &'static str,
    pub rows: &'static [ReferenceRow],
}

impl ReferenceSet {
    pub fn symbols(&self) -> impl Iterator<Item = &'static str> {
        self.rows.iter().map(|r| r.symbol)
    }

    pub fn records(&self) -> Vec<Record> {
        self.rows.iter().map(ReferenceRow::to_record).collect()
    }
}

/// Every reference set, in seeding order.
pub fn reference_sets() -> [ReferenceSet; 2] {
    [
        ReferenceSet {
            table: MARKET,
            rows: &MARKETS,
        },
        ReferenceSet {
            table: SECURITY_TYPE,
            rows: &SECURITY_TYPES,
        },
    ]
}
