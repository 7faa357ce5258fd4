//! The connection seam between statement text and a SQL Server session.
//!
//! [`TiberiusConnection`] drives the async tiberius client from a private
//! current-thread runtime, so callers stay blocking. The session closes when
//! the connection is dropped.

use super::{Row, StoreError};
use crate::sql::{SqlValue, Statement};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tiberius::{AuthMethod, Client, ColumnData, Config, FromSql, Query};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info};

/// Executes statements on one session.
pub trait Connection {
    /// DML/DDL with bound parameters; returns rows affected.
    fn execute(&mut self, statement: &Statement) -> Result<u64, StoreError>;

    /// Statement returning rows.
    fn query(&mut self, statement: &Statement) -> Result<Vec<Row>, StoreError>;

    /// Session-level batch (`USE`, `CREATE DATABASE`, transaction control)
    /// whose effect must outlive the statement.
    fn batch(&mut self, statement: &Statement) -> Result<(), StoreError>;
}

/// Where and how to reach SQL Server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlServerSettings {
    pub server: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub login: String,
    pub password: String,
    /// Accept the server certificate without validation (self-signed dev servers).
    #[serde(default)]
    pub trust_cert: bool,
}

fn default_port() -> u16 {
    1433
}

impl Default for SqlServerSettings {
    fn default() -> Self {
        Self {
            server: "localhost".into(),
            port: default_port(),
            login: "sa".into(),
            password: String::new(),
            trust_cert: true,
        }
    }
}

/// A blocking SQL Server session over tiberius.
pub struct TiberiusConnection {
    runtime: Runtime,
    client: Client<Compat<TcpStream>>,
}

impl TiberiusConnection {
    /// Open a session. Every failure here is a connectivity error.
    pub fn connect(settings: &SqlServerSettings) -> Result<Self, StoreError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| StoreError::Connection(format!("runtime: {e}")))?;

        let mut config = Config::new();
        config.host(&settings.server);
        config.port(settings.port);
        config.authentication(AuthMethod::sql_server(&settings.login, &settings.password));
        if settings.trust_cert {
            config.trust_cert();
        }

        let client = runtime.block_on(async {
            let tcp = TcpStream::connect(config.get_addr())
                .await
                .map_err(|e| StoreError::Connection(e.to_string()))?;
            tcp.set_nodelay(true)
                .map_err(|e| StoreError::Connection(e.to_string()))?;
            Client::connect(config, tcp.compat_write())
                .await
                .map_err(|e| StoreError::Connection(e.to_string()))
        })?;

        info!(server = %settings.server, port = settings.port, "connected to SQL Server");
        Ok(Self { runtime, client })
    }

    fn prepare(statement: &Statement) -> Query<'static> {
        let mut query = Query::new(statement.sql.clone());
        for value in &statement.params {
            match value {
                SqlValue::Int(v) => query.bind(*v),
                SqlValue::BigInt(v) => query.bind(*v),
                SqlValue::Text(s) => query.bind(s.clone()),
                SqlValue::DateTime(dt) => query.bind(*dt),
                // The builder never binds these; keep placeholder numbering intact anyway.
                SqlValue::Null => query.bind(Option::<i32>::None),
                SqlValue::Raw(s) => query.bind(s.clone()),
            }
        }
        query
    }
}

fn execution_error(statement: &Statement, e: tiberius::error::Error) -> StoreError {
    match e {
        tiberius::error::Error::Io { .. } => StoreError::Connection(e.to_string()),
        other => StoreError::Execution {
            statement: statement.render(),
            detail: other.to_string(),
        },
    }
}

fn convert_column(data: &ColumnData<'static>) -> Result<SqlValue, tiberius::error::Error> {
    let value = match data {
        ColumnData::U8(v) => v.map(|x| SqlValue::Int(i32::from(x))),
        ColumnData::I16(v) => v.map(|x| SqlValue::Int(i32::from(x))),
        ColumnData::I32(v) => v.map(SqlValue::Int),
        ColumnData::I64(v) => v.map(SqlValue::BigInt),
        ColumnData::Bit(v) => v.map(|b| SqlValue::Int(i32::from(b))),
        ColumnData::F32(v) => v.map(|x| SqlValue::Raw(x.to_string())),
        ColumnData::F64(v) => v.map(|x| SqlValue::Raw(x.to_string())),
        ColumnData::String(v) => v.as_ref().map(|s| SqlValue::Text(s.to_string())),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            NaiveDateTime::from_sql(data)?.map(SqlValue::DateTime)
        }
        other => Some(SqlValue::Raw(format!("{other:?}"))),
    };
    Ok(value.unwrap_or(SqlValue::Null))
}

fn convert_row(row: tiberius::Row) -> Result<Row, tiberius::error::Error> {
    let columns: Vec<String> = row.columns().iter().map(|c| c.name().to_string()).collect();
    let values = row
        .into_iter()
        .map(|data| convert_column(&data))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Row::new(columns, values))
}

impl Connection for TiberiusConnection {
    fn execute(&mut self, statement: &Statement) -> Result<u64, StoreError> {
        debug!(sql = %statement.render(), "execute");
        let query = Self::prepare(statement);
        let client = &mut self.client;
        let result = self
            .runtime
            .block_on(async { query.execute(client).await })
            .map_err(|e| execution_error(statement, e))?;
        Ok(result.rows_affected().iter().sum())
    }

    fn query(&mut self, statement: &Statement) -> Result<Vec<Row>, StoreError> {
        debug!(sql = %statement.render(), "query");
        let query = Self::prepare(statement);
        let client = &mut self.client;
        let rows = self
            .runtime
            .block_on(async { query.query(client).await?.into_first_result().await })
            .map_err(|e| execution_error(statement, e))?;
        rows.into_iter()
            .map(convert_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| execution_error(statement, e))
    }

    fn batch(&mut self, statement: &Statement) -> Result<(), StoreError> {
        let sql = statement.render();
        debug!(sql = %sql, "batch");
        let client = &mut self.client;
        self.runtime
            .block_on(async { client.simple_query(sql.as_str()).await?.into_results().await })
            .map_err(|e| execution_error(statement, e))?;
        Ok(())
    }
}
