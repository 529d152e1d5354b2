//! Data Source Module
//!
//! Connection pools for source and target databases, table metadata
//! loading, and statement execution for both supported dialects.

mod row;
mod sql;

pub use sql::SqlBuilder;

use futures::TryStreamExt;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{MySqlPool, PgPool, Row as _};
use std::str::FromStr;
use std::time::Duration;

use crate::config::{Dialect, RdbmsConfiguration};
use crate::error::{Error, Result};
use crate::record::{Row, Value};

/// Column information
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMetadata {
    pub name: String,
    /// Lower-case `information_schema` data type
    pub data_type: String,
    pub unsigned: bool,
    pub nullable: bool,
    /// Labels of an ENUM or SET column in declaration order
    pub enum_values: Vec<String>,
}

impl ColumnMetadata {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into().to_ascii_lowercase(),
            unsigned: false,
            nullable: true,
            enum_values: Vec::new(),
        }
    }

    /// Whether the column holds a signed or unsigned integer
    pub fn is_integer(&self) -> bool {
        matches!(
            self.data_type.as_str(),
            "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint"
        )
    }
}

/// Table structure needed to read and write rows
#[derive(Debug, Clone, PartialEq)]
pub struct TableMetadata {
    /// Table name as configured, possibly schema-qualified
    pub name: String,
    pub columns: Vec<ColumnMetadata>,
    pub primary_keys: Vec<String>,
}

impl TableMetadata {
    pub fn is_key(&self, column: &str) -> bool {
        self.primary_keys.iter().any(|k| k.eq_ignore_ascii_case(column))
    }

    pub fn column(&self, name: &str) -> Option<&ColumnMetadata> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// The single integer primary key, when the table has one
    pub fn integer_key(&self) -> Option<&ColumnMetadata> {
        match self.primary_keys.as_slice() {
            [key] => self.column(key).filter(|c| c.is_integer()),
            _ => None,
        }
    }

    /// Key values of a row in primary-key order
    pub fn key_values(&self, row: &Row) -> Vec<Value> {
        self.primary_keys
            .iter()
            .map(|k| row.get(k).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

/// Labels from a MySQL `enum('a','b')` or `set('a','b')` column type
fn parse_enum_values(column_type: &str) -> Vec<String> {
    let lower = column_type.to_ascii_lowercase();
    if !(lower.starts_with("enum(") || lower.starts_with("set(")) {
        return Vec::new();
    }
    let Some(start) = column_type.find('(') else {
        return Vec::new();
    };
    let body = column_type[start + 1..].trim_end_matches(')');

    let mut values = Vec::new();
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\'' {
            continue;
        }
        let mut label = String::new();
        while let Some(c) = chars.next() {
            match c {
                '\'' if chars.peek() == Some(&'\'') => {
                    chars.next();
                    label.push('\'');
                }
                '\'' => break,
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        label.push(escaped);
                    }
                }
                other => label.push(other),
            }
        }
        values.push(label);
    }
    values
}

fn split_table(table: &str) -> (Option<&str>, &str) {
    match table.split_once('.') {
        Some((schema, name)) => (Some(schema), name),
        None => (None, table),
    }
}

/// Connection pool for one database
#[derive(Clone)]
pub enum DataSource {
    MySql(MySqlPool),
    Postgres(PgPool),
}

impl std::fmt::Debug for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DataSource({})", self.dialect())
    }
}

impl DataSource {
    /// Open a pool for a configured data source
    pub async fn connect(config: &RdbmsConfiguration, max_connections: u32) -> Result<Self> {
        let url = config.connection_url()?;
        let acquire_timeout = Duration::from_secs(30);

        let source = match config.dialect()? {
            Dialect::MySql => {
                let mut options = MySqlConnectOptions::from_str(&url)?;
                if let Some(user) = &config.username {
                    options = options.username(user);
                }
                if let Some(password) = &config.password {
                    options = options.password(password);
                }
                let pool = MySqlPoolOptions::new()
                    .max_connections(max_connections)
                    .acquire_timeout(acquire_timeout)
                    .connect_with(options)
                    .await
                    .map_err(|e| connect_error(config, e))?;
                DataSource::MySql(pool)
            }
            Dialect::PostgreSql => {
                let mut options = PgConnectOptions::from_str(&url)?;
                if let Some(user) = &config.username {
                    options = options.username(user);
                }
                if let Some(password) = &config.password {
                    options = options.password(password);
                }
                let pool = PgPoolOptions::new()
                    .max_connections(max_connections)
                    .acquire_timeout(acquire_timeout)
                    .connect_with(options)
                    .await
                    .map_err(|e| connect_error(config, e))?;
                DataSource::Postgres(pool)
            }
        };

        tracing::debug!("Connected to {} at {}", source.dialect(), config.display_address());
        Ok(source)
    }

    pub fn dialect(&self) -> Dialect {
        match self {
            DataSource::MySql(_) => Dialect::MySql,
            DataSource::Postgres(_) => Dialect::PostgreSql,
        }
    }

    pub fn sql(&self) -> SqlBuilder {
        SqlBuilder::new(self.dialect())
    }

    /// Check if connection is healthy
    pub async fn health_check(&self) -> Result<bool> {
        let one: i64 = match self {
            DataSource::MySql(pool) => sqlx::query_scalar("SELECT CAST(1 AS SIGNED)").fetch_one(pool).await?,
            DataSource::Postgres(pool) => sqlx::query_scalar("SELECT 1::int8").fetch_one(pool).await?,
        };
        Ok(one == 1)
    }

    /// Load columns and primary key of a table
    pub async fn table_metadata(&self, table: &str) -> Result<TableMetadata> {
        let (schema, name) = split_table(table);
        let (columns, primary_keys) = match self {
            DataSource::MySql(pool) => {
                let rows = sqlx::query(
                    "SELECT CAST(COLUMN_NAME AS CHAR) AS column_name, \
                     CAST(DATA_TYPE AS CHAR) AS data_type, \
                     CAST(COLUMN_TYPE AS CHAR) AS column_type, \
                     CAST(IS_NULLABLE AS CHAR) AS is_nullable \
                     FROM information_schema.COLUMNS \
                     WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_NAME = ? \
                     ORDER BY ORDINAL_POSITION",
                )
                .bind(schema)
                .bind(name)
                .fetch_all(pool)
                .await?;

                let mut columns = Vec::with_capacity(rows.len());
                for row in rows {
                    let column_type: String = row.try_get("column_type")?;
                    let is_nullable: String = row.try_get("is_nullable")?;
                    let mut column = ColumnMetadata::new(
                        row.try_get::<String, _>("column_name")?,
                        row.try_get::<String, _>("data_type")?,
                    );
                    column.unsigned = column_type.to_ascii_lowercase().contains("unsigned");
                    column.nullable = is_nullable == "YES";
                    column.enum_values = parse_enum_values(&column_type);
                    columns.push(column);
                }

                let keys: Vec<String> = sqlx::query_scalar(
                    "SELECT CAST(COLUMN_NAME AS CHAR) FROM information_schema.KEY_COLUMN_USAGE \
                     WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_NAME = ? \
                     AND CONSTRAINT_NAME = 'PRIMARY' ORDER BY ORDINAL_POSITION",
                )
                .bind(schema)
                .bind(name)
                .fetch_all(pool)
                .await?;
                (columns, keys)
            }
            DataSource::Postgres(pool) => {
                let rows = sqlx::query(
                    "SELECT column_name::text AS column_name, data_type::text AS data_type, \
                     is_nullable::text AS is_nullable \
                     FROM information_schema.columns \
                     WHERE table_schema = COALESCE($1, current_schema()) AND table_name = $2 \
                     ORDER BY ordinal_position",
                )
                .bind(schema)
                .bind(name)
                .fetch_all(pool)
                .await?;

                let mut columns = Vec::with_capacity(rows.len());
                for row in rows {
                    let is_nullable: String = row.try_get("is_nullable")?;
                    let mut column = ColumnMetadata::new(
                        row.try_get::<String, _>("column_name")?,
                        row.try_get::<String, _>("data_type")?,
                    );
                    column.nullable = is_nullable == "YES";
                    columns.push(column);
                }

                let keys: Vec<String> = sqlx::query_scalar(
                    "SELECT kcu.column_name::text FROM information_schema.table_constraints tc \
                     JOIN information_schema.key_column_usage kcu \
                       ON tc.constraint_name = kcu.constraint_name \
                      AND tc.table_schema = kcu.table_schema \
                      AND tc.table_name = kcu.table_name \
                     WHERE tc.constraint_type = 'PRIMARY KEY' \
                       AND tc.table_schema = COALESCE($1, current_schema()) AND tc.table_name = $2 \
                     ORDER BY kcu.ordinal_position",
                )
                .bind(schema)
                .bind(name)
                .fetch_all(pool)
                .await?;
                (columns, keys)
            }
        };

        if columns.is_empty() {
            return Err(Error::Schema(format!("table {} not found", table)));
        }
        if primary_keys.is_empty() {
            return Err(Error::Schema(format!("table {} has no primary key", table)));
        }

        Ok(TableMetadata {
            name: table.to_string(),
            columns,
            primary_keys,
        })
    }

    /// Execute a single statement
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        tracing::trace!("Executing: {}", preview(sql));
        let affected = match self {
            DataSource::MySql(pool) => sqlx::query(sql).execute(pool).await?.rows_affected(),
            DataSource::Postgres(pool) => sqlx::query(sql).execute(pool).await?.rows_affected(),
        };
        Ok(affected)
    }

    /// Execute statements atomically
    pub async fn execute_transaction(&self, statements: &[String]) -> Result<()> {
        match self {
            DataSource::MySql(pool) => {
                let mut tx = pool.begin().await?;
                for stmt in statements {
                    tracing::trace!("Executing: {}", preview(stmt));
                    sqlx::query(stmt).execute(&mut *tx).await?;
                }
                tx.commit().await?;
            }
            DataSource::Postgres(pool) => {
                let mut tx = pool.begin().await?;
                for stmt in statements {
                    tracing::trace!("Executing: {}", preview(stmt));
                    sqlx::query(stmt).execute(&mut *tx).await?;
                }
                tx.commit().await?;
            }
        }
        Ok(())
    }

    /// Run a query returning table rows
    pub async fn fetch_rows(&self, sql: &str, metadata: &TableMetadata) -> Result<Vec<Row>> {
        tracing::trace!("Querying: {}", preview(sql));
        let mut rows = Vec::new();
        match self {
            DataSource::MySql(pool) => {
                let mut stream = sqlx::query(sql).fetch(pool);
                while let Some(row) = stream.try_next().await? {
                    rows.push(row::from_mysql_row(&row, metadata)?);
                }
            }
            DataSource::Postgres(pool) => {
                let mut stream = sqlx::query(sql).fetch(pool);
                while let Some(row) = stream.try_next().await? {
                    rows.push(row::from_pg_row(&row, metadata)?);
                }
            }
        }
        Ok(rows)
    }

    /// Run a query returning one BIGINT
    pub async fn fetch_i64(&self, sql: &str) -> Result<i64> {
        let value = match self {
            DataSource::MySql(pool) => sqlx::query_scalar(sql).fetch_one(pool).await?,
            DataSource::Postgres(pool) => sqlx::query_scalar(sql).fetch_one(pool).await?,
        };
        Ok(value)
    }

    /// Run a query returning two nullable BIGINTs
    pub async fn fetch_i64_pair(&self, sql: &str) -> Result<(Option<i64>, Option<i64>)> {
        let pair = match self {
            DataSource::MySql(pool) => sqlx::query_as(sql).fetch_one(pool).await?,
            DataSource::Postgres(pool) => sqlx::query_as(sql).fetch_one(pool).await?,
        };
        Ok(pair)
    }

    /// Row count under an optional filter
    pub async fn count_rows(&self, table: &str, condition: Option<&str>) -> Result<u64> {
        let count = self.fetch_i64(&self.sql().count(table, condition)).await?;
        Ok(count.max(0) as u64)
    }

    /// Close the connection pool
    pub async fn close(&self) {
        match self {
            DataSource::MySql(pool) => pool.close().await,
            DataSource::Postgres(pool) => pool.close().await,
        }
    }
}

/// First 100 characters of a statement, for logging
fn preview(sql: &str) -> &str {
    match sql.char_indices().nth(100) {
        Some((end, _)) => &sql[..end],
        None => sql,
    }
}

fn connect_error(config: &RdbmsConfiguration, e: sqlx::Error) -> Error {
    match e {
        sqlx::Error::Io(io) => Error::Connection {
            address: config.display_address(),
            reason: io.to_string(),
        },
        sqlx::Error::PoolTimedOut => Error::Connection {
            address: config.display_address(),
            reason: "timed out".to_string(),
        },
        other => Error::Database(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Column;

    fn metadata() -> TableMetadata {
        let mut id = ColumnMetadata::new("order_id", "BIGINT");
        id.nullable = false;
        TableMetadata {
            name: "t_order".into(),
            columns: vec![id, ColumnMetadata::new("user_id", "int")],
            primary_keys: vec!["order_id".into()],
        }
    }

    #[test]
    fn test_integer_key_detection() {
        let meta = metadata();
        assert_eq!(meta.integer_key().map(|c| c.name.as_str()), Some("order_id"));
        assert!(meta.is_key("ORDER_ID"));

        let mut composite = meta.clone();
        composite.primary_keys.push("user_id".into());
        assert!(composite.integer_key().is_none());

        let mut text_key = meta;
        text_key.columns[0].data_type = "varchar".into();
        assert!(text_key.integer_key().is_none());
    }

    #[test]
    fn test_key_values_follow_key_order() {
        let mut meta = metadata();
        meta.primary_keys = vec!["user_id".into(), "order_id".into()];
        let row = Row::new(vec![
            Column::new("order_id", Value::Int(1), true),
            Column::new("user_id", Value::Int(2), true),
        ]);
        assert_eq!(meta.key_values(&row), vec![Value::Int(2), Value::Int(1)]);
    }

    #[test]
    fn test_parse_enum_values() {
        assert_eq!(parse_enum_values("enum('new','paid','it''s')"), vec!["new", "paid", "it's"]);
        assert_eq!(parse_enum_values("set('a,b','c')"), vec!["a,b", "c"]);
        assert!(parse_enum_values("varchar(32)").is_empty());
    }

    #[test]
    fn test_split_table() {
        assert_eq!(split_table("public.t_order"), (Some("public"), "t_order"));
        assert_eq!(split_table("t_order"), (None, "t_order"));
    }
}
