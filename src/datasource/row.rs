//! Conversion from driver rows to [`Value`]s

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::mysql::MySqlRow;
use sqlx::postgres::PgRow;
use sqlx::{Row as _, TypeInfo, ValueRef};

use crate::error::{Error, Result};
use crate::record::{Column, Row, Value};

use super::TableMetadata;

/// PostgreSQL data types read with their native decoding; everything else
/// is selected as text
pub(crate) fn pg_native(data_type: &str) -> bool {
    matches!(
        data_type.to_ascii_lowercase().as_str(),
        "boolean"
            | "smallint"
            | "integer"
            | "bigint"
            | "real"
            | "double precision"
            | "bytea"
            | "uuid"
            | "date"
            | "time without time zone"
            | "timestamp without time zone"
            | "timestamp with time zone"
            | "json"
            | "jsonb"
            | "text"
            | "character varying"
            | "character"
            | "name"
    )
}

fn pg_textual_value(data_type: &str, text: String) -> Value {
    match data_type.to_ascii_lowercase().as_str() {
        "numeric" | "decimal" | "money" => Value::Decimal(text),
        _ => Value::String(text),
    }
}

fn decode_err(column: &str, e: sqlx::Error) -> Error {
    Error::Schema(format!("cannot read column {}: {}", column, e))
}

fn format_time(t: NaiveTime) -> String {
    t.format("%H:%M:%S%.f").to_string()
}

/// Convert a PostgreSQL row selected with [`super::SqlBuilder::select_list`]
pub fn from_pg_row(row: &PgRow, metadata: &TableMetadata) -> Result<Row> {
    let mut columns = Vec::with_capacity(metadata.columns.len());
    for (i, meta) in metadata.columns.iter().enumerate() {
        let raw = row.try_get_raw(i).map_err(|e| decode_err(&meta.name, e))?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let err = |e| decode_err(&meta.name, e);
            match meta.data_type.to_ascii_lowercase().as_str() {
                "boolean" => Value::Bool(row.try_get(i).map_err(err)?),
                "smallint" => Value::Int(row.try_get::<i16, _>(i).map_err(err)? as i64),
                "integer" => Value::Int(row.try_get::<i32, _>(i).map_err(err)? as i64),
                "bigint" => Value::Int(row.try_get(i).map_err(err)?),
                "real" => Value::Float(row.try_get::<f32, _>(i).map_err(err)? as f64),
                "double precision" => Value::Float(row.try_get(i).map_err(err)?),
                "bytea" => Value::Bytes(row.try_get(i).map_err(err)?),
                "uuid" => Value::Uuid(row.try_get(i).map_err(err)?),
                "date" => Value::Date(row.try_get::<NaiveDate, _>(i).map_err(err)?),
                "time without time zone" => {
                    Value::Time(format_time(row.try_get::<NaiveTime, _>(i).map_err(err)?))
                }
                "timestamp without time zone" => {
                    Value::DateTime(row.try_get::<NaiveDateTime, _>(i).map_err(err)?)
                }
                "timestamp with time zone" => {
                    Value::Timestamp(row.try_get::<DateTime<Utc>, _>(i).map_err(err)?)
                }
                "json" | "jsonb" => Value::Json(row.try_get(i).map_err(err)?),
                other => pg_textual_value(other, row.try_get::<String, _>(i).map_err(err)?),
            }
        };
        columns.push(Column::new(
            meta.name.clone(),
            value,
            metadata.is_key(&meta.name),
        ));
    }
    Ok(Row::new(columns))
}

/// Convert a MySQL row selected with [`super::SqlBuilder::select_list`]
pub fn from_mysql_row(row: &MySqlRow, metadata: &TableMetadata) -> Result<Row> {
    let mut columns = Vec::with_capacity(metadata.columns.len());
    for (i, meta) in metadata.columns.iter().enumerate() {
        let raw = row.try_get_raw(i).map_err(|e| decode_err(&meta.name, e))?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let driver_type = raw.type_info().name().to_ascii_uppercase();
            mysql_value(row, i, &meta.data_type, meta.unsigned, &driver_type)
                .map_err(|e| decode_err(&meta.name, e))?
        };
        columns.push(Column::new(
            meta.name.clone(),
            value,
            metadata.is_key(&meta.name),
        ));
    }
    Ok(Row::new(columns))
}

fn mysql_value(
    row: &MySqlRow,
    i: usize,
    data_type: &str,
    unsigned: bool,
    driver_type: &str,
) -> std::result::Result<Value, sqlx::Error> {
    let value = match data_type.to_ascii_lowercase().as_str() {
        "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "year" => {
            if unsigned {
                Value::UInt(row.try_get_unchecked::<u64, _>(i)?)
            } else {
                Value::Int(row.try_get_unchecked::<i64, _>(i)?)
            }
        }
        "float" => Value::Float(row.try_get_unchecked::<f32, _>(i)? as f64),
        "double" | "real" => Value::Float(row.try_get_unchecked::<f64, _>(i)?),
        "decimal" | "numeric" => Value::Decimal(row.try_get_unchecked::<String, _>(i)?),
        "date" => Value::Date(row.try_get::<NaiveDate, _>(i)?),
        "datetime" => Value::DateTime(row.try_get::<NaiveDateTime, _>(i)?),
        "timestamp" => Value::Timestamp(row.try_get::<DateTime<Utc>, _>(i)?),
        "time" => Value::Time(format_time(row.try_get::<NaiveTime, _>(i)?)),
        "json" => {
            let text = row.try_get_unchecked::<String, _>(i)?;
            match serde_json::from_str(&text) {
                Ok(json) => Value::Json(json),
                Err(_) => Value::String(text),
            }
        }
        "binary" | "varbinary" | "tinyblob" | "blob" | "mediumblob" | "longblob" | "bit"
        | "geometry" => Value::Bytes(row.try_get_unchecked::<Vec<u8>, _>(i)?),
        _ if driver_type.contains("BLOB") || driver_type.contains("BINARY") => {
            Value::Bytes(row.try_get_unchecked::<Vec<u8>, _>(i)?)
        }
        _ => Value::String(row.try_get_unchecked::<String, _>(i)?),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pg_native_types() {
        assert!(pg_native("integer"));
        assert!(pg_native("CHARACTER VARYING"));
        assert!(!pg_native("numeric"));
        assert!(!pg_native("interval"));
        assert!(!pg_native("ARRAY"));
    }

    #[test]
    fn test_pg_textual_value() {
        assert_eq!(
            pg_textual_value("numeric", "1.50".into()),
            Value::Decimal("1.50".into())
        );
        assert_eq!(
            pg_textual_value("interval", "1 day".into()),
            Value::String("1 day".into())
        );
    }
}
