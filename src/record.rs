//! Row Event Types
//!
//! Defines the decoded units of change that flow from readers through the
//! channel to importers.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::position::Position;

/// SQL Value representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    /// Exact numeric kept in its textual form
    Decimal(String),
    String(String),
    Bytes(Vec<u8>),
    Uuid(uuid::Uuid),
    Date(chrono::NaiveDate),
    /// Time of day or MySQL duration, e.g. `-838:59:59`
    Time(String),
    DateTime(chrono::NaiveDateTime),
    Timestamp(chrono::DateTime<chrono::Utc>),
    Json(serde_json::Value),
}

impl Value {
    /// Check if value is NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer view used for key-range splitting and keyset paging
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::UInt(u) => i64::try_from(*u).ok(),
            Value::Decimal(d) => d.parse().ok(),
            _ => None,
        }
    }

    /// Dialect-neutral text used by content digests.
    ///
    /// Two values that are equal after migration between dialects render
    /// identically here, so `Bool(true)` and `Int(1)` both become `1`.
    pub fn canonical(&self) -> String {
        match self {
            Value::Null => "\\N".to_string(),
            Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            Value::Int(i) => i.to_string(),
            Value::UInt(u) => u.to_string(),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    format!("{}", *f as i64)
                } else {
                    f.to_string()
                }
            }
            Value::Decimal(d) => normalize_decimal(d),
            Value::String(s) => s.clone(),
            Value::Bytes(b) => format!("\\x{}", hex::encode(b)),
            Value::Uuid(u) => u.to_string(),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::Time(t) => t.clone(),
            Value::DateTime(t) => t.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
            Value::Timestamp(t) => t.naive_utc().format("%Y-%m-%d %H:%M:%S%.f").to_string(),
            Value::Json(j) => j.to_string(),
        }
    }
}

fn normalize_decimal(d: &str) -> String {
    if !d.contains('.') {
        return d.to_string();
    }
    let trimmed = d.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() || trimmed == "-" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            other => f.write_str(&other.canonical()),
        }
    }
}

/// One column of a decoded row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub value: Value,
    /// Part of the primary key
    pub key: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, value: Value, key: bool) -> Self {
        Self {
            name: name.into(),
            value,
            key,
        }
    }
}

/// Ordered set of columns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub columns: Vec<Column>,
}

impl Row {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .map(|c| &c.value)
    }

    /// Primary key columns in declaration order
    pub fn key_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.key)
    }

    /// Mark the named columns as key columns
    pub fn mark_keys(&mut self, keys: &[String]) {
        for column in &mut self.columns {
            column.key = keys.iter().any(|k| k.eq_ignore_ascii_case(&column.name));
        }
    }

    /// Key values, used to detect primary-key changes in updates
    pub fn key_values(&self) -> Vec<&Value> {
        self.key_columns().map(|c| &c.value).collect()
    }
}

/// Decoded unit of change or control signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RowEvent {
    /// Row inserted at the source, or copied by an inventory scan
    Write {
        table: String,
        after: Row,
        position: Position,
    },

    /// Row updated at the source; `before` holds the old key when known
    Update {
        table: String,
        before: Option<Row>,
        after: Row,
        position: Position,
    },

    /// Row deleted at the source; `before` holds at least the key
    Delete {
        table: String,
        before: Row,
        position: Position,
    },

    /// Log entry that carries no row data but still advances position
    Placeholder { position: Position },

    /// End of stream, broadcast to every partition
    Finished { position: Option<Position> },
}

impl RowEvent {
    pub fn table(&self) -> Option<&str> {
        match self {
            RowEvent::Write { table, .. }
            | RowEvent::Update { table, .. }
            | RowEvent::Delete { table, .. } => Some(table),
            RowEvent::Placeholder { .. } | RowEvent::Finished { .. } => None,
        }
    }

    pub fn position(&self) -> Option<&Position> {
        match self {
            RowEvent::Write { position, .. }
            | RowEvent::Update { position, .. }
            | RowEvent::Delete { position, .. }
            | RowEvent::Placeholder { position } => Some(position),
            RowEvent::Finished { position } => position.as_ref(),
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, RowEvent::Finished { .. })
    }

    /// Whether applying this event writes to the target
    pub fn is_data(&self) -> bool {
        self.table().is_some()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RowEvent::Write { .. } => "WRITE",
            RowEvent::Update { .. } => "UPDATE",
            RowEvent::Delete { .. } => "DELETE",
            RowEvent::Placeholder { .. } => "PLACEHOLDER",
            RowEvent::Finished { .. } => "FINISHED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::WalPosition;

    #[test]
    fn test_canonical_crosses_types() {
        assert_eq!(Value::Bool(true).canonical(), Value::Int(1).canonical());
        assert_eq!(Value::Decimal("10.500".into()).canonical(), "10.5");
        assert_eq!(Value::Decimal("3.000".into()).canonical(), "3");
        assert_eq!(Value::Float(2.0).canonical(), "2");
        assert_eq!(Value::Bytes(vec![0xde, 0xad]).canonical(), "\\xdead");
        assert_ne!(Value::Null.canonical(), Value::String("NULL".into()).canonical());
    }

    #[test]
    fn test_row_keys() {
        let mut row = Row::new(vec![
            Column::new("order_id", Value::Int(1), false),
            Column::new("user_id", Value::Int(10), false),
        ]);
        row.mark_keys(&["ORDER_ID".to_string()]);
        let keys: Vec<_> = row.key_columns().map(|c| c.name.as_str()).collect();
        assert_eq!(keys, vec!["order_id"]);
        assert_eq!(row.get("user_id"), Some(&Value::Int(10)));
        assert_eq!(row.key_values(), vec![&Value::Int(1)]);
    }

    #[test]
    fn test_event_accessors() {
        let position = Position::Wal(WalPosition(0x14EFDB8));
        let event = RowEvent::Placeholder {
            position: position.clone(),
        };
        assert_eq!(event.position(), Some(&position));
        assert!(event.table().is_none());
        assert!(!event.is_data());

        let finished = RowEvent::Finished { position: None };
        assert!(finished.is_finished());
        assert_eq!(finished.kind(), "FINISHED");
    }
}
