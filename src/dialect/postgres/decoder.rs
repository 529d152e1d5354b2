//! `test_decoding` output decoder
//!
//! Parses lines produced by PostgreSQL's `test_decoding` output plugin:
//!
//! ```text
//! BEGIN 529
//! table public.t_order: INSERT: order_id[integer]:1 note[text]:'it''s'
//! table public.t_order: UPDATE: old-key: order_id[integer]:1 new-tuple: order_id[integer]:2
//! table public.t_order: DELETE: order_id[integer]:2
//! COMMIT 529
//! ```

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use std::collections::HashSet;

use crate::dialect::LogDecoder;
use crate::error::{Error, Result};
use crate::position::{Position, WalPosition};
use crate::record::{Column, Row, RowEvent, Value};

/// One row returned by `pg_logical_slot_peek_changes`
#[derive(Debug, Clone, PartialEq)]
pub struct WalEntry {
    pub lsn: WalPosition,
    pub xid: Option<u32>,
    pub data: String,
}

impl WalEntry {
    pub fn new(lsn: WalPosition, data: impl Into<String>) -> Self {
        Self {
            lsn,
            xid: None,
            data: data.into(),
        }
    }
}

/// Decoder for `test_decoding` change lines.
///
/// Only tables in the filter produce row events; an empty filter accepts
/// every table.
#[derive(Debug, Clone, Default)]
pub struct TestDecodingDecoder {
    tables: HashSet<String>,
}

impl TestDecodingDecoder {
    pub fn new(tables: HashSet<String>) -> Self {
        Self { tables }
    }

    fn accepts(&self, table: &str) -> bool {
        self.tables.is_empty() || self.tables.contains(table)
    }

    /// Decode a single line into one event
    pub fn decode_line(&self, line: &str, position: &Position) -> Result<RowEvent> {
        let placeholder = || RowEvent::Placeholder {
            position: position.clone(),
        };
        let Some(rest) = line.strip_prefix("table ") else {
            return Ok(placeholder());
        };

        let fail = |reason: String| Error::Decode {
            position: position.to_string(),
            reason,
        };

        let mut cursor = Cursor::new(rest);
        let qualified = cursor.qualified_name().map_err(&fail)?;
        cursor.expect(": ").map_err(&fail)?;
        let action = cursor.take_until(':');
        cursor.expect(":").map_err(&fail)?;

        let table = qualified.last().cloned().unwrap_or_default();
        if !self.accepts(&table) {
            tracing::trace!("Skipping change for unmigrated table {}", table);
            return Ok(placeholder());
        }

        match action {
            "INSERT" => {
                let tuple = parse_tuple(&mut cursor).map_err(&fail)?;
                let after = tuple.into_row(&fail)?;
                Ok(RowEvent::Write {
                    table,
                    after: after.ok_or_else(|| fail("INSERT without tuple data".into()))?,
                    position: position.clone(),
                })
            }
            "UPDATE" => {
                let tuple = parse_tuple(&mut cursor).map_err(&fail)?;
                let before = tuple.old_key_row(&fail)?;
                let after = tuple
                    .into_row(&fail)?
                    .ok_or_else(|| fail("UPDATE without new tuple".into()))?;
                Ok(RowEvent::Update {
                    table,
                    before,
                    after,
                    position: position.clone(),
                })
            }
            "DELETE" => {
                let tuple = parse_tuple(&mut cursor).map_err(&fail)?;
                let before = tuple.into_row(&fail)?.ok_or_else(|| {
                    fail(format!(
                        "DELETE on {} carries no key; set REPLICA IDENTITY",
                        table
                    ))
                })?;
                Ok(RowEvent::Delete {
                    table,
                    before,
                    position: position.clone(),
                })
            }
            _ => Ok(placeholder()),
        }
    }
}

impl LogDecoder for TestDecodingDecoder {
    type Entry = WalEntry;

    fn decode(&mut self, entry: WalEntry, position: &Position) -> Result<Vec<RowEvent>> {
        Ok(vec![self.decode_line(&entry.data, position)?])
    }
}

/// Raw column value before type conversion
#[derive(Debug, Clone, PartialEq)]
enum RawValue {
    Null,
    Unchanged,
    Text(String),
}

#[derive(Debug, Default)]
struct Tuple {
    old_key: Vec<(String, String, RawValue)>,
    new: Vec<(String, String, RawValue)>,
    no_data: bool,
}

impl Tuple {
    fn into_row(&self, fail: &impl Fn(String) -> Error) -> Result<Option<Row>> {
        if self.no_data {
            return Ok(None);
        }
        build_row(&self.new, fail).map(Some)
    }

    fn old_key_row(&self, fail: &impl Fn(String) -> Error) -> Result<Option<Row>> {
        if self.old_key.is_empty() {
            return Ok(None);
        }
        let mut row = build_row(&self.old_key, fail)?;
        for column in &mut row.columns {
            column.key = true;
        }
        Ok(Some(row))
    }
}

fn build_row(
    columns: &[(String, String, RawValue)],
    fail: &impl Fn(String) -> Error,
) -> Result<Row> {
    let mut row = Vec::with_capacity(columns.len());
    for (name, data_type, raw) in columns {
        let value = match raw {
            RawValue::Unchanged => continue,
            RawValue::Null => Value::Null,
            RawValue::Text(text) => convert(data_type, text).map_err(|reason| {
                fail(format!("column {} [{}]: {}", name, data_type, reason))
            })?,
        };
        row.push(Column::new(name.clone(), value, false));
    }
    Ok(Row::new(row))
}

fn parse_tuple(cursor: &mut Cursor<'_>) -> std::result::Result<Tuple, String> {
    let mut tuple = Tuple::default();
    let mut in_old_key = false;
    loop {
        cursor.skip_spaces();
        if cursor.is_empty() {
            break;
        }
        if cursor.eat("(no-tuple-data)") {
            tuple.no_data = true;
            continue;
        }
        if cursor.eat("old-key:") {
            in_old_key = true;
            continue;
        }
        if cursor.eat("new-tuple:") {
            in_old_key = false;
            continue;
        }

        let name = cursor.identifier('[')?;
        cursor.expect("[")?;
        let data_type = cursor.bracketed()?;
        cursor.expect(":")?;
        let value = cursor.value()?;
        let column = (name, data_type, value);
        if in_old_key {
            tuple.old_key.push(column);
        } else {
            tuple.new.push(column);
        }
    }
    Ok(tuple)
}

/// Drop type modifiers: `character varying(20)` becomes `character varying`
fn base_type(data_type: &str) -> String {
    let mut base = String::with_capacity(data_type.len());
    let mut depth = 0usize;
    for c in data_type.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => base.push(c),
            _ => {}
        }
    }
    base.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn convert(data_type: &str, text: &str) -> std::result::Result<Value, String> {
    let base = base_type(data_type);
    if base.ends_with("[]") {
        return Ok(Value::String(text.to_string()));
    }
    let value = match base.as_str() {
        "smallint" | "integer" | "bigint" | "oid" => Value::Int(
            text.parse()
                .map_err(|_| format!("invalid integer '{}'", text))?,
        ),
        "real" | "double precision" => Value::Float(parse_float(text)?),
        "numeric" => {
            if text != "NaN" && text.parse::<f64>().is_err() {
                return Err(format!("invalid numeric '{}'", text));
            }
            Value::Decimal(text.to_string())
        }
        "boolean" => match text {
            "true" | "t" => Value::Bool(true),
            "false" | "f" => Value::Bool(false),
            _ => return Err(format!("invalid boolean '{}'", text)),
        },
        "bytea" => {
            let hex_digits = text
                .strip_prefix("\\x")
                .ok_or_else(|| format!("bytea '{}' is not hex encoded", text))?;
            Value::Bytes(hex::decode(hex_digits).map_err(|e| e.to_string())?)
        }
        "date" if is_special_date(text) => Value::String(text.to_string()),
        "date" => Value::Date(
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .map_err(|e| format!("invalid date '{}': {}", text, e))?,
        ),
        "time without time zone" => {
            let time = NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
                .map_err(|e| format!("invalid time '{}': {}", text, e))?;
            Value::Time(time.format("%H:%M:%S%.f").to_string())
        }
        "timestamp without time zone" if is_special_date(text) => Value::String(text.to_string()),
        "timestamp without time zone" => Value::DateTime(
            NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                .map_err(|e| format!("invalid timestamp '{}': {}", text, e))?,
        ),
        "timestamp with time zone" if is_special_date(text) => Value::String(text.to_string()),
        "timestamp with time zone" => Value::Timestamp(
            DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
                .map_err(|e| format!("invalid timestamptz '{}': {}", text, e))?
                .with_timezone(&Utc),
        ),
        "json" | "jsonb" => Value::Json(
            serde_json::from_str(text).map_err(|e| format!("invalid json: {}", e))?,
        ),
        "uuid" => Value::Uuid(
            uuid::Uuid::parse_str(text).map_err(|e| format!("invalid uuid '{}': {}", text, e))?,
        ),
        _ => Value::String(text.to_string()),
    };
    Ok(value)
}

fn parse_float(text: &str) -> std::result::Result<f64, String> {
    match text {
        "NaN" => Ok(f64::NAN),
        "Infinity" => Ok(f64::INFINITY),
        "-Infinity" => Ok(f64::NEG_INFINITY),
        _ => text.parse().map_err(|_| format!("invalid float '{}'", text)),
    }
}

fn is_special_date(text: &str) -> bool {
    text == "infinity" || text == "-infinity" || text.ends_with(" BC")
}

/// Byte cursor over one output line
struct Cursor<'a> {
    s: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(s: &'a str) -> Self {
        Self { s, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.s[self.pos..]
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.s.len()
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn skip_spaces(&mut self) {
        while self.peek() == Some(' ') {
            self.pos += 1;
        }
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &str) -> std::result::Result<(), String> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(format!("expected '{}' at '{}'", token, self.rest()))
        }
    }

    fn take_until(&mut self, stop: char) -> &'a str {
        let rest = self.rest();
        let end = rest.find(stop).unwrap_or(rest.len());
        self.pos += end;
        &rest[..end]
    }

    /// Plain identifier ending before `stop` or `.`, or a double-quoted one
    fn identifier(&mut self, stop: char) -> std::result::Result<String, String> {
        if self.eat("\"") {
            let mut name = String::new();
            loop {
                let rest = self.rest();
                let end = rest
                    .find('"')
                    .ok_or_else(|| "unterminated quoted identifier".to_string())?;
                name.push_str(&rest[..end]);
                self.pos += end + 1;
                if self.eat("\"") {
                    name.push('"');
                } else {
                    return Ok(name);
                }
            }
        }
        let rest = self.rest();
        let end = rest
            .find(|c: char| c == stop || c == '.')
            .unwrap_or(rest.len());
        if end == 0 {
            return Err(format!("expected identifier at '{}'", rest));
        }
        self.pos += end;
        Ok(rest[..end].to_string())
    }

    fn qualified_name(&mut self) -> std::result::Result<Vec<String>, String> {
        let mut parts = vec![self.identifier(':')?];
        while self.eat(".") {
            parts.push(self.identifier(':')?);
        }
        Ok(parts)
    }

    /// Type name up to the matching `]`; array types nest brackets
    fn bracketed(&mut self) -> std::result::Result<String, String> {
        let rest = self.rest();
        let mut depth = 1usize;
        for (i, c) in rest.char_indices() {
            match c {
                '[' => depth += 1,
                ']' => {
                    depth -= 1;
                    if depth == 0 {
                        self.pos += i + 1;
                        return Ok(rest[..i].to_string());
                    }
                }
                _ => {}
            }
        }
        Err("unterminated type name".to_string())
    }

    fn value(&mut self) -> std::result::Result<RawValue, String> {
        if self.eat("'") {
            let mut text = String::new();
            loop {
                let rest = self.rest();
                let end = rest
                    .find('\'')
                    .ok_or_else(|| "unterminated quoted value".to_string())?;
                text.push_str(&rest[..end]);
                self.pos += end + 1;
                if self.eat("'") {
                    text.push('\'');
                } else {
                    return Ok(RawValue::Text(text));
                }
            }
        }
        let rest = self.rest();
        let end = rest.find(' ').unwrap_or(rest.len());
        let token = &rest[..end];
        self.pos += end;
        Ok(match token {
            "null" => RawValue::Null,
            "unchanged-toast-datum" => RawValue::Unchanged,
            _ => RawValue::Text(token.to_string()),
        })
    }
}
