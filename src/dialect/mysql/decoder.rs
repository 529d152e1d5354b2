//! Row image decoding
//!
//! Turns parsed binlog events into row events. Table map events are cached
//! by table id; the row images that follow are decoded against the cached
//! column types and the table's metadata loaded from the source.

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use chrono::{DateTime, NaiveDate};
use std::collections::{HashMap, HashSet};
use std::io::{self, Cursor, Read};

use crate::datasource::{ColumnMetadata, TableMetadata};
use crate::dialect::LogDecoder;
use crate::error::{Error, Result};
use crate::position::{BinlogPosition, Position};
use crate::record::{Column, Row, RowEvent, Value};

use super::event::{column_type, BinlogEvent, EventHeader, RowsEvent, RowsKind, TableMapEvent};

/// One event read from the dump stream
#[derive(Debug, Clone)]
pub struct BinlogEntry {
    pub header: EventHeader,
    pub event: BinlogEvent,
}

/// Decodes binlog events for a set of tables.
///
/// Row events carry the position of the event that opened their transaction
/// (its GTID or `BEGIN`), so a restart from any emitted position replays the
/// whole transaction, table maps included. Commits become placeholders at
/// the offset just past them.
#[derive(Debug, Default)]
pub struct BinlogDecoder {
    tables: HashSet<String>,
    table_maps: HashMap<u64, TableMapEvent>,
    metadata: HashMap<String, TableMetadata>,
    transaction: Option<Position>,
}

impl BinlogDecoder {
    pub fn new(tables: HashSet<String>) -> Self {
        Self {
            tables,
            ..Default::default()
        }
    }

    fn accepts(&self, table: &str) -> bool {
        self.tables.is_empty() || self.tables.contains(table)
    }

    /// Whether a mapped table is migrated but has no metadata loaded yet
    pub fn needs_metadata(&self, map: &TableMapEvent) -> bool {
        self.accepts(&map.table) && !self.metadata.contains_key(&map.table)
    }

    pub fn register_metadata(&mut self, table: impl Into<String>, metadata: TableMetadata) {
        self.metadata.insert(table.into(), metadata);
    }

    /// Drop metadata so it is reloaded at the next table map, after DDL
    pub fn invalidate_metadata(&mut self, table: &str) {
        self.metadata.remove(table);
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Forget stream state before reading from a new connection
    pub fn reset(&mut self) {
        self.table_maps.clear();
        self.transaction = None;
    }

    fn anchor(&self, position: &Position) -> Position {
        self.transaction.clone().unwrap_or_else(|| position.clone())
    }

    fn end_of(&mut self, header: &EventHeader, position: &Position) -> Result<RowEvent> {
        self.transaction = None;
        let file = position
            .as_binlog()
            .map(|p| p.file_name.clone())
            .ok_or_else(|| Error::Position(position.to_string()))?;
        Ok(RowEvent::Placeholder {
            position: Position::Binlog(BinlogPosition::new(file, header.next_position as u64)),
        })
    }

    fn decode_rows(&self, rows: RowsEvent, position: &Position) -> Result<Vec<RowEvent>> {
        let fail = |reason: String| Error::Decode {
            position: position.to_string(),
            reason,
        };

        let map = self
            .table_maps
            .get(&rows.table_id)
            .ok_or_else(|| fail(format!("rows for unmapped table id {}", rows.table_id)))?;
        if !self.accepts(&map.table) {
            return Ok(Vec::new());
        }
        let metadata = self
            .metadata
            .get(&map.table)
            .ok_or_else(|| fail(format!("no metadata loaded for {}", map.table)))?;
        if metadata.columns.len() != map.column_count() || rows.column_count != map.column_count()
        {
            return Err(fail(format!(
                "{} has {} columns in the binlog but {} in the source schema",
                map.table,
                map.column_count(),
                metadata.columns.len()
            )));
        }

        let anchor = self.anchor(position);
        let table = map.table.clone();
        let mut cursor = Cursor::new(rows.rows.as_slice());
        let mut events = Vec::new();

        while (cursor.position() as usize) < rows.rows.len() {
            let first = read_row(&mut cursor, map, metadata, &rows.present)
                .map_err(|e| fail(format!("{}: {}", table, e)))?;
            let event = match rows.kind {
                RowsKind::Write => RowEvent::Write {
                    table: table.clone(),
                    after: first,
                    position: anchor.clone(),
                },
                RowsKind::Delete => RowEvent::Delete {
                    table: table.clone(),
                    before: first,
                    position: anchor.clone(),
                },
                RowsKind::Update => {
                    let present = rows.present_after.as_deref().unwrap_or(&rows.present);
                    let after = read_row(&mut cursor, map, metadata, present)
                        .map_err(|e| fail(format!("{}: {}", table, e)))?;
                    RowEvent::Update {
                        table: table.clone(),
                        before: Some(first),
                        after,
                        position: anchor.clone(),
                    }
                }
            };
            events.push(event);
        }
        Ok(events)
    }
}

impl LogDecoder for BinlogDecoder {
    type Entry = BinlogEntry;

    /// `position` is the start offset of the entry in the current file
    fn decode(&mut self, entry: BinlogEntry, position: &Position) -> Result<Vec<RowEvent>> {
        let BinlogEntry { header, event } = entry;
        match event {
            BinlogEvent::TableMap(map) => {
                self.table_maps.insert(map.table_id, map);
                Ok(Vec::new())
            }
            BinlogEvent::Rows(rows) => self.decode_rows(rows, position),
            BinlogEvent::Gtid => {
                self.transaction = Some(position.clone());
                Ok(Vec::new())
            }
            BinlogEvent::Query { query, .. } => {
                let statement = query.trim().to_ascii_uppercase();
                if statement == "BEGIN" || statement.starts_with("XA START") {
                    if self.transaction.is_none() {
                        self.transaction = Some(position.clone());
                    }
                    Ok(Vec::new())
                } else if statement.starts_with("SAVEPOINT")
                    || statement.starts_with("ROLLBACK TO")
                    || statement.starts_with("XA END")
                {
                    Ok(Vec::new())
                } else {
                    // COMMIT, ROLLBACK or a DDL statement, which commits implicitly
                    Ok(vec![self.end_of(&header, position)?])
                }
            }
            BinlogEvent::Xid { .. } => Ok(vec![self.end_of(&header, position)?]),
            BinlogEvent::Rotate {
                next_file,
                position: offset,
            } => {
                self.transaction = None;
                Ok(vec![RowEvent::Placeholder {
                    position: Position::Binlog(BinlogPosition::new(next_file, offset)),
                }])
            }
            BinlogEvent::FormatDescription { .. }
            | BinlogEvent::Heartbeat
            | BinlogEvent::Ignorable { .. } => Ok(Vec::new()),
            BinlogEvent::Unknown { type_code } => {
                tracing::debug!("Unhandled binlog event type {} at {}", type_code, position);
                Ok(vec![RowEvent::Placeholder {
                    position: self.anchor(position),
                }])
            }
        }
    }
}

fn invalid(reason: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason.into())
}

fn bit(bitmap: &[u8], index: usize) -> bool {
    bitmap
        .get(index / 8)
        .is_some_and(|b| b & (1 << (index % 8)) != 0)
}

fn read_bytes(cursor: &mut Cursor<&[u8]>, len: usize) -> io::Result<Vec<u8>> {
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if len > remaining {
        return Err(invalid(format!(
            "value of {} bytes exceeds the {} remaining",
            len, remaining
        )));
    }
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_row(
    cursor: &mut Cursor<&[u8]>,
    map: &TableMapEvent,
    metadata: &TableMetadata,
    present: &[u8],
) -> io::Result<Row> {
    let present_count = (0..map.column_count()).filter(|&i| bit(present, i)).count();
    let nulls = read_bytes(cursor, present_count.div_ceil(8))?;

    let mut columns = Vec::with_capacity(present_count);
    let mut null_index = 0;
    for (i, column) in metadata.columns.iter().enumerate() {
        if !bit(present, i) {
            continue;
        }
        let value = if bit(&nulls, null_index) {
            Value::Null
        } else {
            read_value(cursor, map.column_types[i], map.column_meta[i], column)
                .map_err(|e| invalid(format!("column {}: {}", column.name, e)))?
        };
        null_index += 1;
        columns.push(Column::new(
            column.name.clone(),
            value,
            metadata.is_key(&column.name),
        ));
    }
    Ok(Row::new(columns))
}

fn is_binary(column: &ColumnMetadata) -> bool {
    matches!(
        column.data_type.as_str(),
        "binary" | "varbinary" | "tinyblob" | "blob" | "mediumblob" | "longblob" | "geometry"
    )
}

fn text_or_bytes(bytes: Vec<u8>, column: &ColumnMetadata) -> io::Result<Value> {
    if is_binary(column) {
        return Ok(Value::Bytes(bytes));
    }
    String::from_utf8(bytes)
        .map(Value::String)
        .map_err(|_| invalid("text is not valid UTF-8"))
}

fn read_value(
    cursor: &mut Cursor<&[u8]>,
    col_type: u8,
    meta: u16,
    column: &ColumnMetadata,
) -> io::Result<Value> {
    use column_type::*;

    let unsigned = column.unsigned;
    let value = match col_type {
        TINY if unsigned => Value::UInt(cursor.read_u8()? as u64),
        TINY => Value::Int(cursor.read_i8()? as i64),
        SHORT if unsigned => Value::UInt(cursor.read_u16::<LittleEndian>()? as u64),
        SHORT => Value::Int(cursor.read_i16::<LittleEndian>()? as i64),
        INT24 if unsigned => Value::UInt(cursor.read_u24::<LittleEndian>()? as u64),
        INT24 => Value::Int(cursor.read_i24::<LittleEndian>()? as i64),
        LONG if unsigned => Value::UInt(cursor.read_u32::<LittleEndian>()? as u64),
        LONG => Value::Int(cursor.read_i32::<LittleEndian>()? as i64),
        LONGLONG if unsigned => Value::UInt(cursor.read_u64::<LittleEndian>()?),
        LONGLONG => Value::Int(cursor.read_i64::<LittleEndian>()?),
        FLOAT => Value::Float(cursor.read_f32::<LittleEndian>()? as f64),
        DOUBLE => Value::Float(cursor.read_f64::<LittleEndian>()?),
        YEAR => {
            let year = cursor.read_u8()?;
            Value::Int(if year == 0 { 0 } else { 1900 + year as i64 })
        }
        NEWDECIMAL => Value::Decimal(read_decimal(cursor, (meta >> 8) as usize, (meta & 0xFF) as usize)?),
        DATE | NEWDATE => read_date(cursor.read_u24::<LittleEndian>()?),
        TIME => {
            let hms = cursor.read_i24::<LittleEndian>()?;
            let sign = if hms < 0 { "-" } else { "" };
            let hms = hms.unsigned_abs();
            Value::Time(format!(
                "{}{:02}:{:02}:{:02}",
                sign,
                hms / 10000,
                hms / 100 % 100,
                hms % 100
            ))
        }
        TIME2 => Value::Time(read_time2(cursor, meta)?),
        DATETIME => {
            let packed = cursor.read_u64::<LittleEndian>()?;
            let date = packed / 1_000_000;
            let time = packed % 1_000_000;
            datetime_value(
                (date / 10000) as i32,
                (date / 100 % 100) as u32,
                (date % 100) as u32,
                (time / 10000) as u32,
                (time / 100 % 100) as u32,
                (time % 100) as u32,
                0,
            )
        }
        DATETIME2 => read_datetime2(cursor, meta)?,
        TIMESTAMP => timestamp_value(cursor.read_u32::<LittleEndian>()? as i64, 0)?,
        TIMESTAMP2 => {
            let seconds = cursor.read_u32::<BigEndian>()? as i64;
            let micros = read_fraction(cursor, meta)?;
            timestamp_value(seconds, micros)?
        }
        VARCHAR | VAR_STRING => {
            let len = if meta < 256 {
                cursor.read_u8()? as usize
            } else {
                cursor.read_u16::<LittleEndian>()? as usize
            };
            text_or_bytes(read_bytes(cursor, len)?, column)?
        }
        STRING => read_string(cursor, meta, column)?,
        ENUM => read_enum(cursor, (meta & 0xFF) as usize, column)?,
        SET => read_set(cursor, (meta & 0xFF) as usize, column)?,
        BLOB | TINY_BLOB | MEDIUM_BLOB | LONG_BLOB | GEOMETRY => {
            let len = read_length(cursor, meta)?;
            let bytes = read_bytes(cursor, len)?;
            if col_type == GEOMETRY {
                Value::Bytes(bytes)
            } else {
                text_or_bytes(bytes, column)?
            }
        }
        JSON => {
            let len = read_length(cursor, meta)?;
            let bytes = read_bytes(cursor, len)?;
            Value::Json(json::decode(&bytes).map_err(invalid)?)
        }
        BIT => {
            let bits = (meta >> 8) as usize * 8 + (meta & 0xFF) as usize;
            Value::Bytes(read_bytes(cursor, bits.div_ceil(8))?)
        }
        other => return Err(invalid(format!("unsupported column type {}", other))),
    };
    Ok(value)
}

/// Little-endian length prefix of `meta` bytes
fn read_length(cursor: &mut Cursor<&[u8]>, meta: u16) -> io::Result<usize> {
    match meta {
        1..=4 => Ok(cursor.read_uint::<LittleEndian>(meta as usize)? as usize),
        other => Err(invalid(format!("invalid length prefix size {}", other))),
    }
}

fn read_string(cursor: &mut Cursor<&[u8]>, meta: u16, column: &ColumnMetadata) -> io::Result<Value> {
    let byte0 = (meta >> 8) as u8;
    let byte1 = meta & 0xFF;

    // Lengths above 255 borrow two bits of the real type byte
    let (real_type, max_len) = if byte0 & 0x30 != 0x30 {
        (byte0 | 0x30, byte1 | ((((byte0 & 0x30) ^ 0x30) as u16) << 4))
    } else {
        (byte0, byte1)
    };

    match real_type {
        column_type::ENUM => read_enum(cursor, byte1 as usize, column),
        column_type::SET => read_set(cursor, byte1 as usize, column),
        _ => {
            let len = if max_len > 255 {
                cursor.read_u16::<LittleEndian>()? as usize
            } else {
                cursor.read_u8()? as usize
            };
            text_or_bytes(read_bytes(cursor, len)?, column)
        }
    }
}

fn read_enum(cursor: &mut Cursor<&[u8]>, size: usize, column: &ColumnMetadata) -> io::Result<Value> {
    if !(1..=2).contains(&size) {
        return Err(invalid(format!("invalid enum size {}", size)));
    }
    let index = cursor.read_uint::<LittleEndian>(size)? as usize;
    if index == 0 {
        return Ok(Value::String(String::new()));
    }
    column
        .enum_values
        .get(index - 1)
        .map(|label| Value::String(label.clone()))
        .ok_or_else(|| invalid(format!("enum index {} out of range", index)))
}

fn read_set(cursor: &mut Cursor<&[u8]>, size: usize, column: &ColumnMetadata) -> io::Result<Value> {
    if !(1..=8).contains(&size) {
        return Err(invalid(format!("invalid set size {}", size)));
    }
    let mask = cursor.read_uint::<LittleEndian>(size)?;
    let labels: Vec<&str> = column
        .enum_values
        .iter()
        .enumerate()
        .filter(|(i, _)| *i < 64 && mask & (1 << i) != 0)
        .map(|(_, label)| label.as_str())
        .collect();
    Ok(Value::String(labels.join(",")))
}

fn read_date(packed: u32) -> Value {
    let day = packed & 0x1F;
    let month = (packed >> 5) & 0x0F;
    let year = (packed >> 9) as i32;
    match NaiveDate::from_ymd_opt(year, month, day) {
        Some(date) => Value::Date(date),
        None => Value::String(format!("{:04}-{:02}-{:02}", year, month, day)),
    }
}

fn datetime_value(
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
    micros: u32,
) -> Value {
    match NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_micro_opt(hour, minute, second, micros))
    {
        Some(datetime) => Value::DateTime(datetime),
        None => Value::String(format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}{}",
            year,
            month,
            day,
            hour,
            minute,
            second,
            format_micros(micros)
        )),
    }
}

fn timestamp_value(seconds: i64, micros: u32) -> io::Result<Value> {
    if seconds == 0 && micros == 0 {
        return Ok(Value::String("0000-00-00 00:00:00".to_string()));
    }
    DateTime::from_timestamp(seconds, micros * 1000)
        .map(Value::Timestamp)
        .ok_or_else(|| invalid(format!("timestamp {} out of range", seconds)))
}

/// Fractional seconds stored in `(fsp + 1) / 2` big-endian bytes
fn read_fraction(cursor: &mut Cursor<&[u8]>, fsp: u16) -> io::Result<u32> {
    Ok(match fsp {
        0 => 0,
        1 | 2 => cursor.read_u8()? as u32 * 10_000,
        3 | 4 => cursor.read_u16::<BigEndian>()? as u32 * 100,
        5 | 6 => cursor.read_u24::<BigEndian>()?,
        other => return Err(invalid(format!("invalid fractional precision {}", other))),
    })
}

fn format_micros(micros: u32) -> String {
    if micros == 0 {
        String::new()
    } else if micros % 1000 == 0 {
        format!(".{:03}", micros / 1000)
    } else {
        format!(".{:06}", micros)
    }
}

fn read_datetime2(cursor: &mut Cursor<&[u8]>, fsp: u16) -> io::Result<Value> {
    let packed = cursor.read_uint::<BigEndian>(5)? as i64 - 0x80_0000_0000;
    let micros = read_fraction(cursor, fsp)?;
    let packed = packed.unsigned_abs();

    let ymd = packed >> 17;
    let year_month = ymd >> 5;
    let hms = packed % (1 << 17);
    Ok(datetime_value(
        (year_month / 13) as i32,
        (year_month % 13) as u32,
        (ymd % (1 << 5)) as u32,
        (hms >> 12) as u32,
        ((hms >> 6) % (1 << 6)) as u32,
        (hms % (1 << 6)) as u32,
        micros,
    ))
}

/// TIME2 is stored as `(hms << 24) + fraction`, offset to sort unsigned
fn read_time2(cursor: &mut Cursor<&[u8]>, fsp: u16) -> io::Result<String> {
    const INT_OFFSET: i64 = 0x80_0000;
    let packed: i64 = match fsp {
        0 => (cursor.read_u24::<BigEndian>()? as i64 - INT_OFFSET) << 24,
        1 | 2 => {
            let mut int_part = cursor.read_u24::<BigEndian>()? as i64 - INT_OFFSET;
            let mut frac = cursor.read_u8()? as i64;
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x100;
            }
            (int_part << 24) + frac * 10_000
        }
        3 | 4 => {
            let mut int_part = cursor.read_u24::<BigEndian>()? as i64 - INT_OFFSET;
            let mut frac = cursor.read_u16::<BigEndian>()? as i64;
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x10000;
            }
            (int_part << 24) + frac * 100
        }
        5 | 6 => cursor.read_uint::<BigEndian>(6)? as i64 - 0x8000_0000_0000,
        other => return Err(invalid(format!("invalid fractional precision {}", other))),
    };

    let sign = if packed < 0 { "-" } else { "" };
    let packed = packed.unsigned_abs();
    let hms = packed >> 24;
    let micros = (packed % (1 << 24)) as u32;
    Ok(format!(
        "{}{:02}:{:02}:{:02}{}",
        sign,
        (hms >> 12) % (1 << 10),
        (hms >> 6) % (1 << 6),
        hms % (1 << 6),
        format_micros(micros)
    ))
}

const DIGITS_PER_WORD: usize = 9;
const WORD_BYTES: usize = 4;
const LEFTOVER_BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];

fn be_uint(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32)
}

/// Packed DECIMAL: groups of nine digits in four bytes, sign in the top bit
fn read_decimal(cursor: &mut Cursor<&[u8]>, precision: usize, scale: usize) -> io::Result<String> {
    if scale > precision || precision > 65 {
        return Err(invalid(format!("invalid decimal({},{})", precision, scale)));
    }
    let int_digits = precision - scale;
    let int_words = int_digits / DIGITS_PER_WORD;
    let int_leftover = int_digits % DIGITS_PER_WORD;
    let frac_words = scale / DIGITS_PER_WORD;
    let frac_leftover = scale % DIGITS_PER_WORD;
    let size = int_words * WORD_BYTES
        + LEFTOVER_BYTES[int_leftover]
        + frac_words * WORD_BYTES
        + LEFTOVER_BYTES[frac_leftover];

    let mut buf = read_bytes(cursor, size)?;
    if buf.is_empty() {
        return Err(invalid("empty decimal"));
    }
    let negative = buf[0] & 0x80 == 0;
    buf[0] ^= 0x80;
    if negative {
        buf.iter_mut().for_each(|b| *b = !*b);
    }

    let mut pos = 0;
    let mut take = |n: usize| {
        let value = be_uint(&buf[pos..pos + n]);
        pos += n;
        value
    };

    let mut int_part = String::new();
    if int_leftover > 0 {
        let value = take(LEFTOVER_BYTES[int_leftover]);
        if value > 0 {
            int_part.push_str(&value.to_string());
        }
    }
    for _ in 0..int_words {
        let value = take(WORD_BYTES);
        if int_part.is_empty() {
            if value > 0 {
                int_part.push_str(&value.to_string());
            }
        } else {
            int_part.push_str(&format!("{:09}", value));
        }
    }
    if int_part.is_empty() {
        int_part.push('0');
    }

    let mut frac_part = String::new();
    for _ in 0..frac_words {
        frac_part.push_str(&format!("{:09}", take(WORD_BYTES)));
    }
    if frac_leftover > 0 {
        let value = take(LEFTOVER_BYTES[frac_leftover]);
        frac_part.push_str(&format!("{:0width$}", value, width = frac_leftover));
    }

    let mut result = String::new();
    if negative {
        result.push('-');
    }
    result.push_str(&int_part);
    if scale > 0 {
        result.push('.');
        result.push_str(&frac_part);
    }
    Ok(result)
}

/// MySQL binary JSON
mod json {
    use serde_json::{Map, Number, Value};

    const SMALL_OBJECT: u8 = 0x00;
    const LARGE_OBJECT: u8 = 0x01;
    const SMALL_ARRAY: u8 = 0x02;
    const LARGE_ARRAY: u8 = 0x03;
    const LITERAL: u8 = 0x04;
    const INT16: u8 = 0x05;
    const UINT16: u8 = 0x06;
    const INT32: u8 = 0x07;
    const UINT32: u8 = 0x08;
    const INT64: u8 = 0x09;
    const UINT64: u8 = 0x0a;
    const DOUBLE: u8 = 0x0b;
    const STRING: u8 = 0x0c;
    const OPAQUE: u8 = 0x0f;

    pub(super) fn decode(data: &[u8]) -> Result<Value, String> {
        match data.split_first() {
            None => Ok(Value::Null),
            Some((&value_type, rest)) => value(value_type, rest),
        }
    }

    fn slice(data: &[u8], at: usize, len: usize) -> Result<&[u8], String> {
        data.get(at..at + len)
            .ok_or_else(|| "JSON value truncated".to_string())
    }

    fn le_uint(data: &[u8], at: usize, len: usize) -> Result<u64, String> {
        Ok(slice(data, at, len)?
            .iter()
            .rev()
            .fold(0u64, |acc, b| (acc << 8) | *b as u64))
    }

    fn value(value_type: u8, data: &[u8]) -> Result<Value, String> {
        match value_type {
            SMALL_OBJECT => container(data, false, true),
            LARGE_OBJECT => container(data, true, true),
            SMALL_ARRAY => container(data, false, false),
            LARGE_ARRAY => container(data, true, false),
            LITERAL => literal(*data.first().ok_or("JSON literal truncated")?),
            INT16 => Ok(Value::from(le_uint(data, 0, 2)? as u16 as i16)),
            UINT16 => Ok(Value::from(le_uint(data, 0, 2)? as u16)),
            INT32 => Ok(Value::from(le_uint(data, 0, 4)? as u32 as i32)),
            UINT32 => Ok(Value::from(le_uint(data, 0, 4)? as u32)),
            INT64 => Ok(Value::from(le_uint(data, 0, 8)? as i64)),
            UINT64 => Ok(Value::from(le_uint(data, 0, 8)?)),
            DOUBLE => {
                let bits = le_uint(data, 0, 8)?;
                Ok(Number::from_f64(f64::from_bits(bits))
                    .map(Value::Number)
                    .unwrap_or(Value::Null))
            }
            STRING => {
                let (len, used) = variable_length(data)?;
                let bytes = slice(data, used, len)?;
                String::from_utf8(bytes.to_vec())
                    .map(Value::String)
                    .map_err(|_| "JSON string is not valid UTF-8".to_string())
            }
            OPAQUE => {
                let rest = data.get(1..).ok_or("JSON opaque value truncated")?;
                let (len, used) = variable_length(rest)?;
                let bytes = slice(rest, used, len)?;
                Ok(Value::String(String::from_utf8_lossy(bytes).into_owned()))
            }
            other => Err(format!("unknown JSON value type 0x{:02x}", other)),
        }
    }

    fn literal(byte: u8) -> Result<Value, String> {
        match byte {
            0x00 => Ok(Value::Null),
            0x01 => Ok(Value::Bool(true)),
            0x02 => Ok(Value::Bool(false)),
            other => Err(format!("unknown JSON literal 0x{:02x}", other)),
        }
    }

    /// Length with seven bits per byte, high bit set when more follow
    fn variable_length(data: &[u8]) -> Result<(usize, usize), String> {
        let mut len = 0usize;
        for (i, byte) in data.iter().take(5).enumerate() {
            len |= ((byte & 0x7F) as usize) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok((len, i + 1));
            }
        }
        Err("invalid JSON length".to_string())
    }

    fn inlined(value_type: u8, large: bool) -> bool {
        match value_type {
            LITERAL | INT16 | UINT16 => true,
            INT32 | UINT32 => large,
            _ => false,
        }
    }

    fn container(data: &[u8], large: bool, object: bool) -> Result<Value, String> {
        let size = if large { 4 } else { 2 };
        let count = le_uint(data, 0, size)? as usize;
        let mut pos = 2 * size;

        let mut keys = Vec::new();
        if object {
            for _ in 0..count {
                let offset = le_uint(data, pos, size)? as usize;
                let len = le_uint(data, pos + size, 2)? as usize;
                let key = String::from_utf8(slice(data, offset, len)?.to_vec())
                    .map_err(|_| "JSON key is not valid UTF-8".to_string())?;
                keys.push(key);
                pos += size + 2;
            }
        }

        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            let value_type = *data.get(pos).ok_or("JSON value entry truncated")?;
            let entry = if inlined(value_type, large) {
                value(value_type, slice(data, pos + 1, size)?)?
            } else {
                let offset = le_uint(data, pos + 1, size)? as usize;
                value(value_type, data.get(offset..).ok_or("JSON offset out of range")?)?
            };
            values.push(entry);
            pos += 1 + size;
        }

        if object {
            let map: Map<String, Value> = keys.into_iter().zip(values).collect();
            Ok(Value::Object(map))
        } else {
            Ok(Value::Array(values))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::mysql::event::event_type;
    use crate::dialect::mysql::event::parse_event;
    use crate::dialect::mysql::event::tests::{raw_event, t_order_map_payload};
    use serde_json::json;

    fn metadata() -> TableMetadata {
        TableMetadata {
            name: "shop.t_order".into(),
            columns: vec![
                ColumnMetadata::new("order_id", "bigint"),
                ColumnMetadata::new("user_id", "int"),
                ColumnMetadata::new("note", "varchar"),
            ],
            primary_keys: vec!["order_id".into()],
        }
    }

    fn entry(raw: Vec<u8>) -> BinlogEntry {
        let (header, event) = parse_event(&raw).unwrap();
        BinlogEntry { header, event }
    }

    fn at(pos: u64) -> Position {
        Position::Binlog(BinlogPosition::new("mysql-bin.000003", pos))
    }

    fn decoder() -> BinlogDecoder {
        let mut decoder = BinlogDecoder::new(["t_order".to_string()].into_iter().collect());
        let map = entry(raw_event(event_type::TABLE_MAP_EVENT, 300, &t_order_map_payload(42)));
        assert!(decoder.decode(map, &at(250)).unwrap().is_empty());
        decoder.register_metadata("t_order", metadata());
        decoder
    }

    fn row_image(order_id: i64, user_id: i32, note: Option<&str>) -> Vec<u8> {
        let mut p = vec![if note.is_none() { 0b100 } else { 0 }];
        p.extend_from_slice(&order_id.to_le_bytes());
        p.extend_from_slice(&user_id.to_le_bytes());
        if let Some(note) = note {
            p.push(note.len() as u8);
            p.extend_from_slice(note.as_bytes());
        }
        p
    }

    fn rows_payload(kind: u8, images: &[Vec<u8>]) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&42u64.to_le_bytes()[..6]);
        p.extend_from_slice(&0u16.to_le_bytes());
        p.extend_from_slice(&2u16.to_le_bytes());
        p.push(3);
        p.push(0b111);
        if kind == event_type::UPDATE_ROWS_EVENT {
            p.push(0b111);
        }
        for image in images {
            p.extend_from_slice(image);
        }
        p
    }

    #[test]
    fn test_rows_anchor_at_transaction_start() {
        let mut decoder = decoder();
        decoder
            .decode(entry(raw_event(event_type::GTID_LOG_EVENT, 200, &[0u8; 42])), &at(139))
            .unwrap();
        assert!(decoder.in_transaction());

        let payload = rows_payload(
            event_type::WRITE_ROWS_EVENT,
            &[row_image(1, 10, Some("a")), row_image(999, 10, None)],
        );
        let events = decoder
            .decode(entry(raw_event(event_type::WRITE_ROWS_EVENT, 400, &payload)), &at(320))
            .unwrap();
        assert_eq!(events.len(), 2);
        let RowEvent::Write { table, after, position } = &events[0] else {
            panic!("expected write");
        };
        assert_eq!(table, "t_order");
        assert_eq!(position, &at(139));
        assert_eq!(after.get("order_id"), Some(&Value::Int(1)));
        assert_eq!(after.get("note"), Some(&Value::String("a".into())));
        assert_eq!(after.key_values(), vec![&Value::Int(1)]);
        let RowEvent::Write { after, .. } = &events[1] else {
            panic!("expected write");
        };
        assert_eq!(after.get("note"), Some(&Value::Null));

        let xid = decoder
            .decode(entry(raw_event(event_type::XID_EVENT, 431, &5u64.to_le_bytes())), &at(400))
            .unwrap();
        assert_eq!(xid, vec![RowEvent::Placeholder { position: at(431) }]);
        assert!(!decoder.in_transaction());
    }

    #[test]
    fn test_update_carries_both_images() {
        let mut decoder = decoder();
        let payload = rows_payload(
            event_type::UPDATE_ROWS_EVENT,
            &[row_image(1, 10, Some("a")), row_image(2, 10, Some("b"))],
        );
        let events = decoder
            .decode(entry(raw_event(event_type::UPDATE_ROWS_EVENT, 400, &payload)), &at(320))
            .unwrap();
        let RowEvent::Update { before, after, position, .. } = &events[0] else {
            panic!("expected update");
        };
        assert_eq!(position, &at(320));
        assert_eq!(before.as_ref().unwrap().get("order_id"), Some(&Value::Int(1)));
        assert_eq!(after.get("order_id"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_unmapped_and_filtered_tables() {
        let mut decoder = BinlogDecoder::new(["t_order".to_string()].into_iter().collect());
        let payload = rows_payload(event_type::DELETE_ROWS_EVENT, &[row_image(1, 10, None)]);
        let rows = entry(raw_event(event_type::DELETE_ROWS_EVENT, 400, &payload));
        assert!(matches!(
            decoder.decode(rows.clone(), &at(320)),
            Err(Error::Decode { .. })
        ));

        // Mapped but without metadata
        let map = entry(raw_event(event_type::TABLE_MAP_EVENT, 300, &t_order_map_payload(42)));
        decoder.decode(map.clone(), &at(250)).unwrap();
        let BinlogEvent::TableMap(table_map) = &map.event else {
            panic!("expected table map");
        };
        assert!(decoder.needs_metadata(table_map));
        assert!(decoder.decode(rows.clone(), &at(320)).is_err());

        let mut other = BinlogDecoder::new(["t_user".to_string()].into_iter().collect());
        other.decode(map, &at(250)).unwrap();
        assert!(other.decode(rows, &at(320)).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_row_fails() {
        let mut decoder = decoder();
        let mut image = row_image(1, 10, Some("abc"));
        image.truncate(image.len() - 2);
        let payload = rows_payload(event_type::WRITE_ROWS_EVENT, &[image]);
        let result =
            decoder.decode(entry(raw_event(event_type::WRITE_ROWS_EVENT, 400, &payload)), &at(320));
        assert!(matches!(result, Err(Error::Decode { .. })));
    }

    #[test]
    fn test_query_and_rotate_positions() {
        let mut decoder = decoder();
        let mut q = vec![0u8; 8];
        q.push(4);
        q.extend_from_slice(&0u16.to_le_bytes());
        q.extend_from_slice(&0u16.to_le_bytes());
        q.extend_from_slice(b"shop\0ALTER TABLE t_order ADD COLUMN c INT");
        let events = decoder
            .decode(entry(raw_event(event_type::QUERY_EVENT, 700, &q)), &at(600))
            .unwrap();
        assert_eq!(events, vec![RowEvent::Placeholder { position: at(700) }]);

        let mut r = 4u64.to_le_bytes().to_vec();
        r.extend_from_slice(b"mysql-bin.000004");
        let events = decoder
            .decode(entry(raw_event(event_type::ROTATE_EVENT, 800, &r)), &at(700))
            .unwrap();
        assert_eq!(
            events,
            vec![RowEvent::Placeholder {
                position: Position::Binlog(BinlogPosition::new("mysql-bin.000004", 4))
            }]
        );
    }

    #[test]
    fn test_decimal() {
        let positive = [0x81, 0x0D, 0xFB, 0x38, 0xD2, 0x04, 0xD2];
        let mut cursor = Cursor::new(&positive[..]);
        assert_eq!(read_decimal(&mut cursor, 14, 4).unwrap(), "1234567890.1234");

        let negative: Vec<u8> = positive.iter().map(|b| !b).collect();
        let mut cursor = Cursor::new(negative.as_slice());
        assert_eq!(read_decimal(&mut cursor, 14, 4).unwrap(), "-1234567890.1234");

        // DECIMAL(5,2) 0.50
        let mut cursor = Cursor::new(&[0x80, 0x00, 0x32][..]);
        assert_eq!(read_decimal(&mut cursor, 5, 2).unwrap(), "0.50");
    }

    #[test]
    fn test_temporal_values() {
        let ymdhms: u64 = (((2024 * 13 + 1) << 5 | 15) << 17) | (10 << 12) | (30 << 6) | 45;
        let packed = ymdhms + 0x80_0000_0000;
        let bytes = &packed.to_be_bytes()[3..];
        let mut cursor = Cursor::new(bytes);
        let value = read_datetime2(&mut cursor, 0).unwrap();
        assert_eq!(value.canonical(), "2024-01-15 10:30:45");

        let mut cursor = Cursor::new(&[0x7F, 0xF0, 0x00][..]);
        assert_eq!(read_time2(&mut cursor, 0).unwrap(), "-01:00:00");

        // 12:34:56.5 with fsp 1
        let hms: u32 = (12 << 12) | (34 << 6) | 56;
        let mut bytes = (hms + 0x80_0000).to_be_bytes()[1..].to_vec();
        bytes.push(50);
        let mut cursor = Cursor::new(bytes.as_slice());
        assert_eq!(read_time2(&mut cursor, 1).unwrap(), "12:34:56.500");

        let date = (2024 << 9) | (2 << 5) | 29;
        assert_eq!(read_date(date), Value::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()));
        assert_eq!(read_date(0), Value::String("0000-00-00".into()));
    }

    #[test]
    fn test_enum_and_set() {
        let mut status = ColumnMetadata::new("status", "enum");
        status.enum_values = vec!["new".into(), "paid".into()];
        let meta = ((column_type::ENUM as u16) << 8) | 1;
        let mut cursor = Cursor::new(&[2u8][..]);
        assert_eq!(
            read_value(&mut cursor, column_type::STRING, meta, &status).unwrap(),
            Value::String("paid".into())
        );
        let mut cursor = Cursor::new(&[9u8][..]);
        assert!(read_value(&mut cursor, column_type::STRING, meta, &status).is_err());

        let mut tags = ColumnMetadata::new("tags", "set");
        tags.enum_values = vec!["a".into(), "b".into(), "c".into()];
        let meta = ((column_type::SET as u16) << 8) | 1;
        let mut cursor = Cursor::new(&[0b101u8][..]);
        assert_eq!(
            read_value(&mut cursor, column_type::STRING, meta, &tags).unwrap(),
            Value::String("a,c".into())
        );
    }

    #[test]
    fn test_blob_text_and_invalid_utf8() {
        let text = ColumnMetadata::new("body", "text");
        let blob = ColumnMetadata::new("payload", "blob");
        let data = [2u8, 0, b'h', b'i'];
        let mut cursor = Cursor::new(&data[..]);
        assert_eq!(
            read_value(&mut cursor, column_type::BLOB, 2, &text).unwrap(),
            Value::String("hi".into())
        );
        let mut cursor = Cursor::new(&data[..]);
        assert_eq!(
            read_value(&mut cursor, column_type::BLOB, 2, &blob).unwrap(),
            Value::Bytes(b"hi".to_vec())
        );
        let mut cursor = Cursor::new(&[2u8, 0, 0xFF, 0xFE][..]);
        assert!(read_value(&mut cursor, column_type::BLOB, 2, &text).is_err());
    }

    #[test]
    fn test_binary_json() {
        let object = [
            0x00, 0x01, 0x00, 0x0C, 0x00, 0x0B, 0x00, 0x01, 0x00, 0x05, 0x01, 0x00, b'a',
        ];
        assert_eq!(json::decode(&object).unwrap(), json!({"a": 1}));

        let array = [
            0x02, 0x02, 0x00, 0x0C, 0x00, 0x0C, 0x0A, 0x00, 0x04, 0x01, 0x00, 0x01, b'x',
        ];
        assert_eq!(json::decode(&array).unwrap(), json!(["x", true]));

        assert_eq!(json::decode(&[]).unwrap(), serde_json::Value::Null);
        assert!(json::decode(&[0x0C, 0x05, b'a']).is_err());
        assert!(json::decode(&[0x42]).is_err());
    }
}
