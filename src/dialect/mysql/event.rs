//! Binlog Event Types
//!
//! Defines the binlog events the reader acts on and their parsing. Row
//! images are kept as raw bytes here and decoded against table metadata by
//! the decoder.

/// Size of the v4 event header
pub const HEADER_LEN: usize = 19;

/// Binlog event types we care about
#[derive(Debug, Clone, PartialEq)]
pub enum BinlogEvent {
    /// Query event - contains raw SQL (BEGIN, COMMIT, DDL)
    Query {
        database: String,
        query: String,
    },
    /// Table map event - maps table_id to database.table and column types
    TableMap(TableMapEvent),
    /// Write, update or delete rows
    Rows(RowsEvent),
    /// Rotate event - binlog file changed
    Rotate {
        next_file: String,
        position: u64,
    },
    /// Format description event - contains binlog format info
    FormatDescription {
        binlog_version: u16,
        server_version: String,
    },
    /// XID event - transaction commit
    Xid {
        xid: u64,
    },
    /// GTID event (MySQL GTID, anonymous GTID or MariaDB GTID)
    Gtid,
    /// Keep-alive sent by the server when idle
    Heartbeat,
    /// Events without row data that never affect position handling
    Ignorable {
        type_code: u8,
    },
    /// Unknown/unhandled event
    Unknown {
        type_code: u8,
    },
}

/// Binlog event type codes (MariaDB/MySQL)
#[allow(dead_code)]
pub mod event_type {
    pub const UNKNOWN_EVENT: u8 = 0;
    pub const START_EVENT_V3: u8 = 1;
    pub const QUERY_EVENT: u8 = 2;
    pub const STOP_EVENT: u8 = 3;
    pub const ROTATE_EVENT: u8 = 4;
    pub const INTVAR_EVENT: u8 = 5;
    pub const RAND_EVENT: u8 = 13;
    pub const USER_VAR_EVENT: u8 = 14;
    pub const FORMAT_DESCRIPTION_EVENT: u8 = 15;
    pub const XID_EVENT: u8 = 16;
    pub const TABLE_MAP_EVENT: u8 = 19;
    pub const WRITE_ROWS_EVENT_V1: u8 = 23;
    pub const UPDATE_ROWS_EVENT_V1: u8 = 24;
    pub const DELETE_ROWS_EVENT_V1: u8 = 25;
    pub const HEARTBEAT_LOG_EVENT: u8 = 27;
    pub const IGNORABLE_LOG_EVENT: u8 = 28;
    pub const ROWS_QUERY_LOG_EVENT: u8 = 29;
    pub const WRITE_ROWS_EVENT: u8 = 30;
    pub const UPDATE_ROWS_EVENT: u8 = 31;
    pub const DELETE_ROWS_EVENT: u8 = 32;
    pub const GTID_LOG_EVENT: u8 = 33;
    pub const ANONYMOUS_GTID_LOG_EVENT: u8 = 34;
    pub const PREVIOUS_GTIDS_LOG_EVENT: u8 = 35;
    pub const TRANSACTION_CONTEXT_EVENT: u8 = 36;
    pub const VIEW_CHANGE_EVENT: u8 = 37;
    pub const XA_PREPARE_LOG_EVENT: u8 = 38;
    pub const PARTIAL_UPDATE_ROWS_EVENT: u8 = 39;
    pub const TRANSACTION_PAYLOAD_EVENT: u8 = 40;
    pub const HEARTBEAT_LOG_EVENT_V2: u8 = 41;

    // MariaDB specific
    pub const MARIADB_ANNOTATE_ROWS_EVENT: u8 = 160;
    pub const MARIADB_BINLOG_CHECKPOINT_EVENT: u8 = 161;
    pub const MARIADB_GTID_EVENT: u8 = 162;
    pub const MARIADB_GTID_LIST_EVENT: u8 = 163;
    pub const MARIADB_START_ENCRYPTION_EVENT: u8 = 164;
}

/// Column type codes as they appear in table map events
#[allow(dead_code)]
pub mod column_type {
    pub const DECIMAL: u8 = 0;
    pub const TINY: u8 = 1;
    pub const SHORT: u8 = 2;
    pub const LONG: u8 = 3;
    pub const FLOAT: u8 = 4;
    pub const DOUBLE: u8 = 5;
    pub const NULL: u8 = 6;
    pub const TIMESTAMP: u8 = 7;
    pub const LONGLONG: u8 = 8;
    pub const INT24: u8 = 9;
    pub const DATE: u8 = 10;
    pub const TIME: u8 = 11;
    pub const DATETIME: u8 = 12;
    pub const YEAR: u8 = 13;
    pub const NEWDATE: u8 = 14;
    pub const VARCHAR: u8 = 15;
    pub const BIT: u8 = 16;
    pub const TIMESTAMP2: u8 = 17;
    pub const DATETIME2: u8 = 18;
    pub const TIME2: u8 = 19;
    pub const JSON: u8 = 245;
    pub const NEWDECIMAL: u8 = 246;
    pub const ENUM: u8 = 247;
    pub const SET: u8 = 248;
    pub const TINY_BLOB: u8 = 249;
    pub const MEDIUM_BLOB: u8 = 250;
    pub const LONG_BLOB: u8 = 251;
    pub const BLOB: u8 = 252;
    pub const VAR_STRING: u8 = 253;
    pub const STRING: u8 = 254;
    pub const GEOMETRY: u8 = 255;
}

/// Common v4 event header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    pub timestamp: u32,
    pub type_code: u8,
    pub server_id: u32,
    pub event_length: u32,
    /// Offset of the next event in the current file
    pub next_position: u32,
    pub flags: u16,
}

impl EventHeader {
    pub fn parse(data: &[u8]) -> Result<Self, String> {
        if data.len() < HEADER_LEN {
            return Err("Event too short".to_string());
        }
        Ok(Self {
            timestamp: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            type_code: data[4],
            server_id: u32::from_le_bytes([data[5], data[6], data[7], data[8]]),
            event_length: u32::from_le_bytes([data[9], data[10], data[11], data[12]]),
            next_position: u32::from_le_bytes([data[13], data[14], data[15], data[16]]),
            flags: u16::from_le_bytes([data[17], data[18]]),
        })
    }

    /// Offset of this event in the current file
    pub fn start_position(&self) -> u64 {
        (self.next_position as u64).saturating_sub(self.event_length as u64)
    }
}

/// Table map: column layout of a table for the following row events
#[derive(Debug, Clone, PartialEq)]
pub struct TableMapEvent {
    pub table_id: u64,
    pub database: String,
    pub table: String,
    pub column_types: Vec<u8>,
    /// Per-column type metadata, decoded to one integer per column
    pub column_meta: Vec<u16>,
}

impl TableMapEvent {
    pub fn column_count(&self) -> usize {
        self.column_types.len()
    }
}

/// Kind of row change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowsKind {
    Write,
    Update,
    Delete,
}

/// Rows event with undecoded row images
#[derive(Debug, Clone, PartialEq)]
pub struct RowsEvent {
    pub kind: RowsKind,
    pub table_id: u64,
    pub column_count: usize,
    /// Columns present in the before image (or the only image)
    pub present: Vec<u8>,
    /// Columns present in the after image of an update
    pub present_after: Option<Vec<u8>>,
    /// Row images
    pub rows: Vec<u8>,
}

/// Parse a binlog event from raw bytes, checksum already removed
pub fn parse_event(data: &[u8]) -> Result<(EventHeader, BinlogEvent), String> {
    // Binlog event header (19 bytes for v4):
    // 4 bytes: timestamp
    // 1 byte: type_code
    // 4 bytes: server_id
    // 4 bytes: event_length
    // 4 bytes: next_position
    // 2 bytes: flags
    let header = EventHeader::parse(data)?;
    if (header.event_length as usize) < data.len() {
        return Err(format!(
            "Event length {} shorter than {} bytes received",
            header.event_length,
            data.len()
        ));
    }

    let payload = &data[HEADER_LEN..];

    let event = match header.type_code {
        event_type::QUERY_EVENT => parse_query_event(payload)?,
        event_type::TABLE_MAP_EVENT => parse_table_map_event(payload)?,
        event_type::WRITE_ROWS_EVENT | event_type::WRITE_ROWS_EVENT_V1 => {
            parse_rows_event(payload, RowsKind::Write, header.type_code)?
        }
        event_type::UPDATE_ROWS_EVENT | event_type::UPDATE_ROWS_EVENT_V1 => {
            parse_rows_event(payload, RowsKind::Update, header.type_code)?
        }
        event_type::DELETE_ROWS_EVENT | event_type::DELETE_ROWS_EVENT_V1 => {
            parse_rows_event(payload, RowsKind::Delete, header.type_code)?
        }
        event_type::ROTATE_EVENT => parse_rotate_event(payload)?,
        event_type::FORMAT_DESCRIPTION_EVENT => parse_format_description_event(payload)?,
        event_type::XID_EVENT => parse_xid_event(payload)?,
        event_type::GTID_LOG_EVENT
        | event_type::ANONYMOUS_GTID_LOG_EVENT
        | event_type::MARIADB_GTID_EVENT => BinlogEvent::Gtid,
        event_type::HEARTBEAT_LOG_EVENT | event_type::HEARTBEAT_LOG_EVENT_V2 => {
            BinlogEvent::Heartbeat
        }
        event_type::PREVIOUS_GTIDS_LOG_EVENT
        | event_type::ROWS_QUERY_LOG_EVENT
        | event_type::IGNORABLE_LOG_EVENT
        | event_type::INTVAR_EVENT
        | event_type::RAND_EVENT
        | event_type::USER_VAR_EVENT
        | event_type::STOP_EVENT
        | event_type::TRANSACTION_CONTEXT_EVENT
        | event_type::VIEW_CHANGE_EVENT
        | event_type::MARIADB_ANNOTATE_ROWS_EVENT
        | event_type::MARIADB_BINLOG_CHECKPOINT_EVENT
        | event_type::MARIADB_GTID_LIST_EVENT
        | event_type::MARIADB_START_ENCRYPTION_EVENT => BinlogEvent::Ignorable {
            type_code: header.type_code,
        },
        type_code => BinlogEvent::Unknown { type_code },
    };
    Ok((header, event))
}

fn parse_query_event(data: &[u8]) -> Result<BinlogEvent, String> {
    if data.len() < 13 {
        return Err("Query event too short".to_string());
    }

    // Query event post-header:
    // 4 bytes: thread_id
    // 4 bytes: execution_time
    // 1 byte: schema_length
    // 2 bytes: error_code
    // 2 bytes: status_vars_length (v4)

    let schema_length = data[8] as usize;
    let status_vars_length = u16::from_le_bytes([data[11], data[12]]) as usize;

    let schema_start = 13 + status_vars_length;
    if data.len() < schema_start + schema_length + 1 {
        return Err("Query event truncated".to_string());
    }

    let database =
        String::from_utf8_lossy(&data[schema_start..schema_start + schema_length]).to_string();
    let query_start = schema_start + schema_length + 1; // +1 for null terminator
    let query = String::from_utf8_lossy(&data[query_start..]).to_string();

    Ok(BinlogEvent::Query { database, query })
}

fn read_table_id(data: &[u8]) -> u64 {
    u64::from_le_bytes([data[0], data[1], data[2], data[3], data[4], data[5], 0, 0])
}

/// Length-encoded integer; returns the value and bytes consumed
pub(crate) fn read_packed_int(data: &[u8]) -> Result<(u64, usize), String> {
    let first = *data.first().ok_or("Missing packed integer")?;
    let need = match first {
        0..=250 => return Ok((first as u64, 1)),
        252 => 3,
        253 => 4,
        254 => 9,
        _ => return Err(format!("Invalid packed integer prefix 0x{:02X}", first)),
    };
    if data.len() < need {
        return Err("Packed integer truncated".to_string());
    }
    let mut bytes = [0u8; 8];
    bytes[..need - 1].copy_from_slice(&data[1..need]);
    Ok((u64::from_le_bytes(bytes), need))
}

fn parse_table_map_event(data: &[u8]) -> Result<BinlogEvent, String> {
    let truncated = || "Table map event truncated".to_string();
    if data.len() < 9 {
        return Err("Table map event too short".to_string());
    }

    // 6 bytes: table_id
    // 2 bytes: flags
    // 1 byte: schema_name_length, schema_name, null terminator
    // 1 byte: table_name_length, table_name, null terminator
    // packed column count, column types, packed metadata length, metadata
    let table_id = read_table_id(data);

    let schema_len = data[8] as usize;
    let mut pos = 9;
    let database = String::from_utf8_lossy(data.get(pos..pos + schema_len).ok_or_else(truncated)?)
        .to_string();
    pos += schema_len + 1;

    let table_len = *data.get(pos).ok_or_else(truncated)? as usize;
    pos += 1;
    let table =
        String::from_utf8_lossy(data.get(pos..pos + table_len).ok_or_else(truncated)?).to_string();
    pos += table_len + 1;

    let (column_count, used) = read_packed_int(data.get(pos..).ok_or_else(truncated)?)?;
    pos += used;
    let column_count = column_count as usize;
    let column_types = data
        .get(pos..pos + column_count)
        .ok_or_else(truncated)?
        .to_vec();
    pos += column_count;

    let (meta_len, used) = read_packed_int(data.get(pos..).ok_or_else(truncated)?)?;
    pos += used;
    let meta = data
        .get(pos..pos + meta_len as usize)
        .ok_or_else(truncated)?;
    let column_meta = parse_column_meta(&column_types, meta)?;

    Ok(BinlogEvent::TableMap(TableMapEvent {
        table_id,
        database,
        table,
        column_types,
        column_meta,
    }))
}

fn parse_column_meta(column_types: &[u8], meta: &[u8]) -> Result<Vec<u16>, String> {
    use column_type::*;

    let mut pos = 0;
    let mut take = |n: usize| -> Result<&[u8], String> {
        let bytes = meta
            .get(pos..pos + n)
            .ok_or_else(|| "Column metadata truncated".to_string())?;
        pos += n;
        Ok(bytes)
    };

    let mut result = Vec::with_capacity(column_types.len());
    for &t in column_types {
        let value = match t {
            FLOAT | DOUBLE | BLOB | TINY_BLOB | MEDIUM_BLOB | LONG_BLOB | JSON | GEOMETRY
            | TIME2 | DATETIME2 | TIMESTAMP2 => take(1)?[0] as u16,
            VARCHAR | VAR_STRING | BIT => {
                let b = take(2)?;
                u16::from_le_bytes([b[0], b[1]])
            }
            // Real type first, then length: big-endian
            NEWDECIMAL | STRING | ENUM | SET => {
                let b = take(2)?;
                u16::from_be_bytes([b[0], b[1]])
            }
            _ => 0,
        };
        result.push(value);
    }
    Ok(result)
}

fn parse_rows_event(data: &[u8], kind: RowsKind, type_code: u8) -> Result<BinlogEvent, String> {
    let truncated = || "Rows event truncated".to_string();
    if data.len() < 8 {
        return Err("Rows event too short".to_string());
    }

    let table_id = read_table_id(data);
    let mut pos = 8;

    // v2 events carry extra data whose length includes its own two bytes
    if matches!(
        type_code,
        event_type::WRITE_ROWS_EVENT | event_type::UPDATE_ROWS_EVENT | event_type::DELETE_ROWS_EVENT
    ) {
        let b = data.get(pos..pos + 2).ok_or_else(truncated)?;
        let extra = u16::from_le_bytes([b[0], b[1]]) as usize;
        pos += extra.max(2);
    }

    let (column_count, used) = read_packed_int(data.get(pos..).ok_or_else(truncated)?)?;
    pos += used;
    let column_count = column_count as usize;
    let bitmap_len = column_count.div_ceil(8);

    let present = data
        .get(pos..pos + bitmap_len)
        .ok_or_else(truncated)?
        .to_vec();
    pos += bitmap_len;

    let present_after = if kind == RowsKind::Update {
        let bitmap = data
            .get(pos..pos + bitmap_len)
            .ok_or_else(truncated)?
            .to_vec();
        pos += bitmap_len;
        Some(bitmap)
    } else {
        None
    };

    Ok(BinlogEvent::Rows(RowsEvent {
        kind,
        table_id,
        column_count,
        present,
        present_after,
        rows: data[pos..].to_vec(),
    }))
}

fn parse_rotate_event(data: &[u8]) -> Result<BinlogEvent, String> {
    if data.len() < 8 {
        return Err("Rotate event too short".to_string());
    }

    let position = u64::from_le_bytes([
        data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
    ]);
    let next_file = String::from_utf8_lossy(&data[8..])
        .trim_end_matches('\0')
        .to_string();

    Ok(BinlogEvent::Rotate {
        next_file,
        position,
    })
}

fn parse_format_description_event(data: &[u8]) -> Result<BinlogEvent, String> {
    if data.len() < 57 {
        return Err("Format description event too short".to_string());
    }

    let binlog_version = u16::from_le_bytes([data[0], data[1]]);
    let server_version = String::from_utf8_lossy(&data[2..52])
        .trim_end_matches('\0')
        .to_string();

    Ok(BinlogEvent::FormatDescription {
        binlog_version,
        server_version,
    })
}

fn parse_xid_event(data: &[u8]) -> Result<BinlogEvent, String> {
    if data.len() < 8 {
        return Err("XID event too short".to_string());
    }

    let xid = u64::from_le_bytes([
        data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
    ]);

    Ok(BinlogEvent::Xid { xid })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a raw event with a v4 header
    pub(crate) fn raw_event(type_code: u8, next_position: u32, payload: &[u8]) -> Vec<u8> {
        let len = (HEADER_LEN + payload.len()) as u32;
        let mut data = Vec::new();
        data.extend_from_slice(&0u32.to_le_bytes());
        data.push(type_code);
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&next_position.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(payload);
        data
    }

    /// Table map payload for `shop.t_order(order_id BIGINT, user_id INT, note VARCHAR(32))`
    pub(crate) fn t_order_map_payload(table_id: u64) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&table_id.to_le_bytes()[..6]);
        p.extend_from_slice(&1u16.to_le_bytes());
        p.push(4);
        p.extend_from_slice(b"shop\0");
        p.push(7);
        p.extend_from_slice(b"t_order\0");
        p.push(3);
        p.extend_from_slice(&[column_type::LONGLONG, column_type::LONG, column_type::VARCHAR]);
        p.push(2);
        p.extend_from_slice(&32u16.to_le_bytes());
        p.push(0b100);
        p
    }

    #[test]
    fn test_parse_header_positions() {
        let data = raw_event(event_type::XID_EVENT, 1000, &7u64.to_le_bytes());
        let (header, event) = parse_event(&data).unwrap();
        assert_eq!(header.type_code, event_type::XID_EVENT);
        assert_eq!(header.event_length, 27);
        assert_eq!(header.start_position(), 973);
        assert_eq!(event, BinlogEvent::Xid { xid: 7 });
    }

    #[test]
    fn test_parse_table_map() {
        let data = raw_event(event_type::TABLE_MAP_EVENT, 500, &t_order_map_payload(42));
        let (_, event) = parse_event(&data).unwrap();
        let BinlogEvent::TableMap(map) = event else {
            panic!("expected table map");
        };
        assert_eq!(map.table_id, 42);
        assert_eq!(map.database, "shop");
        assert_eq!(map.table, "t_order");
        assert_eq!(map.column_count(), 3);
        assert_eq!(map.column_meta, vec![0, 0, 32]);
    }

    #[test]
    fn test_parse_rows_v2_skips_extra_data() {
        let mut p = Vec::new();
        p.extend_from_slice(&42u64.to_le_bytes()[..6]);
        p.extend_from_slice(&0u16.to_le_bytes());
        p.extend_from_slice(&2u16.to_le_bytes());
        p.push(3);
        p.push(0b111);
        p.extend_from_slice(&[0xAA, 0xBB]);
        let data = raw_event(event_type::WRITE_ROWS_EVENT, 600, &p);
        let (_, event) = parse_event(&data).unwrap();
        let BinlogEvent::Rows(rows) = event else {
            panic!("expected rows");
        };
        assert_eq!(rows.kind, RowsKind::Write);
        assert_eq!(rows.column_count, 3);
        assert_eq!(rows.present, vec![0b111]);
        assert!(rows.present_after.is_none());
        assert_eq!(rows.rows, vec![0xAA, 0xBB]);
    }

    #[test]
    fn test_parse_query_and_rotate() {
        let mut q = Vec::new();
        q.extend_from_slice(&[0u8; 8]);
        q.push(4);
        q.extend_from_slice(&0u16.to_le_bytes());
        q.extend_from_slice(&0u16.to_le_bytes());
        q.extend_from_slice(b"shop\0BEGIN");
        let (_, event) = parse_event(&raw_event(event_type::QUERY_EVENT, 300, &q)).unwrap();
        assert_eq!(
            event,
            BinlogEvent::Query {
                database: "shop".into(),
                query: "BEGIN".into()
            }
        );

        let mut r = 4u64.to_le_bytes().to_vec();
        r.extend_from_slice(b"mysql-bin.000002");
        let (_, event) = parse_event(&raw_event(event_type::ROTATE_EVENT, 0, &r)).unwrap();
        assert_eq!(
            event,
            BinlogEvent::Rotate {
                next_file: "mysql-bin.000002".into(),
                position: 4
            }
        );
    }

    #[test]
    fn test_truncated_events_rejected() {
        assert!(parse_event(&[0u8; 10]).is_err());
        let data = raw_event(event_type::TABLE_MAP_EVENT, 100, &[1, 0, 0, 0, 0, 0, 0, 0, 9]);
        assert!(parse_event(&data).is_err());
    }

    #[test]
    fn test_packed_int() {
        assert_eq!(read_packed_int(&[250]).unwrap(), (250, 1));
        assert_eq!(read_packed_int(&[252, 0x01, 0x02]).unwrap(), (0x0201, 3));
        assert!(read_packed_int(&[251]).is_err());
        assert!(read_packed_int(&[253, 1]).is_err());
    }
}
