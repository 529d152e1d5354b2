//! Resumable Positions
//!
//! A position is a checkpoint into a source's change log (or, during the
//! inventory stage, into a key range). Every position serializes to a short
//! string that parses back to the same value:
//!
//! - PostgreSQL WAL: `0/14EFDB8` (high and low 32 bits in hex)
//! - MySQL binlog: `mysql-bin.000003:1547`
//! - Inventory: `i,<begin>,<end>` for an integer key range still to read,
//!   `p` for a table read in one pass, `f` once the split is finished.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::config::Dialect;
use crate::error::{Error, Result};

/// PostgreSQL log sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WalPosition(pub u64);

impl WalPosition {
    pub fn lsn(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WalPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for WalPosition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (high, low) = s
            .split_once('/')
            .ok_or_else(|| Error::Position(s.to_string()))?;
        let high = u32::from_str_radix(high, 16).map_err(|_| Error::Position(s.to_string()))?;
        let low = u32::from_str_radix(low, 16).map_err(|_| Error::Position(s.to_string()))?;
        Ok(WalPosition(((high as u64) << 32) | low as u64))
    }
}

/// MySQL binary log coordinate
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BinlogPosition {
    pub file_name: String,
    pub position: u64,
}

impl BinlogPosition {
    pub fn new(file_name: impl Into<String>, position: u64) -> Self {
        Self {
            file_name: file_name.into(),
            position,
        }
    }

    /// Split `mysql-bin.000012` into (`mysql-bin`, 12)
    fn file_key(&self) -> (&str, u64) {
        match self.file_name.rsplit_once('.') {
            Some((base, seq)) => match seq.parse() {
                Ok(seq) => (base, seq),
                Err(_) => (&self.file_name, 0),
            },
            None => (&self.file_name, 0),
        }
    }
}

impl Ord for BinlogPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.file_key()
            .cmp(&other.file_key())
            .then_with(|| self.file_name.cmp(&other.file_name))
            .then_with(|| self.position.cmp(&other.position))
    }
}

impl PartialOrd for BinlogPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_name, self.position)
    }
}

impl FromStr for BinlogPosition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (file, offset) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::Position(s.to_string()))?;
        if file.is_empty() {
            return Err(Error::Position(s.to_string()));
        }
        let position = offset.parse().map_err(|_| Error::Position(s.to_string()))?;
        Ok(BinlogPosition::new(file, position))
    }
}

/// Progress of one inventory split
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InventoryPosition {
    /// Keys in `begin..=end` remain to be read
    IntegerRange { begin: i64, end: i64 },
    /// The split is read in one keyset pass with no resumable range
    Placeholder,
    /// Every row of the split has been emitted
    Finished,
}

impl InventoryPosition {
    pub fn is_finished(&self) -> bool {
        matches!(self, InventoryPosition::Finished)
    }
}

impl fmt::Display for InventoryPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InventoryPosition::IntegerRange { begin, end } => write!(f, "i,{},{}", begin, end),
            InventoryPosition::Placeholder => f.write_str("p"),
            InventoryPosition::Finished => f.write_str("f"),
        }
    }
}

impl FromStr for InventoryPosition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "p" => Ok(InventoryPosition::Placeholder),
            "f" => Ok(InventoryPosition::Finished),
            _ => {
                let mut parts = s.split(',');
                match (parts.next(), parts.next(), parts.next(), parts.next()) {
                    (Some("i"), Some(begin), Some(end), None) => {
                        let begin = begin.parse().map_err(|_| Error::Position(s.to_string()))?;
                        let end = end.parse().map_err(|_| Error::Position(s.to_string()))?;
                        Ok(InventoryPosition::IntegerRange { begin, end })
                    }
                    _ => Err(Error::Position(s.to_string())),
                }
            }
        }
    }
}

/// Resumable checkpoint into a source
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Position {
    Wal(WalPosition),
    Binlog(BinlogPosition),
    Inventory(InventoryPosition),
}

impl Position {
    /// Parse a persisted incremental position for a known dialect
    pub fn parse_for(dialect: Dialect, s: &str) -> Result<Self> {
        match dialect {
            Dialect::PostgreSql => Ok(Position::Wal(s.parse()?)),
            Dialect::MySql => Ok(Position::Binlog(s.parse()?)),
        }
    }

    pub fn is_inventory(&self) -> bool {
        matches!(self, Position::Inventory(_))
    }

    pub fn as_wal(&self) -> Option<WalPosition> {
        match self {
            Position::Wal(p) => Some(*p),
            _ => None,
        }
    }

    pub fn as_binlog(&self) -> Option<&BinlogPosition> {
        match self {
            Position::Binlog(p) => Some(p),
            _ => None,
        }
    }
}

/// Positions of different kinds are unordered
impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Position::Wal(a), Position::Wal(b)) => Some(a.cmp(b)),
            (Position::Binlog(a), Position::Binlog(b)) => Some(a.cmp(b)),
            (Position::Inventory(a), Position::Inventory(b)) => match (a, b) {
                (InventoryPosition::Finished, InventoryPosition::Finished) => Some(Ordering::Equal),
                (InventoryPosition::Finished, _) => Some(Ordering::Greater),
                (_, InventoryPosition::Finished) => Some(Ordering::Less),
                (
                    InventoryPosition::IntegerRange { begin: a, end: ea },
                    InventoryPosition::IntegerRange { begin: b, end: eb },
                ) if ea == eb => Some(a.cmp(b)),
                _ if a == b => Some(Ordering::Equal),
                _ => None,
            },
            _ => None,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Wal(p) => p.fmt(f),
            Position::Binlog(p) => p.fmt(f),
            Position::Inventory(p) => p.fmt(f),
        }
    }
}

impl FromStr for Position {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "p" || s == "f" || s.starts_with("i,") {
            return Ok(Position::Inventory(s.parse()?));
        }
        if let Ok(wal) = s.parse::<WalPosition>() {
            return Ok(Position::Wal(wal));
        }
        Ok(Position::Binlog(s.parse()?))
    }
}

impl TryFrom<String> for Position {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Position> for String {
    fn from(p: Position) -> Self {
        p.to_string()
    }
}
