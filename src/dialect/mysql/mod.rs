//! MySQL dialect: row-based binlog streamed over a replica connection

mod client;
mod decoder;
mod event;
mod position;
mod reader;

pub use client::{server_id_for, BinlogClient, ConnectParams};
pub use decoder::{BinlogDecoder, BinlogEntry};
pub use event::{parse_event, BinlogEvent, EventHeader, TableMapEvent};
pub use position::BinlogPositionManager;
pub use reader::BinlogIncrementalReader;

use std::sync::Arc;

use crate::config::Dialect;
use crate::dialect::{DialectHandler, PositionManager};
use crate::ingest::{IncrementalContext, IncrementalReader};

#[derive(Debug, Clone, Default)]
pub struct MySqlDialect {
    position_manager: Arc<BinlogPositionManager>,
}

impl MySqlDialect {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DialectHandler for MySqlDialect {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }

    fn position_manager(&self) -> Arc<dyn PositionManager> {
        self.position_manager.clone()
    }

    fn incremental_reader(&self, context: IncrementalContext) -> Box<dyn IncrementalReader> {
        Box::new(BinlogIncrementalReader::new(context))
    }
}
