//! PostgreSQL dialect: logical replication slots decoded with `test_decoding`

mod decoder;
mod position;
mod reader;

pub use decoder::{TestDecodingDecoder, WalEntry};
pub use position::{slot_name, WalPositionManager, DECODING_PLUGIN};
pub use reader::WalIncrementalReader;

use std::sync::Arc;

use crate::config::Dialect;
use crate::dialect::{DialectHandler, PositionManager};
use crate::ingest::{IncrementalContext, IncrementalReader};

#[derive(Debug, Clone, Default)]
pub struct PostgresDialect {
    position_manager: Arc<WalPositionManager>,
}

impl PostgresDialect {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DialectHandler for PostgresDialect {
    fn dialect(&self) -> Dialect {
        Dialect::PostgreSql
    }

    fn position_manager(&self) -> Arc<dyn PositionManager> {
        self.position_manager.clone()
    }

    fn incremental_reader(&self, context: IncrementalContext) -> Box<dyn IncrementalReader> {
        Box::new(WalIncrementalReader::new(context))
    }
}
