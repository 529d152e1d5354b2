//! Readers
//!
//! Producers that feed a channel: the one-shot inventory scan and the
//! continuous change-log tail.

pub mod inventory;

pub use inventory::{InventoryReader, InventorySource};

use async_trait::async_trait;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;

use crate::channel::ChannelProducer;
use crate::config::{PipelineConfig, RdbmsConfiguration};
use crate::datasource::DataSource;
use crate::error::Result;
use crate::position::Position;

/// Everything an incremental reader needs to tail one source
#[derive(Debug, Clone)]
pub struct IncrementalContext {
    /// Job item key, used to name server-side resources
    pub job_key: String,
    pub source: DataSource,
    pub source_config: RdbmsConfiguration,
    /// Unqualified names of the tables being migrated
    pub tables: Vec<String>,
    pub pipeline: PipelineConfig,
}

impl IncrementalContext {
    pub fn table_filter(&self) -> HashSet<String> {
        self.tables.iter().map(|t| unqualified(t).to_string()).collect()
    }
}

/// Strip a schema qualifier from a table name
pub fn unqualified(table: &str) -> &str {
    table.rsplit_once('.').map(|(_, name)| name).unwrap_or(table)
}

/// Continuously tails a source change log.
///
/// `start` emits decoded events in log order until `cancel` fires, then
/// pushes `Finished` carrying the last emitted position and returns. A
/// transient connection loss is retried from the last decoded position; a
/// decode failure ends the read with an error.
#[async_trait]
pub trait IncrementalReader: Send {
    async fn start(
        &mut self,
        from: Position,
        channel: &ChannelProducer,
        cancel: CancellationToken,
    ) -> Result<()>;
}
