//! Importer
//!
//! Drains one channel partition and applies its events to the target.
//!
//! Re-delivery after a restart is made harmless by the statements
//! themselves: writes are upserts keyed on the target's primary key and
//! deletes match by key, so applying an event twice leaves the same row
//! state as applying it once.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::channel::ChannelConsumer;
use crate::config::PipelineConfig;
use crate::datasource::{DataSource, SqlBuilder, TableMetadata};
use crate::error::{Error, Result};
use crate::ingest::unqualified;
use crate::record::{Row, RowEvent};

/// Activity shared between the importers of a job item and its coordinator
#[derive(Debug, Default)]
pub struct ImportStats {
    last_applied_ms: AtomicI64,
}

impl ImportStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn touch(&self) {
        self.last_applied_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Time of the last applied data event in milliseconds, if any
    pub fn last_applied_ms(&self) -> Option<i64> {
        match self.last_applied_ms.load(Ordering::Relaxed) {
            0 => None,
            at => Some(at),
        }
    }
}

/// Database the importer writes to
#[async_trait]
pub trait ImportTarget: Send + Sync {
    fn sql(&self) -> SqlBuilder;

    async fn table_metadata(&self, table: &str) -> Result<TableMetadata>;

    /// Run all statements in one transaction
    async fn execute_transaction(&self, statements: &[String]) -> Result<()>;
}

#[async_trait]
impl ImportTarget for DataSource {
    fn sql(&self) -> SqlBuilder {
        DataSource::sql(self)
    }

    async fn table_metadata(&self, table: &str) -> Result<TableMetadata> {
        DataSource::table_metadata(self, table).await
    }

    async fn execute_transaction(&self, statements: &[String]) -> Result<()> {
        DataSource::execute_transaction(self, statements).await
    }
}

/// Applies the events of one channel partition
pub struct Importer<T = DataSource> {
    target: T,
    consumer: ChannelConsumer,
    pipeline: PipelineConfig,
    stats: Arc<ImportStats>,
    metadata: HashMap<String, TableMetadata>,
}

impl<T: ImportTarget> Importer<T> {
    pub fn new(
        target: T,
        consumer: ChannelConsumer,
        pipeline: PipelineConfig,
        stats: Arc<ImportStats>,
    ) -> Self {
        Self {
            target,
            consumer,
            pipeline,
            stats,
            metadata: HashMap::new(),
        }
    }

    /// Apply events until `Finished`; returns the number of applied rows.
    ///
    /// Each fetched batch is applied in one target transaction and
    /// acknowledged only after it commits. Placeholders are acknowledged
    /// without writing.
    pub async fn write(mut self) -> Result<u64> {
        let partition = self.consumer.partition();
        let sql = self.target.sql();
        let mut applied = 0u64;
        tracing::debug!("Importer for partition {} started", partition);

        loop {
            let batch = self.consumer.fetch(self.pipeline.batch_size).await?;
            if batch.is_empty() {
                continue;
            }

            let mut seqs = Vec::with_capacity(batch.len());
            let mut statements = Vec::new();
            let mut data_records = 0u64;
            let mut last_table = String::new();
            let mut finished = false;

            for delivery in batch {
                if delivery.event.is_finished() {
                    finished = true;
                    break;
                }
                if let Some(table) = delivery.event.table() {
                    let table = unqualified(table).to_string();
                    let metadata = self.target_metadata(&table).await?;
                    statements.extend(statements_for(&sql, metadata, delivery.event));
                    data_records += 1;
                    last_table = table;
                }
                if let Some(seq) = delivery.seq {
                    seqs.push(seq);
                }
            }

            if !statements.is_empty() {
                self.apply(&statements, &last_table).await?;
                self.stats.touch();
                applied += data_records;
                tracing::trace!(
                    "Partition {} applied {} events in {} statements",
                    partition,
                    data_records,
                    statements.len()
                );
            }
            self.consumer.ack(&seqs, data_records);

            if finished {
                tracing::debug!(
                    "Importer for partition {} finished after {} rows",
                    partition,
                    applied
                );
                return Ok(applied);
            }
        }
    }

    async fn target_metadata(&mut self, table: &str) -> Result<&TableMetadata> {
        if !self.metadata.contains_key(table) {
            let metadata = self.target.table_metadata(table).await?;
            self.metadata.insert(table.to_string(), metadata);
        }
        self.metadata
            .get(table)
            .ok_or_else(|| Error::Internal(format!("metadata for {} vanished", table)))
    }

    /// Run statements in one transaction, retrying a bounded number of times
    async fn apply(&self, statements: &[String], table: &str) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            match self.target.execute_transaction(statements).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.pipeline.retry_times => {
                    attempt += 1;
                    tracing::warn!(
                        "Applying batch to {} failed (attempt {}/{}): {}",
                        table,
                        attempt,
                        self.pipeline.retry_times,
                        e
                    );
                    tokio::time::sleep(self.pipeline.retry_interval()).await;
                }
                Err(e) => {
                    tracing::error!("Giving up on batch for {}: {}", table, e);
                    return Err(Error::Apply {
                        table: table.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }
}

fn keyed(mut row: Row, keys: &[String]) -> Row {
    row.mark_keys(keys);
    row
}

/// Target statements for one data event
fn statements_for(sql: &SqlBuilder, metadata: &TableMetadata, event: RowEvent) -> Vec<String> {
    let table = metadata.name.as_str();
    let keys = &metadata.primary_keys;
    match event {
        RowEvent::Write { after, .. } => vec![sql.upsert(table, &keyed(after, keys), keys)],
        RowEvent::Update { before, after, .. } => {
            let after = keyed(after, keys);
            let mut statements = Vec::with_capacity(2);
            if let Some(before) = before.map(|b| keyed(b, keys)) {
                let key_changed = before.key_columns().next().is_some()
                    && before.key_values() != after.key_values();
                if key_changed {
                    statements.push(sql.delete(table, &before, keys));
                }
            }
            statements.push(sql.upsert(table, &after, keys));
            statements
        }
        RowEvent::Delete { before, .. } => vec![sql.delete(table, &keyed(before, keys), keys)],
        RowEvent::Placeholder { .. } | RowEvent::Finished { .. } => Vec::new(),
    }
}
