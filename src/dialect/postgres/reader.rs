//! Logical slot tailing
//!
//! Changes are peeked from the job's slot, so nothing is consumed until it
//! has been applied: the slot is advanced to the channel watermark after the
//! importers acknowledge a transaction's commit. Every change of a
//! transaction carries the commit LSN of the transaction before it, which is
//! the point the slot restarts from; the commit itself is emitted as a
//! placeholder at its own LSN.

use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::channel::ChannelProducer;
use crate::dialect::LogDecoder;
use crate::error::{Error, Result};
use crate::ingest::{IncrementalContext, IncrementalReader};
use crate::position::{Position, WalPosition};
use crate::record::RowEvent;

use super::decoder::{TestDecodingDecoder, WalEntry};
use super::position::{pg_pool, slot_name};

/// Upper bound for the adaptive peek window
const MAX_PEEK_ROWS: usize = 1 << 20;

/// Tails a `test_decoding` replication slot by polling
pub struct WalIncrementalReader {
    context: IncrementalContext,
    decoder: TestDecodingDecoder,
}

impl WalIncrementalReader {
    pub fn new(context: IncrementalContext) -> Self {
        let decoder = TestDecodingDecoder::new(context.table_filter());
        Self { context, decoder }
    }

    async fn peek(&self, pool: &PgPool, slot: &str, limit: usize) -> Result<Vec<WalEntry>> {
        let rows: Vec<(String, Option<String>, String)> = sqlx::query_as(
            "SELECT lsn::text, xid::text, data FROM pg_logical_slot_peek_changes($1, NULL, $2)",
        )
        .bind(slot)
        .bind(limit.min(i32::MAX as usize) as i32)
        .fetch_all(pool)
        .await?;

        rows.into_iter()
            .map(|(lsn, xid, data)| {
                Ok(WalEntry {
                    lsn: lsn.parse()?,
                    xid: xid.and_then(|x| x.parse().ok()),
                    data,
                })
            })
            .collect()
    }

    /// Move the slot forward; moving it backwards is a no-op
    async fn advance(&self, pool: &PgPool, slot: &str, to: WalPosition) -> Result<()> {
        sqlx::query(
            "SELECT pg_replication_slot_advance($1, $2::pg_lsn) FROM pg_replication_slots \
             WHERE slot_name = $1 AND confirmed_flush_lsn < $2::pg_lsn",
        )
        .bind(slot)
        .bind(to.to_string())
        .execute(pool)
        .await?;
        tracing::debug!("Advanced slot {} to {}", slot, to);
        Ok(())
    }

    async fn poll(
        &self,
        pool: &PgPool,
        slot: &str,
        advance: bool,
        target: WalPosition,
        limit: usize,
    ) -> Result<Vec<WalEntry>> {
        if advance {
            self.advance(pool, slot, target).await?;
        }
        self.peek(pool, slot, limit).await
    }

    /// Decode complete transactions committed after `pushed`
    fn decode_window(
        &mut self,
        entries: Vec<WalEntry>,
        pushed: &mut WalPosition,
    ) -> Result<Vec<RowEvent>> {
        let mut events = Vec::new();
        let mut transaction: Vec<WalEntry> = Vec::new();
        let mut in_transaction = false;

        for entry in entries {
            if entry.data.starts_with("BEGIN") {
                transaction.clear();
                in_transaction = true;
                continue;
            }
            if entry.data.starts_with("COMMIT") {
                in_transaction = false;
                let commit = entry.lsn;
                if commit <= *pushed {
                    transaction.clear();
                    continue;
                }
                let restart = Position::Wal(*pushed);
                for change in transaction.drain(..) {
                    events.extend(self.decoder.decode(change, &restart)?);
                }
                events.push(RowEvent::Placeholder {
                    position: Position::Wal(commit),
                });
                *pushed = commit;
                continue;
            }
            if in_transaction {
                transaction.push(entry);
            }
        }
        Ok(events)
    }
}

#[async_trait]
impl IncrementalReader for WalIncrementalReader {
    async fn start(
        &mut self,
        from: Position,
        channel: &ChannelProducer,
        cancel: CancellationToken,
    ) -> Result<()> {
        let from = from
            .as_wal()
            .ok_or_else(|| Error::Position(from.to_string()))?;
        let pool = pg_pool(&self.context.source)?.clone();
        let slot = slot_name(&self.context.job_key);
        let pipeline = self.context.pipeline.clone();
        let watermark = channel.watermark();

        tracing::info!("Tailing slot {} from {}", slot, from);

        let mut pushed = from;
        let mut advanced = WalPosition(0);
        let mut limit = pipeline.batch_size.max(1);
        let mut failures = 0u32;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let target = watermark
                .committed()
                .and_then(|p| p.as_wal())
                .map_or(from, |w| w.max(from));
            let result = self.poll(&pool, &slot, target > advanced, target, limit).await;
            let entries = match result {
                Ok(entries) => {
                    failures = 0;
                    advanced = advanced.max(target);
                    entries
                }
                Err(e) if e.is_retryable() && failures < pipeline.retry_times => {
                    failures += 1;
                    tracing::warn!(
                        "Polling slot {} failed (attempt {}/{}): {}",
                        slot,
                        failures,
                        pipeline.retry_times,
                        e
                    );
                    sleep_or_cancel(pipeline.retry_interval(), &cancel).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let window = entries.len();
            let events = self.decode_window(entries, &mut pushed)?;
            if events.is_empty() {
                if window >= limit && limit < MAX_PEEK_ROWS {
                    // Window filled by transactions already in flight.
                    limit = (limit * 2).min(MAX_PEEK_ROWS);
                    continue;
                }
                sleep_or_cancel(pipeline.poll_interval(), &cancel).await;
                continue;
            }

            limit = pipeline.batch_size.max(1);
            tracing::trace!("Pushing {} events from slot {}", events.len(), slot);
            channel.push_all(events).await?;
        }

        tracing::info!("Stopped tailing slot {} at {}", slot, pushed);
        channel
            .push(RowEvent::Finished {
                position: Some(Position::Wal(pushed)),
            })
            .await
    }
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = cancel.cancelled() => {}
    }
}
