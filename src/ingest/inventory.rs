//! Inventory Reader
//!
//! Copies the existing rows of one table split as `Write` events. Rows are
//! read by keyset pagination on the primary key so at most one page is held
//! in memory, and a resumed split continues from the last acknowledged key.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::channel::ChannelProducer;
use crate::config::RdbmsConfiguration;
use crate::datasource::{DataSource, SqlBuilder, TableMetadata};
use crate::error::{Error, Result};
use crate::position::{InventoryPosition, Position};
use crate::record::{Row, RowEvent, Value};

use super::unqualified;

/// Key-ordered access to the rows of a source table
#[async_trait]
pub trait InventorySource: Send + Sync {
    fn sql(&self) -> SqlBuilder;

    /// Smallest and largest value of an integer key under `condition`
    async fn key_range(
        &self,
        table: &str,
        key: &str,
        condition: Option<&str>,
    ) -> Result<(Option<i64>, Option<i64>)>;

    /// Up to `limit` rows with keys strictly after `after`, in key order
    async fn page(
        &self,
        metadata: &TableMetadata,
        condition: Option<&str>,
        after: Option<&[Value]>,
        limit: usize,
    ) -> Result<Vec<Row>>;
}

#[async_trait]
impl InventorySource for DataSource {
    fn sql(&self) -> SqlBuilder {
        DataSource::sql(self)
    }

    async fn key_range(
        &self,
        table: &str,
        key: &str,
        condition: Option<&str>,
    ) -> Result<(Option<i64>, Option<i64>)> {
        self.fetch_i64_pair(&DataSource::sql(self).key_range(table, key, condition))
            .await
    }

    async fn page(
        &self,
        metadata: &TableMetadata,
        condition: Option<&str>,
        after: Option<&[Value]>,
        limit: usize,
    ) -> Result<Vec<Row>> {
        let sql = DataSource::sql(self).select_page(metadata, condition, after, limit);
        self.fetch_rows(&sql, metadata).await
    }
}

/// Streams the rows of one table split
pub struct InventoryReader<S = DataSource> {
    source: S,
    config: RdbmsConfiguration,
    metadata: TableMetadata,
    batch_size: usize,
}

impl<S: InventorySource> InventoryReader<S> {
    /// Create a reader for the table and filter in `config`
    pub fn new(
        source: S,
        config: RdbmsConfiguration,
        metadata: TableMetadata,
        batch_size: usize,
    ) -> Self {
        Self {
            source,
            config,
            metadata,
            batch_size: batch_size.max(1),
        }
    }

    pub fn config(&self) -> &RdbmsConfiguration {
        &self.config
    }

    /// Partition the table into at most `concurrency` disjoint key ranges.
    ///
    /// Only a single integer primary key can be split; other tables, and
    /// tables with fewer rows than splits, yield one split covering the
    /// whole filter.
    pub async fn split(&self, concurrency: usize) -> Result<Vec<RdbmsConfiguration>> {
        let Some(key) = self.metadata.integer_key() else {
            return Ok(vec![self.config.clone()]);
        };
        if concurrency <= 1 {
            return Ok(vec![self.config.clone()]);
        }

        let sql = self.source.sql();
        let (min, max) = self
            .source
            .key_range(
                &self.metadata.name,
                &key.name,
                self.config.where_condition.as_deref(),
            )
            .await?;
        let (Some(min), Some(max)) = (min, max) else {
            return Ok(vec![self.config.clone()]);
        };

        let ranges = split_range(min, max, concurrency);
        tracing::info!(
            "Split {} into {} key ranges over [{}, {}]",
            self.metadata.name,
            ranges.len(),
            min,
            max
        );
        Ok(ranges
            .into_iter()
            .map(|(begin, end)| {
                self.config
                    .with_condition(sql.range_condition(&key.name, begin, end))
            })
            .collect())
    }

    /// Emit every row of the split, then `Finished`.
    ///
    /// A `Finished` resume position skips the scan. When `cancel` fires the
    /// reader still pushes `Finished` so importers drain, then returns
    /// [`Error::Cancelled`].
    pub async fn read(
        &self,
        channel: &ChannelProducer,
        resume: Option<&InventoryPosition>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let table = unqualified(&self.metadata.name).to_string();
        if resume.is_some_and(|p| p.is_finished()) {
            tracing::debug!("Inventory split of {} already finished", table);
            channel
                .push(RowEvent::Finished {
                    position: Some(Position::Inventory(InventoryPosition::Finished)),
                })
                .await?;
            return Ok(0);
        }

        let condition = self.config.where_condition.as_deref();
        let integer_key = self.metadata.integer_key().is_some();

        let end = if integer_key {
            let key = &self.metadata.primary_keys[0];
            let (_, max) = self
                .source
                .key_range(&self.metadata.name, key, condition)
                .await?;
            max
        } else {
            None
        };

        let mut after: Option<Vec<Value>> = match (resume, integer_key) {
            (Some(InventoryPosition::IntegerRange { begin, .. }), true) => {
                tracing::info!("Resuming inventory of {} from key {}", table, begin);
                Some(vec![Value::Int(begin.saturating_sub(1))])
            }
            _ => None,
        };

        let mut emitted = 0u64;
        let mut last_position = None;
        loop {
            if cancel.is_cancelled() {
                channel.push(RowEvent::Finished { position: last_position }).await?;
                return Err(Error::Cancelled);
            }

            let rows = self
                .source
                .page(&self.metadata, condition, after.as_deref(), self.batch_size)
                .await?;
            let page_len = rows.len();

            for row in rows {
                let keys = self.metadata.key_values(&row);
                let position = match (keys.first().and_then(Value::as_i64), end) {
                    (Some(begin), Some(end)) if integer_key => {
                        InventoryPosition::IntegerRange { begin, end }
                    }
                    _ => InventoryPosition::Placeholder,
                };
                let position = Position::Inventory(position);
                last_position = Some(position.clone());
                after = Some(keys);
                channel
                    .push(RowEvent::Write {
                        table: table.clone(),
                        after: row,
                        position,
                    })
                    .await?;
                emitted += 1;
            }

            if page_len < self.batch_size {
                break;
            }
        }

        tracing::info!("Inventory of {} emitted {} rows", table, emitted);
        channel
            .push(RowEvent::Finished {
                position: Some(Position::Inventory(InventoryPosition::Finished)),
            })
            .await?;
        Ok(emitted)
    }
}

/// Divide `[min, max]` into at most `parts` contiguous inclusive ranges
fn split_range(min: i64, max: i64, parts: usize) -> Vec<(i64, i64)> {
    if max < min || parts <= 1 {
        return vec![(min, max)];
    }
    let span = (max as i128) - (min as i128) + 1;
    let parts = (parts as i128).min(span);
    let step = span / parts;
    let remainder = span % parts;

    let mut ranges = Vec::with_capacity(parts as usize);
    let mut begin = min as i128;
    for i in 0..parts {
        let len = step + if i < remainder { 1 } else { 0 };
        let end = begin + len - 1;
        ranges.push((begin as i64, end as i64));
        begin = end + 1;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, ChannelConsumer, ChannelOptions};
    use crate::config::Dialect;
    use crate::datasource::ColumnMetadata;
    use crate::job::{InventorySplit, JobItemProgress};
    use crate::record::Column;
    use std::time::Duration;

    /// Table held in memory, optionally cancelling a token after serving
    /// its first page
    struct MemoryTable {
        rows: Vec<Row>,
        cancel_after_page: Option<CancellationToken>,
    }

    impl MemoryTable {
        fn new(keys: std::ops::RangeInclusive<i64>) -> Self {
            let rows = keys
                .map(|k| {
                    Row::new(vec![
                        Column::new("order_id", Value::Int(k), true),
                        Column::new("user_id", Value::Int(k * 10), false),
                    ])
                })
                .collect();
            Self {
                rows,
                cancel_after_page: None,
            }
        }

        fn key(row: &Row) -> i64 {
            row.get("order_id").and_then(Value::as_i64).unwrap_or_default()
        }
    }

    #[async_trait]
    impl InventorySource for MemoryTable {
        fn sql(&self) -> SqlBuilder {
            SqlBuilder::new(Dialect::PostgreSql)
        }

        async fn key_range(
            &self,
            _table: &str,
            _key: &str,
            _condition: Option<&str>,
        ) -> Result<(Option<i64>, Option<i64>)> {
            Ok((
                self.rows.first().map(Self::key),
                self.rows.last().map(Self::key),
            ))
        }

        async fn page(
            &self,
            _metadata: &TableMetadata,
            _condition: Option<&str>,
            after: Option<&[Value]>,
            limit: usize,
        ) -> Result<Vec<Row>> {
            let after = after.and_then(|a| a.first()).and_then(Value::as_i64);
            let rows = self
                .rows
                .iter()
                .filter(|row| after.map_or(true, |a| Self::key(row) > a))
                .take(limit)
                .cloned()
                .collect();
            if let Some(cancel) = &self.cancel_after_page {
                cancel.cancel();
            }
            Ok(rows)
        }
    }

    fn metadata() -> TableMetadata {
        TableMetadata {
            name: "t_order".into(),
            columns: vec![
                ColumnMetadata::new("order_id", "bigint"),
                ColumnMetadata::new("user_id", "int"),
            ],
            primary_keys: vec!["order_id".into()],
        }
    }

    fn reader(table: MemoryTable) -> InventoryReader<MemoryTable> {
        let config = RdbmsConfiguration::new("postgres://src:5432/app").for_table("t_order");
        InventoryReader::new(table, config, metadata(), 3)
    }

    fn channel() -> (ChannelProducer, ChannelConsumer) {
        let (producer, mut consumers) = Channel::new(ChannelOptions {
            partitions: 1,
            capacity: 64,
            push_timeout: Duration::from_millis(200),
            pop_timeout: Duration::from_millis(50),
        });
        (producer, consumers.pop().unwrap())
    }

    /// Keys and acknowledgement numbers up to `Finished`, and its position
    async fn drain(consumer: &mut ChannelConsumer) -> (Vec<i64>, Vec<u64>, Option<Position>) {
        let mut keys = Vec::new();
        let mut seqs = Vec::new();
        while let Some(delivery) = consumer.pop().await.unwrap() {
            match delivery.event {
                RowEvent::Write { after, .. } => keys.push(MemoryTable::key(&after)),
                RowEvent::Finished { position } => return (keys, seqs, position),
                other => panic!("unexpected event {:?}", other),
            }
            seqs.extend(delivery.seq);
        }
        panic!("no Finished event");
    }

    #[tokio::test]
    async fn test_read_emits_every_row_in_key_order() {
        let (producer, mut consumer) = channel();
        let emitted = reader(MemoryTable::new(1..=7))
            .read(&producer, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(emitted, 7);
        let (keys, _, finished) = drain(&mut consumer).await;
        assert_eq!(keys, (1..=7).collect::<Vec<_>>());
        assert_eq!(
            finished,
            Some(Position::Inventory(InventoryPosition::Finished))
        );
    }

    #[tokio::test]
    async fn test_resume_starts_at_recorded_key() {
        let (producer, mut consumer) = channel();
        let resume = InventoryPosition::IntegerRange { begin: 6, end: 10 };
        let emitted = reader(MemoryTable::new(1..=10))
            .read(&producer, Some(&resume), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(emitted, 5);
        let (keys, _, _) = drain(&mut consumer).await;
        assert_eq!(keys, vec![6, 7, 8, 9, 10]);
    }

    #[tokio::test]
    async fn test_finished_split_is_not_read_again() {
        let (producer, mut consumer) = channel();
        let emitted = reader(MemoryTable::new(1..=10))
            .read(
                &producer,
                Some(&InventoryPosition::Finished),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(emitted, 0);
        let (keys, _, finished) = drain(&mut consumer).await;
        assert!(keys.is_empty());
        assert_eq!(
            finished,
            Some(Position::Inventory(InventoryPosition::Finished))
        );
    }

    #[tokio::test]
    async fn test_cancelled_read_drains_and_resumes_from_acked_key() {
        let cancel = CancellationToken::new();
        let mut table = MemoryTable::new(1..=10);
        table.cancel_after_page = Some(cancel.clone());
        let (producer, mut consumer) = channel();

        let result = reader(table).read(&producer, None, &cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));

        // Importers still see Finished and acknowledge what they applied
        let (keys, seqs, finished) = drain(&mut consumer).await;
        assert_eq!(keys, vec![1, 2, 3]);
        let last = Position::Inventory(InventoryPosition::IntegerRange { begin: 3, end: 10 });
        assert_eq!(finished, Some(last.clone()));
        consumer.ack(&seqs, keys.len() as u64);
        assert_eq!(producer.committed(), Some(last.clone()));
        assert_eq!(producer.acked_records(), 3);

        let mut item = JobItemProgress::new(0, "src:5432");
        item.inventory = vec![InventorySplit::new("t_order", None)];
        assert!(item.advance_inventory(0, last));
        let resume = item.inventory[0].inventory_position();

        let (producer, mut consumer) = channel();
        reader(MemoryTable::new(1..=10))
            .read(&producer, resume.as_ref(), &CancellationToken::new())
            .await
            .unwrap();
        let (keys, _, _) = drain(&mut consumer).await;
        assert_eq!(keys, (3..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_split_by_integer_key() {
        let splits = reader(MemoryTable::new(1..=10)).split(2).await.unwrap();
        assert_eq!(splits.len(), 2);
        assert_eq!(
            splits[0].where_condition.as_deref(),
            Some("\"order_id\" >= 1 AND \"order_id\" <= 5")
        );
        assert_eq!(
            splits[1].where_condition.as_deref(),
            Some("\"order_id\" >= 6 AND \"order_id\" <= 10")
        );
        assert_eq!(reader(MemoryTable::new(1..=10)).split(1).await.unwrap().len(), 1);
    }

    #[test]
    fn test_split_range_covers_without_overlap() {
        let ranges = split_range(1, 999, 3);
        assert_eq!(ranges, vec![(1, 333), (334, 666), (667, 999)]);

        let ranges = split_range(1, 10, 3);
        assert_eq!(ranges, vec![(1, 4), (5, 7), (8, 10)]);
    }

    #[test]
    fn test_split_range_fewer_keys_than_parts() {
        assert_eq!(split_range(5, 6, 4), vec![(5, 5), (6, 6)]);
        assert_eq!(split_range(7, 7, 3), vec![(7, 7)]);
    }

    #[test]
    fn test_split_range_extreme_bounds() {
        let ranges = split_range(i64::MIN, i64::MAX, 2);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].0, i64::MIN);
        assert_eq!(ranges[1].1, i64::MAX);
        assert_eq!(ranges[0].1 + 1, ranges[1].0);
    }

    #[test]
    fn test_split_range_single_part() {
        assert_eq!(split_range(1, 100, 1), vec![(1, 100)]);
    }
}
