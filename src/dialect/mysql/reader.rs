//! Binlog tailing over a replica connection
//!
//! The reader registers as a replica and streams events from the requested
//! coordinate. After a connection loss it reconnects from the start of the
//! transaction in progress, so every row event is delivered at least once.

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::channel::ChannelProducer;
use crate::dialect::LogDecoder;
use crate::error::{Error, Result};
use crate::ingest::{IncrementalContext, IncrementalReader};
use crate::position::{BinlogPosition, Position};
use crate::record::RowEvent;

use super::client::{server_id_for, BinlogClient, ConnectParams};
use super::decoder::{BinlogDecoder, BinlogEntry};
use super::event::{parse_event, BinlogEvent};
use super::position::mysql_pool;

/// Tails the binlog of a MySQL or MariaDB source
pub struct BinlogIncrementalReader {
    context: IncrementalContext,
    decoder: BinlogDecoder,
    server_id: u32,
}

impl BinlogIncrementalReader {
    pub fn new(context: IncrementalContext) -> Self {
        let decoder = BinlogDecoder::new(context.table_filter());
        let server_id = server_id_for(&context.job_key);
        Self {
            context,
            decoder,
            server_id,
        }
    }

    async fn checksum_enabled(&self) -> Result<bool> {
        let pool = mysql_pool(&self.context.source)?;
        let checksum: std::result::Result<Option<String>, sqlx::Error> =
            sqlx::query_scalar("SELECT CAST(@@global.binlog_checksum AS CHAR)")
                .fetch_one(pool)
                .await;
        match checksum {
            Ok(value) => Ok(value.is_some_and(|v| !v.eq_ignore_ascii_case("NONE"))),
            // Servers before 5.6 have no checksums
            Err(sqlx::Error::Database(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn open(&self, from: &BinlogPosition, checksum: bool) -> Result<BinlogClient> {
        let params = ConnectParams::from_config(&self.context.source_config)?;
        let mut client = BinlogClient::connect(&params).await?;
        client.prepare(checksum).await?;
        client.register_slave(self.server_id).await?;
        client.binlog_dump(from, self.server_id).await?;
        tracing::info!(
            "Streaming binlog from {} at {} as server_id {}",
            params.address(),
            from,
            self.server_id
        );
        Ok(client)
    }

    /// Load metadata for a mapped table the first time it is seen
    async fn ensure_metadata(&mut self, event: &BinlogEvent) -> Result<()> {
        let BinlogEvent::TableMap(map) = event else {
            return Ok(());
        };
        if !self.decoder.needs_metadata(map) {
            return Ok(());
        }
        let qualified = format!("{}.{}", map.database, map.table);
        let metadata = self.context.source.table_metadata(&qualified).await?;
        tracing::debug!(
            "Loaded metadata for {} ({} columns)",
            qualified,
            metadata.columns.len()
        );
        self.decoder.register_metadata(map.table.clone(), metadata);
        Ok(())
    }

    /// Decode one raw event, advancing `file` and `resume`
    async fn handle(
        &mut self,
        raw: &[u8],
        file: &mut String,
        resume: &mut BinlogPosition,
    ) -> Result<Vec<RowEvent>> {
        let (header, event) = parse_event(raw).map_err(|reason| Error::Decode {
            position: BinlogPosition::new(file.clone(), 0).to_string(),
            reason,
        })?;
        let position = Position::Binlog(BinlogPosition::new(
            file.clone(),
            header.start_position(),
        ));

        self.ensure_metadata(&event).await?;
        if let BinlogEvent::Query { query, .. } = &event {
            self.invalidate_on_ddl(query);
        }
        let rotate = match &event {
            BinlogEvent::Rotate {
                next_file,
                position,
            } => Some(BinlogPosition::new(next_file.clone(), *position)),
            _ => None,
        };

        let events = self.decoder.decode(BinlogEntry { header, event }, &position)?;

        if let Some(rotate) = rotate {
            tracing::debug!("Binlog rotate to {}", rotate);
            *file = rotate.file_name.clone();
            *resume = rotate;
        } else if !self.decoder.in_transaction() && header.next_position > 0 {
            // Artificial events carry no offset
            *resume = BinlogPosition::new(file.clone(), header.next_position as u64);
        }
        Ok(events)
    }

    fn invalidate_on_ddl(&mut self, query: &str) {
        let statement = query.trim_start().to_ascii_uppercase();
        if !(statement.starts_with("ALTER TABLE")
            || statement.starts_with("DROP TABLE")
            || statement.starts_with("RENAME TABLE")
            || statement.starts_with("TRUNCATE"))
        {
            return;
        }
        for table in self.context.tables.clone() {
            let name = crate::ingest::unqualified(&table).to_string();
            if statement.contains(&name.to_ascii_uppercase()) {
                tracing::info!("Schema change on {}, reloading metadata", name);
                self.decoder.invalidate_metadata(&name);
            }
        }
    }

    /// Stream until cancelled or the connection fails
    async fn stream(
        &mut self,
        client: &mut BinlogClient,
        channel: &ChannelProducer,
        cancel: &CancellationToken,
        file: &mut String,
        resume: &mut BinlogPosition,
    ) -> Result<()> {
        loop {
            let raw = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                raw = client.next_event() => raw?,
            };
            let Some(raw) = raw else {
                return Err(Error::Connection {
                    address: self.context.source_config.display_address(),
                    reason: "binlog stream ended".into(),
                });
            };
            let events = self.handle(&raw, file, resume).await?;
            if !events.is_empty() {
                channel.push_all(events).await?;
            }
        }
    }
}

#[async_trait]
impl IncrementalReader for BinlogIncrementalReader {
    async fn start(
        &mut self,
        from: Position,
        channel: &ChannelProducer,
        cancel: CancellationToken,
    ) -> Result<()> {
        let from = from
            .as_binlog()
            .cloned()
            .ok_or_else(|| Error::Position(from.to_string()))?;
        let pipeline = self.context.pipeline.clone();
        let checksum = self.checksum_enabled().await?;

        let mut resume = from;
        let mut failures = 0u32;

        while !cancel.is_cancelled() {
            let mut file = resume.file_name.clone();
            self.decoder.reset();

            let result = match self.open(&resume, checksum).await {
                Ok(mut client) => {
                    let started = resume.clone();
                    let result = self
                        .stream(&mut client, channel, &cancel, &mut file, &mut resume)
                        .await;
                    if resume != started {
                        failures = 0;
                    }
                    result
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => break,
                Err(e) if e.is_retryable() && failures < pipeline.retry_times => {
                    failures += 1;
                    tracing::warn!(
                        "Binlog connection lost (attempt {}/{}), resuming from {}: {}",
                        failures,
                        pipeline.retry_times,
                        resume,
                        e
                    );
                    sleep_or_cancel(pipeline.retry_interval(), &cancel).await;
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!("Stopped binlog reader at {}", resume);
        channel
            .push(RowEvent::Finished {
                position: Some(Position::Binlog(resume)),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PipelineConfig, RdbmsConfiguration};
    use crate::datasource::{ColumnMetadata, DataSource, TableMetadata};
    use crate::dialect::mysql::event::event_type;
    use crate::dialect::mysql::event::tests::{raw_event, t_order_map_payload};
    use sqlx::mysql::MySqlPoolOptions;

    fn reader() -> BinlogIncrementalReader {
        let pool = MySqlPoolOptions::new()
            .connect_lazy("mysql://localhost/unused")
            .unwrap();
        let mut reader = BinlogIncrementalReader::new(IncrementalContext {
            job_key: "j1#0".into(),
            source: DataSource::MySql(pool),
            source_config: RdbmsConfiguration::new("mysql://localhost/shop"),
            tables: vec!["shop.t_order".into()],
            pipeline: PipelineConfig::default(),
        });
        reader.decoder.register_metadata(
            "t_order",
            TableMetadata {
                name: "shop.t_order".into(),
                columns: vec![
                    ColumnMetadata::new("order_id", "bigint"),
                    ColumnMetadata::new("user_id", "int"),
                    ColumnMetadata::new("note", "varchar"),
                ],
                primary_keys: vec!["order_id".into()],
            },
        );
        reader
    }

    fn write_rows(next_position: u32) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&42u64.to_le_bytes()[..6]);
        p.extend_from_slice(&0u16.to_le_bytes());
        p.extend_from_slice(&2u16.to_le_bytes());
        p.push(3);
        p.push(0b111);
        p.push(0b100);
        p.extend_from_slice(&1i64.to_le_bytes());
        p.extend_from_slice(&10i32.to_le_bytes());
        raw_event(event_type::WRITE_ROWS_EVENT, next_position, &p)
    }

    #[tokio::test]
    async fn test_resume_stays_at_transaction_start() {
        let mut reader = reader();
        let mut file = "mysql-bin.000003".to_string();
        let mut resume = BinlogPosition::new("mysql-bin.000003", 100);

        let gtid = raw_event(event_type::GTID_LOG_EVENT, 165, &[0u8; 46]);
        reader.handle(&gtid, &mut file, &mut resume).await.unwrap();
        let map = raw_event(event_type::TABLE_MAP_EVENT, 220, &t_order_map_payload(42));
        reader.handle(&map, &mut file, &mut resume).await.unwrap();
        let events = reader.handle(&write_rows(270), &mut file, &mut resume).await.unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].position(),
            Some(&Position::Binlog(BinlogPosition::new("mysql-bin.000003", 100)))
        );
        assert_eq!(resume.position, 100);

        let xid = raw_event(event_type::XID_EVENT, 301, &9u64.to_le_bytes());
        let events = reader.handle(&xid, &mut file, &mut resume).await.unwrap();
        assert!(matches!(events[0], RowEvent::Placeholder { .. }));
        assert_eq!(resume.position, 301);
    }

    #[tokio::test]
    async fn test_rotate_switches_file() {
        let mut reader = reader();
        let mut file = "mysql-bin.000003".to_string();
        let mut resume = BinlogPosition::new("mysql-bin.000003", 500);

        let mut payload = 4u64.to_le_bytes().to_vec();
        payload.extend_from_slice(b"mysql-bin.000004");
        let rotate = raw_event(event_type::ROTATE_EVENT, 0, &payload);
        reader.handle(&rotate, &mut file, &mut resume).await.unwrap();
        assert_eq!(file, "mysql-bin.000004");
        assert_eq!(resume, BinlogPosition::new("mysql-bin.000004", 4));

        // Artificial format description after a rotate keeps the offset
        let mut fde = 4u16.to_le_bytes().to_vec();
        fde.extend_from_slice(&[0u8; 60]);
        reader
            .handle(&raw_event(event_type::FORMAT_DESCRIPTION_EVENT, 0, &fde), &mut file, &mut resume)
            .await
            .unwrap();
        assert_eq!(resume.position, 4);
    }

    #[tokio::test]
    async fn test_ddl_invalidates_metadata() {
        let mut reader = reader();
        reader.invalidate_on_ddl("ALTER TABLE t_order ADD COLUMN c INT");
        let mut file = "mysql-bin.000003".to_string();
        let mut resume = BinlogPosition::new("mysql-bin.000003", 100);
        let map = raw_event(event_type::TABLE_MAP_EVENT, 220, &t_order_map_payload(42));
        let (_, event) = parse_event(&map).unwrap();
        let BinlogEvent::TableMap(table_map) = event else {
            panic!("expected table map");
        };
        assert!(reader.decoder.needs_metadata(&table_map));
        assert!(reader.handle(&[0u8; 5], &mut file, &mut resume).await.is_err());
    }
}
