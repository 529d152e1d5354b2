//! Replication slot management

use async_trait::async_trait;
use sqlx::PgPool;

use crate::config::Dialect;
use crate::datasource::DataSource;
use crate::dialect::PositionManager;
use crate::error::{Error, Result};
use crate::position::{Position, WalPosition};

/// Maximum length for a replication slot name in bytes
const MAX_SLOT_NAME_LENGTH: usize = 63;

const SLOT_PREFIX: &str = "wm_";

/// Output plugin used by every slot this crate creates
pub const DECODING_PLUGIN: &str = "test_decoding";

/// `pg_replication_slot_advance` arrived in PostgreSQL 11
const MIN_SERVER_VERSION: i32 = 110000;

/// Replication slot name for a job item.
///
/// Slot names may only contain lower-case letters, digits and underscores.
/// Names that would exceed the server limit are truncated and suffixed with
/// a checksum of the full key so they stay unique.
pub fn slot_name(job_key: &str) -> String {
    let sanitized: String = job_key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    let name = format!("{}{}", SLOT_PREFIX, sanitized);
    if name.len() <= MAX_SLOT_NAME_LENGTH {
        return name;
    }
    let suffix = format!("_{:08x}", crc32fast::hash(job_key.as_bytes()));
    let keep = MAX_SLOT_NAME_LENGTH - suffix.len();
    format!("{}{}", &name[..keep], suffix)
}

pub(crate) fn pg_pool(source: &DataSource) -> Result<&PgPool> {
    match source {
        DataSource::Postgres(pool) => Ok(pool),
        other => Err(Error::Config(format!(
            "expected a postgresql source, got {}",
            other.dialect()
        ))),
    }
}

/// Creates and drops logical replication slots
#[derive(Debug, Clone, Default)]
pub struct WalPositionManager;

impl WalPositionManager {
    pub fn new() -> Self {
        Self
    }

    async fn check_capability(&self, pool: &PgPool) -> Result<()> {
        let version: i32 =
            sqlx::query_scalar("SELECT current_setting('server_version_num')::int4")
                .fetch_one(pool)
                .await?;
        if version < MIN_SERVER_VERSION {
            return Err(Error::UnsupportedVersion {
                dialect: Dialect::PostgreSql.to_string(),
                version: version.to_string(),
                reason: "logical slot advancing requires PostgreSQL 11 or later".into(),
            });
        }

        let wal_level: String = sqlx::query_scalar("SELECT current_setting('wal_level')")
            .fetch_one(pool)
            .await?;
        if wal_level != "logical" {
            return Err(Error::Config(format!(
                "wal_level is '{}', logical decoding requires 'logical'",
                wal_level
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PositionManager for WalPositionManager {
    fn dialect(&self) -> Dialect {
        Dialect::PostgreSql
    }

    async fn init(&self, source: &DataSource, job_key: &str) -> Result<Position> {
        let pool = pg_pool(source)?;
        self.check_capability(pool).await?;
        let slot = slot_name(job_key);

        let existing: Option<(String, Option<String>)> = sqlx::query_as(
            "SELECT plugin::text, confirmed_flush_lsn::text FROM pg_replication_slots \
             WHERE slot_name = $1",
        )
        .bind(&slot)
        .fetch_optional(pool)
        .await?;

        let lsn = match existing {
            Some((plugin, _)) if plugin != DECODING_PLUGIN => {
                return Err(Error::Config(format!(
                    "slot {} uses plugin {}, expected {}",
                    slot, plugin, DECODING_PLUGIN
                )));
            }
            Some((_, Some(lsn))) => {
                tracing::info!("Reusing replication slot {} at {}", slot, lsn);
                lsn
            }
            Some((_, None)) => {
                return Err(Error::State(format!(
                    "slot {} has no confirmed flush position",
                    slot
                )));
            }
            None => {
                // Slot creation captures the consistent point it reports.
                let lsn: String = sqlx::query_scalar(
                    "SELECT lsn::text FROM pg_create_logical_replication_slot($1, $2)",
                )
                .bind(&slot)
                .bind(DECODING_PLUGIN)
                .fetch_one(pool)
                .await?;
                tracing::info!("Created replication slot {} at {}", slot, lsn);
                lsn
            }
        };

        Ok(Position::Wal(lsn.parse::<WalPosition>()?))
    }

    async fn destroy(&self, source: &DataSource, job_key: &str) -> Result<()> {
        let pool = pg_pool(source)?;
        let slot = slot_name(job_key);
        let dropped = sqlx::query(
            "SELECT pg_drop_replication_slot(slot_name) FROM pg_replication_slots \
             WHERE slot_name = $1",
        )
        .bind(&slot)
        .execute(pool)
        .await?
        .rows_affected();
        if dropped > 0 {
            tracing::info!("Dropped replication slot {}", slot);
        } else {
            tracing::debug!("Replication slot {} does not exist", slot);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_name_sanitized() {
        assert_eq!(slot_name("j0102-Orders#0"), "wm_j0102_orders_0");
    }

    #[test]
    fn test_long_slot_name_truncated_and_unique() {
        let a = slot_name(&format!("{}#0", "x".repeat(100)));
        let b = slot_name(&format!("{}#1", "x".repeat(100)));
        assert_eq!(a.len(), MAX_SLOT_NAME_LENGTH);
        assert_eq!(b.len(), MAX_SLOT_NAME_LENGTH);
        assert_ne!(a, b);
        assert!(a.starts_with("wm_xxx"));
    }

    #[test]
    fn test_slot_name_stable() {
        assert_eq!(slot_name("job#3"), slot_name("job#3"));
    }
}
