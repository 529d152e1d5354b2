//! Binlog coordinates

use async_trait::async_trait;
use sqlx::{MySqlPool, Row as _};

use crate::config::Dialect;
use crate::datasource::DataSource;
use crate::dialect::PositionManager;
use crate::error::{Error, Result};
use crate::position::{BinlogPosition, Position};

pub(crate) fn mysql_pool(source: &DataSource) -> Result<&MySqlPool> {
    match source {
        DataSource::MySql(pool) => Ok(pool),
        other => Err(Error::Config(format!(
            "expected a mysql source, got {}",
            other.dialect()
        ))),
    }
}

/// Parse `major.minor` from a server version string such as `10.11.6-MariaDB`
fn parse_version(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.split(|c: char| !c.is_ascii_digit());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// Reads the current binlog coordinate. The server retains binlogs on its
/// own schedule, so there is nothing to create or release.
#[derive(Debug, Clone, Default)]
pub struct BinlogPositionManager;

impl BinlogPositionManager {
    pub fn new() -> Self {
        Self
    }

    async fn check_capability(&self, pool: &MySqlPool) -> Result<()> {
        let version: String = sqlx::query_scalar("SELECT CAST(VERSION() AS CHAR)")
            .fetch_one(pool)
            .await?;
        match parse_version(&version) {
            Some((major, minor)) if (major, minor) >= (5, 6) => {}
            _ => {
                return Err(Error::UnsupportedVersion {
                    dialect: Dialect::MySql.to_string(),
                    version,
                    reason: "row images with checksums require MySQL 5.6 or later".into(),
                });
            }
        }

        let row = sqlx::query(
            "SELECT CAST(@@global.log_bin AS CHAR) AS log_bin, \
             CAST(@@global.binlog_format AS CHAR) AS binlog_format, \
             CAST(@@global.binlog_row_image AS CHAR) AS binlog_row_image",
        )
        .fetch_one(pool)
        .await?;
        let log_bin: String = row.try_get("log_bin")?;
        let format: String = row.try_get("binlog_format")?;
        let row_image: String = row.try_get("binlog_row_image")?;

        if log_bin != "1" && !log_bin.eq_ignore_ascii_case("ON") {
            return Err(Error::Config("binary logging is disabled (log_bin)".into()));
        }
        if !format.eq_ignore_ascii_case("ROW") {
            return Err(Error::Config(format!(
                "binlog_format is {}, change data capture requires ROW",
                format
            )));
        }
        if !row_image.eq_ignore_ascii_case("FULL") {
            return Err(Error::Config(format!(
                "binlog_row_image is {}, change data capture requires FULL",
                row_image
            )));
        }
        Ok(())
    }

    async fn current_position(&self, pool: &MySqlPool) -> Result<BinlogPosition> {
        // Renamed in MySQL 8.4
        let row = match sqlx::query("SHOW MASTER STATUS").fetch_optional(pool).await {
            Ok(row) => row,
            Err(sqlx::Error::Database(e)) => {
                tracing::debug!("SHOW MASTER STATUS failed ({}), trying SHOW BINARY LOG STATUS", e);
                sqlx::query("SHOW BINARY LOG STATUS")
                    .fetch_optional(pool)
                    .await?
            }
            Err(e) => return Err(e.into()),
        };
        let row = row.ok_or_else(|| Error::Config("binary logging is disabled".into()))?;

        let file: String = row.try_get_unchecked(0)?;
        let position: u64 = row.try_get_unchecked(1)?;
        Ok(BinlogPosition::new(file, position))
    }
}

#[async_trait]
impl PositionManager for BinlogPositionManager {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }

    async fn init(&self, source: &DataSource, job_key: &str) -> Result<Position> {
        let pool = mysql_pool(source)?;
        self.check_capability(pool).await?;
        let position = self.current_position(pool).await?;
        tracing::info!("Incremental position for {} starts at {}", job_key, position);
        Ok(Position::Binlog(position))
    }

    async fn destroy(&self, _source: &DataSource, job_key: &str) -> Result<()> {
        tracing::debug!("Nothing to release for {}", job_key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("8.0.36"), Some((8, 0)));
        assert_eq!(parse_version("10.11.6-MariaDB-log"), Some((10, 11)));
        assert_eq!(parse_version("5.5.62-log"), Some((5, 5)));
        assert_eq!(parse_version("garbage"), None);
    }

    #[test]
    fn test_version_gate() {
        assert!(parse_version("5.5.62").unwrap() < (5, 6));
        assert!(parse_version("5.7.44").unwrap() >= (5, 6));
    }

    #[tokio::test]
    async fn test_destroy_is_noop() {
        let pool = sqlx::mysql::MySqlPoolOptions::new()
            .connect_lazy("mysql://localhost/unused")
            .unwrap();
        let source = DataSource::MySql(pool);
        let manager = BinlogPositionManager::new();
        manager.destroy(&source, "j1#0").await.unwrap();
        manager.destroy(&source, "j1#0").await.unwrap();
        assert!(matches!(
            manager.parse("mysql-bin.000003:1547").unwrap(),
            Position::Binlog(_)
        ));
    }
}
