//! WolfMigrate Configuration
//!
//! This module provides configuration structures for the migration
//! service: node settings, pipeline tuning, and the job descriptors
//! that name source and target databases.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Main WolfMigrate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigratorConfig {
    /// Node-specific configuration
    #[serde(default)]
    pub node: NodeConfig,

    /// Pipeline tuning
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Jobs started by `wolfmigrate run`
    #[serde(default)]
    pub jobs: Vec<JobConfiguration>,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identifier, used in replication slot names
    #[serde(default = "default_node_id")]
    pub id: String,

    /// Data directory for progress storage
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Pipeline tuning shared by every job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Capacity of each channel partition
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// How long a producer may wait on a full partition before failing
    #[serde(default = "default_push_timeout_ms")]
    pub push_timeout_ms: u64,

    /// How long a consumer waits for an event before reporting "no data yet"
    #[serde(default = "default_pop_timeout_ms")]
    pub pop_timeout_ms: u64,

    /// Number of importer partitions per shard
    #[serde(default = "default_importer_concurrency")]
    pub importer_concurrency: usize,

    /// Rows per inventory page and events per importer transaction
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Attempts for transient apply and connection failures
    #[serde(default = "default_retry_times")]
    pub retry_times: u32,

    /// Delay between retries in milliseconds
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Interval between progress checkpoints in milliseconds
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// Maximum time to wait for importers to drain on stop
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Sleep between empty polls of a logical replication slot
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Rows compared per consistency-check chunk
    #[serde(default = "default_check_chunk_size")]
    pub check_chunk_size: usize,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Source database dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[serde(alias = "mariadb")]
    MySql,
    #[serde(alias = "postgres", alias = "openGauss")]
    PostgreSql,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::MySql => "mysql",
            Dialect::PostgreSql => "postgresql",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dialect {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(Dialect::MySql),
            "postgresql" | "postgres" | "opengauss" => Ok(Dialect::PostgreSql),
            other => Err(Error::Config(format!("unknown dialect '{}'", other))),
        }
    }
}

/// Connection descriptor for a source or target database.
///
/// Splitting a job clones this value and narrows `where_condition`, so each
/// split owns its own filtered copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RdbmsConfiguration {
    /// JDBC-style or native URL, e.g. `jdbc:mysql://host:3306/db`
    pub url: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Driver class name, informational only
    #[serde(default)]
    pub driver: Option<String>,

    /// Table this descriptor is scoped to
    #[serde(default)]
    pub table: Option<String>,

    /// Row filter applied to every read
    #[serde(default)]
    pub where_condition: Option<String>,

    /// Explicit dialect, overriding the URL scheme
    #[serde(default)]
    pub dialect: Option<Dialect>,
}

impl RdbmsConfiguration {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
            driver: None,
            table: None,
            where_condition: None,
            dialect: None,
        }
    }

    /// Resolve the dialect from the explicit setting or the URL scheme
    pub fn dialect(&self) -> Result<Dialect> {
        if let Some(dialect) = self.dialect {
            return Ok(dialect);
        }
        let url = self.url.strip_prefix("jdbc:").unwrap_or(&self.url);
        let scheme = url
            .split_once(':')
            .map(|(scheme, _)| scheme)
            .ok_or_else(|| Error::Config(format!("url '{}' has no scheme", self.url)))?;
        scheme.parse()
    }

    /// URL understood by the native driver.
    ///
    /// JDBC prefixes and JDBC-only query parameters are removed.
    pub fn connection_url(&self) -> Result<String> {
        let Some(stripped) = self.url.strip_prefix("jdbc:") else {
            return Ok(self.url.clone());
        };
        let base = stripped.split('?').next().unwrap_or(stripped);
        let base = match self.dialect()? {
            Dialect::PostgreSql => base.replacen("postgresql:", "postgres:", 1),
            Dialect::MySql => base.to_string(),
        };
        Ok(base)
    }

    /// Clone this descriptor scoped to `table`
    pub fn for_table(&self, table: &str) -> Self {
        let mut config = self.clone();
        config.table = Some(table.to_string());
        config
    }

    /// Clone this descriptor with an additional row filter
    pub fn with_condition(&self, condition: String) -> Self {
        let mut config = self.clone();
        config.where_condition = Some(match &self.where_condition {
            Some(existing) => format!("({}) AND ({})", existing, condition),
            None => condition,
        });
        config
    }

    /// Host portion of the URL, for log messages without credentials
    pub fn display_address(&self) -> String {
        let url = self.url.strip_prefix("jdbc:").unwrap_or(&self.url);
        let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
        let rest = rest.rsplit_once('@').map(|(_, host)| host).unwrap_or(rest);
        rest.split(['/', '?']).next().unwrap_or(rest).to_string()
    }
}

/// Describes one migration job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfiguration {
    /// Job identifier, generated when absent
    #[serde(default)]
    pub id: Option<String>,

    /// Source data sources; each becomes one job item
    pub sources: Vec<RdbmsConfiguration>,

    /// Target data source
    pub target: RdbmsConfiguration,

    /// Logical tables migrated by this job
    pub tables: Vec<String>,

    /// Number of inventory splits per table
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Dialect of the sources, derived from their URLs when absent
    #[serde(default)]
    pub dialect: Option<Dialect>,
}

impl JobConfiguration {
    /// Dialect shared by all sources
    pub fn source_dialect(&self) -> Result<Dialect> {
        if let Some(dialect) = self.dialect {
            return Ok(dialect);
        }
        let mut resolved = None;
        for source in &self.sources {
            let dialect = source.dialect()?;
            match resolved {
                None => resolved = Some(dialect),
                Some(existing) if existing != dialect => {
                    return Err(Error::Config(format!(
                        "job mixes {} and {} sources",
                        existing, dialect
                    )));
                }
                Some(_) => {}
            }
        }
        resolved.ok_or_else(|| Error::Config("job has no sources".into()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(Error::Config("job must name at least one source".into()));
        }
        if self.tables.is_empty() {
            return Err(Error::Config("job must name at least one table".into()));
        }
        if self.concurrency == 0 {
            return Err(Error::Config("job concurrency must be at least 1".into()));
        }
        for table in &self.tables {
            if table.is_empty() || table.contains(['`', '"', ';']) {
                return Err(Error::Config(format!("invalid table name '{}'", table)));
            }
        }
        self.source_dialect()?;
        self.target.dialect()?;
        Ok(())
    }
}

// Default value functions
fn default_node_id() -> String {
    "node1".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfmigrate")
}

fn default_channel_capacity() -> usize {
    1000
}

fn default_push_timeout_ms() -> u64 {
    30_000
}

fn default_pop_timeout_ms() -> u64 {
    1000
}

fn default_importer_concurrency() -> usize {
    3
}

fn default_batch_size() -> usize {
    1000
}

fn default_retry_times() -> u32 {
    3
}

fn default_retry_interval_ms() -> u64 {
    1000
}

fn default_progress_interval_ms() -> u64 {
    1000
}

fn default_drain_timeout_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_check_chunk_size() -> usize {
    1000
}

fn default_concurrency() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            push_timeout_ms: default_push_timeout_ms(),
            pop_timeout_ms: default_pop_timeout_ms(),
            importer_concurrency: default_importer_concurrency(),
            batch_size: default_batch_size(),
            retry_times: default_retry_times(),
            retry_interval_ms: default_retry_interval_ms(),
            progress_interval_ms: default_progress_interval_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            check_chunk_size: default_check_chunk_size(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl PipelineConfig {
    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl MigratorConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: MigratorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.node.id.is_empty() {
            return Err(Error::Config("node.id cannot be empty".into()));
        }
        if !self
            .node
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(Error::Config(
                "node.id may only contain letters, digits and underscores".into(),
            ));
        }

        let p = &self.pipeline;
        if p.channel_capacity == 0 {
            return Err(Error::Config("pipeline.channel_capacity must be at least 1".into()));
        }
        if p.push_timeout_ms == 0 {
            return Err(Error::Config("pipeline.push_timeout_ms must be finite and non-zero".into()));
        }
        if p.importer_concurrency == 0 {
            return Err(Error::Config("pipeline.importer_concurrency must be at least 1".into()));
        }
        if p.batch_size == 0 || p.check_chunk_size == 0 {
            return Err(Error::Config("pipeline batch sizes must be at least 1".into()));
        }

        for job in &self.jobs {
            job.validate()?;
        }

        Ok(())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Path of the SQLite progress store
    pub fn progress_db_path(&self) -> PathBuf {
        self.node.data_dir.join("progress.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "node1"
data_dir = "/tmp/wolfmigrate"

[pipeline]
channel_capacity = 500
importer_concurrency = 2

[[jobs]]
tables = ["t_order"]
concurrency = 2

[[jobs.sources]]
url = "jdbc:mysql://127.0.0.1:3306/ds_0?useSSL=false"
username = "root"
password = "root"

[jobs.target]
url = "mysql://127.0.0.1:3307/ds_target"
username = "root"
"#;

        let config = MigratorConfig::from_str(toml).unwrap();
        assert_eq!(config.node.id, "node1");
        assert_eq!(config.pipeline.channel_capacity, 500);
        assert_eq!(config.pipeline.push_timeout_ms, 30_000);
        assert_eq!(config.jobs.len(), 1);

        let job = &config.jobs[0];
        assert_eq!(job.source_dialect().unwrap(), Dialect::MySql);
        assert_eq!(
            job.sources[0].connection_url().unwrap(),
            "mysql://127.0.0.1:3306/ds_0"
        );
        assert_eq!(job.sources[0].display_address(), "127.0.0.1:3306");
    }

    #[test]
    fn test_dialect_from_url() {
        let pg = RdbmsConfiguration::new("jdbc:postgresql://db:5432/app");
        assert_eq!(pg.dialect().unwrap(), Dialect::PostgreSql);
        assert_eq!(pg.connection_url().unwrap(), "postgres://db:5432/app");

        let native = RdbmsConfiguration::new("postgres://u:p@db/app");
        assert_eq!(native.dialect().unwrap(), Dialect::PostgreSql);
        assert_eq!(native.display_address(), "db");

        let unknown = RdbmsConfiguration::new("jdbc:oracle:thin:@db:1521");
        assert!(unknown.dialect().is_err());
    }

    #[test]
    fn test_with_condition_composes() {
        let mut base = RdbmsConfiguration::new("mysql://db/app");
        base.where_condition = Some("status = 1".into());
        let split = base.with_condition("order_id >= 1 AND order_id <= 10".into());
        assert_eq!(
            split.where_condition.as_deref(),
            Some("(status = 1) AND (order_id >= 1 AND order_id <= 10)")
        );
        assert_eq!(base.where_condition.as_deref(), Some("status = 1"));
    }

    #[test]
    fn test_mixed_dialects_rejected() {
        let job = JobConfiguration {
            id: None,
            sources: vec![
                RdbmsConfiguration::new("mysql://a/db"),
                RdbmsConfiguration::new("postgres://b/db"),
            ],
            target: RdbmsConfiguration::new("mysql://c/db"),
            tables: vec!["t_order".into()],
            concurrency: 1,
            dialect: None,
        };
        assert!(matches!(job.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_push_timeout_rejected() {
        let toml = r#"
[pipeline]
push_timeout_ms = 0
"#;
        assert!(MigratorConfig::from_str(toml).is_err());
    }
}
