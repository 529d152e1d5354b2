//! Dialect Strategies
//!
//! Each supported source dialect provides a [`PositionManager`], a
//! [`LogDecoder`] and an incremental reader. The [`DialectRegistry`] is built
//! once at startup and handed to the job coordinator.

pub mod mysql;
pub mod postgres;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Dialect;
use crate::datasource::DataSource;
use crate::error::{Error, Result};
use crate::ingest::{IncrementalContext, IncrementalReader};
use crate::position::Position;
use crate::record::RowEvent;

/// Creates, resumes and releases incremental positions
#[async_trait]
pub trait PositionManager: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Capture the current log offset and retain the log from it.
    ///
    /// Reading the offset and establishing retention happen in one step.
    /// A source below the supported version fails with a configuration
    /// error.
    async fn init(&self, source: &DataSource, job_key: &str) -> Result<Position>;

    /// Release retention. Calling it when nothing is retained is a no-op.
    async fn destroy(&self, source: &DataSource, job_key: &str) -> Result<()>;

    /// Resume from a persisted position, or initialize a fresh one
    async fn init_or_resume(
        &self,
        persisted: Option<&Position>,
        source: &DataSource,
        job_key: &str,
    ) -> Result<Position> {
        if let Some(position) = persisted.filter(|p| !p.is_inventory()) {
            tracing::info!("Resuming {} from persisted position {}", job_key, position);
            return Ok(position.clone());
        }
        self.init(source, job_key).await
    }

    /// Parse a persisted position string
    fn parse(&self, s: &str) -> Result<Position> {
        Position::parse_for(self.dialect(), s)
    }
}

/// Turns raw log entries into row events
pub trait LogDecoder: Send {
    type Entry;

    /// Decode one entry read at `position`.
    ///
    /// Unrecognized entries become `Placeholder`; a recognized entry with a
    /// malformed value is an error.
    fn decode(&mut self, entry: Self::Entry, position: &Position) -> Result<Vec<RowEvent>>;
}

/// Strategy object bundling a dialect's components
pub trait DialectHandler: Send + Sync {
    fn dialect(&self) -> Dialect;

    fn position_manager(&self) -> Arc<dyn PositionManager>;

    fn incremental_reader(&self, context: IncrementalContext) -> Box<dyn IncrementalReader>;
}

/// Dialect handlers keyed by dialect
#[derive(Clone, Default)]
pub struct DialectRegistry {
    handlers: HashMap<Dialect, Arc<dyn DialectHandler>>,
}

impl DialectRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the MySQL and PostgreSQL handlers
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(mysql::MySqlDialect::new()));
        registry.register(Arc::new(postgres::PostgresDialect::new()));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn DialectHandler>) {
        self.handlers.insert(handler.dialect(), handler);
    }

    pub fn get(&self, dialect: Dialect) -> Result<Arc<dyn DialectHandler>> {
        self.handlers
            .get(&dialect)
            .cloned()
            .ok_or_else(|| Error::Config(format!("no handler registered for {}", dialect)))
    }

    pub fn dialects(&self) -> Vec<Dialect> {
        self.handlers.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_defaults() {
        let registry = DialectRegistry::with_defaults();
        assert_eq!(registry.get(Dialect::MySql).unwrap().dialect(), Dialect::MySql);
        assert_eq!(
            registry.get(Dialect::PostgreSql).unwrap().dialect(),
            Dialect::PostgreSql
        );
        assert_eq!(registry.dialects().len(), 2);
    }

    #[test]
    fn test_empty_registry_rejects_lookup() {
        let registry = DialectRegistry::new();
        assert!(matches!(registry.get(Dialect::MySql), Err(Error::Config(_))));
    }

    #[test]
    fn test_position_manager_parses_own_format() {
        let registry = DialectRegistry::with_defaults();
        let pg = registry.get(Dialect::PostgreSql).unwrap().position_manager();
        assert_eq!(pg.parse("0/14EFDB8").unwrap().to_string(), "0/14EFDB8");
        assert!(pg.parse("mysql-bin.000001:4").is_err());

        let my = registry.get(Dialect::MySql).unwrap().position_manager();
        assert_eq!(
            my.parse("mysql-bin.000001:4").unwrap().to_string(),
            "mysql-bin.000001:4"
        );
    }
}
