//! WolfMigrate - Online MySQL/PostgreSQL Data Migration
//!
//! Moves tables from one or more source databases into a target database
//! while the sources stay online. Each job copies existing rows in parallel
//! key-range splits, then replays changes captured from the source's log
//! (MySQL binlog or PostgreSQL logical replication) until the operator
//! commits it after a consistency check.
//!
//! # Architecture
//!
//! Readers push [`record::RowEvent`]s into a partitioned [`channel`]; importers
//! apply them to the target in transactions and acknowledge them. The
//! channel's watermark is the position persisted as job progress, so a
//! restarted job resumes from the last applied change.
//!
//! # Features
//!
//! - Parallel inventory copy with resumable key-range splits
//! - Binlog and pgoutput change capture with position retention
//! - Idempotent apply, so replays after a restart are safe
//! - Count and content consistency checks across sharded sources
//! - HTTP API and CLI for job control

pub mod config;
pub mod error;
pub mod record;
pub mod position;
pub mod channel;
pub mod datasource;
pub mod ingest;
pub mod dialect;
pub mod importer;
pub mod check;
pub mod job;
pub mod api;

pub use config::MigratorConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{JobConfiguration, MigratorConfig, RdbmsConfiguration};
    pub use crate::error::{Error, Result};
    pub use crate::job::{JobCoordinator, JobStatus, ProgressStore};
    pub use crate::position::Position;
    pub use crate::record::RowEvent;
}
