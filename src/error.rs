//! WolfMigrate Error Types

use thiserror::Error;

/// Result type alias for WolfMigrate operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfMigrate error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Unsupported {dialect} version {version}: {reason}")]
    UnsupportedVersion {
        dialect: String,
        version: String,
        reason: String,
    },

    // Change log errors
    #[error("Decode error at {position}: {reason}")]
    Decode { position: String, reason: String },

    #[error("Invalid position '{0}'")]
    Position(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Apply failed on {table}: {reason}")]
    Apply { table: String, reason: String },

    #[error("Schema error: {0}")]
    Schema(String),

    // Pipeline errors
    #[error("Channel partition {partition} full after {timeout_ms}ms")]
    ChannelFull { partition: usize, timeout_ms: u64 },

    #[error("Channel closed")]
    ChannelClosed,

    // Network errors
    #[error("Connection failed to {address}: {reason}")]
    Connection { address: String, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    // Job errors
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job already exists: {0}")]
    JobAlreadyExists(String),

    #[error("Consistency check already running for job {0}")]
    CheckInProgress(String),

    #[error("Consistency check of job {job_id} failed: {reason}")]
    CheckFailed { job_id: String, reason: String },

    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: String,
        to: String,
    },

    // State errors
    #[error("State error: {0}")]
    State(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Connection { .. } | Error::Io(_) => true,
            Error::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }

    /// Check if this error must stop the job before it leaves PREPARING
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::ConfigParse(_) | Error::UnsupportedVersion { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let conn = Error::Connection {
            address: "127.0.0.1:3306".into(),
            reason: "reset by peer".into(),
        };
        assert!(conn.is_retryable());
        assert!(Error::Database(sqlx::Error::PoolTimedOut).is_retryable());

        let decode = Error::Decode {
            position: "0/16B3748".into(),
            reason: "bad timestamp".into(),
        };
        assert!(!decode.is_retryable());
        assert!(!Error::ChannelFull { partition: 0, timeout_ms: 10 }.is_retryable());
    }

    #[test]
    fn test_configuration_classification() {
        let err = Error::UnsupportedVersion {
            dialect: "postgresql".into(),
            version: "90600".into(),
            reason: "logical decoding requires 11 or later".into(),
        };
        assert!(err.is_configuration());
        assert!(!Error::Cancelled.is_configuration());
    }
}
