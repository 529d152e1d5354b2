//! Job and job item progress records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::JobConfiguration;
use crate::error::{Error, Result};
use crate::position::{InventoryPosition, Position};

/// Lifecycle state of a job item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Preparing,
    Inventory,
    Incremental,
    ConsistencyCheck,
    Finished,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Preparing => "PREPARING",
            JobStatus::Inventory => "INVENTORY",
            JobStatus::Incremental => "INCREMENTAL",
            JobStatus::ConsistencyCheck => "CONSISTENCY_CHECK",
            JobStatus::Finished => "FINISHED",
            JobStatus::Failed => "FAILED",
            JobStatus::Stopped => "STOPPED",
        }
    }

    /// No further work happens in this state without an explicit restart
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed | JobStatus::Stopped)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Finished, _) => false,
            (_, Failed) => true,
            (Preparing, Inventory) => true,
            (Inventory, Incremental) => true,
            (Incremental, ConsistencyCheck) => true,
            (ConsistencyCheck, Finished) => true,
            (ConsistencyCheck, Incremental) => true,
            (Failed, _) => false,
            // Restarting a stopped item re-prepares it from its saved progress
            (Stopped, Preparing) => true,
            (Stopped, _) => false,
            (_, Stopped) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One inventory split of a table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventorySplit {
    pub table: String,
    /// Row filter selecting this split, combined with the source filter
    pub condition: Option<String>,
    /// Last acknowledged inventory position, `None` before the first ack
    pub position: Option<Position>,
}

impl InventorySplit {
    pub fn new(table: impl Into<String>, condition: Option<String>) -> Self {
        Self {
            table: table.into(),
            condition,
            position: None,
        }
    }

    pub fn inventory_position(&self) -> Option<InventoryPosition> {
        match &self.position {
            Some(Position::Inventory(p)) => Some(*p),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.inventory_position().is_some_and(|p| p.is_finished())
    }
}

/// Mutable progress of one job item, one per source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobItemProgress {
    pub item: usize,
    /// Source address without credentials
    pub data_source: String,
    pub status: JobStatus,
    pub inventory: Vec<InventorySplit>,
    /// Last acknowledged incremental position
    pub incremental_position: Option<Position>,
    pub processed_records: u64,
    /// Time of the last applied incremental event, in milliseconds
    pub incremental_last_event_ms: Option<i64>,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl JobItemProgress {
    pub fn new(item: usize, data_source: impl Into<String>) -> Self {
        Self {
            item,
            data_source: data_source.into(),
            status: JobStatus::Preparing,
            inventory: Vec::new(),
            incremental_position: None,
            processed_records: 0,
            incremental_last_event_ms: None,
            error_message: None,
            updated_at: Utc::now(),
        }
    }

    /// Move to `next`, rejecting transitions the state machine forbids
    pub fn transition(&mut self, job_id: &str, next: JobStatus) -> Result<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                job_id: format!("{}#{}", job_id, self.item),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error_message = Some(message.into());
        self.updated_at = Utc::now();
    }

    /// Record an acknowledged incremental position.
    ///
    /// Returns false and keeps the old value when `position` is not later
    /// than the one already recorded.
    pub fn advance_incremental(&mut self, position: Position) -> bool {
        let advances = match &self.incremental_position {
            None => true,
            Some(current) => position > *current,
        };
        if advances {
            self.incremental_position = Some(position);
            self.updated_at = Utc::now();
        }
        advances
    }

    /// Record an acknowledged position of one inventory split, never
    /// moving backwards
    pub fn advance_inventory(&mut self, split: usize, position: Position) -> bool {
        let Some(split) = self.inventory.get_mut(split) else {
            return false;
        };
        let advances = match &split.position {
            None => true,
            Some(current) => position > *current,
        };
        if advances {
            split.position = Some(position);
            self.updated_at = Utc::now();
        }
        advances
    }

    pub fn inventory_finished_percentage(&self) -> u8 {
        if self.inventory.is_empty() {
            return if self.status == JobStatus::Preparing { 0 } else { 100 };
        }
        let finished = self.inventory.iter().filter(|s| s.is_finished()).count();
        (finished * 100 / self.inventory.len()) as u8
    }

    /// Seconds since the last applied incremental event
    pub fn incremental_idle_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        self.incremental_last_event_ms
            .map(|at| ((now.timestamp_millis() - at).max(0)) / 1000)
    }
}

/// Persisted description of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: String,
    pub config: JobConfiguration,
    pub active: bool,
    pub create_time: DateTime<Utc>,
    pub stop_time: Option<DateTime<Utc>>,
}

impl JobInfo {
    pub fn new(id: impl Into<String>, config: JobConfiguration) -> Self {
        Self {
            id: id.into(),
            config,
            active: true,
            create_time: Utc::now(),
            stop_time: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::{BinlogPosition, WalPosition};

    #[test]
    fn test_state_machine() {
        let mut item = JobItemProgress::new(0, "db:5432");
        item.transition("j1", JobStatus::Inventory).unwrap();
        item.transition("j1", JobStatus::Incremental).unwrap();
        assert!(item.transition("j1", JobStatus::Preparing).is_err());
        item.transition("j1", JobStatus::ConsistencyCheck).unwrap();
        item.transition("j1", JobStatus::Finished).unwrap();
        assert!(matches!(
            item.transition("j1", JobStatus::Stopped),
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_failed_reachable_from_any_state() {
        for status in [
            JobStatus::Preparing,
            JobStatus::Inventory,
            JobStatus::Incremental,
            JobStatus::ConsistencyCheck,
        ] {
            assert!(status.can_transition_to(JobStatus::Failed));
            assert!(status.can_transition_to(JobStatus::Stopped));
        }
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Preparing));
    }

    #[test]
    fn test_stopped_restarts_through_preparing() {
        assert!(JobStatus::Stopped.can_transition_to(JobStatus::Preparing));
        assert!(!JobStatus::Stopped.can_transition_to(JobStatus::Incremental));
        assert!(!JobStatus::Stopped.can_transition_to(JobStatus::Inventory));

        let mut item = JobItemProgress::new(0, "db:5432");
        item.transition("j1", JobStatus::Inventory).unwrap();
        item.transition("j1", JobStatus::Incremental).unwrap();
        item.advance_incremental(Position::Wal(WalPosition(0x14EFDB8)));
        item.transition("j1", JobStatus::Stopped).unwrap();
        item.transition("j1", JobStatus::Preparing).unwrap();
        assert_eq!(
            item.incremental_position,
            Some(Position::Wal(WalPosition(0x14EFDB8)))
        );
    }

    #[test]
    fn test_incremental_position_is_monotonic() {
        let mut item = JobItemProgress::new(0, "db:5432");
        assert!(item.advance_incremental(Position::Wal(WalPosition(200))));
        assert!(!item.advance_incremental(Position::Wal(WalPosition(100))));
        assert!(!item.advance_incremental(Position::Wal(WalPosition(200))));
        assert_eq!(item.incremental_position, Some(Position::Wal(WalPosition(200))));

        let mut mysql = JobItemProgress::new(1, "db:3306");
        mysql.advance_incremental(Position::Binlog(BinlogPosition::new("mysql-bin.000002", 4)));
        assert!(!mysql.advance_incremental(Position::Binlog(BinlogPosition::new("mysql-bin.000001", 900))));
    }

    #[test]
    fn test_inventory_percentage() {
        let mut item = JobItemProgress::new(0, "db:3306");
        assert_eq!(item.inventory_finished_percentage(), 0);
        item.inventory = vec![
            InventorySplit::new("t_order", Some("`order_id` >= 1 AND `order_id` <= 500".into())),
            InventorySplit::new("t_order", Some("`order_id` >= 501 AND `order_id` <= 999".into())),
        ];
        assert!(item.advance_inventory(
            0,
            Position::Inventory(InventoryPosition::IntegerRange { begin: 10, end: 500 })
        ));
        assert_eq!(item.inventory_finished_percentage(), 0);
        item.advance_inventory(0, Position::Inventory(InventoryPosition::Finished));
        assert_eq!(item.inventory_finished_percentage(), 50);
        assert!(!item.advance_inventory(
            0,
            Position::Inventory(InventoryPosition::IntegerRange { begin: 20, end: 500 })
        ));
    }

    #[test]
    fn test_progress_serializes() {
        let mut item = JobItemProgress::new(2, "db:3306");
        item.incremental_position = Some(Position::Binlog(BinlogPosition::new("mysql-bin.000003", 1547)));
        item.inventory = vec![InventorySplit::new("t_order", None)];
        item.advance_inventory(0, Position::Inventory(InventoryPosition::Placeholder));

        let json = serde_json::to_string(&item).unwrap();
        assert!(json.contains("\"mysql-bin.000003:1547\""));
        assert!(json.contains("\"PREPARING\""));
        let back: JobItemProgress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn test_idle_seconds() {
        let mut item = JobItemProgress::new(0, "db");
        let now = Utc::now();
        assert_eq!(item.incremental_idle_seconds(now), None);
        item.incremental_last_event_ms = Some(now.timestamp_millis() - 5_500);
        assert_eq!(item.incremental_idle_seconds(now), Some(5));
    }
}
