//! Read-only projections served by the status surface

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::check::CheckProgress;

use super::progress::{JobInfo, JobItemProgress};

fn format_time(time: &DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

/// Row of the job list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobListInfo {
    pub id: String,
    pub tables: String,
    pub job_item_count: usize,
    pub active: bool,
    pub create_time: String,
    pub stop_time: Option<String>,
}

impl JobListInfo {
    pub fn from_job(job: &JobInfo) -> Self {
        Self {
            id: job.id.clone(),
            tables: job.config.tables.join(","),
            job_item_count: job.config.sources.len(),
            active: job.active,
            create_time: format_time(&job.create_time),
            stop_time: job.stop_time.as_ref().map(format_time),
        }
    }
}

/// Row of a job's item status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobItemInfo {
    pub item: usize,
    pub data_source: String,
    pub tables: String,
    pub status: String,
    pub active: bool,
    pub processed_records_count: u64,
    pub inventory_finished_percentage: u8,
    pub incremental_idle_seconds: Option<i64>,
    pub error_message: Option<String>,
}

impl JobItemInfo {
    pub fn from_progress(job: &JobInfo, progress: &JobItemProgress, now: DateTime<Utc>) -> Self {
        Self {
            item: progress.item,
            data_source: progress.data_source.clone(),
            tables: job.config.tables.join(","),
            status: progress.status.to_string(),
            active: job.active && !progress.status.is_terminal(),
            processed_records_count: progress.processed_records,
            inventory_finished_percentage: progress.inventory_finished_percentage(),
            incremental_idle_seconds: progress.incremental_idle_seconds(now),
            error_message: progress.error_message.clone(),
        }
    }
}

/// Status of the latest consistency check of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckStatusInfo {
    pub tables: String,
    /// `None` while the check is running
    pub result: Option<bool>,
    pub check_failed_tables: String,
    pub finished_percentage: u8,
    pub remaining_seconds: u64,
    pub check_begin_time: String,
    pub check_end_time: Option<String>,
    pub duration_seconds: u64,
    pub error_message: Option<String>,
}

impl CheckStatusInfo {
    pub fn from_progress(progress: &CheckProgress, now: DateTime<Utc>) -> Self {
        Self {
            tables: progress.tables.join(","),
            result: progress.is_finished().then(|| progress.is_matched()),
            check_failed_tables: progress.failed_tables().join(","),
            finished_percentage: progress.finished_percentage(),
            remaining_seconds: progress.remaining_seconds(now),
            check_begin_time: format_time(&progress.begin_time),
            check_end_time: progress.end_time.as_ref().map(format_time),
            duration_seconds: progress.duration_seconds(now),
            error_message: progress.error_message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::{ConsistencyCheckResult, ContentCheckResult, CountCheckResult};
    use crate::config::{JobConfiguration, RdbmsConfiguration};
    use crate::job::progress::{InventorySplit, JobStatus};
    use crate::position::{InventoryPosition, Position};
    use chrono::TimeZone;

    fn job() -> JobInfo {
        let mut job = JobInfo::new(
            "j1",
            JobConfiguration {
                id: None,
                sources: vec![
                    RdbmsConfiguration::new("mysql://a/ds_0"),
                    RdbmsConfiguration::new("mysql://b/ds_1"),
                ],
                target: RdbmsConfiguration::new("mysql://c/ds"),
                tables: vec!["t_order".into(), "t_order_item".into()],
                concurrency: 1,
                dialect: None,
            },
        );
        job.create_time = Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap();
        job
    }

    #[test]
    fn test_job_list_row() {
        let info = JobListInfo::from_job(&job());
        assert_eq!(info.tables, "t_order,t_order_item");
        assert_eq!(info.job_item_count, 2);
        assert_eq!(info.create_time, "2024-03-01 08:30:00.000");
        assert_eq!(info.stop_time, None);
    }

    #[test]
    fn test_item_row() {
        let job = job();
        let mut progress = JobItemProgress::new(1, "b");
        progress.status = JobStatus::Incremental;
        progress.processed_records = 1000;
        progress.inventory = vec![InventorySplit::new("t_order", None)];
        progress.advance_inventory(0, Position::Inventory(InventoryPosition::Finished));
        let now = Utc::now();
        progress.incremental_last_event_ms = Some(now.timestamp_millis() - 3_000);

        let info = JobItemInfo::from_progress(&job, &progress, now);
        assert_eq!(info.status, "INCREMENTAL");
        assert!(info.active);
        assert_eq!(info.inventory_finished_percentage, 100);
        assert_eq!(info.incremental_idle_seconds, Some(3));

        progress.fail("apply failed");
        let info = JobItemInfo::from_progress(&job, &progress, now);
        assert!(!info.active);
        assert_eq!(info.error_message.as_deref(), Some("apply failed"));
    }

    #[test]
    fn test_check_status_row() {
        let mut progress = CheckProgress::new(vec!["t_order".into()]);
        let now = Utc::now();
        assert_eq!(CheckStatusInfo::from_progress(&progress, now).result, None);

        progress.end_time = Some(progress.begin_time);
        progress.results = vec![ConsistencyCheckResult {
            table: "t_order".into(),
            count: CountCheckResult {
                source_count: 2,
                target_count: 1,
                matched: false,
            },
            content: ContentCheckResult {
                matched: false,
                first_mismatch: Some("target is missing key (999)".into()),
            },
        }];
        let info = CheckStatusInfo::from_progress(&progress, now);
        assert_eq!(info.result, Some(false));
        assert_eq!(info.check_failed_tables, "t_order");
        assert_eq!(info.finished_percentage, 100);
        assert_eq!(info.remaining_seconds, 0);
    }
}
