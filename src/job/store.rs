//! Progress Store
//!
//! Persistent storage for jobs, job item progress and consistency-check
//! results, backed by SQLite.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tokio::sync::Mutex;

use crate::check::CheckProgress;
use crate::error::{Error, Result};

use super::progress::{JobInfo, JobItemProgress};

/// Job progress storage backed by SQLite
pub struct ProgressStore {
    conn: Mutex<Connection>,
}

impl ProgressStore {
    /// Create or open the progress database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Store that lives only as long as the process
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                info TEXT NOT NULL,
                active INTEGER NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS job_items (
                job_id TEXT NOT NULL,
                item INTEGER NOT NULL,
                progress TEXT NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (job_id, item)
            );

            CREATE TABLE IF NOT EXISTS check_results (
                job_id TEXT PRIMARY KEY,
                progress TEXT NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or replace a job
    pub async fn save_job(&self, info: &JobInfo) -> Result<()> {
        let json = serde_json::to_string(info)?;
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO jobs (id, info, active) VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET info = ?2, active = ?3, updated_at = CURRENT_TIMESTAMP
            "#,
            params![info.id, json, info.active],
        )?;
        Ok(())
    }

    pub async fn job(&self, id: &str) -> Result<Option<JobInfo>> {
        let conn = self.conn.lock().await;
        let json: Option<String> = conn
            .query_row("SELECT info FROM jobs WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// All jobs ordered by id
    pub async fn jobs(&self) -> Result<Vec<JobInfo>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT info FROM jobs ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut jobs = Vec::new();
        for json in rows {
            jobs.push(serde_json::from_str(&json?)?);
        }
        Ok(jobs)
    }

    pub async fn save_item(&self, job_id: &str, progress: &JobItemProgress) -> Result<()> {
        let json = serde_json::to_string(progress)?;
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO job_items (job_id, item, progress) VALUES (?1, ?2, ?3)
            ON CONFLICT(job_id, item) DO UPDATE SET progress = ?3, updated_at = CURRENT_TIMESTAMP
            "#,
            params![job_id, progress.item as i64, json],
        )?;
        Ok(())
    }

    /// Items of a job ordered by index
    pub async fn items(&self, job_id: &str) -> Result<Vec<JobItemProgress>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT progress FROM job_items WHERE job_id = ?1 ORDER BY item")?;
        let rows = stmt.query_map(params![job_id], |row| row.get::<_, String>(0))?;

        let mut items = Vec::new();
        for json in rows {
            items.push(serde_json::from_str(&json?)?);
        }
        Ok(items)
    }

    pub async fn save_check(&self, job_id: &str, progress: &CheckProgress) -> Result<()> {
        let json = serde_json::to_string(progress)?;
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO check_results (job_id, progress) VALUES (?1, ?2)
            ON CONFLICT(job_id) DO UPDATE SET progress = ?2, updated_at = CURRENT_TIMESTAMP
            "#,
            params![job_id, json],
        )?;
        Ok(())
    }

    /// Latest consistency check of a job
    pub async fn check(&self, job_id: &str) -> Result<Option<CheckProgress>> {
        let conn = self.conn.lock().await;
        let json: Option<String> = conn
            .query_row(
                "SELECT progress FROM check_results WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Remove a job with its items and check results
    pub async fn delete_job(&self, job_id: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM job_items WHERE job_id = ?1", params![job_id])?;
        tx.execute("DELETE FROM check_results WHERE job_id = ?1", params![job_id])?;
        tx.execute("DELETE FROM jobs WHERE id = ?1", params![job_id])?;
        tx.commit()?;
        Ok(())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::State(format!("SQLite error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JobConfiguration, RdbmsConfiguration};
    use crate::job::progress::JobStatus;
    use crate::position::{Position, WalPosition};
    use tempfile::tempdir;

    fn job_config() -> JobConfiguration {
        JobConfiguration {
            id: Some("j1".into()),
            sources: vec![RdbmsConfiguration::new("postgres://src/app")],
            target: RdbmsConfiguration::new("postgres://dst/app"),
            tables: vec!["t_order".into()],
            concurrency: 2,
            dialect: None,
        }
    }

    #[tokio::test]
    async fn test_jobs_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("progress.db");
        {
            let store = ProgressStore::open(&path).unwrap();
            store.save_job(&JobInfo::new("j1", job_config())).await.unwrap();
            let mut item = JobItemProgress::new(0, "src");
            item.transition("j1", JobStatus::Inventory).unwrap();
            item.advance_incremental(Position::Wal(WalPosition(0x14EFDB8)));
            store.save_item("j1", &item).await.unwrap();
        }

        let store = ProgressStore::open(&path).unwrap();
        let jobs = store.jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].active);
        assert_eq!(jobs[0].config.tables, vec!["t_order".to_string()]);

        let items = store.items("j1").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, JobStatus::Inventory);
        assert_eq!(
            items[0].incremental_position.as_ref().map(|p| p.to_string()),
            Some("0/14EFDB8".to_string())
        );
    }

    #[tokio::test]
    async fn test_item_updates_replace() {
        let store = ProgressStore::in_memory().unwrap();
        let mut item = JobItemProgress::new(1, "src");
        store.save_item("j1", &item).await.unwrap();
        item.processed_records = 42;
        store.save_item("j1", &item).await.unwrap();

        let items = store.items("j1").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].processed_records, 42);
        assert!(store.items("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_check_results_and_delete() {
        let store = ProgressStore::in_memory().unwrap();
        store.save_job(&JobInfo::new("j1", job_config())).await.unwrap();
        store.save_item("j1", &JobItemProgress::new(0, "src")).await.unwrap();
        assert!(store.check("j1").await.unwrap().is_none());

        let mut check = CheckProgress::new(vec!["t_order".into()]);
        check.total_records = 2;
        store.save_check("j1", &check).await.unwrap();
        assert_eq!(store.check("j1").await.unwrap().unwrap().total_records, 2);

        store.delete_job("j1").await.unwrap();
        assert!(store.job("j1").await.unwrap().is_none());
        assert!(store.items("j1").await.unwrap().is_empty());
        assert!(store.check("j1").await.unwrap().is_none());
    }
}
