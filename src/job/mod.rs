//! Job Coordinator
//!
//! Owns the lifecycle of migration jobs. A job has one item per source;
//! each item moves through
//! `PREPARING -> INVENTORY -> INCREMENTAL -> CONSISTENCY_CHECK -> FINISHED`
//! on its own task, and a failure marks only that item `FAILED`.
//!
//! The incremental position is captured in `PREPARING`, before any row is
//! copied, so changes made during the inventory copy are replayed from the
//! log afterwards. Positions are checkpointed to the [`ProgressStore`] on
//! the progress interval and never move backwards.

mod info;
mod progress;
mod store;

pub use info::{CheckStatusInfo, JobItemInfo, JobListInfo};
pub use progress::{InventorySplit, JobInfo, JobItemProgress, JobStatus};
pub use store::ProgressStore;

use chrono::Utc;
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, ChannelOptions, Watermark};
use crate::check::{CheckProgress, ConsistencyChecker};
use crate::config::{Dialect, JobConfiguration, PipelineConfig, RdbmsConfiguration};
use crate::datasource::DataSource;
use crate::dialect::{DialectHandler, DialectRegistry};
use crate::error::{Error, Result};
use crate::importer::{ImportStats, Importer};
use crate::ingest::{IncrementalContext, InventoryReader};
use crate::position::{InventoryPosition, Position};

/// Runtime state of one job item, shared with its task
struct ItemState {
    /// Names server-side resources such as replication slots
    key: String,
    source: RdbmsConfiguration,
    progress: RwLock<JobItemProgress>,
    cancel: CancellationToken,
}

struct RunningJob {
    info: JobInfo,
    cancel: CancellationToken,
    items: Vec<Arc<ItemState>>,
    tasks: Vec<JoinHandle<()>>,
}

struct RunningCheck {
    progress: Arc<RwLock<CheckProgress>>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Starts, stops and reports on migration jobs
pub struct JobCoordinator {
    node_id: String,
    pipeline: PipelineConfig,
    registry: DialectRegistry,
    store: Arc<ProgressStore>,
    jobs: RwLock<HashMap<String, RunningJob>>,
    checks: RwLock<HashMap<String, RunningCheck>>,
}

impl JobCoordinator {
    pub fn new(
        node_id: impl Into<String>,
        pipeline: PipelineConfig,
        registry: DialectRegistry,
        store: Arc<ProgressStore>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            pipeline,
            registry,
            store,
            jobs: RwLock::new(HashMap::new()),
            checks: RwLock::new(HashMap::new()),
        }
    }

    fn item_key(&self, job_id: &str, item: usize) -> String {
        format!("{}_{}#{}", self.node_id, job_id, item)
    }

    /// Validate and launch a job; returns its id
    pub async fn start(&self, mut config: JobConfiguration) -> Result<String> {
        config.validate()?;
        let dialect = config.source_dialect()?;
        self.registry.get(dialect)?;

        let id = config
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        config.id = Some(id.clone());
        if self.store.job(&id).await?.is_some() {
            return Err(Error::JobAlreadyExists(id));
        }

        let info = JobInfo::new(&id, config);
        self.store.save_job(&info).await?;
        let mut items = Vec::with_capacity(info.config.sources.len());
        for (index, source) in info.config.sources.iter().enumerate() {
            let item = JobItemProgress::new(index, source.display_address());
            self.store.save_item(&id, &item).await?;
            items.push(item);
        }

        tracing::info!(
            "Starting job {} ({} items, tables {})",
            id,
            items.len(),
            info.config.tables.join(",")
        );
        self.launch(info, items).await?;
        Ok(id)
    }

    /// Spawn a task for every item that still has work to do
    async fn launch(&self, info: JobInfo, items: Vec<JobItemProgress>) -> Result<()> {
        let dialect = info.config.source_dialect()?;
        let handler = self.registry.get(dialect)?;
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&info.id) {
            return Err(Error::JobAlreadyExists(info.id));
        }
        let cancel = CancellationToken::new();

        let mut states = Vec::with_capacity(items.len());
        let mut tasks = Vec::new();
        for progress in items {
            let index = progress.item;
            let source = info.config.sources.get(index).cloned().ok_or_else(|| {
                Error::Internal(format!("job {} has no source for item {}", info.id, index))
            })?;
            let runnable = !progress.status.is_terminal();
            let state = Arc::new(ItemState {
                key: self.item_key(&info.id, index),
                source,
                progress: RwLock::new(progress),
                cancel: cancel.child_token(),
            });
            if runnable {
                let task = ItemTask {
                    job_id: info.id.clone(),
                    config: info.config.clone(),
                    dialect,
                    handler: handler.clone(),
                    pipeline: self.pipeline.clone(),
                    store: self.store.clone(),
                    state: state.clone(),
                };
                tasks.push(tokio::spawn(task.run()));
            }
            states.push(state);
        }

        let id = info.id.clone();
        jobs.insert(
            id,
            RunningJob {
                info,
                cancel,
                items: states,
                tasks,
            },
        );
        Ok(())
    }

    /// Cancel a running job and wait for its items to drain
    async fn halt(&self, job_id: &str) -> Option<RunningJob> {
        let mut job = self.jobs.write().await.remove(job_id)?;
        job.cancel.cancel();
        for task in job.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::error!("Job {} item task ended abnormally: {}", job_id, e);
            }
        }
        Some(job)
    }

    /// Stop a job; its items keep their last acknowledged positions
    pub async fn stop(&self, job_id: &str) -> Result<()> {
        let mut info = self
            .store
            .job(job_id)
            .await?
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;

        if let Some(job) = self.halt(job_id).await {
            for item in &job.items {
                let mut progress = item.progress.write().await;
                if !progress.status.is_terminal() {
                    progress.transition(job_id, JobStatus::Stopped)?;
                }
                self.store.save_item(job_id, &progress).await?;
            }
        }

        info.active = false;
        info.stop_time.get_or_insert_with(Utc::now);
        self.store.save_job(&info).await?;
        tracing::info!("Stopped job {}", job_id);
        Ok(())
    }

    /// Stop every running job without marking it inactive, so the next
    /// process picks it up in [`Self::resume_all`]
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.jobs.read().await.keys().cloned().collect();
        for id in ids {
            if let Some(job) = self.halt(&id).await {
                for item in &job.items {
                    let progress = item.progress.read().await;
                    if let Err(e) = self.store.save_item(&id, &progress).await {
                        tracing::error!("Could not persist progress of {}: {}", item.key, e);
                    }
                }
            }
        }
        for (_, check) in self.checks.write().await.drain() {
            check.cancel.cancel();
        }
    }

    /// Restart the jobs that were active when the process last exited
    pub async fn resume_all(&self) -> Result<usize> {
        let mut resumed = 0;
        for info in self.store.jobs().await? {
            if !info.active || self.jobs.read().await.contains_key(&info.id) {
                continue;
            }
            tracing::info!("Resuming job {}", info.id);
            self.relaunch(info).await?;
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Restart a stopped job from its saved positions
    pub async fn resume(&self, job_id: &str) -> Result<()> {
        let mut info = self
            .store
            .job(job_id)
            .await?
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
        if self.jobs.read().await.contains_key(job_id) {
            return Ok(());
        }
        let items = self.store.items(job_id).await?;
        if !items.is_empty()
            && items
                .iter()
                .all(|item| item.status.is_terminal() && item.status != JobStatus::Stopped)
        {
            return Err(Error::InvalidTransition {
                job_id: job_id.to_string(),
                from: items[0].status.to_string(),
                to: JobStatus::Preparing.to_string(),
            });
        }

        info.active = true;
        info.stop_time = None;
        self.store.save_job(&info).await?;
        tracing::info!("Restarting job {}", job_id);
        self.relaunch(info).await
    }

    /// Launch a persisted job. Stopped items prepare again from their saved
    /// progress and an interrupted commit goes back to replication.
    async fn relaunch(&self, info: JobInfo) -> Result<()> {
        let mut items = self.store.items(&info.id).await?;
        if items.is_empty() {
            items = info
                .config
                .sources
                .iter()
                .enumerate()
                .map(|(index, source)| JobItemProgress::new(index, source.display_address()))
                .collect();
        }
        for item in &mut items {
            let next = match item.status {
                JobStatus::ConsistencyCheck => JobStatus::Incremental,
                JobStatus::Stopped => JobStatus::Preparing,
                _ => continue,
            };
            item.transition(&info.id, next)?;
            self.store.save_item(&info.id, item).await?;
        }
        self.launch(info, items).await
    }

    async fn checker_for(&self, info: &JobInfo) -> Result<ConsistencyChecker> {
        let mut sources = Vec::with_capacity(info.config.sources.len());
        for source in &info.config.sources {
            sources.push((DataSource::connect(source, 2).await?, source.clone()));
        }
        let target = DataSource::connect(&info.config.target, 2).await?;
        Ok(ConsistencyChecker::new(
            sources,
            target,
            info.config.tables.clone(),
            self.pipeline.check_chunk_size,
        ))
    }

    /// Start a consistency check in the background. The check does not
    /// change item states; poll [`Self::check_status`] for the outcome.
    pub async fn check(&self, job_id: &str) -> Result<()> {
        let info = self
            .store
            .job(job_id)
            .await?
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
        if self
            .checks
            .read()
            .await
            .get(job_id)
            .is_some_and(|c| !c.handle.is_finished())
        {
            return Err(Error::CheckInProgress(job_id.to_string()));
        }

        let checker = self.checker_for(&info).await?;
        let progress = checker.progress();
        let cancel = CancellationToken::new();
        let store = self.store.clone();
        let id = job_id.to_string();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            match checker.check(&token).await {
                Ok(results) => {
                    let failed = results.iter().filter(|r| !r.is_matched()).count();
                    tracing::info!(
                        "Consistency check of job {} done: {} tables, {} mismatched",
                        id,
                        results.len(),
                        failed
                    );
                }
                Err(e) => tracing::error!("Consistency check of job {} failed: {}", id, e),
            }
            let snapshot = checker.progress().read().await.clone();
            if let Err(e) = store.save_check(&id, &snapshot).await {
                tracing::error!("Could not persist check result of job {}: {}", id, e);
            }
            checker.close().await;
        });

        tracing::info!("Started consistency check of job {}", job_id);
        self.checks.write().await.insert(
            job_id.to_string(),
            RunningCheck {
                progress,
                cancel,
                handle,
            },
        );
        Ok(())
    }

    /// Finish a job: drain replication, verify, then release retention.
    ///
    /// Every item must be in `INCREMENTAL`. When any step fails, including
    /// a final check that does not match, replication resumes and the error
    /// is returned.
    pub async fn commit(&self, job_id: &str) -> Result<()> {
        let job = self
            .halt(job_id)
            .await
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
        let mut items = Vec::with_capacity(job.items.len());
        for item in &job.items {
            items.push(item.progress.read().await.clone());
        }

        if let Err(e) = self.verify_and_finish(&job.info, &mut items).await {
            tracing::warn!("Commit of job {} rejected, resuming replication: {}", job_id, e);
            for item in &mut items {
                if item.status != JobStatus::ConsistencyCheck {
                    continue;
                }
                if let Err(e) = item.transition(job_id, JobStatus::Incremental) {
                    tracing::error!("Could not restore job {} item {}: {}", job_id, item.item, e);
                }
                if let Err(e) = self.store.save_item(job_id, item).await {
                    tracing::error!("Could not persist job {} item {}: {}", job_id, item.item, e);
                }
            }
            if let Err(e) = self.launch(job.info, items).await {
                tracing::error!("Could not relaunch job {}: {}", job_id, e);
            }
            return Err(e);
        }

        let mut info = job.info;
        info.active = false;
        info.stop_time = Some(Utc::now());
        self.store.save_job(&info).await?;
        tracing::info!("Job {} finished", job_id);
        Ok(())
    }

    /// Check a halted job and release its retention when it matches
    async fn verify_and_finish(&self, info: &JobInfo, items: &mut [JobItemProgress]) -> Result<()> {
        let job_id = info.id.as_str();
        if let Some(item) = items.iter().find(|i| i.status != JobStatus::Incremental) {
            return Err(Error::InvalidTransition {
                job_id: format!("{}#{}", job_id, item.item),
                from: item.status.to_string(),
                to: JobStatus::ConsistencyCheck.to_string(),
            });
        }
        for item in items.iter_mut() {
            item.transition(job_id, JobStatus::ConsistencyCheck)?;
            self.store.save_item(job_id, item).await?;
        }

        tracing::info!("Committing job {}: running final consistency check", job_id);
        let checker = self.checker_for(info).await?;
        let result = checker.check(&CancellationToken::new()).await;
        let snapshot = checker.progress().read().await.clone();
        checker.close().await;
        self.store.save_check(job_id, &snapshot).await?;
        result?;
        if !snapshot.is_matched() {
            return Err(Error::CheckFailed {
                job_id: job_id.to_string(),
                reason: format!("mismatched tables {}", snapshot.failed_tables().join(",")),
            });
        }

        let handler = self.registry.get(info.config.source_dialect()?)?;
        for item in items.iter_mut() {
            self.destroy_retention(handler.as_ref(), info, item.item)
                .await?;
            item.transition(job_id, JobStatus::Finished)?;
            self.store.save_item(job_id, item).await?;
        }
        Ok(())
    }

    async fn destroy_retention(
        &self,
        handler: &dyn DialectHandler,
        info: &JobInfo,
        item: usize,
    ) -> Result<()> {
        let Some(source_config) = info.config.sources.get(item) else {
            return Ok(());
        };
        let source = DataSource::connect(source_config, 1).await?;
        let result = handler
            .position_manager()
            .destroy(&source, &self.item_key(&info.id, item))
            .await;
        source.close().await;
        result
    }

    /// Stop a job, release its retention and delete its progress
    pub async fn drop_job(&self, job_id: &str) -> Result<()> {
        let info = self
            .store
            .job(job_id)
            .await?
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
        if info.active {
            self.stop(job_id).await?;
        }
        if let Some(check) = self.checks.write().await.remove(job_id) {
            check.cancel.cancel();
        }

        let handler = self.registry.get(info.config.source_dialect()?)?;
        for item in 0..info.config.sources.len() {
            self.destroy_retention(handler.as_ref(), &info, item).await?;
        }
        self.store.delete_job(job_id).await?;
        tracing::info!("Dropped job {}", job_id);
        Ok(())
    }

    /// All known jobs
    pub async fn list(&self) -> Result<Vec<JobListInfo>> {
        Ok(self
            .store
            .jobs()
            .await?
            .iter()
            .map(JobListInfo::from_job)
            .collect())
    }

    /// Per-item status of a job
    pub async fn items(&self, job_id: &str) -> Result<Vec<JobItemInfo>> {
        let info = self
            .store
            .job(job_id)
            .await?
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
        let now = Utc::now();

        let running = {
            let jobs = self.jobs.read().await;
            match jobs.get(job_id) {
                Some(job) => {
                    let mut items = Vec::with_capacity(job.items.len());
                    for item in &job.items {
                        items.push(item.progress.read().await.clone());
                    }
                    Some(items)
                }
                None => None,
            }
        };
        let items = match running {
            Some(items) => items,
            None => self.store.items(job_id).await?,
        };

        Ok(items
            .iter()
            .map(|progress| JobItemInfo::from_progress(&info, progress, now))
            .collect())
    }

    /// Status of the running or latest consistency check of a job
    pub async fn check_status(&self, job_id: &str) -> Result<Option<CheckStatusInfo>> {
        if self.store.job(job_id).await?.is_none() {
            return Err(Error::JobNotFound(job_id.to_string()));
        }
        let now = Utc::now();
        let running = match self.checks.read().await.get(job_id) {
            Some(check) => Some(check.progress.clone()),
            None => None,
        };
        if let Some(progress) = running {
            let progress = progress.read().await;
            return Ok(Some(CheckStatusInfo::from_progress(&progress, now)));
        }
        Ok(self
            .store
            .check(job_id)
            .await?
            .map(|progress| CheckStatusInfo::from_progress(&progress, now)))
    }
}

/// Work of one job item, run on its own task
struct ItemTask {
    job_id: String,
    config: JobConfiguration,
    dialect: Dialect,
    handler: Arc<dyn DialectHandler>,
    pipeline: PipelineConfig,
    store: Arc<ProgressStore>,
    state: Arc<ItemState>,
}

impl ItemTask {
    async fn run(self) {
        match self.execute().await {
            Ok(()) => {}
            Err(Error::Cancelled) => {
                tracing::info!("Job item {} stopped", self.state.key);
            }
            Err(e) => {
                tracing::error!("Job item {} failed: {}", self.state.key, e);
                self.state.progress.write().await.fail(e.to_string());
            }
        }
        if let Err(e) = self.persist().await {
            tracing::error!("Could not persist progress of {}: {}", self.state.key, e);
        }
    }

    async fn persist(&self) -> Result<()> {
        let snapshot = self.state.progress.read().await.clone();
        self.store.save_item(&self.job_id, &snapshot).await
    }

    async fn transition(&self, next: JobStatus) -> Result<()> {
        self.state
            .progress
            .write()
            .await
            .transition(&self.job_id, next)?;
        tracing::info!("Job item {} is now {}", self.state.key, next);
        self.persist().await
    }

    async fn execute(&self) -> Result<()> {
        let (source, target) = tokio::select! {
            connected = self.connect() => connected?,
            _ = self.state.cancel.cancelled() => return Err(Error::Cancelled),
        };
        let result = self.execute_with(&source, &target).await;
        source.close().await;
        target.close().await;
        result
    }

    async fn connect(&self) -> Result<(DataSource, DataSource)> {
        let pool_size = (self.config.concurrency.max(self.pipeline.importer_concurrency) + 2) as u32;
        let source = DataSource::connect(&self.state.source, pool_size).await?;
        match DataSource::connect(&self.config.target, pool_size).await {
            Ok(target) => Ok((source, target)),
            Err(e) => {
                source.close().await;
                Err(e)
            }
        }
    }

    async fn execute_with(&self, source: &DataSource, target: &DataSource) -> Result<()> {
        loop {
            if self.state.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let status = self.state.progress.read().await.status;
            match status {
                JobStatus::Preparing => {
                    self.prepare(source, target).await?;
                    self.transition(JobStatus::Inventory).await?;
                }
                JobStatus::Inventory => {
                    self.run_inventory(source, target).await?;
                    self.transition(JobStatus::Incremental).await?;
                }
                JobStatus::Incremental => return self.run_incremental(source, target).await,
                _ => return Ok(()),
            }
        }
    }

    /// Check both ends, split the tables and capture the incremental
    /// starting position
    async fn prepare(&self, source: &DataSource, target: &DataSource) -> Result<()> {
        for (name, db, config) in [
            ("source", source, &self.state.source),
            ("target", target, &self.config.target),
        ] {
            if !db.health_check().await? {
                return Err(Error::Connection {
                    address: config.display_address(),
                    reason: format!("{} health check failed", name),
                });
            }
        }

        let needs_split = self.state.progress.read().await.inventory.is_empty();
        if needs_split {
            let mut splits = Vec::new();
            for table in &self.config.tables {
                target.table_metadata(table).await?;
                let metadata = source.table_metadata(table).await?;
                let reader = InventoryReader::new(
                    source.clone(),
                    self.state.source.for_table(table),
                    metadata,
                    self.pipeline.batch_size,
                );
                for split in reader.split(self.config.concurrency).await? {
                    splits.push(InventorySplit::new(table.clone(), split.where_condition));
                }
            }
            tracing::info!("Job item {} has {} inventory splits", self.state.key, splits.len());
            self.state.progress.write().await.inventory = splits;
        }

        let persisted = self.state.progress.read().await.incremental_position.clone();
        let position = self
            .handler
            .position_manager()
            .init_or_resume(persisted.as_ref(), source, &self.state.key)
            .await?;
        self.state.progress.write().await.incremental_position = Some(position);
        self.persist().await
    }

    async fn run_inventory(&self, source: &DataSource, target: &DataSource) -> Result<()> {
        let pending: Vec<(usize, InventorySplit)> = self
            .state
            .progress
            .read()
            .await
            .inventory
            .iter()
            .cloned()
            .enumerate()
            .filter(|(_, split)| !split.is_finished())
            .collect();
        tracing::info!(
            "Job item {} copying {} inventory splits",
            self.state.key,
            pending.len()
        );

        let splits: Vec<_> = pending
            .into_iter()
            .map(|(index, split)| self.run_split(index, split, source, target))
            .collect();
        futures::stream::iter(splits)
            .buffer_unordered(self.config.concurrency.max(1))
            .try_collect::<Vec<()>>()
            .await?;
        Ok(())
    }

    async fn run_split(
        &self,
        index: usize,
        split: InventorySplit,
        source: &DataSource,
        target: &DataSource,
    ) -> Result<()> {
        let metadata = source.table_metadata(&split.table).await?;
        let mut config = self.state.source.for_table(&split.table);
        config.where_condition = split.condition.clone();
        let reader = InventoryReader::new(source.clone(), config, metadata, self.pipeline.batch_size);

        let options = ChannelOptions::from_pipeline(&self.pipeline).with_partitions(1);
        let (producer, mut consumers) = Channel::new(options);
        let consumer = consumers
            .pop()
            .ok_or_else(|| Error::Internal("channel has no partitions".into()))?;
        let mut importer = tokio::spawn(
            Importer::new(target.clone(), consumer, self.pipeline.clone(), ImportStats::new())
                .write(),
        );
        let watermark = producer.watermark();
        let resume = split.inventory_position();

        let mut recorded = 0u64;
        let read_result = {
            let read = reader.read(&producer, resume.as_ref(), &self.state.cancel);
            tokio::pin!(read);
            let mut ticker = tokio::time::interval(self.pipeline.progress_interval());
            loop {
                tokio::select! {
                    result = &mut read => break result,
                    _ = ticker.tick() => {
                        self.checkpoint_split(index, &watermark, &mut recorded).await?;
                    }
                }
            }
        };
        drop(producer);

        let import_result = if read_result.is_ok() {
            joined_result((&mut importer).await)
        } else {
            match tokio::time::timeout(self.pipeline.drain_timeout(), &mut importer).await {
                Ok(joined) => joined_result(joined),
                Err(_) => {
                    importer.abort();
                    tracing::warn!(
                        "Importer of {} split {} did not drain in time",
                        split.table,
                        index
                    );
                    Err(Error::Cancelled)
                }
            }
        };
        self.checkpoint_split(index, &watermark, &mut recorded).await?;

        match (read_result, import_result) {
            (Err(Error::ChannelClosed), Err(e)) => Err(e),
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(e),
            (Ok(rows), Ok(applied)) => {
                self.state
                    .progress
                    .write()
                    .await
                    .advance_inventory(index, Position::Inventory(InventoryPosition::Finished));
                tracing::info!(
                    "Inventory split {} of {} done: {} rows read, {} applied",
                    index,
                    split.table,
                    rows,
                    applied
                );
                self.persist().await
            }
        }
    }

    async fn checkpoint_split(
        &self,
        index: usize,
        watermark: &Watermark,
        recorded: &mut u64,
    ) -> Result<()> {
        let acked = watermark.acked_records();
        {
            let mut progress = self.state.progress.write().await;
            progress.processed_records += acked.saturating_sub(*recorded);
            if let Some(position) = watermark.committed() {
                progress.advance_inventory(index, position);
            }
        }
        *recorded = acked;
        self.persist().await
    }

    async fn run_incremental(&self, source: &DataSource, target: &DataSource) -> Result<()> {
        let from = self
            .state
            .progress
            .read()
            .await
            .incremental_position
            .clone()
            .ok_or_else(|| Error::Internal(format!("{} has no incremental position", self.state.key)))?;

        let options = ChannelOptions::from_pipeline(&self.pipeline);
        let (producer, consumers) = Channel::resume(options, Some(from.clone()));
        let watermark = producer.watermark();
        let stats = ImportStats::new();
        let mut importers = JoinSet::new();
        for consumer in consumers {
            importers.spawn(
                Importer::new(target.clone(), consumer, self.pipeline.clone(), stats.clone())
                    .write(),
            );
        }

        let context = IncrementalContext {
            job_key: self.state.key.clone(),
            source: source.clone(),
            source_config: self.state.source.clone(),
            tables: self.config.tables.clone(),
            pipeline: self.pipeline.clone(),
        };
        let mut reader = self.handler.incremental_reader(context);
        let reader_cancel = self.state.cancel.child_token();
        let token = reader_cancel.clone();
        tracing::info!(
            "Job item {} replicating {} changes from {}",
            self.state.key,
            self.dialect,
            from
        );
        let mut reader_task = tokio::spawn(async move {
            let result = reader.start(from, &producer, token).await;
            drop(producer);
            result
        });

        let drain = async {
            self.state.cancel.cancelled().await;
            tokio::time::sleep(self.pipeline.drain_timeout()).await;
        };
        tokio::pin!(drain);
        let mut ticker = tokio::time::interval(self.pipeline.progress_interval());
        let mut recorded = 0u64;
        let mut reader_result: Option<Result<()>> = None;
        let mut import_error: Option<Error> = None;

        loop {
            if reader_result.is_some() && importers.is_empty() {
                break;
            }
            tokio::select! {
                joined = &mut reader_task, if reader_result.is_none() => {
                    let result = joined.unwrap_or_else(|e| {
                        Err(Error::Internal(format!("incremental reader panicked: {}", e)))
                    });
                    if let Err(e) = &result {
                        if !matches!(e, Error::Cancelled) {
                            tracing::error!("Incremental reader of {} failed: {}", self.state.key, e);
                        }
                    }
                    reader_result = Some(result);
                }
                Some(joined) = importers.join_next() => {
                    if let Err(e) = joined_result(joined) {
                        if import_error.is_none() {
                            tracing::error!("Importer of {} failed: {}", self.state.key, e);
                            import_error = Some(e);
                            reader_cancel.cancel();
                            importers.abort_all();
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.checkpoint_incremental(&watermark, &stats, &mut recorded).await?;
                }
                _ = &mut drain => {
                    tracing::warn!(
                        "Job item {} did not drain within {:?}, abandoning in-flight events",
                        self.state.key,
                        self.pipeline.drain_timeout()
                    );
                    importers.abort_all();
                    if reader_result.is_none() {
                        reader_task.abort();
                    }
                    break;
                }
            }
        }
        self.checkpoint_incremental(&watermark, &stats, &mut recorded).await?;

        match (reader_result, import_error) {
            (Some(Err(Error::ChannelClosed)), Some(e)) => Err(e),
            (Some(Err(Error::Cancelled)), Some(e)) => Err(e),
            (Some(Err(e)), _) if !matches!(e, Error::Cancelled) => Err(e),
            (_, Some(e)) if !matches!(e, Error::ChannelClosed | Error::Cancelled) => Err(e),
            _ if self.state.cancel.is_cancelled() => Err(Error::Cancelled),
            _ => Err(Error::Internal(format!(
                "incremental reader of {} stopped unexpectedly",
                self.state.key
            ))),
        }
    }

    async fn checkpoint_incremental(
        &self,
        watermark: &Watermark,
        stats: &ImportStats,
        recorded: &mut u64,
    ) -> Result<()> {
        let acked = watermark.acked_records();
        {
            let mut progress = self.state.progress.write().await;
            progress.processed_records += acked.saturating_sub(*recorded);
            if let Some(at) = stats.last_applied_ms() {
                progress.incremental_last_event_ms = Some(at);
            }
            if let Some(position) = watermark.committed() {
                if progress.advance_incremental(position.clone()) {
                    tracing::debug!("Job item {} checkpoint at {}", self.state.key, position);
                }
            }
        }
        *recorded = acked;
        self.persist().await
    }
}

fn joined_result(joined: std::result::Result<Result<u64>, tokio::task::JoinError>) -> Result<u64> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Err(Error::Cancelled),
        Err(e) => Err(Error::Internal(format!("importer panicked: {}", e))),
    }
}
