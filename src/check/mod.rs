//! Consistency Checker
//!
//! Compares source and target tables without pausing the migration. Each
//! table gets a count check and a content check. The content check walks
//! both sides in primary-key order in bounded chunks, digests each chunk
//! with SHA-256 and stops at the first chunk that differs. Both checks only
//! read.
//!
//! A job with several sources merges their key-ordered streams before
//! comparing against the single target table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::RdbmsConfiguration;
use crate::datasource::{DataSource, TableMetadata};
use crate::error::{Error, Result};
use crate::ingest::unqualified;
use crate::record::{Row, Value};

/// Outcome of the `COUNT(*)` comparison
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountCheckResult {
    pub source_count: u64,
    pub target_count: u64,
    pub matched: bool,
}

/// Outcome of the chunked content comparison
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentCheckResult {
    pub matched: bool,
    /// Description of the first differing row, if any
    pub first_mismatch: Option<String>,
}

/// Check result for one logical table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyCheckResult {
    pub table: String,
    pub count: CountCheckResult,
    pub content: ContentCheckResult,
}

impl ConsistencyCheckResult {
    pub fn is_matched(&self) -> bool {
        self.count.matched && self.content.matched
    }
}

/// Progress of a running or completed check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckProgress {
    pub tables: Vec<String>,
    pub total_records: u64,
    pub checked_records: u64,
    pub begin_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub results: Vec<ConsistencyCheckResult>,
    pub error_message: Option<String>,
}

impl CheckProgress {
    pub fn new(tables: Vec<String>) -> Self {
        Self {
            tables,
            total_records: 0,
            checked_records: 0,
            begin_time: Utc::now(),
            end_time: None,
            results: Vec::new(),
            error_message: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }

    /// Whether the check completed and every table matched
    pub fn is_matched(&self) -> bool {
        self.is_finished()
            && self.error_message.is_none()
            && self.results.iter().all(ConsistencyCheckResult::is_matched)
    }

    /// Tables whose count or content check failed
    pub fn failed_tables(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| !r.is_matched())
            .map(|r| r.table.clone())
            .collect()
    }

    pub fn finished_percentage(&self) -> u8 {
        if self.is_finished() {
            return 100;
        }
        if self.total_records == 0 {
            return 0;
        }
        (self.checked_records.saturating_mul(100) / self.total_records).min(99) as u8
    }

    /// Estimate from the rate so far: (total - checked) / checked * elapsed
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> u64 {
        if self.is_finished() || self.checked_records == 0 {
            return 0;
        }
        let remaining = self.total_records.saturating_sub(self.checked_records) as f64;
        let elapsed = (now - self.begin_time).num_milliseconds().max(0) as f64;
        (remaining / self.checked_records as f64 * elapsed / 1000.0) as u64
    }

    pub fn duration_seconds(&self, now: DateTime<Utc>) -> u64 {
        let end = self.end_time.unwrap_or(now);
        (end - self.begin_time).num_seconds().max(0) as u64
    }
}

/// Key-ordered page access to one side of a comparison
#[async_trait]
pub trait PageReader: Send + Sync {
    /// Rows with keys strictly after `after`, in key order
    async fn page(&self, after: Option<&[Value]>, limit: usize) -> Result<Vec<Row>>;

    async fn count(&self) -> Result<u64>;

    fn key_of(&self, row: &Row) -> Vec<Value>;
}

/// One table of one database under an optional filter
pub struct TableScan {
    source: DataSource,
    metadata: TableMetadata,
    condition: Option<String>,
}

impl TableScan {
    pub fn new(source: DataSource, metadata: TableMetadata, condition: Option<String>) -> Self {
        Self {
            source,
            metadata,
            condition,
        }
    }
}

#[async_trait]
impl PageReader for TableScan {
    async fn page(&self, after: Option<&[Value]>, limit: usize) -> Result<Vec<Row>> {
        let sql = self.source.sql().select_page(
            &self.metadata,
            self.condition.as_deref(),
            after,
            limit,
        );
        self.source.fetch_rows(&sql, &self.metadata).await
    }

    async fn count(&self) -> Result<u64> {
        self.source
            .count_rows(&self.metadata.name, self.condition.as_deref())
            .await
    }

    fn key_of(&self, row: &Row) -> Vec<Value> {
        self.metadata.key_values(row)
    }
}

/// A row and its key as reported by the reader it came from
struct KeyedRow {
    key: Vec<Value>,
    row: Row,
}

/// Buffered keyset walk over one reader
struct Cursor<'a> {
    reader: &'a dyn PageReader,
    after: Option<Vec<Value>>,
    buffer: VecDeque<KeyedRow>,
    exhausted: bool,
    page_size: usize,
}

impl<'a> Cursor<'a> {
    fn new(reader: &'a dyn PageReader, page_size: usize) -> Self {
        Self {
            reader,
            after: None,
            buffer: VecDeque::new(),
            exhausted: false,
            page_size,
        }
    }

    async fn fill(&mut self) -> Result<()> {
        if !self.buffer.is_empty() || self.exhausted {
            return Ok(());
        }
        let rows = self
            .reader
            .page(self.after.as_deref(), self.page_size)
            .await?;
        if rows.len() < self.page_size {
            self.exhausted = true;
        }
        let reader = self.reader;
        self.buffer.extend(rows.into_iter().map(|row| KeyedRow {
            key: reader.key_of(&row),
            row,
        }));
        if let Some(last) = self.buffer.back() {
            self.after = Some(last.key.clone());
        }
        Ok(())
    }
}

/// Next row across all cursors in key order
async fn next_merged(cursors: &mut [Cursor<'_>]) -> Result<Option<KeyedRow>> {
    let mut best: Option<usize> = None;
    for i in 0..cursors.len() {
        cursors[i].fill().await?;
        let Some(head) = cursors[i].buffer.front() else {
            continue;
        };
        let better = match best.and_then(|b| cursors[b].buffer.front()) {
            None => true,
            Some(current) => compare_keys(&head.key, &current.key) == Ordering::Less,
        };
        if better {
            best = Some(i);
        }
    }
    Ok(best.and_then(|i| cursors[i].buffer.pop_front()))
}

async fn next_chunk(cursors: &mut [Cursor<'_>], size: usize) -> Result<Vec<KeyedRow>> {
    let mut chunk = Vec::with_capacity(size);
    while chunk.len() < size {
        match next_merged(cursors).await? {
            Some(row) => chunk.push(row),
            None => break,
        }
    }
    Ok(chunk)
}

/// Order of primary-key tuples as the databases sort them for integer and
/// binary-collated keys
fn compare_keys(a: &[Value], b: &[Value]) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        let ordering = match (x, y) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Int(x), Value::Int(y)) => x.cmp(y),
            (Value::UInt(x), Value::UInt(y)) => x.cmp(y),
            (Value::Int(x), Value::UInt(y)) => (*x as i128).cmp(&(*y as i128)),
            (Value::UInt(x), Value::Int(y)) => (*x as i128).cmp(&(*y as i128)),
            (Value::String(x), Value::String(y)) => x.cmp(y),
            (Value::Bytes(x), Value::Bytes(y)) => x.cmp(y),
            (Value::Date(x), Value::Date(y)) => x.cmp(y),
            (Value::DateTime(x), Value::DateTime(y)) => x.cmp(y),
            (Value::Timestamp(x), Value::Timestamp(y)) => x.cmp(y),
            (x, y) => x.canonical().cmp(&y.canonical()),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.len().cmp(&b.len())
}

/// Dialect-neutral text of a row restricted to `columns`
fn canonical_row(row: &Row, columns: &[String]) -> String {
    columns
        .iter()
        .map(|name| match row.get(name) {
            Some(value) => format!("{}={}", name, value.canonical()),
            None => format!("{}=<missing>", name),
        })
        .collect::<Vec<_>>()
        .join("\x1f")
}

fn chunk_digest(rows: &[KeyedRow], columns: &[String]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for keyed in rows {
        hasher.update(canonical_row(&keyed.row, columns).as_bytes());
        hasher.update(b"\x1e");
    }
    hasher.finalize().into()
}

fn describe_key(key: &[Value]) -> String {
    key.iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// First differing row of two chunks whose digests differ
fn first_mismatch(source: &[KeyedRow], target: &[KeyedRow], columns: &[String]) -> String {
    for i in 0..source.len().max(target.len()) {
        match (source.get(i), target.get(i)) {
            (Some(s), Some(t)) => {
                match compare_keys(&s.key, &t.key) {
                    Ordering::Less => {
                        return format!("target is missing key ({})", describe_key(&s.key))
                    }
                    Ordering::Greater => {
                        return format!("target has unexpected key ({})", describe_key(&t.key))
                    }
                    Ordering::Equal => {}
                }
                if canonical_row(&s.row, columns) != canonical_row(&t.row, columns) {
                    return format!("row with key ({}) differs", describe_key(&s.key));
                }
            }
            (Some(s), None) => {
                return format!("target is missing key ({})", describe_key(&s.key))
            }
            (None, Some(t)) => {
                return format!("target has unexpected key ({})", describe_key(&t.key))
            }
            (None, None) => break,
        }
    }
    "chunk digests differ".to_string()
}

/// Compare one table across `sources` and `target`
pub async fn check_table(
    table: &str,
    sources: &[&dyn PageReader],
    target: &dyn PageReader,
    columns: &[String],
    chunk_size: usize,
    progress: &RwLock<CheckProgress>,
    cancel: &CancellationToken,
) -> Result<ConsistencyCheckResult> {
    let mut source_count = 0u64;
    for source in sources {
        source_count += source.count().await?;
    }
    let target_count = target.count().await?;
    let count = CountCheckResult {
        source_count,
        target_count,
        matched: source_count == target_count,
    };
    if !count.matched {
        tracing::warn!(
            "Count check of {} failed: source {} target {}",
            table,
            source_count,
            target_count
        );
    }
    progress.write().await.total_records += source_count;

    let chunk_size = chunk_size.max(1);
    let mut source_cursors: Vec<Cursor<'_>> = sources
        .iter()
        .map(|reader| Cursor::new(*reader, chunk_size))
        .collect();
    let mut target_cursor = [Cursor::new(target, chunk_size)];

    let mut content = ContentCheckResult {
        matched: true,
        first_mismatch: None,
    };
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let source_chunk = next_chunk(&mut source_cursors, chunk_size).await?;
        let target_chunk = next_chunk(&mut target_cursor, chunk_size).await?;
        if source_chunk.is_empty() && target_chunk.is_empty() {
            break;
        }
        progress.write().await.checked_records += source_chunk.len() as u64;

        if chunk_digest(&source_chunk, columns) != chunk_digest(&target_chunk, columns) {
            let mismatch = first_mismatch(&source_chunk, &target_chunk, columns);
            tracing::warn!("Content check of {} failed: {}", table, mismatch);
            content = ContentCheckResult {
                matched: false,
                first_mismatch: Some(mismatch),
            };
            break;
        }
    }

    Ok(ConsistencyCheckResult {
        table: table.to_string(),
        count,
        content,
    })
}

/// Compares a job's sources against its target
pub struct ConsistencyChecker {
    sources: Vec<(DataSource, RdbmsConfiguration)>,
    target: DataSource,
    tables: Vec<String>,
    chunk_size: usize,
    progress: Arc<RwLock<CheckProgress>>,
}

impl ConsistencyChecker {
    pub fn new(
        sources: Vec<(DataSource, RdbmsConfiguration)>,
        target: DataSource,
        tables: Vec<String>,
        chunk_size: usize,
    ) -> Self {
        let progress = Arc::new(RwLock::new(CheckProgress::new(tables.clone())));
        Self {
            sources,
            target,
            tables,
            chunk_size,
            progress,
        }
    }

    /// Live progress, shared with status queries while the check runs
    pub fn progress(&self) -> Arc<RwLock<CheckProgress>> {
        self.progress.clone()
    }

    /// Close the connection pools of both sides
    pub async fn close(&self) {
        for (source, _) in &self.sources {
            source.close().await;
        }
        self.target.close().await;
    }

    /// Check every table. Results are also recorded in [`Self::progress`],
    /// together with the error message when the check fails.
    pub async fn check(&self, cancel: &CancellationToken) -> Result<Vec<ConsistencyCheckResult>> {
        let outcome = self.check_tables(cancel).await;
        let mut progress = self.progress.write().await;
        progress.end_time = Some(Utc::now());
        match &outcome {
            Ok(results) => progress.results = results.clone(),
            Err(e) => progress.error_message = Some(e.to_string()),
        }
        outcome
    }

    async fn check_tables(&self, cancel: &CancellationToken) -> Result<Vec<ConsistencyCheckResult>> {
        let mut results = Vec::with_capacity(self.tables.len());
        for table in &self.tables {
            let table = unqualified(table);
            let target_metadata = self.target.table_metadata(table).await?;
            let mut scans = Vec::with_capacity(self.sources.len());
            let mut columns = Vec::new();
            for (source, config) in &self.sources {
                let metadata = source.table_metadata(table).await?;
                if columns.is_empty() {
                    columns = metadata.columns.iter().map(|c| c.name.clone()).collect();
                }
                scans.push(TableScan::new(
                    source.clone(),
                    metadata,
                    config.where_condition.clone(),
                ));
            }
            let target = TableScan::new(self.target.clone(), target_metadata, None);
            let readers: Vec<&dyn PageReader> =
                scans.iter().map(|s| s as &dyn PageReader).collect();

            tracing::info!("Checking {} across {} sources", table, readers.len());
            let result = check_table(
                table,
                &readers,
                &target,
                &columns,
                self.chunk_size,
                &self.progress,
                cancel,
            )
            .await?;
            tracing::info!(
                "Check of {}: count {} ({} / {}), content {}",
                table,
                if result.count.matched { "matched" } else { "mismatched" },
                result.count.source_count,
                result.count.target_count,
                if result.content.matched { "matched" } else { "mismatched" }
            );
            results.push(result);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Column;

    /// Table held in memory, sorted by its first column
    struct MemoryTable {
        rows: Vec<Row>,
    }

    impl MemoryTable {
        fn new(pairs: &[(i64, i64)]) -> Self {
            let mut rows: Vec<Row> = pairs
                .iter()
                .map(|(order_id, user_id)| {
                    Row::new(vec![
                        Column::new("order_id", Value::Int(*order_id), true),
                        Column::new("user_id", Value::Int(*user_id), false),
                    ])
                })
                .collect();
            rows.sort_by(|a, b| compare_keys(&a.key_values_owned(), &b.key_values_owned()));
            Self { rows }
        }
    }

    trait OwnedKeys {
        fn key_values_owned(&self) -> Vec<Value>;
    }

    impl OwnedKeys for Row {
        fn key_values_owned(&self) -> Vec<Value> {
            self.key_values().into_iter().cloned().collect()
        }
    }

    #[async_trait]
    impl PageReader for MemoryTable {
        async fn page(&self, after: Option<&[Value]>, limit: usize) -> Result<Vec<Row>> {
            Ok(self
                .rows
                .iter()
                .filter(|row| match after {
                    Some(after) => compare_keys(&row.key_values_owned(), after) == Ordering::Greater,
                    None => true,
                })
                .take(limit)
                .cloned()
                .collect())
        }

        async fn count(&self) -> Result<u64> {
            Ok(self.rows.len() as u64)
        }

        fn key_of(&self, row: &Row) -> Vec<Value> {
            row.key_values_owned()
        }
    }

    fn columns() -> Vec<String> {
        vec!["order_id".into(), "user_id".into()]
    }

    async fn run(sources: &[&MemoryTable], target: &MemoryTable) -> ConsistencyCheckResult {
        let progress = RwLock::new(CheckProgress::new(vec!["t_order".into()]));
        let readers: Vec<&dyn PageReader> = sources.iter().map(|s| *s as &dyn PageReader).collect();
        check_table(
            "t_order",
            &readers,
            target,
            &columns(),
            2,
            &progress,
            &CancellationToken::new(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_matching_tables() {
        let source = MemoryTable::new(&[(1, 1), (999, 10)]);
        let target = MemoryTable::new(&[(1, 1), (999, 10)]);
        let result = run(&[&source], &target).await;
        assert!(result.count.matched);
        assert_eq!(result.count.source_count, 2);
        assert_eq!(result.count.target_count, 2);
        assert!(result.content.matched);
        assert!(result.is_matched());
    }

    #[tokio::test]
    async fn test_check_is_idempotent() {
        let source = MemoryTable::new(&[(1, 1), (2, 2), (3, 3), (4, 4), (5, 5)]);
        let target = MemoryTable::new(&[(1, 1), (2, 2), (3, 30), (4, 4), (5, 5)]);
        let first = run(&[&source], &target).await;
        let second = run(&[&source], &target).await;
        assert_eq!(first, second);
        assert!(!first.content.matched);
        assert_eq!(
            first.content.first_mismatch.as_deref(),
            Some("row with key (3) differs")
        );
    }

    #[tokio::test]
    async fn test_count_and_content_reported_independently() {
        // Same count, different keys
        let source = MemoryTable::new(&[(1, 1), (2, 2)]);
        let target = MemoryTable::new(&[(1, 1), (3, 2)]);
        let result = run(&[&source], &target).await;
        assert!(result.count.matched);
        assert!(!result.content.matched);
        assert_eq!(
            result.content.first_mismatch.as_deref(),
            Some("target is missing key (2)")
        );

        // Leftover target rows after the source is exhausted
        let source = MemoryTable::new(&[(1, 1), (2, 2)]);
        let target = MemoryTable::new(&[(1, 1), (2, 2), (3, 3)]);
        let result = run(&[&source], &target).await;
        assert!(!result.count.matched);
        assert_eq!(result.count.target_count, 3);
        assert_eq!(
            result.content.first_mismatch.as_deref(),
            Some("target has unexpected key (3)")
        );
    }

    #[tokio::test]
    async fn test_sources_are_merged_in_key_order() {
        let shard0 = MemoryTable::new(&[(2, 1), (4, 1), (6, 1)]);
        let shard1 = MemoryTable::new(&[(1, 1), (3, 1), (5, 1)]);
        let target = MemoryTable::new(&[(1, 1), (2, 1), (3, 1), (4, 1), (5, 1), (6, 1)]);
        let result = run(&[&shard0, &shard1], &target).await;
        assert_eq!(result.count.source_count, 6);
        assert!(result.is_matched());
    }

    /// Rows without key flags, keyed by column name the way a shard with
    /// its own metadata reports them
    struct NamedKeyTable {
        rows: Vec<Row>,
    }

    impl NamedKeyTable {
        fn new(pairs: &[(i64, i64)]) -> Self {
            let rows = pairs
                .iter()
                .map(|(order_id, user_id)| {
                    Row::new(vec![
                        Column::new("order_id", Value::Int(*order_id), false),
                        Column::new("user_id", Value::Int(*user_id), false),
                    ])
                })
                .collect();
            Self { rows }
        }
    }

    #[async_trait]
    impl PageReader for NamedKeyTable {
        async fn page(&self, after: Option<&[Value]>, limit: usize) -> Result<Vec<Row>> {
            Ok(self
                .rows
                .iter()
                .filter(|row| match after {
                    Some(after) => compare_keys(&self.key_of(row), after) == Ordering::Greater,
                    None => true,
                })
                .take(limit)
                .cloned()
                .collect())
        }

        async fn count(&self) -> Result<u64> {
            Ok(self.rows.len() as u64)
        }

        fn key_of(&self, row: &Row) -> Vec<Value> {
            vec![row.get("order_id").cloned().unwrap_or(Value::Null)]
        }
    }

    #[tokio::test]
    async fn test_mismatch_keyed_by_originating_source() {
        let shard0 = MemoryTable::new(&[(2, 1), (4, 1)]);
        let shard1 = NamedKeyTable::new(&[(1, 1), (3, 1)]);
        let target = MemoryTable::new(&[(1, 1), (2, 1), (3, 9), (4, 1)]);
        let progress = RwLock::new(CheckProgress::new(vec!["t_order".into()]));
        let sources: Vec<&dyn PageReader> = vec![&shard0, &shard1];
        let result = check_table(
            "t_order",
            &sources,
            &target,
            &columns(),
            4,
            &progress,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(result.count.matched);
        assert_eq!(
            result.content.first_mismatch.as_deref(),
            Some("row with key (3) differs")
        );
    }

    #[tokio::test]
    async fn test_cancelled_check() {
        let source = MemoryTable::new(&[(1, 1)]);
        let progress = RwLock::new(CheckProgress::new(vec!["t_order".into()]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = check_table("t_order", &[&source], &source, &columns(), 2, &progress, &cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn test_compare_keys() {
        assert_eq!(compare_keys(&[Value::Int(2)], &[Value::Int(10)]), Ordering::Less);
        assert_eq!(compare_keys(&[Value::Int(-1)], &[Value::UInt(0)]), Ordering::Less);
        assert_eq!(
            compare_keys(
                &[Value::Int(1), Value::String("b".into())],
                &[Value::Int(1), Value::String("a".into())]
            ),
            Ordering::Greater
        );
    }

    #[test]
    fn test_progress_estimates() {
        let mut progress = CheckProgress::new(vec!["t_order".into()]);
        progress.total_records = 1000;
        progress.checked_records = 250;
        progress.begin_time = Utc::now() - chrono::Duration::seconds(10);
        assert_eq!(progress.finished_percentage(), 25);

        let remaining = progress.remaining_seconds(progress.begin_time + chrono::Duration::seconds(10));
        assert_eq!(remaining, 30);

        progress.end_time = Some(progress.begin_time + chrono::Duration::seconds(12));
        assert_eq!(progress.finished_percentage(), 100);
        assert_eq!(progress.remaining_seconds(Utc::now()), 0);
        assert_eq!(progress.duration_seconds(Utc::now()), 12);
    }

    #[test]
    fn test_failed_tables() {
        let mut progress = CheckProgress::new(vec!["t_order".into(), "t_item".into()]);
        progress.end_time = Some(Utc::now());
        progress.results = vec![
            ConsistencyCheckResult {
                table: "t_order".into(),
                count: CountCheckResult { source_count: 2, target_count: 2, matched: true },
                content: ContentCheckResult { matched: true, first_mismatch: None },
            },
            ConsistencyCheckResult {
                table: "t_item".into(),
                count: CountCheckResult { source_count: 2, target_count: 1, matched: false },
                content: ContentCheckResult { matched: true, first_mismatch: None },
            },
        ];
        assert!(!progress.is_matched());
        assert_eq!(progress.failed_tables(), vec!["t_item".to_string()]);
    }
}
