// ai
//! 🧪 InMemoryWarehouse: a warehouse that lives and dies with the process.
//!
//! 🎬 *[a table is created. nobody pays for it. it is the happiest table alive.]*
//!
//! Used by tests and by `warehouse.InMemory` runs. It keeps pending streams, committed
//! tables and a seeded query result behind one `Arc`, counts every call, and can be told to
//! misbehave in the specific ways the sink has to survive:
//! - fail the Nth append, or delay appends so they complete out of order
//! - commit without a commit time, or with stream errors
//! - take its sweet time to terminate after shutdown
//! - report pending polls or a job error on the query side
//!
//! 🧠 Knowledge graph: appended batches are stored by offset, so the committed table is in
//! submission order no matter which append finished first.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::{debug, trace};

use super::{
    ClientLifecycle, CommitResponse, QueryClient, QueryJob, ResultPage, StreamErrorEntry, WriteClient,
    WriteStream,
};
use crate::codec::RecordBatchCodec;
use crate::common::{BatchRow, TableSchema, Target};
use crate::error::{BridgeError, BridgeResult};

/// 🔢 How many times each operation was called. A snapshot, not a live view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub create_stream: usize,
    pub append: usize,
    pub close: usize,
    pub finalize: usize,
    pub commit: usize,
    pub shutdown: usize,
    pub query_jobs: usize,
    pub result_pages: usize,
}

#[derive(Debug, Default)]
struct CallCounters {
    create_stream: AtomicUsize,
    append: AtomicUsize,
    close: AtomicUsize,
    finalize: AtomicUsize,
    commit: AtomicUsize,
    shutdown: AtomicUsize,
    query_jobs: AtomicUsize,
    result_pages: AtomicUsize,
}

/// 😈 Misbehaviour on request.
#[derive(Debug, Default, Clone)]
struct Faults {
    /// 1-based append call that fails.
    fail_append_number: Option<usize>,
    /// Delay for the Nth append call (index 0 = first call).
    append_delays: Vec<Duration>,
    commit_without_timestamp: bool,
    commit_stream_error: Option<String>,
    termination_delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct Table {
    schema: Option<TableSchema>,
    rows: Vec<BatchRow>,
}

#[derive(Debug)]
struct PendingStream {
    target: Target,
    batches: BTreeMap<u64, Vec<BatchRow>>,
    closed: bool,
    finalized: bool,
}

#[derive(Debug, Clone)]
struct QueryFixture {
    schema: TableSchema,
    rows: Vec<BatchRow>,
    page_size: Option<usize>,
    pending_polls: usize,
    job_error: Option<String>,
    later_page_schema: Option<TableSchema>,
}

#[derive(Debug, Default)]
struct Warehouse {
    tables: Mutex<HashMap<String, Table>>,
    streams: Mutex<HashMap<String, PendingStream>>,
    next_id: AtomicUsize,
    calls: CallCounters,
    faults: Mutex<Faults>,
    query: Mutex<Option<QueryFixture>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // -- 🧯 a panicked test thread should not take the whole warehouse down with it
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 🧪 The shared warehouse. Clones see the same tables.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWarehouse {
    inner: Arc<Warehouse>,
}

impl InMemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// 📐 Register a table so schema lookups find it.
    pub fn with_table(self, target: &Target, schema: TableSchema) -> Self {
        lock(&self.inner.tables)
            .entry(target.table_path())
            .or_default()
            .schema = Some(schema);
        self
    }

    /// 💥 Make the `n`th append call (1-based) fail.
    pub fn failing_append(self, n: usize) -> Self {
        lock(&self.inner.faults).fail_append_number = Some(n);
        self
    }

    /// 🐢 Delay append calls by position, so later appends can finish first.
    pub fn delaying_appends(self, delays: Vec<Duration>) -> Self {
        lock(&self.inner.faults).append_delays = delays;
        self
    }

    pub fn committing_without_timestamp(self) -> Self {
        lock(&self.inner.faults).commit_without_timestamp = true;
        self
    }

    pub fn committing_with_stream_error(self, message: impl Into<String>) -> Self {
        lock(&self.inner.faults).commit_stream_error = Some(message.into());
        self
    }

    /// 🐌 After shutdown, clients only count as terminated once `delay` has passed.
    pub fn terminating_slowly(self, delay: Duration) -> Self {
        lock(&self.inner.faults).termination_delay = Some(delay);
        self
    }

    /// 🔎 Seed the result every query job will return.
    pub fn with_query_result(self, schema: TableSchema, rows: Vec<BatchRow>, page_size: Option<usize>) -> Self {
        *lock(&self.inner.query) = Some(QueryFixture {
            schema,
            rows,
            page_size,
            pending_polls: 0,
            job_error: None,
            later_page_schema: None,
        });
        self
    }

    /// ⏳ The first `polls` result fetches report the job as still running.
    pub fn with_pending_polls(self, polls: usize) -> Self {
        if let Some(fixture) = lock(&self.inner.query).as_mut() {
            fixture.pending_polls = polls;
        }
        self
    }

    /// 🔀 Pages after the first announce `schema` instead of staying quiet about it.
    pub fn with_later_page_schema(self, schema: TableSchema) -> Self {
        if let Some(fixture) = lock(&self.inner.query).as_mut() {
            fixture.later_page_schema = Some(schema);
        }
        self
    }

    /// 💀 Query jobs complete, but with this job-level error.
    pub fn failing_query_job(self, message: impl Into<String>) -> Self {
        let mut query = lock(&self.inner.query);
        let fixture = query.get_or_insert_with(|| QueryFixture {
            schema: TableSchema::default(),
            rows: Vec::new(),
            page_size: None,
            pending_polls: 0,
            job_error: None,
            later_page_schema: None,
        });
        fixture.job_error = Some(message.into());
        drop(query);
        self
    }

    pub fn calls(&self) -> CallCounts {
        let c = &self.inner.calls;
        CallCounts {
            create_stream: c.create_stream.load(Ordering::Acquire),
            append: c.append.load(Ordering::Acquire),
            close: c.close.load(Ordering::Acquire),
            finalize: c.finalize.load(Ordering::Acquire),
            commit: c.commit.load(Ordering::Acquire),
            shutdown: c.shutdown.load(Ordering::Acquire),
            query_jobs: c.query_jobs.load(Ordering::Acquire),
            result_pages: c.result_pages.load(Ordering::Acquire),
        }
    }

    /// 📋 Everything committed to `target` so far, in commit then offset order.
    pub fn committed_rows(&self, target: &Target) -> Vec<BatchRow> {
        lock(&self.inner.tables)
            .get(&target.table_path())
            .map(|table| table.rows.clone())
            .unwrap_or_default()
    }

    /// 🔌 A fresh per-session client over this warehouse.
    pub fn open_write_client(&self) -> InMemoryWriteClient {
        InMemoryWriteClient {
            warehouse: Arc::clone(&self.inner),
            lifecycle: Arc::new(ClientLifecycle::default()),
            shutdown_at: Arc::new(Mutex::new(None)),
        }
    }

    fn next_id(&self) -> usize {
        self.inner.next_id.fetch_add(1, Ordering::AcqRel)
    }
}

#[async_trait]
impl QueryClient for InMemoryWarehouse {
    async fn insert_query_job(
        &self,
        project: &str,
        query: &str,
        _destination: Option<&Target>,
    ) -> BridgeResult<QueryJob> {
        self.inner.calls.query_jobs.fetch_add(1, Ordering::AcqRel);
        if lock(&self.inner.query).is_none() {
            return Err(BridgeError::Job("no query result seeded in the in-memory warehouse".into()));
        }
        let job = QueryJob {
            project: project.to_string(),
            job_id: format!("job-{}", self.next_id()),
            location: None,
        };
        debug!("🔎 in-memory job {} accepted query: {query}", job.job_id);
        Ok(job)
    }

    async fn get_query_results(
        &self,
        job: &QueryJob,
        page_token: Option<&str>,
        page_size: u32,
    ) -> BridgeResult<ResultPage> {
        self.inner.calls.result_pages.fetch_add(1, Ordering::AcqRel);
        let mut query = lock(&self.inner.query);
        let fixture = query
            .as_mut()
            .ok_or_else(|| BridgeError::Job(format!("job {} has no result", job.job_id)))?;

        if fixture.pending_polls > 0 {
            fixture.pending_polls -= 1;
            return Ok(ResultPage::default());
        }
        if let Some(message) = &fixture.job_error {
            return Err(BridgeError::Job(message.clone()));
        }

        let page = match page_token {
            None => 0,
            Some(token) => token
                .strip_prefix("page-")
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| BridgeError::Job(format!("unknown page token '{token}'")))?,
        };
        let size = fixture.page_size.unwrap_or(page_size as usize).max(1);
        let start = (page * size).min(fixture.rows.len());
        let end = (start + size).min(fixture.rows.len());

        trace!("📄 in-memory job {} serving rows {start}..{end}", job.job_id);
        Ok(ResultPage {
            job_complete: true,
            // -- 📐 schema rides on the first page only; later pages make you remember it
            schema: if page == 0 {
                Some(fixture.schema.clone())
            } else {
                fixture.later_page_schema.clone()
            },
            rows: fixture.rows[start..end]
                .iter()
                .map(RecordBatchCodec::encode_table_row)
                .collect(),
            page_token: (end < fixture.rows.len()).then(|| format!("page-{}", page + 1)),
        })
    }
}

/// 🔌 One session's view of the in-memory warehouse.
#[derive(Debug, Clone)]
pub struct InMemoryWriteClient {
    warehouse: Arc<Warehouse>,
    lifecycle: Arc<ClientLifecycle>,
    shutdown_at: Arc<Mutex<Option<Instant>>>,
}

impl InMemoryWriteClient {
    fn unknown_stream(operation: &'static str, stream: &WriteStream) -> BridgeError {
        BridgeError::stream(operation, format!("unknown write stream '{}'", stream.name))
    }
}

#[async_trait]
impl WriteClient for InMemoryWriteClient {
    async fn table_schema(&self, target: &Target) -> BridgeResult<TableSchema> {
        lock(&self.warehouse.tables)
            .get(&target.table_path())
            .and_then(|table| table.schema.clone())
            .ok_or_else(|| BridgeError::stream("schema lookup", format!("table {target} does not exist")))
    }

    async fn create_write_stream(&self, target: &Target) -> BridgeResult<WriteStream> {
        let _ticket = self.lifecycle.begin("create stream")?;
        self.warehouse.calls.create_stream.fetch_add(1, Ordering::AcqRel);
        let id = self.warehouse.next_id.fetch_add(1, Ordering::AcqRel);
        let stream = WriteStream {
            name: format!("{}/streams/{id}", target.table_path()),
        };
        lock(&self.warehouse.streams).insert(
            stream.name.clone(),
            PendingStream {
                target: target.clone(),
                batches: BTreeMap::new(),
                closed: false,
                finalized: false,
            },
        );
        Ok(stream)
    }

    async fn append_rows(&self, stream: &WriteStream, rows: &[BatchRow], offset: u64) -> BridgeResult<()> {
        let _ticket = self.lifecycle.begin("append")?;
        let call = self.warehouse.calls.append.fetch_add(1, Ordering::AcqRel) + 1;
        let (delay, fail) = {
            let faults = lock(&self.warehouse.faults);
            (
                faults.append_delays.get(call - 1).copied(),
                faults.fail_append_number == Some(call),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(BridgeError::stream("append", format!("injected failure on append #{call}")));
        }

        let mut streams = lock(&self.warehouse.streams);
        let pending = streams
            .get_mut(&stream.name)
            .ok_or_else(|| Self::unknown_stream("append", stream))?;
        if pending.finalized {
            return Err(BridgeError::stream("append", format!("stream '{}' is finalized", stream.name)));
        }
        pending.batches.insert(offset, rows.to_vec());
        Ok(())
    }

    async fn close_stream(&self, stream: &WriteStream) -> BridgeResult<()> {
        self.warehouse.calls.close.fetch_add(1, Ordering::AcqRel);
        let mut streams = lock(&self.warehouse.streams);
        let pending = streams
            .get_mut(&stream.name)
            .ok_or_else(|| Self::unknown_stream("close", stream))?;
        pending.closed = true;
        Ok(())
    }

    async fn finalize_write_stream(&self, stream: &WriteStream) -> BridgeResult<u64> {
        let _ticket = self.lifecycle.begin("finalize")?;
        self.warehouse.calls.finalize.fetch_add(1, Ordering::AcqRel);
        let mut streams = lock(&self.warehouse.streams);
        let pending = streams
            .get_mut(&stream.name)
            .ok_or_else(|| Self::unknown_stream("finalize", stream))?;
        pending.finalized = true;
        Ok(pending.batches.values().map(|b| b.len() as u64).sum())
    }

    async fn batch_commit(&self, target: &Target, streams: &[WriteStream]) -> BridgeResult<CommitResponse> {
        let _ticket = self.lifecycle.begin("commit")?;
        self.warehouse.calls.commit.fetch_add(1, Ordering::AcqRel);
        let faults = lock(&self.warehouse.faults).clone();
        if faults.commit_without_timestamp {
            return Ok(CommitResponse::default());
        }
        if let Some(message) = faults.commit_stream_error {
            return Ok(CommitResponse {
                commit_time: Some(commit_timestamp()),
                stream_errors: streams
                    .iter()
                    .map(|s| StreamErrorEntry {
                        code: "INVALID_STREAM_STATE".into(),
                        entity: s.name.clone(),
                        message: message.clone(),
                    })
                    .collect(),
            });
        }

        let mut pending = lock(&self.warehouse.streams);
        let stream_errors: Vec<StreamErrorEntry> = streams
            .iter()
            .filter_map(|s| match pending.get(&s.name) {
                Some(p) if p.finalized && p.target == *target => None,
                Some(p) if !p.finalized => Some(("STREAM_NOT_FINALIZED", s, "stream is not finalized")),
                Some(_) => Some(("INVALID_STREAM_TYPE", s, "stream belongs to another table")),
                None => Some(("STREAM_NOT_FOUND", s, "stream does not exist")),
            })
            .map(|(code, s, message)| StreamErrorEntry {
                code: code.into(),
                entity: s.name.clone(),
                message: message.into(),
            })
            .collect();
        if !stream_errors.is_empty() {
            // -- 🚫 all or nothing: a single bad stream means nothing lands
            return Ok(CommitResponse {
                commit_time: None,
                stream_errors,
            });
        }

        let mut tables = lock(&self.warehouse.tables);
        let table = tables.entry(target.table_path()).or_default();
        for s in streams {
            if let Some(p) = pending.remove(&s.name) {
                table.rows.extend(p.batches.into_values().flatten());
            }
        }
        Ok(CommitResponse {
            commit_time: Some(commit_timestamp()),
            stream_errors: Vec::new(),
        })
    }

    fn shutdown_now(&self) {
        self.warehouse.calls.shutdown.fetch_add(1, Ordering::AcqRel);
        self.lifecycle.shutdown_now();
        lock(&self.shutdown_at).get_or_insert_with(Instant::now);
    }

    async fn await_termination(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        if !self.lifecycle.await_termination(timeout).await {
            return false;
        }
        let delay = lock(&self.warehouse.faults).termination_delay;
        let Some(delay) = delay else {
            return true;
        };

        let shut_down_at = (*lock(&self.shutdown_at)).unwrap_or(started);
        let ready_at = shut_down_at + delay;
        let now = Instant::now();
        if now >= ready_at {
            return true;
        }
        let budget = timeout.saturating_sub(started.elapsed());
        let wait = ready_at - now;
        if wait <= budget {
            tokio::time::sleep(wait).await;
            true
        } else {
            tokio::time::sleep(budget).await;
            false
        }
    }
}

fn commit_timestamp() -> String {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:06}Z", since_epoch.as_secs(), since_epoch.subsec_micros())
}
