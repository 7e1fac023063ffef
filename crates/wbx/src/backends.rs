//! 🔌 Backends: where the bridge actually touches a warehouse.
//!
//! 🚰 The write side hands out one [`WriteClient`] per sink session; the session opens a
//! stream on it, appends, closes, finalizes, commits, and finally shuts the client down.
//! 🔎 The read side is a [`QueryClient`]: submit a job, page through results.
//!
//! Same shape as everywhere else in this crate: trait → concrete impls → enum dispatcher, so
//! the sink and the source never need to know whether they are talking to a real warehouse
//! over HTTP or to the in-memory one the tests lean on.
//!
//! 🦆 The duck would like it noted that it has never once been consulted on the trait design.

pub mod bigquery;
pub mod in_mem;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;

use crate::common::{BatchRow, TableSchema, Target};
use crate::credentials::CredentialProvider;
use crate::error::{BridgeError, BridgeResult};

pub use bigquery::{BigQueryConfig, BigQueryWarehouse, BigQueryWriteClient};
pub use in_mem::{InMemoryWarehouse, InMemoryWriteClient};

// ===== Wire-level value types =====

/// 📝 Handle for a server-side write stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteStream {
    pub name: String,
}

/// ✅ What a batch commit said. `commit_time == None` or any stream error means "not committed".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitResponse {
    pub commit_time: Option<String>,
    pub stream_errors: Vec<StreamErrorEntry>,
}

/// 🚫 One per-stream complaint inside a commit response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamErrorEntry {
    pub code: String,
    pub entity: String,
    pub message: String,
}

/// 🔎 A submitted query job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryJob {
    pub project: String,
    pub job_id: String,
    pub location: Option<String>,
}

/// 📄 One page of query results, rows still in the warehouse's positional `f`/`v` shape.
#[derive(Debug, Clone, Default)]
pub struct ResultPage {
    pub job_complete: bool,
    pub schema: Option<TableSchema>,
    pub rows: Vec<Value>,
    pub page_token: Option<String>,
}

// ===== Traits =====

/// 🚰 Per-session write access to one warehouse.
#[async_trait]
pub trait WriteClient: std::fmt::Debug + Send + Sync {
    /// 📐 The governing column list for `target`.
    async fn table_schema(&self, target: &Target) -> BridgeResult<TableSchema>;
    /// 🆕 Open a pending write stream on `target`.
    async fn create_write_stream(&self, target: &Target) -> BridgeResult<WriteStream>;
    /// 📤 Append one batch at `offset` (the stream's row count before this batch).
    async fn append_rows(&self, stream: &WriteStream, rows: &[BatchRow], offset: u64) -> BridgeResult<()>;
    /// 🚪 Stop sending on the stream.
    async fn close_stream(&self, stream: &WriteStream) -> BridgeResult<()>;
    /// 🏁 Seal the stream; returns the row count the warehouse holds for it.
    async fn finalize_write_stream(&self, stream: &WriteStream) -> BridgeResult<u64>;
    /// 💍 Atomically commit the finalized streams.
    async fn batch_commit(&self, target: &Target, streams: &[WriteStream]) -> BridgeResult<CommitResponse>;
    /// 🛑 Refuse new work immediately. Work already in flight may finish.
    fn shutdown_now(&self);
    /// ⏳ Wait up to `timeout` for the client to fully terminate. True if it did.
    async fn await_termination(&self, timeout: Duration) -> bool;
}

/// 🔎 Query access to one warehouse.
#[async_trait]
pub trait QueryClient: std::fmt::Debug + Send + Sync {
    async fn insert_query_job(
        &self,
        project: &str,
        query: &str,
        destination: Option<&Target>,
    ) -> BridgeResult<QueryJob>;

    async fn get_query_results(
        &self,
        job: &QueryJob,
        page_token: Option<&str>,
        page_size: u32,
    ) -> BridgeResult<ResultPage>;
}

// ===== Dispatchers =====

/// 🎭 The warehouse we were configured with.
#[derive(Debug, Clone)]
pub enum WarehouseBackend {
    BigQuery(BigQueryWarehouse),
    InMemory(InMemoryWarehouse),
}

impl WarehouseBackend {
    /// 🏗️ Build from config. The credential provider is only used by the HTTP backend.
    pub fn from_config(
        config: &crate::app_config::WarehouseConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> BridgeResult<Self> {
        use crate::app_config::WarehouseConfig;
        match config {
            WarehouseConfig::BigQuery(bq) => Ok(Self::BigQuery(BigQueryWarehouse::new(bq.clone(), credentials)?)),
            WarehouseConfig::InMemory => Ok(Self::InMemory(InMemoryWarehouse::new())),
        }
    }

    /// 🔌 A fresh write client for one sink session. Each session shuts its own client down.
    pub fn open_write_client(&self) -> BridgeResult<WriteClientBackend> {
        match self {
            Self::BigQuery(bq) => Ok(WriteClientBackend::BigQuery(bq.open_write_client()?)),
            Self::InMemory(mem) => Ok(WriteClientBackend::InMemory(mem.open_write_client())),
        }
    }
}

#[async_trait]
impl QueryClient for WarehouseBackend {
    async fn insert_query_job(
        &self,
        project: &str,
        query: &str,
        destination: Option<&Target>,
    ) -> BridgeResult<QueryJob> {
        match self {
            Self::BigQuery(bq) => bq.insert_query_job(project, query, destination).await,
            Self::InMemory(mem) => mem.insert_query_job(project, query, destination).await,
        }
    }

    async fn get_query_results(
        &self,
        job: &QueryJob,
        page_token: Option<&str>,
        page_size: u32,
    ) -> BridgeResult<ResultPage> {
        match self {
            Self::BigQuery(bq) => bq.get_query_results(job, page_token, page_size).await,
            Self::InMemory(mem) => mem.get_query_results(job, page_token, page_size).await,
        }
    }
}

/// 🎭 A per-session write client, whichever flavour.
#[derive(Debug, Clone)]
pub enum WriteClientBackend {
    BigQuery(BigQueryWriteClient),
    InMemory(InMemoryWriteClient),
}

#[async_trait]
impl WriteClient for WriteClientBackend {
    async fn table_schema(&self, target: &Target) -> BridgeResult<TableSchema> {
        match self {
            Self::BigQuery(c) => c.table_schema(target).await,
            Self::InMemory(c) => c.table_schema(target).await,
        }
    }

    async fn create_write_stream(&self, target: &Target) -> BridgeResult<WriteStream> {
        match self {
            Self::BigQuery(c) => c.create_write_stream(target).await,
            Self::InMemory(c) => c.create_write_stream(target).await,
        }
    }

    async fn append_rows(&self, stream: &WriteStream, rows: &[BatchRow], offset: u64) -> BridgeResult<()> {
        match self {
            Self::BigQuery(c) => c.append_rows(stream, rows, offset).await,
            Self::InMemory(c) => c.append_rows(stream, rows, offset).await,
        }
    }

    async fn close_stream(&self, stream: &WriteStream) -> BridgeResult<()> {
        match self {
            Self::BigQuery(c) => c.close_stream(stream).await,
            Self::InMemory(c) => c.close_stream(stream).await,
        }
    }

    async fn finalize_write_stream(&self, stream: &WriteStream) -> BridgeResult<u64> {
        match self {
            Self::BigQuery(c) => c.finalize_write_stream(stream).await,
            Self::InMemory(c) => c.finalize_write_stream(stream).await,
        }
    }

    async fn batch_commit(&self, target: &Target, streams: &[WriteStream]) -> BridgeResult<CommitResponse> {
        match self {
            Self::BigQuery(c) => c.batch_commit(target, streams).await,
            Self::InMemory(c) => c.batch_commit(target, streams).await,
        }
    }

    fn shutdown_now(&self) {
        match self {
            Self::BigQuery(c) => c.shutdown_now(),
            Self::InMemory(c) => c.shutdown_now(),
        }
    }

    async fn await_termination(&self, timeout: Duration) -> bool {
        match self {
            Self::BigQuery(c) => c.await_termination(timeout).await,
            Self::InMemory(c) => c.await_termination(timeout).await,
        }
    }
}

// ===== Shared client lifecycle =====

/// 🚦 Shutdown bookkeeping shared by the write clients: a closed flag plus a count of
/// requests still on the wire. Terminated means shut down and idle.
#[derive(Debug, Default)]
pub(crate) struct ClientLifecycle {
    shut_down: AtomicBool,
    active: AtomicUsize,
    idle: Notify,
}

/// 🎟️ Held for the duration of one request. Dropping it is the "request finished" signal.
pub(crate) struct ActiveRequest<'a> {
    lifecycle: &'a ClientLifecycle,
}

impl Drop for ActiveRequest<'_> {
    fn drop(&mut self) {
        if self.lifecycle.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.lifecycle.idle.notify_waiters();
        }
    }
}

impl ClientLifecycle {
    /// 🎟️ Register a request, or refuse it if the client is already shut down.
    pub(crate) fn begin(&self, operation: &'static str) -> BridgeResult<ActiveRequest<'_>> {
        self.active.fetch_add(1, Ordering::AcqRel);
        let ticket = ActiveRequest { lifecycle: self };
        if self.shut_down.load(Ordering::Acquire) {
            // -- 🎟️ ticket drops here and gives its slot back
            return Err(BridgeError::stream(operation, "write client is shut down"));
        }
        Ok(ticket)
    }

    pub(crate) fn shutdown_now(&self) {
        self.shut_down.store(true, Ordering::Release);
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// ⏳ True once shut down with nothing in flight, within `timeout`.
    pub(crate) async fn await_termination(&self, timeout: Duration) -> bool {
        if !self.is_shut_down() {
            return false;
        }
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.active.load(Ordering::Acquire) == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn the_one_where_a_shut_down_client_turns_work_away() {
        let lifecycle = ClientLifecycle::default();
        assert!(lifecycle.begin("append").is_ok());
        lifecycle.shutdown_now();
        assert!(matches!(
            lifecycle.begin("append"),
            Err(BridgeError::Stream { operation: "append", .. })
        ));
        assert!(lifecycle.await_termination(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn the_one_where_termination_waits_for_the_last_request() {
        let lifecycle = Arc::new(ClientLifecycle::default());
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let worker = {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move {
                let _ticket = lifecycle.begin("append").expect("💀 should not be shut down yet");
                let _ = started_tx.send(());
                tokio::time::sleep(Duration::from_millis(50)).await;
            })
        };
        started_rx.await.unwrap();
        lifecycle.shutdown_now();
        assert!(!lifecycle.await_termination(Duration::from_millis(1)).await);
        assert!(lifecycle.await_termination(Duration::from_secs(5)).await);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn the_one_where_a_running_client_is_not_terminated() {
        let lifecycle = ClientLifecycle::default();
        assert!(!lifecycle.await_termination(Duration::from_millis(1)).await);
    }
}
