//! 🎬 *[a list of parts arrives. some are files. one is a failure wearing a part costume.]*
//!
//! 🧭 TransferCoordinator: the front door of the sink path.
//!
//! - [`TransferCoordinator::transfer`] runs one session: mint a write client, work out the
//!   governing schema, hand the parts to a [`StreamingSink`] and return whatever it says.
//!   No retries here. If a wrapping layer wants retries, it can have them.
//! - [`TransferCoordinator::transfer_all`] runs many independent sessions side by side.
//!   Jobs go into an `async-channel`, `session_parallelism` workers pull from it, and every
//!   outcome comes back in a [`TransferReport`]. One session failing never touches another.
//!
//! 🦆 The duck coordinates nothing. The duck has never been asked.

mod session_worker;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::backends::{WarehouseBackend, WriteClient, WriteClientBackend};
use crate::codec::RecordBatchCodec;
use crate::common::{TableSchema, Target};
use crate::error::BridgeResult;
use crate::parts::{Part, PartBody, total_expected_rows};
use crate::sink::{SessionReport, SinkSettings, StreamingSink, shut_down_client};
use session_worker::{SessionWorker, Worker};

/// 📦 One independent session's worth of work.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub target: Target,
    pub parts: Vec<Part>,
}

/// 🧾 How one session ended. Failures are kept as their human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionResult {
    pub target: Target,
    pub outcome: Result<SessionReport, String>,
}

/// 🧾 Every session of a [`TransferCoordinator::transfer_all`] run, in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub sessions: Vec<SessionResult>,
    /// 📊 Sum of advertised rows across every part. Observability only.
    pub expected_rows: u64,
    pub elapsed: Duration,
}

impl TransferReport {
    pub fn succeeded(&self) -> usize {
        self.sessions.iter().filter(|s| s.outcome.is_ok()).count()
    }

    pub fn is_success(&self) -> bool {
        self.succeeded() == self.sessions.len()
    }

    /// 💬 `"<target>: <reason>"` for every failed session.
    pub fn failure_reasons(&self) -> Vec<String> {
        self.sessions
            .iter()
            .filter_map(|s| s.outcome.as_ref().err().map(|reason| format!("{}: {reason}", s.target)))
            .collect()
    }
}

/// 🧭 Fans parts out to sink sessions.
#[derive(Debug, Clone)]
pub struct TransferCoordinator {
    warehouse: WarehouseBackend,
    settings: SinkSettings,
    schema: Option<TableSchema>,
    session_parallelism: usize,
    queue_capacity: usize,
    show_progress: bool,
}

impl TransferCoordinator {
    pub fn new(warehouse: WarehouseBackend, settings: SinkSettings) -> Self {
        Self {
            warehouse,
            settings,
            schema: None,
            session_parallelism: 1,
            queue_capacity: 10,
            show_progress: false,
        }
    }

    /// 📐 Use this column list instead of asking the warehouse for the target's schema.
    pub fn with_schema(mut self, schema: Option<TableSchema>) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_runtime(mut self, session_parallelism: usize, queue_capacity: usize) -> Self {
        self.session_parallelism = session_parallelism.max(1);
        self.queue_capacity = queue_capacity.max(1);
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// 🚀 One session: every batch of every part into `target`, all or nothing.
    pub async fn transfer(&self, target: &Target, parts: &[Part]) -> BridgeResult<SessionReport> {
        info!(
            "🧭 transferring {} parts ({} rows advertised) into {target}",
            parts.len(),
            total_expected_rows(parts)
        );
        let client = self.warehouse.open_write_client()?;
        // -- 🫙 nothing to decode (no parts, or only failed ones), no reason to ask about schemas.
        // -- a failed part still has to reach the sink so its carried error is what surfaces.
        let schema = if parts.iter().all(|part| matches!(part.body, PartBody::Failed(_))) {
            TableSchema::default()
        } else {
            match self.resolve_schema(&client, target).await {
                Ok(schema) => schema,
                Err(err) => {
                    shut_down_client(&client, target, &self.settings).await;
                    return Err(err);
                }
            }
        };

        let sink = StreamingSink::new(
            target.clone(),
            client,
            RecordBatchCodec::new(Arc::new(schema)),
            self.settings.clone(),
        );
        let mut sink = if self.show_progress { sink.with_progress() } else { sink };
        sink.transfer(parts).await
    }

    async fn resolve_schema(&self, client: &WriteClientBackend, target: &Target) -> BridgeResult<TableSchema> {
        match &self.schema {
            Some(schema) => Ok(schema.clone()),
            None => client.table_schema(target).await,
        }
    }

    /// 🧵 Many independent sessions, `session_parallelism` at a time.
    pub async fn transfer_all(&self, jobs: Vec<TransferJob>) -> TransferReport {
        let started = Instant::now();
        let expected_rows = jobs.iter().map(|j| total_expected_rows(&j.parts)).sum();
        let targets: Vec<Target> = jobs.iter().map(|j| j.target.clone()).collect();
        info!(
            "🧵 {} sessions across {} workers",
            jobs.len(),
            self.session_parallelism
        );

        let (job_tx, job_rx) = async_channel::bounded(self.queue_capacity);
        let (result_tx, result_rx) = async_channel::unbounded();
        let workers: Vec<_> = (0..self.session_parallelism)
            .map(|id| SessionWorker::new(id, job_rx.clone(), result_tx.clone(), self.clone()).start())
            .collect();
        drop(job_rx);
        drop(result_tx);

        for (index, job) in jobs.into_iter().enumerate() {
            if job_tx.send((index, job)).await.is_err() {
                error!("💀 every session worker is gone; {} jobs were never started", targets.len() - index);
                break;
            }
        }
        job_tx.close();

        let mut outcomes: Vec<Option<Result<SessionReport, String>>> = vec![None; targets.len()];
        while let Ok((index, outcome)) = result_rx.recv().await {
            outcomes[index] = Some(outcome);
        }
        for worker in workers {
            match worker.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!("💀 session worker stopped with an error: {err:#}"),
                Err(join_err) => error!("💀 session worker panicked: {join_err}"),
            }
        }

        let sessions: Vec<SessionResult> = targets
            .into_iter()
            .zip(outcomes)
            .map(|(target, outcome)| SessionResult {
                target,
                outcome: outcome.unwrap_or_else(|| Err("session never ran: its worker died".into())),
            })
            .collect();
        let report = TransferReport {
            sessions,
            expected_rows,
            elapsed: started.elapsed(),
        };
        if report.is_success() {
            info!("✅ all {} sessions committed", report.sessions.len());
        } else {
            warn!(
                "⚠️ {} of {} sessions failed",
                report.sessions.len() - report.succeeded(),
                report.sessions.len()
            );
        }
        report
    }
}
