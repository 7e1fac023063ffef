// ai
//! 🚰 StreamingSink: one logical write session, from "open a stream" to "committed or not".
//!
//! 🎬 *[a stream opens. batches fly out. acks drift back in whatever order they please.]*
//! *[the sink waits by the door until the last one is home. only then does it lock up.]*
//!
//! ```text
//! IDLE → STREAM_OPENING → APPENDING → CLOSING → FINALIZING → COMMITTING → TERMINATED
//!                                        ↑ always reached       ↑ only with zero errors
//! ```
//!
//! 🧠 Knowledge graph:
//! - The driving task decodes parts batch by batch and spawns one append task per batch.
//! - [`InflightTracker`] counts appends on the wire. The driver only moves on to CLOSING once
//!   it is back at zero. Finalizing with acks still outstanding is the bug this whole module
//!   is shaped around.
//! - [`TerminalError`] keeps the first failure (decode, carried, or append) and ignores the
//!   rest. Once set, no further batches are submitted and commit is skipped.
//! - A `Semaphore` caps how many appends may be outstanding at once. Back-pressure only.
//! - Teardown always runs: `shutdown_now`, then `await_termination` a bounded number of times.
//!   A slow teardown is a warning, never a failure.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, trace, warn};

use crate::backends::{CommitResponse, WriteClient, WriteClientBackend, WriteStream};
use crate::codec::RecordBatchCodec;
use crate::common::{BatchRow, Target};
use crate::error::{BridgeError, BridgeResult};
use crate::parts::{Part, total_expected_rows};
use crate::progress::ProgressMetrics;

/// 🔧 Plain knobs for one session, lifted out of [`SinkConfig`](crate::app_config::SinkConfig).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkSettings {
    /// 📏 Largest single batch (one JSON array) a part may contain.
    pub max_batch_bytes: usize,
    pub max_inflight_appends: usize,
    pub shutdown_retries: u32,
    pub shutdown_attempt_timeout: Duration,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            max_batch_bytes: 8 * 1024 * 1024,
            max_inflight_appends: 16,
            shutdown_retries: 5,
            shutdown_attempt_timeout: Duration::from_millis(2000),
        }
    }
}

/// 🚦 Where a session is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Idle,
    StreamOpening,
    Appending,
    Closing,
    Finalizing,
    Committing,
    Terminated { success: bool },
}

/// 🧾 What a successful session did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub target: Target,
    pub stream: Option<String>,
    pub batches_appended: usize,
    pub rows_appended: u64,
    pub finalized_rows: Option<u64>,
    pub commit_time: Option<String>,
    pub terminated_in_time: bool,
}

impl SessionReport {
    fn nothing_to_do(target: Target) -> Self {
        Self {
            target,
            stream: None,
            batches_appended: 0,
            rows_appended: 0,
            finalized_rows: None,
            commit_time: None,
            terminated_in_time: true,
        }
    }
}

// ===== Concurrency primitives =====

/// 🧮 Appends currently on the wire, plus a way to wait for zero.
#[derive(Debug, Default)]
pub(crate) struct InflightTracker {
    count: AtomicUsize,
    drained: Notify,
}

impl InflightTracker {
    /// ➕ Count one more. Must happen before the append is handed to the executor.
    fn register(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// ➖ Count one fewer. The last one out rings the bell.
    fn complete(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// ⏳ Park until nothing is in flight.
    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // -- 🔔 enable before checking, or a completion between the check and the await is lost
            notified.as_mut().enable();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// 🥇 Single-assignment error cell. First write wins, later ones are dropped.
#[derive(Debug, Default)]
pub(crate) struct TerminalError {
    slot: Mutex<Option<BridgeError>>,
}

impl TerminalError {
    /// Returns true if this call set the error.
    fn record(&self, err: BridgeError) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            trace!("🥈 dropping a later error, first one already recorded: {err}");
            return false;
        }
        *slot = Some(err);
        true
    }

    fn is_set(&self) -> bool {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    fn take(&self) -> Option<BridgeError> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// 🎟️ Owned by each append task. Dropping it completes the in-flight slot, and a drop during
/// a panic counts as a failed append so the session cannot commit around a lost batch.
struct AppendTicket {
    inflight: Arc<InflightTracker>,
    terminal: Arc<TerminalError>,
}

impl Drop for AppendTicket {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.terminal
                .record(BridgeError::stream("append", "append task panicked"));
        }
        self.inflight.complete();
    }
}

/// 📒 Ephemeral per-session bookkeeping.
#[derive(Debug, Default)]
struct AppendSession {
    stream: Option<WriteStream>,
    inflight: Arc<InflightTracker>,
    terminal: Arc<TerminalError>,
    /// Rows handed to appends so far; doubles as the next append's stream offset.
    rows_submitted: u64,
    batches_acked: Arc<AtomicUsize>,
    rows_acked: Arc<AtomicU64>,
    closed: bool,
}

// ===== The sink =====

/// 🚰 Drives one write session against one target on one per-session client.
#[derive(Debug)]
pub struct StreamingSink {
    target: Target,
    client: WriteClientBackend,
    codec: RecordBatchCodec,
    settings: SinkSettings,
    appends_allowed: Arc<Semaphore>,
    state: SinkState,
    session: AppendSession,
    show_progress: bool,
    progress: Option<ProgressMetrics>,
}

impl StreamingSink {
    pub fn new(target: Target, client: WriteClientBackend, codec: RecordBatchCodec, settings: SinkSettings) -> Self {
        let permits = settings.max_inflight_appends.max(1);
        Self {
            target,
            client,
            codec,
            settings,
            appends_allowed: Arc::new(Semaphore::new(permits)),
            state: SinkState::Idle,
            session: AppendSession::default(),
            show_progress: false,
            progress: None,
        }
    }

    /// 📊 Render a live progress bar while appending.
    pub fn with_progress(mut self) -> Self {
        self.show_progress = true;
        self
    }

    pub fn state(&self) -> SinkState {
        self.state
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    fn transition(&mut self, next: SinkState) {
        debug!("🚦 sink {}: {:?} → {:?}", self.target, self.state, next);
        self.state = next;
    }

    /// 🚀 Move every batch of every part into the target, atomically.
    ///
    /// Ok only if every batch was appended and the commit came back with a commit time and no
    /// stream errors. Otherwise the first recorded error. The client is torn down either way.
    pub async fn transfer(&mut self, parts: &[Part]) -> BridgeResult<SessionReport> {
        if matches!(self.state, SinkState::Terminated { .. }) {
            return Err(BridgeError::stream("open stream", "this sink session has already terminated"));
        }
        if parts.is_empty() {
            info!("🫙 no parts for {}, nothing to write", self.target);
            self.transition(SinkState::Terminated { success: true });
            return Ok(SessionReport::nothing_to_do(self.target.clone()));
        }

        let expected_rows = total_expected_rows(parts);
        info!(
            "🚰 session on {} starting: {} parts, {} rows advertised",
            self.target,
            parts.len(),
            expected_rows
        );
        if self.show_progress {
            self.progress = Some(ProgressMetrics::new(self.target.to_string(), expected_rows));
        }

        let outcome = self.run_session(parts).await;
        let terminated_in_time = self.teardown().await;
        if let Some(progress) = &self.progress {
            progress.finish();
        }

        match outcome {
            Ok((finalized_rows, commit_time)) => {
                self.transition(SinkState::Terminated { success: true });
                let report = SessionReport {
                    target: self.target.clone(),
                    stream: self.session.stream.as_ref().map(|s| s.name.clone()),
                    batches_appended: self.session.batches_acked.load(Ordering::Acquire),
                    rows_appended: self.session.rows_acked.load(Ordering::Acquire),
                    finalized_rows,
                    commit_time: Some(commit_time),
                    terminated_in_time,
                };
                info!(
                    "✅ session on {} committed {} rows in {} batches",
                    self.target, report.rows_appended, report.batches_appended
                );
                Ok(report)
            }
            Err(err) => {
                self.transition(SinkState::Terminated { success: false });
                error!("💀 session on {} failed, nothing committed: {err}", self.target);
                Err(err)
            }
        }
    }

    /// Steps from STREAM_OPENING through COMMITTING. Returns (finalized rows, commit time).
    async fn run_session(&mut self, parts: &[Part]) -> BridgeResult<(Option<u64>, String)> {
        self.transition(SinkState::StreamOpening);
        let stream = self.ensure_stream().await?;

        self.transition(SinkState::Appending);
        for part in parts {
            if self.session.terminal.is_set() {
                debug!("⛔ skipping part '{}', the session already failed", part.name);
                break;
            }
            self.append_part(part, &stream).await;
        }

        // -- ⏳ the one place the driver parks: every submitted append must be home first
        trace!(
            "⏳ draining {} in-flight appends on {}",
            self.session.inflight.in_flight(),
            stream.name
        );
        self.session.inflight.wait_drained().await;

        self.transition(SinkState::Closing);
        if !self.session.closed {
            if let Err(err) = self.client.close_stream(&stream).await {
                self.session.terminal.record(err);
            }
            self.session.closed = true;
        }

        self.transition(SinkState::Finalizing);
        let finalized_rows = match self.client.finalize_write_stream(&stream).await {
            Ok(rows) => {
                debug!("🏁 stream {} finalized with {rows} rows", stream.name);
                Some(rows)
            }
            Err(err) => {
                self.session.terminal.record(err);
                None
            }
        };

        if let Some(err) = self.session.terminal.take() {
            return Err(err);
        }

        self.transition(SinkState::Committing);
        let response = self
            .client
            .batch_commit(&self.target, std::slice::from_ref(&stream))
            .await?;
        let commit_time = accept_commit(response)?;
        Ok((finalized_rows, commit_time))
    }

    /// 🆕 Open the session's stream, or hand back the one already open.
    async fn ensure_stream(&mut self) -> BridgeResult<WriteStream> {
        if let Some(stream) = &self.session.stream {
            return Ok(stream.clone());
        }
        let stream = self.client.create_write_stream(&self.target).await?;
        debug!("🆕 session on {} writing to {}", self.target, stream.name);
        self.session.stream = Some(stream.clone());
        Ok(stream)
    }

    /// 📤 Decode one part and submit its batches. Failures land in the terminal error cell.
    async fn append_part(&mut self, part: &Part, stream: &WriteStream) {
        let reader = match part.open().await {
            Ok(reader) => reader,
            Err(err) => {
                self.session.terminal.record(err);
                return;
            }
        };

        let mut decoder = self
            .codec
            .stream_decoder(part.name.clone(), reader, self.settings.max_batch_bytes);
        let mut bytes_seen = 0;
        loop {
            if self.session.terminal.is_set() {
                debug!("⛔ stopping part '{}' early, the session already failed", part.name);
                return;
            }
            match decoder.next_batch().await {
                Ok(Some(rows)) if rows.is_empty() => {
                    trace!("🫙 empty batch in part '{}', nothing to append", part.name);
                }
                Ok(Some(rows)) => {
                    let bytes = decoder.bytes_consumed() - bytes_seen;
                    bytes_seen = decoder.bytes_consumed();
                    if let Some(progress) = self.progress.as_mut() {
                        progress.update(rows.len() as u64, bytes);
                    }
                    if let Err(err) = self.submit_append(stream, rows).await {
                        self.session.terminal.record(err);
                        return;
                    }
                }
                Ok(None) => {
                    trace!("📭 part '{}' exhausted after {bytes_seen} bytes", part.name);
                    return;
                }
                Err(err) => {
                    self.session.terminal.record(err);
                    return;
                }
            }
        }
    }

    /// 🚀 Hand one batch to the executor. Registers it as in flight before spawning.
    async fn submit_append(&mut self, stream: &WriteStream, rows: Vec<BatchRow>) -> BridgeResult<()> {
        let permit = Arc::clone(&self.appends_allowed)
            .acquire_owned()
            .await
            .map_err(|e| BridgeError::stream("append", format!("append limiter closed: {e}")))?;

        let offset = self.session.rows_submitted;
        let row_count = rows.len() as u64;
        self.session.rows_submitted += row_count;

        self.session.inflight.register();
        let ticket = AppendTicket {
            inflight: Arc::clone(&self.session.inflight),
            terminal: Arc::clone(&self.session.terminal),
        };
        let client = self.client.clone();
        let stream = stream.clone();
        let batches_acked = Arc::clone(&self.session.batches_acked);
        let rows_acked = Arc::clone(&self.session.rows_acked);

        trace!("📤 appending {row_count} rows at offset {offset} to {}", stream.name);
        tokio::spawn(async move {
            let _permit = permit;
            match client.append_rows(&stream, &rows, offset).await {
                Ok(()) => {
                    batches_acked.fetch_add(1, Ordering::AcqRel);
                    rows_acked.fetch_add(row_count, Ordering::AcqRel);
                    trace!("📬 append at offset {offset} acknowledged");
                }
                Err(err) => {
                    if ticket.terminal.record(err) {
                        error!("💀 append at offset {offset} on {} failed", stream.name);
                    }
                }
            }
            drop(ticket);
        });
        Ok(())
    }

    async fn teardown(&mut self) -> bool {
        shut_down_client(&self.client, &self.target, &self.settings).await
    }
}

/// 🛑 Bounded best-effort shutdown. True if the client terminated within the budget.
pub(crate) async fn shut_down_client(client: &WriteClientBackend, target: &Target, settings: &SinkSettings) -> bool {
    client.shutdown_now();
    let timeout = settings.shutdown_attempt_timeout;
    for attempt in 1..=settings.shutdown_retries {
        if client.await_termination(timeout).await {
            debug!("🛑 write client for {target} terminated (attempt {attempt})");
            return true;
        }
        debug!("⏳ write client for {target} still shutting down after attempt {attempt}");
    }
    warn!(
        "⚠️ write client for {target} did not terminate after {} attempts of {timeout:?}; moving on",
        settings.shutdown_retries
    );
    false
}

/// ✅ A commit only counts with a commit time and zero stream errors.
fn accept_commit(response: CommitResponse) -> BridgeResult<String> {
    if let Some(first) = response.stream_errors.first() {
        return Err(BridgeError::CommitRejected(format!(
            "{} stream error(s), first on {}: {} ({})",
            response.stream_errors.len(),
            first.entity,
            first.message,
            first.code
        )));
    }
    response
        .commit_time
        .ok_or_else(|| BridgeError::CommitRejected("commit response carried no commit time".into()))
}
