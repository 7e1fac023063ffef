//! 🧵 SessionWorker: pulls transfer jobs off a channel and runs each one as its own session.
//!
//! It receives jobs. It runs them. It reports back. When the channel closes and drains, it
//! goes home. Failures are the job's business, not the worker's: they are reported, and the
//! worker moves on to the next one.

use anyhow::Result;
use async_channel::{Receiver, Sender};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{TransferCoordinator, TransferJob};
use crate::sink::SessionReport;

/// 🏗️ A background worker, that does work. duh.
pub(crate) trait Worker {
    fn start(self) -> JoinHandle<Result<()>>;
}

pub(crate) type IndexedJob = (usize, TransferJob);
pub(crate) type IndexedOutcome = (usize, std::result::Result<SessionReport, String>);

#[derive(Debug)]
pub(crate) struct SessionWorker {
    id: usize,
    rx: Receiver<IndexedJob>,
    tx: Sender<IndexedOutcome>,
    coordinator: TransferCoordinator,
}

impl SessionWorker {
    pub(crate) fn new(
        id: usize,
        rx: Receiver<IndexedJob>,
        tx: Sender<IndexedOutcome>,
        coordinator: TransferCoordinator,
    ) -> Self {
        Self {
            id,
            rx,
            tx,
            coordinator,
        }
    }
}

impl Worker for SessionWorker {
    fn start(self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            debug!("🧵 session worker {} reporting for duty", self.id);
            while let Ok((index, job)) = self.rx.recv().await {
                debug!("🧵 worker {} took session #{index} for {}", self.id, job.target);
                let outcome = self
                    .coordinator
                    .transfer(&job.target, &job.parts)
                    .await
                    .map_err(|err| err.to_string());
                if self.tx.send((index, outcome)).await.is_err() {
                    anyhow::bail!("💀 worker {}: nobody is listening for session results anymore", self.id);
                }
            }
            debug!("🏁 session worker {}: channel closed and drained, going home", self.id);
            Ok(())
        })
    }
}
