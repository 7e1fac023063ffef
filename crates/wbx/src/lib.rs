//! 🌉 wbx: a two-way bridge between a row pipeline and a warehouse table.
//!
//! 🚰 Sink path: parts (byte streams of concatenated JSON arrays) go through a
//! [`coordinator::TransferCoordinator`] into a [`sink::StreamingSink`] session, which appends
//! every batch to a pending write stream and commits all of it or none of it.
//!
//! 🔎 Source path: a [`source::PaginatedSource`] runs a query and hands the pages back as one
//! self-describing `allRows` batch.
//!
//! [`run`] wires those up from an [`app_config::AppConfig`] for the CLI's three modes.

pub mod app_config;
pub mod backends;
pub mod codec;
pub mod common;
pub mod coordinator;
pub mod credentials;
pub mod error;
pub mod parts;
pub mod progress;
pub mod ring_buffer;
pub mod sink;
pub mod source;

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::info;

use crate::app_config::{AppConfig, SourceConfig, WarehouseConfig};
use crate::backends::WarehouseBackend;
use crate::codec::RecordBatchCodec;
use crate::common::{ALL_ROWS, RecordBatch};
use crate::coordinator::{TransferCoordinator, TransferJob, TransferReport};
use crate::credentials::{CredentialProvider, StaticTokenProvider};
use crate::parts::Part;
use crate::sink::SinkSettings;
use crate::source::PaginatedSource;

/// 🧭 Which way the data flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// 📥 Part files from `sink_config.parts` into `sink_config.target`.
    Import,
    /// 📤 `source_config.query` out to `source_config.output_file` (or stdout).
    Export,
    /// 🔁 `source_config.query` straight into `sink_config.target`.
    Copy,
}

/// 🚀 Build the warehouse from config and run one mode to completion.
pub async fn run(app_config: AppConfig, mode: Mode) -> Result<()> {
    validate_targets(&app_config, mode)?;
    let credentials: Arc<dyn CredentialProvider> = match &app_config.warehouse {
        WarehouseConfig::BigQuery(bq) => Arc::new(StaticTokenProvider::new(bq.access_token.clone())),
        WarehouseConfig::InMemory => Arc::new(StaticTokenProvider::new(None)),
    };
    let warehouse = WarehouseBackend::from_config(&app_config.warehouse, Arc::clone(&credentials))
        .context("💀 Could not set up the warehouse client")?;
    run_with(&app_config, mode, warehouse, credentials).await
}

/// 🔌 [`run`] against an already built warehouse.
pub(crate) async fn run_with(
    app_config: &AppConfig,
    mode: Mode,
    warehouse: WarehouseBackend,
    credentials: Arc<dyn CredentialProvider>,
) -> Result<()> {
    info!("🌉 running {mode:?}");
    match mode {
        Mode::Import => import(app_config, warehouse).await,
        Mode::Export => export(app_config, warehouse, credentials).await,
        Mode::Copy => copy(app_config, warehouse, credentials).await,
    }
}

fn validate_targets(app_config: &AppConfig, mode: Mode) -> Result<()> {
    let mut targets = Vec::new();
    if mode != Mode::Export {
        targets.push(("sink_config.target", &app_config.sink_config.target));
    }
    if let Some(destination) = app_config.source_config.as_ref().and_then(|s| s.destination.as_ref()) {
        targets.push(("source_config.destination", destination));
    }
    let violations: Vec<String> = targets
        .into_iter()
        .flat_map(|(field, target)| target.violations().into_iter().map(move |v| format!("{field}.{v}")))
        .collect();
    if !violations.is_empty() {
        anyhow::bail!("💀 Invalid table address:\n  {}", violations.join("\n  "));
    }
    Ok(())
}

fn coordinator(app_config: &AppConfig, warehouse: WarehouseBackend) -> TransferCoordinator {
    TransferCoordinator::new(warehouse, SinkSettings::from(&app_config.sink_config))
        .with_schema(app_config.sink_config.schema.clone())
        .with_runtime(
            app_config.runtime.session_parallelism,
            app_config.runtime.queue_capacity,
        )
        .with_progress(true)
}

fn source_config(app_config: &AppConfig) -> Result<&SourceConfig> {
    app_config
        .source_config
        .as_ref()
        .context("💀 This mode runs a query, but there is no [source_config] with a project and query")
}

fn finish(report: TransferReport) -> Result<()> {
    eprintln!("{}", progress::render_transfer_report(&report));
    if report.is_success() {
        return Ok(());
    }
    anyhow::bail!(
        "💀 {} session(s) failed, nothing was committed for them:\n  {}",
        report.sessions.len() - report.succeeded(),
        report.failure_reasons().join("\n  ")
    )
}

async fn import(app_config: &AppConfig, warehouse: WarehouseBackend) -> Result<()> {
    let sink_config = &app_config.sink_config;
    let parts: Vec<Part> = sink_config.parts.iter().map(|path| Part::from_file(path.clone())).collect();
    info!("📥 importing {} part files into {}", parts.len(), sink_config.target);

    let report = coordinator(app_config, warehouse)
        .transfer_all(vec![TransferJob {
            target: sink_config.target.clone(),
            parts,
        }])
        .await;
    finish(report)
}

async fn export(
    app_config: &AppConfig,
    warehouse: WarehouseBackend,
    credentials: Arc<dyn CredentialProvider>,
) -> Result<()> {
    let source_config = source_config(app_config)?;
    let source = PaginatedSource::new(warehouse, credentials, source_config.into());
    let mut batches = source.query(source_config.query.clone(), source_config.destination.clone());

    let mut out: std::pin::Pin<Box<dyn AsyncWrite + Send>> = match &source_config.output_file {
        Some(path) => Box::pin(
            tokio::fs::File::create(path)
                .await
                .with_context(|| format!("💀 Could not create output file '{}'", path.display()))?,
        ),
        None => Box::pin(tokio::io::stdout()),
    };

    let mut rows = 0usize;
    while let Some(batch) = batches.next().await {
        let batch = batch.context("💀 The query did not produce results")?;
        let codec = RecordBatchCodec::new(Arc::new(source.discovered_schema().unwrap_or_default()));
        let rows_in_batch = batch.rows.len();
        let mut bytes = codec.encode(&batch.into_rows()?)?;
        bytes.push(b'\n');
        out.write_all(&bytes).await.context("💀 Could not write exported rows")?;
        rows += rows_in_batch;
    }
    out.flush().await.context("💀 Could not flush exported rows")?;
    info!("📤 exported {rows} rows");
    Ok(())
}

async fn copy(
    app_config: &AppConfig,
    warehouse: WarehouseBackend,
    credentials: Arc<dyn CredentialProvider>,
) -> Result<()> {
    let source_config = source_config(app_config)?;
    let source = PaginatedSource::new(warehouse.clone(), credentials, source_config.into());
    let batches: Vec<RecordBatch> = source
        .query(source_config.query.clone(), source_config.destination.clone())
        .map(|batch| batch.unwrap_or_else(|err| RecordBatch::failed(ALL_ROWS, err.to_string())))
        .collect()
        .await;

    let schema = app_config.sink_config.schema.clone().or_else(|| source.discovered_schema());
    let codec = RecordBatchCodec::new(Arc::new(schema.clone().unwrap_or_default()));
    let parts = batches
        .into_iter()
        .map(|batch| Part::from_record_batch(batch, &codec))
        .collect::<Result<Vec<_>, _>>()?;
    info!("🔁 copying {} rows into {}", parts::total_expected_rows(&parts), app_config.sink_config.target);

    let report = coordinator(app_config, warehouse)
        .with_schema(schema)
        .transfer_all(vec![TransferJob {
            target: app_config.sink_config.target.clone(),
            parts,
        }])
        .await;
    finish(report)
}
