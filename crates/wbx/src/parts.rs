// ai
//! 🧺 Parts: opaque, named byte streams handed to the sink by whatever sits upstream.
//!
//! A part holds zero or more JSON-array batches. It might be bytes already in memory, a file
//! on disk (gzipped or not), or a placeholder for a producer that failed and left only a
//! reason behind. The sink treats that last flavour as a terminal error, never as "no rows".

use std::path::PathBuf;
use std::pin::Pin;

use flate2::read::GzDecoder;
use std::io::Read;
use tokio::io::AsyncRead;
use tracing::debug;

use crate::codec::RecordBatchCodec;
use crate::common::RecordBatch;
use crate::error::{BridgeError, BridgeResult};

/// 📚 A boxed byte stream, ready for a [`BatchStreamDecoder`](crate::codec::BatchStreamDecoder).
pub type PartReader = Pin<Box<dyn AsyncRead + Send>>;

/// 🎒 Where a part's bytes live.
#[derive(Debug, Clone)]
pub enum PartBody {
    Bytes(Vec<u8>),
    File(PathBuf),
    /// The producer failed. The reason is all that is left.
    Failed(String),
}

/// 🧺 One named part.
#[derive(Debug, Clone)]
pub struct Part {
    pub name: String,
    /// 📊 Row count advertised by the producer. Observability only, never a gate.
    pub expected_rows: u64,
    pub body: PartBody,
}

impl Part {
    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Vec<u8>>, expected_rows: u64) -> Self {
        Self {
            name: name.into(),
            expected_rows,
            body: PartBody::Bytes(bytes.into()),
        }
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: path.display().to_string(),
            expected_rows: 0,
            body: PartBody::File(path),
        }
    }

    pub fn failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expected_rows: 0,
            body: PartBody::Failed(reason.into()),
        }
    }

    /// 🔄 Turn a source-produced batch into a part, carried error and all.
    pub fn from_record_batch(batch: RecordBatch, codec: &RecordBatchCodec) -> BridgeResult<Self> {
        if let Some(reason) = batch.error {
            return Ok(Self::failed(batch.name, reason));
        }
        let bytes = codec.encode(&batch.rows)?;
        Ok(Self::from_bytes(batch.name, bytes, batch.rows.len() as u64))
    }

    /// 📂 Open the byte stream. A `Failed` part opens straight into its carried error.
    pub async fn open(&self) -> BridgeResult<PartReader> {
        match &self.body {
            PartBody::Bytes(bytes) => Ok(Box::pin(std::io::Cursor::new(bytes.clone()))),
            PartBody::File(path) if is_gzipped(path) => {
                debug!("🫁 inflating gzipped part '{}'", self.name);
                let squished = tokio::fs::read(path).await.map_err(|e| self.read_error(e))?;
                let mut inflated = Vec::with_capacity(squished.len() * 4);
                GzDecoder::new(squished.as_slice())
                    .read_to_end(&mut inflated)
                    .map_err(|e| self.read_error(e))?;
                Ok(Box::pin(std::io::Cursor::new(inflated)))
            }
            PartBody::File(path) => {
                let file = tokio::fs::File::open(path).await.map_err(|e| self.read_error(e))?;
                Ok(Box::pin(tokio::io::BufReader::new(file)))
            }
            PartBody::Failed(reason) => Err(BridgeError::CarriedError {
                part: self.name.clone(),
                reason: reason.clone(),
            }),
        }
    }

    fn read_error(&self, e: std::io::Error) -> BridgeError {
        BridgeError::PartRead {
            part: self.name.clone(),
            message: e.to_string(),
        }
    }
}

fn is_gzipped(path: &std::path::Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
}

/// 📊 Sum of advertised rows across parts. For the logs, not for correctness.
pub fn total_expected_rows(parts: &[Part]) -> u64 {
    parts.iter().map(|p| p.expected_rows).sum()
}
