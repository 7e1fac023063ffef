//! 💀 The error taxonomy of the bridge.
//!
//! Everything below the CLI that a caller might want to match on lives here as a
//! [`BridgeError`]. Config loading and the `run` entrypoint stay on `anyhow`, and wrap these
//! with context on the way out. `anyhow::Error::downcast_ref::<BridgeError>()` still finds them.
//!
//! 🦆 The duck has read every variant. The duck has notes. The duck is keeping them to itself.

use thiserror::Error;

/// 🧯 Result alias for the core modules.
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// 🏷️ Every way a transfer can go sideways, sorted by who to blame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// 📦 Tried to write more bytes than the ring buffer has room for.
    #[error("💀 ring buffer overflow: requested {requested} bytes, at most {max} writable")]
    BufferOverflow { requested: usize, max: usize },

    /// 📦 Tried to read more bytes than the ring buffer holds.
    #[error("💀 ring buffer underflow: requested {requested} bytes, at most {max} readable")]
    BufferUnderflow { requested: usize, max: usize },

    /// 🧩 The bytes were not the JSON arrays of objects the schema promised.
    #[error("💀 malformed batch: {0}")]
    MalformedBatch(String),

    /// 📡 Transport-level failure talking to the write stream.
    #[error("💀 stream error during {operation}: {message}")]
    Stream {
        operation: &'static str,
        message: String,
    },

    /// 🚫 The commit call came back 200 but the warehouse did not actually commit.
    #[error("💀 commit rejected: {0}")]
    CommitRejected(String),

    /// 🔎 The query job finished, just not successfully.
    #[error("💀 query job failed: {0}")]
    Job(String),

    /// 🎒 A part showed up already carrying its producer's failure.
    #[error("💀 part '{part}' carried an upstream error: {reason}")]
    CarriedError { part: String, reason: String },

    /// 📂 Reading the bytes of a part failed before decoding could even start.
    #[error("💀 could not read part '{part}': {message}")]
    PartRead { part: String, message: String },

    /// 🔒 No usable credential.
    #[error("💀 credentials unavailable: {0}")]
    Credentials(String),
}

impl BridgeError {
    /// 📡 Shorthand for the transport failures that make up most of the sink's bad days.
    pub fn stream(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Stream {
            operation,
            message: message.into(),
        }
    }

    /// 🧩 Shorthand for decode-time failures.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedBatch(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_overflow_reports_both_counts() {
        let err = BridgeError::BufferOverflow {
            requested: 10,
            max: 3,
        };
        let rendered = err.to_string();
        assert!(rendered.contains("10"), "requested count missing: {rendered}");
        assert!(rendered.contains("3"), "max count missing: {rendered}");
    }

    #[test]
    fn the_one_where_bridge_errors_survive_a_trip_through_anyhow() {
        let wrapped: anyhow::Error = BridgeError::CommitRejected("no commit time".into()).into();
        let wrapped = wrapped.context("💀 session blew up");
        assert_eq!(
            wrapped.downcast_ref::<BridgeError>(),
            Some(&BridgeError::CommitRejected("no commit time".into()))
        );
    }
}
