// ai
//! 🎼 RecordBatchCodec: rows in, JSON arrays of objects out, and back again.
//!
//! The wire format on both sides of the bridge is UTF-8 JSON: zero or more arrays of objects,
//! concatenated. Object keys follow the governing table schema, in order. Integers stay
//! integers, strings stay quoted, booleans stay literal.
//!
//! 🧠 Knowledge graph:
//! - [`RecordBatchCodec::encode`] / [`RecordBatchCodec::decode`]: one whole array at a time.
//! - [`stream_decoder::BatchStreamDecoder`]: the incremental flavour for parts holding many
//!   arrays, framed through a [`RingBuffer`](crate::ring_buffer::RingBuffer).
//! - [`table_rows`]: the warehouse's own `{"f":[{"v":..}]}` row shape, used by the query path.
//!
//! 🦆 The duck only speaks JSON. The duck is, frankly, a little limited.

pub mod stream_decoder;
pub mod table_rows;

use std::sync::Arc;

use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value;
use tokio::io::AsyncRead;

use crate::common::{BatchRow, FieldSchema, FieldType, ScalarValue, TableSchema};
use crate::error::{BridgeError, BridgeResult};

pub use stream_decoder::BatchStreamDecoder;

// ===== Serialization of rows =====

impl Serialize for ScalarValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ScalarValue::String(s) => serializer.serialize_str(s),
            ScalarValue::Integer(i) => serializer.serialize_i64(*i),
            ScalarValue::Boolean(b) => serializer.serialize_bool(*b),
            ScalarValue::Null => serializer.serialize_unit(),
        }
    }
}

impl Serialize for BatchRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // -- 🔗 serialize_map keeps insertion order, which is the row's field order
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (name, value) in self.iter() {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

// ===== Codec =====

/// 🎼 Converts between [`BatchRow`]s and JSON-array bytes for one table schema.
#[derive(Debug, Clone)]
pub struct RecordBatchCodec {
    schema: Arc<TableSchema>,
}

impl RecordBatchCodec {
    pub fn new(schema: Arc<TableSchema>) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    /// 📤 Rows → `[{"a":1,"b":"x"},...]`.
    pub fn encode(&self, rows: &[BatchRow]) -> BridgeResult<Vec<u8>> {
        serde_json::to_vec(rows)
            .map_err(|e| BridgeError::malformed(format!("rows could not be encoded: {e}")))
    }

    /// 📥 One JSON array → rows, coerced against the declared schema.
    pub fn decode(&self, bytes: &[u8]) -> BridgeResult<Vec<BatchRow>> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| BridgeError::malformed(format!("batch is not valid JSON: {e}")))?;
        let items = match value {
            Value::Array(items) => items,
            other => {
                return Err(BridgeError::malformed(format!(
                    "expected a top-level array, found {}",
                    json_kind(&other)
                )));
            }
        };
        items
            .into_iter()
            .enumerate()
            .map(|(index, item)| self.decode_object(index, item))
            .collect()
    }

    /// 🌊 Wrap a part's byte stream in an incremental decoder that yields one batch per array.
    pub fn stream_decoder<R: AsyncRead + Unpin>(
        &self,
        part_name: impl Into<String>,
        reader: R,
        max_batch_bytes: usize,
    ) -> BatchStreamDecoder<R> {
        BatchStreamDecoder::new(part_name, reader, self.clone(), max_batch_bytes)
    }

    fn decode_object(&self, index: usize, item: Value) -> BridgeResult<BatchRow> {
        let mut object = match item {
            Value::Object(object) => object,
            other => {
                return Err(BridgeError::malformed(format!(
                    "element {index} is {}, expected an object",
                    json_kind(&other)
                )));
            }
        };

        let mut row = BatchRow::new();
        for field in &self.schema.fields {
            let value = match object.remove(&field.name) {
                Some(raw) => coerce(raw, field).map_err(|reason| {
                    BridgeError::malformed(format!("element {index}, field '{}': {reason}", field.name))
                })?,
                None => ScalarValue::Null,
            };
            row.push(field.name.clone(), value);
        }

        // -- 🚫 leftovers mean the producer and the table disagree about the columns
        if let Some(stray) = object.keys().next() {
            return Err(BridgeError::malformed(format!(
                "element {index} has field '{stray}' which is not in the table schema"
            )));
        }
        Ok(row)
    }
}

/// 🔄 Coerce one JSON value into the declared column type.
///
/// Integers and booleans are also accepted in their quoted form, since the warehouse's JSON
/// renders int64 as strings.
pub(crate) fn coerce(raw: Value, field: &FieldSchema) -> Result<ScalarValue, String> {
    match (field.field_type, raw) {
        (_, Value::Null) => Ok(ScalarValue::Null),
        (FieldType::String, Value::String(s)) => Ok(ScalarValue::String(s)),
        (FieldType::Integer, Value::Number(n)) => n
            .as_i64()
            .map(ScalarValue::Integer)
            .ok_or_else(|| format!("{n} is not a 64-bit integer")),
        (FieldType::Integer, Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(ScalarValue::Integer)
            .map_err(|_| format!("'{s}' is not an integer")),
        (FieldType::Boolean, Value::Bool(b)) => Ok(ScalarValue::Boolean(b)),
        (FieldType::Boolean, Value::String(s)) => match s.to_ascii_lowercase().as_str() {
            "true" => Ok(ScalarValue::Boolean(true)),
            "false" => Ok(ScalarValue::Boolean(false)),
            _ => Err(format!("'{s}' is not a boolean")),
        },
        (expected, other) => Err(format!("{} cannot be read as {expected:?}", json_kind(&other))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
