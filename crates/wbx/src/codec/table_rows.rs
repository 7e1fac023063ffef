//! 🗂️ The warehouse's own row shape: `{"f":[{"v":"row1"},{"v":"1"},{"v":null}]}`.
//!
//! Cells are positional and usually stringly typed, so the schema does all the talking.

use serde_json::{Value, json};

use super::{RecordBatchCodec, coerce};
use crate::common::{BatchRow, ScalarValue};
use crate::error::{BridgeError, BridgeResult};

impl RecordBatchCodec {
    /// 📥 Positional `f`/`v` rows → [`BatchRow`]s named after the schema's fields.
    pub fn decode_table_rows(&self, rows: Vec<Value>) -> BridgeResult<Vec<BatchRow>> {
        rows.into_iter()
            .enumerate()
            .map(|(index, row)| self.decode_table_row(index, row))
            .collect()
    }

    fn decode_table_row(&self, index: usize, row: Value) -> BridgeResult<BatchRow> {
        let cells = match row {
            Value::Object(mut object) => match object.remove("f") {
                Some(Value::Array(cells)) => cells,
                _ => {
                    return Err(BridgeError::malformed(format!(
                        "result row {index} has no 'f' cell list"
                    )));
                }
            },
            _ => {
                return Err(BridgeError::malformed(format!(
                    "result row {index} is not an object"
                )));
            }
        };

        let fields = &self.schema().fields;
        if cells.len() != fields.len() {
            return Err(BridgeError::malformed(format!(
                "result row {index} has {} cells but the schema declares {} fields",
                cells.len(),
                fields.len()
            )));
        }

        let mut out = BatchRow::new();
        for (field, cell) in fields.iter().zip(cells) {
            let raw = match cell {
                Value::Object(mut cell) => cell.remove("v").unwrap_or(Value::Null),
                other => other,
            };
            let value = coerce(raw, field).map_err(|reason| {
                BridgeError::malformed(format!("result row {index}, field '{}': {reason}", field.name))
            })?;
            out.push(field.name.clone(), value);
        }
        Ok(out)
    }

    /// 📤 The reverse trip, rendering every non-null cell as a string the way the warehouse does.
    pub fn encode_table_row(row: &BatchRow) -> Value {
        let cells: Vec<Value> = row
            .iter()
            .map(|(_, value)| match value {
                ScalarValue::String(s) => json!({ "v": s }),
                ScalarValue::Integer(i) => json!({ "v": i.to_string() }),
                ScalarValue::Boolean(b) => json!({ "v": b.to_string() }),
                ScalarValue::Null => json!({ "v": null }),
            })
            .collect();
        json!({ "f": cells })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::common::{FieldSchema, FieldType, TableSchema};

    fn codec() -> RecordBatchCodec {
        RecordBatchCodec::new(Arc::new(TableSchema::new(vec![
            FieldSchema::new("text", FieldType::String),
            FieldSchema::new("integer", FieldType::Integer),
            FieldSchema::new("boolean", FieldType::Boolean),
        ])))
    }

    #[test]
    fn the_one_where_stringly_typed_cells_get_their_types_back() {
        let rows = codec()
            .decode_table_rows(vec![json!({"f":[{"v":"row2"},{"v":"-4"},{"v":"true"}]})])
            .unwrap();
        assert_eq!(
            rows[0],
            BatchRow::new()
                .with("text", ScalarValue::String("row2".into()))
                .with("integer", ScalarValue::Integer(-4))
                .with("boolean", ScalarValue::Boolean(true))
        );
    }

    #[test]
    fn the_one_where_encode_table_row_speaks_warehouse() {
        let row = BatchRow::new()
            .with("text", ScalarValue::String("row1".into()))
            .with("integer", ScalarValue::Integer(1))
            .with("boolean", ScalarValue::Null);
        let encoded = RecordBatchCodec::encode_table_row(&row);
        assert_eq!(encoded, json!({"f":[{"v":"row1"},{"v":"1"},{"v":null}]}));
        assert_eq!(codec().decode_table_rows(vec![encoded]).unwrap(), vec![row]);
    }

    #[test]
    fn the_one_where_a_short_row_is_called_out() {
        let err = codec()
            .decode_table_rows(vec![json!({"f":[{"v":"only one"}]})])
            .unwrap_err();
        assert!(matches!(err, BridgeError::MalformedBatch(ref m) if m.contains("1 cells")), "{err:?}");
    }
}
