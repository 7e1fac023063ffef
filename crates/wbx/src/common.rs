// ai
//! 📦 Common data structures: the building blocks every other module passes around.
//!
//! 🎬 COLD OPEN. A row leaves a JSON file. It does not know it is about to become part of a
//! warehouse table. It does not know about write streams, finalize calls, or commit
//! timestamps. It only knows its fields, in order, and it clings to that order like a
//! toddler to a blanket.
//!
//! - [`Target`]: the (project, dataset, table) triple we read from or write to.
//! - [`TableSchema`] / [`FieldSchema`] / [`FieldType`]: the declared column list that drives
//!   decoding. Column order here is the column order everywhere.
//! - [`BatchRow`]: ordered field name → [`ScalarValue`].
//! - [`RecordBatch`]: a named run of rows, or the error its producer hit instead.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

/// 🏷️ The logical name of the single batch a query produces.
pub const ALL_ROWS: &str = "allRows";

// ===== Target =====

/// 🎯 Where the rows live. Immutable once built, cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Target {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl Target {
    pub fn new(
        project: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    /// 🔗 `projects/{p}/datasets/{d}/tables/{t}`, the fully qualified reference the write API wants.
    pub fn table_path(&self) -> String {
        format!(
            "projects/{}/datasets/{}/tables/{}",
            self.project, self.dataset, self.table
        )
    }

    /// 🚦 Named problems with this address, empty when it is usable. Checked once at the edge;
    /// everything past `run` trusts the target.
    pub fn violations(&self) -> Vec<String> {
        [
            ("project", &self.project),
            ("dataset", &self.dataset),
            ("table", &self.table),
        ]
        .into_iter()
        .filter_map(|(name, value)| {
            if value.trim().is_empty() {
                Some(format!("{name}: must not be empty"))
            } else if value.contains(['/', '?', '#']) || value.chars().any(char::is_whitespace) {
                Some(format!("{name}: '{value}' contains characters that cannot appear in a table path"))
            } else {
                None
            }
        })
        .collect()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

// ===== Schema =====

/// 🧬 The three scalar column types the bridge understands natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[serde(alias = "STRING", alias = "text")]
    String,
    #[serde(alias = "INTEGER", alias = "INT64", alias = "int64")]
    Integer,
    #[serde(alias = "BOOLEAN", alias = "BOOL", alias = "bool")]
    Boolean,
}

impl FieldType {
    /// 🔄 Map a warehouse column type name onto ours. Anything exotic (FLOAT, TIMESTAMP,
    /// NUMERIC, ...) rides along as a string so no data is lost in translation.
    pub fn from_warehouse_type(type_name: &str) -> Self {
        match type_name.to_ascii_uppercase().as_str() {
            "INTEGER" | "INT64" => Self::Integer,
            "BOOLEAN" | "BOOL" => Self::Boolean,
            _ => Self::String,
        }
    }
}

/// 📐 One declared column.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// 📐 The governing column list, in table order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(transparent)]
pub struct TableSchema {
    pub fields: Vec<FieldSchema>,
}

impl TableSchema {
    pub fn new(fields: Vec<FieldSchema>) -> Self {
        Self { fields }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

// ===== Rows =====

/// 🔢 A single cell value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScalarValue {
    String(String),
    Integer(i64),
    Boolean(bool),
    Null,
}

/// 🧾 One row: field name → value, in schema order. Order is the whole point, hence a Vec.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchRow {
    fields: Vec<(String, ScalarValue)>,
}

impl BatchRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// 🧱 Builder flavour of [`push`](Self::push), for tests and fixtures.
    pub fn with(mut self, name: impl Into<String>, value: ScalarValue) -> Self {
        self.push(name, value);
        self
    }

    pub fn push(&mut self, name: impl Into<String>, value: ScalarValue) {
        self.fields.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<&ScalarValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ScalarValue)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// 📦 A named run of rows, or the failure its producer recorded instead.
///
/// A batch with `error` set must never be read as "zero rows". [`RecordBatch::into_rows`]
/// turns the carried error back into a real one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatch {
    pub name: String,
    pub rows: Vec<BatchRow>,
    pub error: Option<String>,
}

impl RecordBatch {
    pub fn new(name: impl Into<String>, rows: Vec<BatchRow>) -> Self {
        Self {
            name: name.into(),
            rows,
            error: None,
        }
    }

    /// 💀 A batch that is nothing but its producer's bad news.
    pub fn failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: Vec::new(),
            error: Some(reason.into()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    /// ✅ The rows, or the carried error as a [`BridgeError::CarriedError`].
    pub fn into_rows(self) -> BridgeResult<Vec<BatchRow>> {
        match self.error {
            Some(reason) => Err(BridgeError::CarriedError {
                part: self.name,
                reason,
            }),
            None => Ok(self.rows),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_the_target_knows_its_full_address() {
        let target = Target::new("acme", "sales", "orders");
        assert_eq!(target.table_path(), "projects/acme/datasets/sales/tables/orders");
        assert_eq!(target.to_string(), "acme.sales.orders");
        assert!(target.violations().is_empty());
    }

    #[test]
    fn the_one_where_a_bad_address_gets_named_violations() {
        let violations = Target::new("", "sales/2024", "orders").violations();
        assert_eq!(violations.len(), 2);
        assert!(violations[0].starts_with("project:"));
        assert!(violations[1].starts_with("dataset:"));
    }

    #[test]
    fn the_one_where_exotic_column_types_become_strings() {
        assert_eq!(FieldType::from_warehouse_type("INT64"), FieldType::Integer);
        assert_eq!(FieldType::from_warehouse_type("bool"), FieldType::Boolean);
        assert_eq!(FieldType::from_warehouse_type("TIMESTAMP"), FieldType::String);
        assert_eq!(FieldType::from_warehouse_type("STRING"), FieldType::String);
    }

    #[test]
    fn the_one_where_rows_remember_their_field_order() {
        let row = BatchRow::new()
            .with("zebra", ScalarValue::Integer(1))
            .with("apple", ScalarValue::Null);
        let names: Vec<&str> = row.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["zebra", "apple"]);
        assert_eq!(row.get("apple"), Some(&ScalarValue::Null));
    }

    #[test]
    fn the_one_where_a_failed_batch_refuses_to_pretend_it_is_empty() {
        let batch = RecordBatch::failed(ALL_ROWS, "job exploded");
        assert!(batch.is_failed());
        assert_eq!(
            batch.into_rows(),
            Err(BridgeError::CarriedError {
                part: ALL_ROWS.to_string(),
                reason: "job exploded".to_string()
            })
        );
    }

    #[test]
    fn the_one_where_schema_types_accept_warehouse_spellings() {
        let schema: TableSchema = serde_json::from_str(
            r#"[{"name":"text","type":"STRING"},{"name":"n","type":"integer"},{"name":"b","type":"BOOL"}]"#,
        )
        .expect("💀 schema should parse");
        assert_eq!(schema.len(), 3);
        assert_eq!(schema.field("n").map(|f| f.field_type), Some(FieldType::Integer));
        assert_eq!(schema.field("b").map(|f| f.field_type), Some(FieldType::Boolean));
    }
}
