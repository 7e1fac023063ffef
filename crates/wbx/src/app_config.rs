//! 🔧 App Configuration: the TOML-to-struct pipeline.
//!
//! 📡 Figment layers `WBX_*` environment variables under an optional TOML file (TOML wins).
//! Everything here is plain values. The core never reaches back into config at runtime; it is
//! handed [`SinkSettings`] / [`SourceSettings`] and gets on with it.
//!
//! ```toml
//! [warehouse.BigQuery]
//! storage_endpoint = "http://localhost:9050"
//! access_token = "ya29...."
//!
//! [runtime]
//! session_parallelism = 2
//!
//! [sink_config]
//! target = { project = "p", dataset = "d", table = "t" }
//! parts = ["part-0.json", "part-1.json.gz"]
//!
//! [source_config]
//! project = "p"
//! query = "SELECT text, integer, boolean FROM d.t"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::backends::BigQueryConfig;
use crate::common::{TableSchema, Target};
use crate::sink::SinkSettings;
use crate::source::SourceSettings;

/// 📦 One struct to hold them all.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub warehouse: WarehouseConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    pub sink_config: SinkConfig,
    #[serde(default)]
    pub source_config: Option<SourceConfig>,
}

/// 🏭 Which warehouse to talk to. Externally tagged: `[warehouse.BigQuery]` or `warehouse = "InMemory"`.
#[derive(Debug, Deserialize, Clone)]
pub enum WarehouseConfig {
    BigQuery(BigQueryConfig),
    /// 🧪 Process-local tables. Nothing survives the run.
    InMemory,
}

/// 🧵 How much runs at once.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Independent sink sessions running side by side.
    #[serde(default = "default_session_parallelism", alias = "thread_pool_size")]
    pub session_parallelism: usize,
    /// Jobs queued for the session workers before the producer waits.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            session_parallelism: default_session_parallelism(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_session_parallelism() -> usize {
    1
}

fn default_queue_capacity() -> usize {
    10
}

/// 🚰 The write side.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct SinkConfig {
    pub target: Target,
    /// 📂 Part files for `import`. `.gz` files are inflated on the fly.
    #[serde(default)]
    pub parts: Vec<PathBuf>,
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,
    #[serde(default = "default_max_inflight_appends")]
    pub max_inflight_appends: usize,
    #[serde(default = "default_shutdown_retries")]
    pub shutdown_retries: u32,
    #[serde(default = "default_shutdown_attempt_timeout_ms")]
    pub shutdown_attempt_timeout_ms: u64,
    /// 📐 Column list to use instead of looking the target's schema up.
    #[serde(default)]
    pub schema: Option<TableSchema>,
}

fn default_max_batch_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_max_inflight_appends() -> usize {
    16
}

fn default_shutdown_retries() -> u32 {
    5
}

fn default_shutdown_attempt_timeout_ms() -> u64 {
    2000
}

impl From<&SinkConfig> for SinkSettings {
    fn from(config: &SinkConfig) -> Self {
        Self {
            max_batch_bytes: config.max_batch_bytes,
            max_inflight_appends: config.max_inflight_appends,
            shutdown_retries: config.shutdown_retries,
            shutdown_attempt_timeout: Duration::from_millis(config.shutdown_attempt_timeout_ms),
        }
    }
}

/// 🔎 The read side.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    pub project: String,
    pub query: String,
    /// 🎯 Ask the warehouse to also persist the result here.
    #[serde(default)]
    pub destination: Option<Target>,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// 📄 Where `export` writes. Stdout when unset.
    #[serde(default)]
    pub output_file: Option<PathBuf>,
    #[serde(default = "default_job_poll_interval_ms")]
    pub job_poll_interval_ms: u64,
    #[serde(default = "default_max_job_polls")]
    pub max_job_polls: u32,
}

fn default_page_size() -> u32 {
    10_000
}

fn default_job_poll_interval_ms() -> u64 {
    500
}

fn default_max_job_polls() -> u32 {
    120
}

impl From<&SourceConfig> for SourceSettings {
    fn from(config: &SourceConfig) -> Self {
        Self {
            project: config.project.clone(),
            page_size: config.page_size,
            job_poll_interval: Duration::from_millis(config.job_poll_interval_ms),
            max_job_polls: config.max_job_polls,
        }
    }
}

/// 🚀 Load the config from `WBX_*` env vars, plus `config_file_name` when given.
///
/// 📐 `None` means env vars only. Falling back to a default file (the CLI's `wbx.toml`) is the
/// caller's decision, not this function's.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {}",
        config_file_name.map_or_else(|| "<env only>".to_string(), |p| p.display().to_string())
    );

    let config = Figment::new().merge(Env::prefixed("WBX_").split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (WBX_*)",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (WBX_*); no file was given".to_string(),
    };
    config.extract().context(context_msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::FieldType;

    fn write_test_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("wbx.toml");
        std::fs::write(&path, contents).expect("💀 could not write the test config");
        path
    }

    #[test]
    fn the_one_where_a_bigquery_import_config_parses() {
        let dir = tempfile::tempdir().expect("💀 no tempdir for us");
        let path = write_test_config(
            &dir,
            r#"
            [warehouse.BigQuery]
            storage_endpoint = "http://localhost:9050"
            access_token = "tok"

            [runtime]
            thread_pool_size = 3

            [sink_config]
            target = { project = "p", dataset = "d", table = "t" }
            parts = ["a.json", "b.json.gz"]
            max_inflight_appends = 4
            schema = [
                { name = "text", type = "STRING" },
                { name = "integer", type = "INT64" },
            ]
            "#,
        );

        let config = load_config(Some(path.as_path())).expect("💀 config should parse");

        match &config.warehouse {
            WarehouseConfig::BigQuery(bq) => {
                assert_eq!(bq.storage_endpoint, "http://localhost:9050");
                assert_eq!(bq.bigquery_endpoint, "https://bigquery.googleapis.com");
                assert_eq!(bq.access_token.as_deref(), Some("tok"));
            }
            other => panic!("💀 expected BigQuery, serde gave us {other:?}"),
        }
        assert_eq!(config.runtime.session_parallelism, 3);
        assert_eq!(config.runtime.queue_capacity, 10);
        assert_eq!(config.sink_config.target, Target::new("p", "d", "t"));
        assert_eq!(config.sink_config.parts.len(), 2);
        let schema = config.sink_config.schema.clone().unwrap();
        assert_eq!(schema.fields[1].field_type, FieldType::Integer);
        assert!(config.source_config.is_none());

        let settings = SinkSettings::from(&config.sink_config);
        assert_eq!(settings.max_inflight_appends, 4);
        assert_eq!(settings.max_batch_bytes, 8 * 1024 * 1024);
        assert_eq!(settings.shutdown_retries, 5);
        assert_eq!(settings.shutdown_attempt_timeout, Duration::from_millis(2000));
    }

    #[test]
    fn the_one_where_the_in_memory_warehouse_needs_no_settings() {
        let dir = tempfile::tempdir().expect("💀 no tempdir for us");
        let path = write_test_config(
            &dir,
            r#"
            warehouse = "InMemory"

            [sink_config]
            target = { project = "p", dataset = "d", table = "t" }

            [source_config]
            project = "p"
            query = "SELECT 1"
            page_size = 2
            "#,
        );

        let config: AppConfig = Figment::new()
            .merge(Toml::file(&path))
            .extract()
            .expect("💀 in-memory config should parse");

        assert!(matches!(config.warehouse, WarehouseConfig::InMemory));
        assert_eq!(config.runtime, RuntimeConfig::default());
        let source = config.source_config.expect("💀 source config went missing");
        let settings = SourceSettings::from(&source);
        assert_eq!(settings.page_size, 2);
        assert_eq!(settings.job_poll_interval, Duration::from_millis(500));
        assert_eq!(settings.max_job_polls, 120);
        assert!(source.output_file.is_none());
    }

    #[test]
    fn the_one_where_a_missing_target_is_reported_with_context() {
        let dir = tempfile::tempdir().expect("💀 no tempdir for us");
        let path = write_test_config(&dir, "warehouse = \"InMemory\"\n[sink_config]\nparts = []\n");
        let err = load_config(Some(path.as_path())).unwrap_err();
        assert!(format!("{err:#}").contains("target"), "{err:#}");
        assert!(err.to_string().contains("wbx.toml"));
    }
}
