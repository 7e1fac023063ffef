//! 🔎 PaginatedSource: run a query, page through the results, hand back one `allRows` batch.
//!
//! The returned stream is lazy (nothing happens until the first poll), finite (one item),
//! and not restartable: query again to get fresh results. Pages are a network detail. The
//! schema is taken from the first page and every later page is decoded against it, so the
//! consumer only ever sees one schema.
//!
//! 💀 A failed job shows up as `Err` on the first pull. No partial rows, no empty batch
//! pretending to be a result.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tracing::{debug, info, trace};

use crate::backends::{QueryClient, WarehouseBackend};
use crate::codec::RecordBatchCodec;
use crate::common::{ALL_ROWS, RecordBatch, TableSchema, Target};
use crate::credentials::CredentialProvider;
use crate::error::{BridgeError, BridgeResult};

/// 🔧 Query-side knobs, as plain values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSettings {
    /// 🏷️ Project the job runs (and is billed) in.
    pub project: String,
    pub page_size: u32,
    /// ⏳ Wait between result polls while the job is still running.
    pub job_poll_interval: Duration,
    pub max_job_polls: u32,
}

impl SourceSettings {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            page_size: 10_000,
            job_poll_interval: Duration::from_millis(500),
            max_job_polls: 120,
        }
    }
}

/// 🔎 Query in, batches out.
#[derive(Debug, Clone)]
pub struct PaginatedSource {
    client: WarehouseBackend,
    credentials: Arc<dyn CredentialProvider>,
    settings: SourceSettings,
    discovered_schema: Arc<Mutex<Option<TableSchema>>>,
}

impl PaginatedSource {
    pub fn new(client: WarehouseBackend, credentials: Arc<dyn CredentialProvider>, settings: SourceSettings) -> Self {
        Self {
            client,
            credentials,
            settings,
            discovered_schema: Arc::new(Mutex::new(None)),
        }
    }

    /// 📐 The schema of the most recent query, once its first page has been read.
    pub fn discovered_schema(&self) -> Option<TableSchema> {
        self.discovered_schema
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 🚀 Lazily run `query_text`. `destination` asks the warehouse to also persist the result.
    pub fn query(
        &self,
        query_text: impl Into<String>,
        destination: Option<Target>,
    ) -> BoxStream<'static, BridgeResult<RecordBatch>> {
        let run = QueryRun {
            client: self.client.clone(),
            credentials: Arc::clone(&self.credentials),
            settings: self.settings.clone(),
            discovered_schema: Arc::clone(&self.discovered_schema),
            query_text: query_text.into(),
            destination,
        };
        stream::once(run.fetch_all()).boxed()
    }
}

/// 🧳 Everything one query execution needs, owned, so the stream can be `'static`.
struct QueryRun {
    client: WarehouseBackend,
    credentials: Arc<dyn CredentialProvider>,
    settings: SourceSettings,
    discovered_schema: Arc<Mutex<Option<TableSchema>>>,
    query_text: String,
    destination: Option<Target>,
}

impl QueryRun {
    async fn fetch_all(self) -> BridgeResult<RecordBatch> {
        info!("🔎 running query in project {}", self.settings.project);
        let job = self
            .client
            .insert_query_job(&self.settings.project, &self.query_text, self.destination.as_ref())
            .await?;
        debug!("🔎 job {} submitted", job.job_id);

        let mut codec: Option<RecordBatchCodec> = None;
        let mut rows = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0usize;
        let mut polls = 0u32;

        loop {
            // -- 🔄 paging can outlive a token; freshen it before every fetch
            self.credentials.refresh_if_expired().await?;
            let page = self
                .client
                .get_query_results(&job, page_token.as_deref(), self.settings.page_size)
                .await?;

            if !page.job_complete {
                polls += 1;
                // -- ⏳ max_job_polls unfinished polls are allowed; the one after that is not
                if polls > self.settings.max_job_polls {
                    return Err(BridgeError::Job(format!(
                        "job {} still running after {polls} polls",
                        job.job_id
                    )));
                }
                trace!("⏳ job {} not complete yet (poll {polls})", job.job_id);
                tokio::time::sleep(self.settings.job_poll_interval).await;
                continue;
            }

            let active = match codec.take() {
                None => {
                    let schema = page.schema.ok_or_else(|| {
                        BridgeError::Job(format!("job {} returned rows without a schema", job.job_id))
                    })?;
                    *self
                        .discovered_schema
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Some(schema.clone());
                    RecordBatchCodec::new(Arc::new(schema))
                }
                Some(active) => {
                    if let Some(schema) = &page.schema {
                        if active.schema().as_ref() != schema {
                            return Err(BridgeError::malformed(format!(
                                "job {} changed its schema between result pages",
                                job.job_id
                            )));
                        }
                    }
                    active
                }
            };

            pages += 1;
            rows.extend(active.decode_table_rows(page.rows)?);
            codec = Some(active);
            match page.page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        info!("📦 job {} produced {} rows over {pages} pages", job.job_id, rows.len());
        Ok(RecordBatch::new(ALL_ROWS, rows))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::backends::InMemoryWarehouse;
    use crate::common::{BatchRow, FieldSchema, FieldType, ScalarValue};

    /// 🧮 Counts refreshes so the test can tell they happened.
    #[derive(Debug, Default)]
    struct CountingProvider {
        refreshes: AtomicUsize,
    }

    #[async_trait]
    impl CredentialProvider for CountingProvider {
        async fn access_token(&self) -> BridgeResult<String> {
            Ok("counted".into())
        }

        async fn refresh_if_expired(&self) -> BridgeResult<()> {
            self.refreshes.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }
    }

    fn schema() -> TableSchema {
        TableSchema::new(vec![
            FieldSchema::new("text", FieldType::String),
            FieldSchema::new("integer", FieldType::Integer),
            FieldSchema::new("boolean", FieldType::Boolean),
        ])
    }

    fn row(text: &str, integer: i64, boolean: bool) -> BatchRow {
        BatchRow::new()
            .with("text", ScalarValue::String(text.into()))
            .with("integer", ScalarValue::Integer(integer))
            .with("boolean", ScalarValue::Boolean(boolean))
    }

    fn settings() -> SourceSettings {
        SourceSettings {
            job_poll_interval: Duration::from_millis(1),
            max_job_polls: 5,
            ..SourceSettings::new("proj")
        }
    }

    fn source(warehouse: &InMemoryWarehouse, credentials: Arc<CountingProvider>) -> PaginatedSource {
        PaginatedSource::new(WarehouseBackend::InMemory(warehouse.clone()), credentials, settings())
    }

    #[tokio::test]
    async fn the_one_where_two_pages_make_one_batch() {
        let warehouse = InMemoryWarehouse::new().with_query_result(
            schema(),
            vec![row("row1", 1, false), row("row2", -4, true)],
            Some(1),
        );
        let credentials = Arc::new(CountingProvider::default());
        let source = source(&warehouse, Arc::clone(&credentials));

        let mut batches = source.query("SELECT text, integer, boolean FROM t", None);
        // -- 💤 lazy: nothing has been asked of the warehouse yet
        assert_eq!(warehouse.calls().query_jobs, 0);
        assert_eq!(credentials.refreshes.load(Ordering::Acquire), 0);

        let batch = batches.next().await.unwrap().unwrap();
        assert!(credentials.refreshes.load(Ordering::Acquire) >= 1);
        assert_eq!(batch.name, ALL_ROWS);
        assert_eq!(batch.rows, vec![row("row1", 1, false), row("row2", -4, true)]);
        assert_eq!(warehouse.calls().result_pages, 2);
        assert_eq!(source.discovered_schema(), Some(schema()));

        assert!(batches.next().await.is_none());
    }

    #[tokio::test]
    async fn the_one_where_a_failed_job_fails_the_first_pull() {
        let warehouse = InMemoryWarehouse::new().failing_query_job("Unrecognized name: nope");
        let mut batches = source(&warehouse, Arc::new(CountingProvider::default())).query("SELECT nope", None);

        let first = batches.next().await.unwrap();
        assert_eq!(first.unwrap_err(), BridgeError::Job("Unrecognized name: nope".into()));
        assert!(batches.next().await.is_none());
    }

    #[tokio::test]
    async fn the_one_where_the_job_takes_a_couple_of_polls() {
        let warehouse = InMemoryWarehouse::new()
            .with_query_result(schema(), vec![row("late", 7, true)], None)
            .with_pending_polls(2);
        let batch = source(&warehouse, Arc::new(CountingProvider::default()))
            .query("SELECT 1", None)
            .next()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.rows, vec![row("late", 7, true)]);
        assert_eq!(warehouse.calls().result_pages, 3);
    }

    #[tokio::test]
    async fn the_one_where_patience_runs_out() {
        let warehouse = InMemoryWarehouse::new()
            .with_query_result(schema(), vec![], None)
            .with_pending_polls(50);
        let err = source(&warehouse, Arc::new(CountingProvider::default()))
            .query("SELECT forever", None)
            .next()
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, BridgeError::Job(ref m) if m.contains("still running")), "{err:?}");
    }

    #[tokio::test]
    async fn the_one_where_the_last_allowed_poll_still_counts() {
        let warehouse = InMemoryWarehouse::new()
            .with_query_result(schema(), vec![], None)
            .with_pending_polls(5);
        let batch = source(&warehouse, Arc::new(CountingProvider::default()))
            .query("SELECT just_in_time", None)
            .next()
            .await
            .unwrap()
            .unwrap();
        assert!(batch.rows.is_empty());
        assert_eq!(warehouse.calls().result_pages, 6);
    }

    #[tokio::test]
    async fn the_one_where_one_poll_too_many_is_a_job_error() {
        let warehouse = InMemoryWarehouse::new()
            .with_query_result(schema(), vec![], None)
            .with_pending_polls(6);
        let err = source(&warehouse, Arc::new(CountingProvider::default()))
            .query("SELECT too_late", None)
            .next()
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, BridgeError::Job(ref m) if m.contains("after 6 polls")), "{err:?}");
    }

    #[tokio::test]
    async fn the_one_where_page_two_changes_its_story() {
        let drifted = TableSchema::new(vec![FieldSchema::new("text", FieldType::String)]);
        let warehouse = InMemoryWarehouse::new()
            .with_query_result(schema(), vec![row("row1", 1, false), row("row2", -4, true)], Some(1))
            .with_later_page_schema(drifted);
        let source = source(&warehouse, Arc::new(CountingProvider::default()));

        let batches: Vec<_> = source.query("SELECT shifty", None).collect().await;
        assert_eq!(batches.len(), 1);
        let err = batches[0].clone().unwrap_err();
        assert!(matches!(err, BridgeError::MalformedBatch(ref m) if m.contains("changed its schema")), "{err:?}");
        assert_eq!(warehouse.calls().result_pages, 2);
        // -- 📐 the first page's schema is the one that was announced
        assert_eq!(source.discovered_schema(), Some(schema()));
    }

    #[tokio::test]
    async fn the_one_where_an_empty_result_is_still_one_batch() {
        let warehouse = InMemoryWarehouse::new().with_query_result(schema(), vec![], None);
        let batches: Vec<_> = source(&warehouse, Arc::new(CountingProvider::default()))
            .query("SELECT nothing", None)
            .collect()
            .await;
        assert_eq!(batches.len(), 1);
        assert!(batches[0].as_ref().unwrap().rows.is_empty());
    }
}
