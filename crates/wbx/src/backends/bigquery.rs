//! 📡 BigQuery over REST.
//!
//! Two hosts, one bearer token:
//! - `bigquery_endpoint` serves table metadata, query jobs and result pages (`/bigquery/v2/...`).
//! - `storage_endpoint` serves the write-stream lifecycle as a JSON facade over the Storage
//!   Write API: `POST /v1/{table}` opens a PENDING stream, `:append`, `:finalize` and
//!   `{table}:batchCommit` do the rest.
//!
//! 🔒 Every request asks the [`CredentialProvider`] for a fresh token. No caching here; that is
//! the provider's business.
//!
//! 🧠 Knowledge graph: [`BigQueryWarehouse`] is the long-lived, shared query client.
//! [`BigQueryWriteClient`] is minted per sink session with its own HTTP pool and its own
//! [`ClientLifecycle`], so one session shutting down never strands another.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};
use tracing::{debug, trace};

use super::{
    ClientLifecycle, CommitResponse, QueryClient, QueryJob, ResultPage, StreamErrorEntry, WriteClient,
    WriteStream,
};
use crate::common::{BatchRow, FieldSchema, FieldType, TableSchema, Target};
use crate::credentials::CredentialProvider;
use crate::error::{BridgeError, BridgeResult};

/// 🔧 Where the warehouse lives and how patient we are with it.
#[derive(Debug, Deserialize, Clone)]
pub struct BigQueryConfig {
    #[serde(default = "default_storage_endpoint")]
    pub storage_endpoint: String,
    #[serde(default = "default_bigquery_endpoint")]
    pub bigquery_endpoint: String,
    /// 🔒 Static bearer token. Leave unset when a real provider is wired in.
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_storage_endpoint() -> String {
    "https://bigquerystorage.googleapis.com".into()
}

fn default_bigquery_endpoint() -> String {
    "https://bigquery.googleapis.com".into()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl BigQueryConfig {
    /// 🧪 Both hosts pointed at the same base URL. Handy for a mock server.
    pub fn at(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            storage_endpoint: base_url.clone(),
            bigquery_endpoint: base_url,
            access_token: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    fn storage_url(&self, resource: &str) -> String {
        format!("{}/v1/{resource}", self.storage_endpoint.trim_end_matches('/'))
    }

    fn bigquery_url(&self, resource: &str) -> String {
        format!("{}/bigquery/v2/{resource}", self.bigquery_endpoint.trim_end_matches('/'))
    }
}

fn build_http_client(config: &BigQueryConfig) -> BridgeResult<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .build()
        .map_err(|e| BridgeError::stream("connect", format!("could not build HTTP client: {e}")))
}

/// 🔑 Attach the bearer token and send. Non-2xx is turned into `on_error(message)`.
async fn send_json<T: DeserializeOwned>(
    credentials: &dyn CredentialProvider,
    request: RequestBuilder,
    on_error: impl Fn(String) -> BridgeError,
) -> BridgeResult<T> {
    let token = credentials.access_token().await?;
    let response = request
        .bearer_auth(token)
        .send()
        .await
        .map_err(|e| on_error(format!("request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(on_error(format!("warehouse answered {status}: {body}")));
    }
    response
        .json::<T>()
        .await
        .map_err(|e| on_error(format!("unreadable response: {e}")))
}

// ===== Wire shapes =====

#[derive(Debug, Deserialize)]
struct RestSchema {
    #[serde(default)]
    fields: Vec<RestField>,
}

#[derive(Debug, Deserialize)]
struct RestField {
    name: String,
    #[serde(rename = "type")]
    field_type: String,
}

impl From<RestSchema> for TableSchema {
    fn from(schema: RestSchema) -> Self {
        TableSchema::new(
            schema
                .fields
                .into_iter()
                .map(|f| FieldSchema::new(f.name, FieldType::from_warehouse_type(&f.field_type)))
                .collect(),
        )
    }
}

#[derive(Debug, Deserialize)]
struct TableResource {
    schema: Option<RestSchema>,
}

#[derive(Debug, Deserialize)]
struct WriteStreamResource {
    name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AppendRequest<'a> {
    write_stream: &'a str,
    /// int64 travels as a string on this API.
    offset: String,
    rows: &'a [BatchRow],
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendResponse {
    #[serde(default)]
    error: Option<RestStatus>,
    #[serde(default)]
    row_errors: Vec<RowError>,
}

#[derive(Debug, Deserialize)]
struct RestStatus {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct RowError {
    #[serde(default, deserialize_with = "int64")]
    index: u64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FinalizeResponse {
    #[serde(default, deserialize_with = "int64")]
    row_count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchCommitResponse {
    #[serde(default)]
    commit_time: Option<String>,
    #[serde(default)]
    stream_errors: Vec<RestStorageError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestStorageError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    entity: String,
    #[serde(default)]
    error_message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobResource {
    job_reference: JobReference,
    #[serde(default)]
    status: Option<JobStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    project_id: String,
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    #[serde(default)]
    error_result: Option<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

impl ErrorProto {
    fn describe(&self) -> String {
        format!("{}: {}", self.reason, self.message)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResultsResponse {
    #[serde(default)]
    job_complete: bool,
    #[serde(default)]
    schema: Option<RestSchema>,
    #[serde(default)]
    rows: Vec<Value>,
    #[serde(default)]
    page_token: Option<String>,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

/// 🔢 The API renders int64 as either a JSON string or a number, depending on its mood.
fn int64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Int64 {
        Number(u64),
        Text(String),
    }
    match Int64::deserialize(deserializer)? {
        Int64::Number(n) => Ok(n),
        Int64::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

// ===== Query side =====

/// 📡 The shared, long-lived BigQuery handle.
#[derive(Debug, Clone)]
pub struct BigQueryWarehouse {
    config: Arc<BigQueryConfig>,
    credentials: Arc<dyn CredentialProvider>,
    http: reqwest::Client,
}

impl BigQueryWarehouse {
    pub fn new(config: BigQueryConfig, credentials: Arc<dyn CredentialProvider>) -> BridgeResult<Self> {
        let http = build_http_client(&config)?;
        Ok(Self {
            config: Arc::new(config),
            credentials,
            http,
        })
    }

    /// 🔌 Mint a write client with its own connection pool and lifecycle.
    pub fn open_write_client(&self) -> BridgeResult<BigQueryWriteClient> {
        Ok(BigQueryWriteClient {
            config: Arc::clone(&self.config),
            credentials: Arc::clone(&self.credentials),
            http: build_http_client(&self.config)?,
            lifecycle: Arc::new(ClientLifecycle::default()),
        })
    }
}

#[async_trait]
impl QueryClient for BigQueryWarehouse {
    async fn insert_query_job(
        &self,
        project: &str,
        query: &str,
        destination: Option<&Target>,
    ) -> BridgeResult<QueryJob> {
        let mut query_config = json!({
            "query": query,
            "useLegacySql": false,
        });
        if let Some(target) = destination {
            query_config["destinationTable"] = json!({
                "projectId": target.project,
                "datasetId": target.dataset,
                "tableId": target.table,
            });
            query_config["writeDisposition"] = json!("WRITE_TRUNCATE");
        }

        let url = self.config.bigquery_url(&format!("projects/{project}/jobs"));
        debug!("🔎 submitting query job to {url}");
        let job: JobResource = send_json(
            self.credentials.as_ref(),
            self.http.post(&url).json(&json!({ "configuration": { "query": query_config } })),
            BridgeError::Job,
        )
        .await?;

        if let Some(error) = job.status.and_then(|s| s.error_result) {
            return Err(BridgeError::Job(error.describe()));
        }
        Ok(QueryJob {
            project: job.job_reference.project_id,
            job_id: job.job_reference.job_id,
            location: job.job_reference.location,
        })
    }

    async fn get_query_results(
        &self,
        job: &QueryJob,
        page_token: Option<&str>,
        page_size: u32,
    ) -> BridgeResult<ResultPage> {
        let raw = self
            .config
            .bigquery_url(&format!("projects/{}/queries/{}", job.project, job.job_id));
        let mut url = Url::parse(&raw).map_err(|e| BridgeError::Job(format!("bad results url '{raw}': {e}")))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("maxResults", &page_size.to_string());
            if let Some(token) = page_token {
                pairs.append_pair("pageToken", token);
            }
            if let Some(location) = &job.location {
                pairs.append_pair("location", location);
            }
        }

        trace!("📄 fetching results page for job {}", job.job_id);
        let page: QueryResultsResponse =
            send_json(self.credentials.as_ref(), self.http.get(url), BridgeError::Job).await?;

        if let Some(first) = page.errors.first() {
            return Err(BridgeError::Job(first.describe()));
        }
        Ok(ResultPage {
            job_complete: page.job_complete,
            schema: page.schema.map(TableSchema::from),
            rows: page.rows,
            page_token: page.page_token.filter(|t| !t.is_empty()),
        })
    }
}

// ===== Write side =====

/// 🚰 Per-session write client.
#[derive(Debug, Clone)]
pub struct BigQueryWriteClient {
    config: Arc<BigQueryConfig>,
    credentials: Arc<dyn CredentialProvider>,
    http: reqwest::Client,
    lifecycle: Arc<ClientLifecycle>,
}

#[async_trait]
impl WriteClient for BigQueryWriteClient {
    async fn table_schema(&self, target: &Target) -> BridgeResult<TableSchema> {
        let url = self.config.bigquery_url(&format!(
            "projects/{}/datasets/{}/tables/{}",
            target.project, target.dataset, target.table
        ));
        let table: TableResource = send_json(self.credentials.as_ref(), self.http.get(&url), |m| {
            BridgeError::stream("schema lookup", m)
        })
        .await?;
        table
            .schema
            .map(TableSchema::from)
            .ok_or_else(|| BridgeError::stream("schema lookup", format!("table {target} has no schema")))
    }

    async fn create_write_stream(&self, target: &Target) -> BridgeResult<WriteStream> {
        let _ticket = self.lifecycle.begin("create stream")?;
        let url = self.config.storage_url(&target.table_path());
        let stream: WriteStreamResource = send_json(
            self.credentials.as_ref(),
            self.http.post(&url).json(&json!({ "type": "PENDING" })),
            |m| BridgeError::stream("create stream", m),
        )
        .await?;
        debug!("🆕 opened write stream {}", stream.name);
        Ok(WriteStream { name: stream.name })
    }

    async fn append_rows(&self, stream: &WriteStream, rows: &[BatchRow], offset: u64) -> BridgeResult<()> {
        let _ticket = self.lifecycle.begin("append")?;
        let url = self.config.storage_url(&format!("{}:append", stream.name));
        let body = AppendRequest {
            write_stream: &stream.name,
            offset: offset.to_string(),
            rows,
        };
        let response: AppendResponse = send_json(
            self.credentials.as_ref(),
            self.http.post(&url).json(&body),
            |m| BridgeError::stream("append", m),
        )
        .await?;

        if let Some(status) = response.error {
            return Err(BridgeError::stream(
                "append",
                format!("append at offset {offset} failed ({}): {}", status.code, status.message),
            ));
        }
        if let Some(row_error) = response.row_errors.first() {
            return Err(BridgeError::stream(
                "append",
                format!(
                    "{} rows rejected, first at index {}: {}",
                    response.row_errors.len(),
                    row_error.index,
                    row_error.message
                ),
            ));
        }
        Ok(())
    }

    async fn close_stream(&self, stream: &WriteStream) -> BridgeResult<()> {
        // -- 🚪 unary REST has no open connection to half-close; nothing goes on the wire
        trace!("🚪 closing send side of {}", stream.name);
        Ok(())
    }

    async fn finalize_write_stream(&self, stream: &WriteStream) -> BridgeResult<u64> {
        let _ticket = self.lifecycle.begin("finalize")?;
        let url = self.config.storage_url(&format!("{}:finalize", stream.name));
        let response: FinalizeResponse = send_json(
            self.credentials.as_ref(),
            self.http.post(&url).json(&json!({})),
            |m| BridgeError::stream("finalize", m),
        )
        .await?;
        Ok(response.row_count)
    }

    async fn batch_commit(&self, target: &Target, streams: &[WriteStream]) -> BridgeResult<CommitResponse> {
        let _ticket = self.lifecycle.begin("commit")?;
        let url = self.config.storage_url(&format!("{}:batchCommit", target.table_path()));
        let names: Vec<&str> = streams.iter().map(|s| s.name.as_str()).collect();
        let response: BatchCommitResponse = send_json(
            self.credentials.as_ref(),
            self.http.post(&url).json(&json!({ "writeStreams": names })),
            |m| BridgeError::stream("commit", m),
        )
        .await?;
        Ok(CommitResponse {
            commit_time: response.commit_time.filter(|t| !t.is_empty()),
            stream_errors: response
                .stream_errors
                .into_iter()
                .map(|e| StreamErrorEntry {
                    code: e.code,
                    entity: e.entity,
                    message: e.error_message,
                })
                .collect(),
        })
    }

    fn shutdown_now(&self) {
        self.lifecycle.shutdown_now();
    }

    async fn await_termination(&self, timeout: Duration) -> bool {
        self.lifecycle.await_termination(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::common::ScalarValue;
    use crate::credentials::StaticTokenProvider;

    const TABLE: &str = "/v1/projects/p/datasets/d/tables/t";
    const STREAM: &str = "projects/p/datasets/d/tables/t/streams/s1";

    fn warehouse(server: &MockServer) -> BigQueryWarehouse {
        BigQueryWarehouse::new(
            BigQueryConfig::at(server.uri()),
            Arc::new(StaticTokenProvider::new(Some("tok".into()))),
        )
        .unwrap()
    }

    fn target() -> Target {
        Target::new("p", "d", "t")
    }

    #[tokio::test]
    async fn the_one_where_a_stream_lives_a_full_life() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TABLE))
            .and(header("authorization", "Bearer tok"))
            .and(body_partial_json(json!({"type": "PENDING"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": STREAM})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/v1/{STREAM}:append")))
            .and(body_partial_json(json!({
                "offset": "0",
                "rows": [{"text": "row1", "integer": 1}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"appendResult": {"offset": "0"}})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/v1/{STREAM}:finalize")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"rowCount": "1"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{TABLE}:batchCommit")))
            .and(body_partial_json(json!({"writeStreams": [STREAM]})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"commitTime": "2024-01-01T00:00:00Z"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = warehouse(&server).open_write_client().unwrap();
        let stream = client.create_write_stream(&target()).await.unwrap();
        assert_eq!(stream.name, STREAM);

        let row = BatchRow::new()
            .with("text", ScalarValue::String("row1".into()))
            .with("integer", ScalarValue::Integer(1));
        client.append_rows(&stream, &[row], 0).await.unwrap();
        client.close_stream(&stream).await.unwrap();
        assert_eq!(client.finalize_write_stream(&stream).await.unwrap(), 1);

        let commit = client.batch_commit(&target(), &[stream]).await.unwrap();
        assert_eq!(commit.commit_time.as_deref(), Some("2024-01-01T00:00:00Z"));
        assert!(commit.stream_errors.is_empty());

        client.shutdown_now();
        assert!(client.await_termination(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn the_one_where_row_errors_fail_the_append() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/v1/{STREAM}:append")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "rowErrors": [{"index": "2", "code": "FIELDS_ERROR", "message": "bad value"}]
            })))
            .mount(&server)
            .await;

        let client = warehouse(&server).open_write_client().unwrap();
        let stream = WriteStream { name: STREAM.into() };
        let err = client.append_rows(&stream, &[], 0).await.unwrap_err();
        assert!(
            matches!(err, BridgeError::Stream { operation: "append", ref message } if message.contains("index 2")),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn the_one_where_a_500_is_a_stream_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/v1/{STREAM}:finalize")))
            .respond_with(ResponseTemplate::new(500).set_body_string("backend sad"))
            .mount(&server)
            .await;

        let client = warehouse(&server).open_write_client().unwrap();
        let err = client
            .finalize_write_stream(&WriteStream { name: STREAM.into() })
            .await
            .unwrap_err();
        assert!(
            matches!(err, BridgeError::Stream { operation: "finalize", ref message } if message.contains("backend sad")),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn the_one_where_commit_stream_errors_come_through() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{TABLE}:batchCommit")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "streamErrors": [{"code": "STREAM_FINALIZED", "entity": STREAM, "errorMessage": "nope"}]
            })))
            .mount(&server)
            .await;

        let client = warehouse(&server).open_write_client().unwrap();
        let commit = client
            .batch_commit(&target(), &[WriteStream { name: STREAM.into() }])
            .await
            .unwrap();
        assert!(commit.commit_time.is_none());
        assert_eq!(commit.stream_errors[0].message, "nope");
    }

    #[tokio::test]
    async fn the_one_where_schema_types_get_mapped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bigquery/v2/projects/p/datasets/d/tables/t"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "schema": {"fields": [
                    {"name": "text", "type": "STRING"},
                    {"name": "integer", "type": "INT64"},
                    {"name": "boolean", "type": "BOOL"},
                    {"name": "when", "type": "TIMESTAMP"}
                ]}
            })))
            .mount(&server)
            .await;

        let schema = warehouse(&server)
            .open_write_client()
            .unwrap()
            .table_schema(&target())
            .await
            .unwrap();
        let types: Vec<FieldType> = schema.fields.iter().map(|f| f.field_type).collect();
        assert_eq!(
            types,
            vec![FieldType::String, FieldType::Integer, FieldType::Boolean, FieldType::String]
        );
    }

    #[tokio::test]
    async fn the_one_where_a_query_pages_through_results() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bigquery/v2/projects/p/jobs"))
            .and(body_partial_json(json!({"configuration": {"query": {"useLegacySql": false}}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobReference": {"projectId": "p", "jobId": "job_1", "location": "EU"},
                "status": {"state": "RUNNING"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bigquery/v2/projects/p/queries/job_1"))
            .and(query_param("pageToken", "next"))
            .and(query_param("location", "EU"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobComplete": true,
                "rows": [{"f": [{"v": "b"}]}]
            })))
            .mount(&server)
            .await;

        let bq = warehouse(&server);
        let job = bq.insert_query_job("p", "SELECT 1", None).await.unwrap();
        assert_eq!(job.location.as_deref(), Some("EU"));

        let page = bq.get_query_results(&job, Some("next"), 500).await.unwrap();
        assert!(page.job_complete);
        assert_eq!(page.rows.len(), 1);
        assert!(page.page_token.is_none());
    }

    #[tokio::test]
    async fn the_one_where_the_job_reports_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bigquery/v2/projects/p/queries/job_2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobComplete": true,
                "errors": [{"reason": "invalidQuery", "message": "Unrecognized name: nope"}]
            })))
            .mount(&server)
            .await;

        let job = QueryJob {
            project: "p".into(),
            job_id: "job_2".into(),
            location: None,
        };
        let err = warehouse(&server).get_query_results(&job, None, 10).await.unwrap_err();
        assert_eq!(err, BridgeError::Job("invalidQuery: Unrecognized name: nope".into()));
    }
}
