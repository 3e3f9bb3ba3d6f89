//! BigQuery client: watermark query and append-only load jobs.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ApiError, EtlError};
use crate::google::GoogleTransport;
use crate::transform::WarehouseRow;

const MULTIPART_BOUNDARY: &str = "ga3_backfill_9c1f4e2a";

/// Server-side wait per query/poll request.
const QUERY_TIMEOUT_MS: u64 = 30_000;

/// Fully qualified BigQuery table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRef {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
}

impl FromStr for TableRef {
    type Err = String;

    /// Parse `project.dataset.table`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        match parts.as_slice() {
            [project, dataset, table]
                if !project.is_empty() && !dataset.is_empty() && !table.is_empty() =>
            {
                Ok(Self {
                    project_id: project.to_string(),
                    dataset_id: dataset.to_string(),
                    table_id: table.to_string(),
                })
            }
            _ => Err(format!(
                "destination_table '{}' must be of the form project.dataset.table",
                s
            )),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project_id, self.dataset_id, self.table_id)
    }
}

/// Destination of the backfill.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Oldest `date` in `table`, or `None` when the table is empty.
    async fn min_date(&self, table: &TableRef) -> Result<Option<NaiveDate>, ApiError>;

    /// Append `rows` to `table` as one load job. Returns the job id.
    async fn append_rows(&self, table: &TableRef, rows: &[WarehouseRow]) -> Result<String, EtlError>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    job_reference: JobReference,
    #[serde(default)]
    rows: Vec<TableRow>,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    v: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Job {
    job_reference: JobReference,
    status: JobStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    state: String,
    error_result: Option<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: String,
    message: String,
}

/// BigQuery REST client.
#[derive(Clone)]
pub struct BigQueryClient {
    base_url: String,
    transport: GoogleTransport,
    location: Option<String>,
    poll_interval: Duration,
}

impl BigQueryClient {
    pub fn new(
        base_url: impl Into<String>,
        transport: GoogleTransport,
        location: Option<String>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            transport,
            location,
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Delay between job status polls.
    #[cfg(test)]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn project_url(&self, project_id: &str) -> String {
        format!(
            "{}/bigquery/v2/projects/{}",
            self.base_url,
            urlencoding::encode(project_id)
        )
    }

    fn location_param(location: Option<&str>) -> String {
        location
            .map(|l| format!("&location={}", urlencoding::encode(l)))
            .unwrap_or_default()
    }

    /// Run a query and wait for its first result page.
    async fn query(&self, project_id: &str, sql: &str) -> Result<QueryResponse, ApiError> {
        let mut body = json!({
            "query": sql,
            "useLegacySql": false,
            "timeoutMs": QUERY_TIMEOUT_MS,
        });
        if let Some(location) = &self.location {
            body["location"] = json!(location);
        }

        let url = format!("{}/queries", self.project_url(project_id));
        let mut response: QueryResponse = self.transport.post(&url, &body).await?;

        while !response.job_complete {
            tracing::debug!(job_id = %response.job_reference.job_id, "Query still running");
            let reference = &response.job_reference;
            let url = format!(
                "{}/queries/{}?timeoutMs={}{}",
                self.project_url(project_id),
                urlencoding::encode(&reference.job_id),
                QUERY_TIMEOUT_MS,
                Self::location_param(reference.location.as_deref())
            );
            response = self.transport.get(&url).await?;
        }

        Ok(response)
    }

    /// Wait until a job reaches the DONE state.
    async fn wait_for_job(&self, project_id: &str, mut job: Job) -> Result<Job, ApiError> {
        while job.status.state != "DONE" {
            tokio::time::sleep(self.poll_interval).await;
            let reference = &job.job_reference;
            let url = format!(
                "{}/jobs/{}?projection=full{}",
                self.project_url(project_id),
                urlencoding::encode(&reference.job_id),
                Self::location_param(reference.location.as_deref())
            );
            job = self.transport.get(&url).await?;
            tracing::debug!(job_id = %job.job_reference.job_id, state = %job.status.state, "Load job status");
        }
        Ok(job)
    }

    fn load_metadata(&self, table: &TableRef) -> Value {
        let fields: Vec<Value> = WarehouseRow::SCHEMA
            .iter()
            .map(|(name, field_type)| json!({"name": name, "type": field_type}))
            .collect();

        let mut job_reference = json!({"projectId": table.project_id});
        if let Some(location) = &self.location {
            job_reference["location"] = json!(location);
        }

        json!({
            "jobReference": job_reference,
            "configuration": {
                "load": {
                    "destinationTable": table,
                    "sourceFormat": "NEWLINE_DELIMITED_JSON",
                    "writeDisposition": "WRITE_APPEND",
                    "createDisposition": "CREATE_NEVER",
                    "schema": {"fields": fields}
                }
            }
        })
    }
}

/// Encode rows as newline-delimited JSON.
fn to_ndjson(rows: &[WarehouseRow]) -> Result<Vec<u8>, serde_json::Error> {
    let mut out = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut out, row)?;
        out.push(b'\n');
    }
    Ok(out)
}

/// Build a `multipart/related` body of job metadata followed by the data.
fn multipart_body(metadata: &Value, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(data.len() + 1024);
    body.extend_from_slice(
        format!(
            "--{b}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{m}\r\n--{b}\r\nContent-Type: application/octet-stream\r\n\r\n",
            b = MULTIPART_BOUNDARY,
            m = metadata
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{}--\r\n", MULTIPART_BOUNDARY).as_bytes());
    body
}

#[async_trait]
impl Warehouse for BigQueryClient {
    async fn min_date(&self, table: &TableRef) -> Result<Option<NaiveDate>, ApiError> {
        let sql = format!("SELECT MIN(date) FROM `{}`", table);
        let response = self.query(&table.project_id, &sql).await?;

        let value = response
            .rows
            .first()
            .and_then(|row| row.f.first())
            .map(|cell| &cell.v);

        match value {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(Some)
                .map_err(|e| {
                    ApiError::UnexpectedResponse(format!("MIN(date) returned '{}': {}", s, e))
                }),
            Some(other) => Err(ApiError::UnexpectedResponse(format!(
                "MIN(date) returned {}",
                other
            ))),
        }
    }

    async fn append_rows(&self, table: &TableRef, rows: &[WarehouseRow]) -> Result<String, EtlError> {
        let data = to_ndjson(rows).map_err(ApiError::from)?;
        let body = multipart_body(&self.load_metadata(table), &data);

        let url = format!(
            "{}/upload/bigquery/v2/projects/{}/jobs?uploadType=multipart",
            self.base_url,
            urlencoding::encode(&table.project_id)
        );
        let content_type = format!("multipart/related; boundary={}", MULTIPART_BOUNDARY);

        let job: Job = self.transport.post_raw(&url, &content_type, body).await?;
        tracing::debug!(job_id = %job.job_reference.job_id, rows = rows.len(), "Load job submitted");

        let job = self.wait_for_job(&table.project_id, job).await?;
        let job_id = job.job_reference.job_id;

        match job.status.error_result {
            Some(error) => Err(EtlError::LoadJob {
                job_id,
                message: if error.reason.is_empty() {
                    error.message
                } else {
                    format!("{}: {}", error.reason, error.message)
                },
            }),
            None => Ok(job_id),
        }
    }
}

impl fmt::Debug for BigQueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BigQueryClient")
            .field("base_url", &self.base_url)
            .field("location", &self.location)
            .finish()
    }
}
