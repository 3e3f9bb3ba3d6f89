//! Analytics Reporting API v4 client with report query builder.

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, EtlError};
use crate::google::GoogleTransport;

lazy_static! {
    static ref ISO_DATE_PATTERN: Regex =
        Regex::new(r"^[0-9]{4}-(?:0[1-9]|1[0-2])-(?:0[1-9]|[1-2][0-9]|3[0-1])$").unwrap();
}

/// Requested sample size for a report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SamplingLevel {
    Default,
    Small,
    #[default]
    Large,
}

/// `reports:batchGet` request body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchGetRequest {
    pub report_requests: Vec<ReportRequest>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRequest {
    pub view_id: String,
    pub date_ranges: Vec<DateRange>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dimensions: Vec<Dimension>,
    pub metrics: Vec<Metric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_token: Option<String>,
    pub sampling_level: SamplingLevel,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    pub start_date: String,
    pub end_date: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Dimension {
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Metric {
    pub expression: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub segment_id: String,
}

/// `reports:batchGet` response body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatchGetResponse {
    #[serde(default)]
    pub reports: Vec<Report>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    #[serde(default)]
    pub column_header: ColumnHeader,
    #[serde(default)]
    pub data: ReportData,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnHeader {
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub metric_header: MetricHeader,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricHeader {
    #[serde(default)]
    pub metric_header_entries: Vec<MetricHeaderEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricHeaderEntry {
    pub name: String,
    #[serde(rename = "type")]
    #[allow(dead_code)]
    pub metric_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportData {
    #[serde(default)]
    pub rows: Vec<ReportRow>,
    #[allow(dead_code)]
    pub row_count: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportRow {
    #[serde(default)]
    pub dimensions: Vec<String>,
    /// One entry per requested date range.
    #[serde(default)]
    pub metrics: Vec<DateRangeValues>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DateRangeValues {
    #[serde(default)]
    pub values: Vec<String>,
}

/// Anything that can answer a `reports:batchGet` call.
#[async_trait]
pub trait ReportingBackend: Send + Sync {
    async fn batch_get(&self, request: &BatchGetRequest) -> Result<BatchGetResponse, ApiError>;
}

/// Report query builder.
///
/// Every setter consumes the query and returns the updated one; `get()`
/// issues the request.
#[derive(Debug, Clone)]
pub struct ReportQuery {
    view_id: String,
    date_ranges: Vec<DateRange>,
    dimensions: Vec<String>,
    metrics: Vec<String>,
    segments: Vec<String>,
    page_size: Option<u32>,
    page_token: Option<String>,
    sampling_level: SamplingLevel,
}

impl ReportQuery {
    /// Create a query for `view_id` covering the trailing 90 days of users.
    pub fn new(view_id: impl Into<String>) -> Self {
        Self::trailing_window(view_id, Utc::now().date_naive())
    }

    fn trailing_window(view_id: impl Into<String>, today: NaiveDate) -> Self {
        let format = |days: i64| (today - Duration::days(days)).format("%Y-%m-%d").to_string();
        Self {
            view_id: view_id.into(),
            date_ranges: vec![DateRange {
                start_date: format(91),
                end_date: format(1),
            }],
            dimensions: Vec::new(),
            metrics: vec!["ga:users".to_string()],
            segments: Vec::new(),
            page_size: None,
            page_token: None,
            sampling_level: SamplingLevel::Large,
        }
    }

    /// Replace the date ranges. Dates must be `YYYY-MM-DD`.
    pub fn date_range(mut self, ranges: &[(&str, &str)]) -> Result<Self, EtlError> {
        self.date_ranges = ranges
            .iter()
            .map(|(start, end)| {
                Ok(DateRange {
                    start_date: iso_date(start)?,
                    end_date: iso_date(end)?,
                })
            })
            .collect::<Result<_, EtlError>>()?;
        Ok(self)
    }

    /// Dimensions to report on (`ga:` names).
    pub fn dimensions<S: AsRef<str>>(mut self, dimensions: &[S]) -> Self {
        self.dimensions = dimensions.iter().map(|d| d.as_ref().to_string()).collect();
        self
    }

    /// Metrics to report on (`ga:` names).
    pub fn metrics<S: AsRef<str>>(mut self, metrics: &[S]) -> Self {
        self.metrics = metrics.iter().map(|m| m.as_ref().to_string()).collect();
        self
    }

    /// Segments to apply (`gaid::` ids).
    #[allow(dead_code)]
    pub fn segment<S: AsRef<str>>(mut self, segments: &[S]) -> Self {
        self.segments = segments.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Continuation token for the next page.
    pub fn page_token(mut self, page_token: impl Into<String>) -> Self {
        self.page_token = Some(page_token.into());
        self
    }

    pub fn sampling_level(mut self, sampling_level: SamplingLevel) -> Self {
        self.sampling_level = sampling_level;
        self
    }

    /// Build the request body.
    pub fn to_request(&self) -> BatchGetRequest {
        BatchGetRequest {
            report_requests: vec![ReportRequest {
                view_id: self.view_id.clone(),
                date_ranges: self.date_ranges.clone(),
                dimensions: self
                    .dimensions
                    .iter()
                    .map(|name| Dimension { name: name.clone() })
                    .collect(),
                metrics: self
                    .metrics
                    .iter()
                    .map(|expression| Metric {
                        expression: expression.clone(),
                    })
                    .collect(),
                page_size: self.page_size,
                page_token: self.page_token.clone(),
                sampling_level: self.sampling_level,
                segments: self
                    .segments
                    .iter()
                    .map(|segment_id| Segment {
                        segment_id: segment_id.clone(),
                    })
                    .collect(),
            }],
        }
    }

    /// Issue the request.
    pub async fn get(&self, backend: &dyn ReportingBackend) -> Result<AnalyticsReport, ApiError> {
        let raw = backend.batch_get(&self.to_request()).await?;
        Ok(AnalyticsReport {
            raw,
            query: self.clone(),
        })
    }
}

/// A response together with the query that produced it.
#[derive(Debug, Clone)]
pub struct AnalyticsReport {
    pub raw: BatchGetResponse,
    #[allow(dead_code)]
    pub query: ReportQuery,
}

/// Validate a `YYYY-MM-DD` date string.
pub fn iso_date(date: &str) -> Result<String, EtlError> {
    if is_iso_date(date) {
        Ok(date.to_string())
    } else {
        Err(EtlError::InvalidDateFormat(date.to_string()))
    }
}

/// Shape check only: month 01-12, day 01-31.
fn is_iso_date(date: &str) -> bool {
    ISO_DATE_PATTERN.is_match(date)
}

/// Analytics Reporting API client.
#[derive(Clone)]
pub struct ReportingClient {
    base_url: String,
    transport: GoogleTransport,
}

impl ReportingClient {
    pub fn new(base_url: impl Into<String>, transport: GoogleTransport) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            transport,
        }
    }
}

#[async_trait]
impl ReportingBackend for ReportingClient {
    async fn batch_get(&self, request: &BatchGetRequest) -> Result<BatchGetResponse, ApiError> {
        let url = format!("{}/v4/reports:batchGet", self.base_url);
        self.transport.post(&url, request).await
    }
}

impl std::fmt::Debug for ReportingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportingClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::GoogleAuth;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_default_query_is_trailing_window() {
        let today = NaiveDate::from_ymd_opt(2023, 4, 1).unwrap();
        let request = ReportQuery::trailing_window("123", today).to_request();
        let report = &request.report_requests[0];

        assert_eq!(report.view_id, "123");
        assert_eq!(
            report.date_ranges,
            vec![DateRange {
                start_date: "2022-12-31".to_string(),
                end_date: "2023-03-31".to_string(),
            }]
        );
        assert_eq!(report.metrics.len(), 1);
        assert_eq!(report.metrics[0].expression, "ga:users");
        assert_eq!(report.sampling_level, SamplingLevel::Large);
    }

    #[test]
    fn test_chained_query_serializes_to_wire_format() {
        let request = ReportQuery::new("987")
            .date_range(&[("2023-01-01", "2023-01-31")])
            .unwrap()
            .dimensions(&["ga:date", "ga:hostname"])
            .metrics(&["ga:users", "ga:sessions"])
            .segment(&["gaid::-1"])
            .page_size(10_000)
            .page_token("0")
            .sampling_level(SamplingLevel::Small)
            .to_request();

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "reportRequests": [{
                    "viewId": "987",
                    "dateRanges": [{"startDate": "2023-01-01", "endDate": "2023-01-31"}],
                    "dimensions": [{"name": "ga:date"}, {"name": "ga:hostname"}],
                    "metrics": [{"expression": "ga:users"}, {"expression": "ga:sessions"}],
                    "pageSize": 10000,
                    "pageToken": "0",
                    "samplingLevel": "SMALL",
                    "segments": [{"segmentId": "gaid::-1"}]
                }]
            })
        );
    }

    #[test]
    fn test_unset_optionals_are_omitted() {
        let value = serde_json::to_value(ReportQuery::new("1").to_request()).unwrap();
        let report = &value["reportRequests"][0];

        assert!(report.get("pageToken").is_none());
        assert!(report.get("pageSize").is_none());
        assert!(report.get("segments").is_none());
        assert!(report.get("dimensions").is_none());
    }

    #[test]
    fn test_date_range_rejects_bad_dates() {
        for bad in ["2023-1-01", "2023/01/01", "2023-13-01", "2023-00-10", "2023-01-32", "20230101", "abcd-ef-gh"] {
            let err = ReportQuery::new("1")
                .date_range(&[(bad, "2023-02-01")])
                .unwrap_err();
            assert!(matches!(err, EtlError::InvalidDateFormat(ref d) if d == bad), "{bad}");
        }

        let err = ReportQuery::new("1")
            .date_range(&[("2023-02-01", "2023-02-1")])
            .unwrap_err();
        assert!(matches!(err, EtlError::InvalidDateFormat(_)));
    }

    #[test]
    fn test_iso_date_is_a_shape_check() {
        assert!(iso_date("2023-02-30").is_ok());
        assert!(iso_date("2023-02-28 ").is_err());
        assert!(iso_date(" 2023-02-28").is_err());
        assert!(iso_date("").is_err());
        assert!(iso_date("２０２３-02-28").is_err());
    }

    #[test]
    fn test_iso_date_accepts_valid_shapes() {
        assert_eq!(iso_date("2023-02-28").unwrap(), "2023-02-28");
        assert!(iso_date("1999-12-31").is_ok());
        assert!(iso_date("2024-10-01").is_ok());
    }

    #[test]
    fn test_response_deserializes_with_missing_sections() {
        let response: BatchGetResponse = serde_json::from_str(
            r#"{"reports": [{"columnHeader": {"dimensions": ["ga:date"]}, "data": {}}]}"#,
        )
        .unwrap();

        let report = &response.reports[0];
        assert_eq!(report.column_header.dimensions, vec!["ga:date"]);
        assert!(report.column_header.metric_header.metric_header_entries.is_empty());
        assert!(report.data.rows.is_empty());
        assert!(report.next_page_token.is_none());

        let empty: BatchGetResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.reports.is_empty());
    }

    #[tokio::test]
    async fn test_get_posts_batch_request() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v4/reports:batchGet"))
            .and(header("Authorization", "Bearer ya29.test"))
            .and(body_partial_json(json!({
                "reportRequests": [{"viewId": "42", "pageToken": "abc"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "reports": [{
                    "columnHeader": {
                        "dimensions": ["ga:date"],
                        "metricHeader": {"metricHeaderEntries": [{"name": "ga:users", "type": "INTEGER"}]}
                    },
                    "data": {"rows": [{"dimensions": ["20230101"], "metrics": [{"values": ["7"]}]}], "rowCount": 1},
                    "nextPageToken": "10000"
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let auth = GoogleAuth::with_static_token("ya29.test".to_string(), None);
        let transport =
            GoogleTransport::new(auth, std::time::Duration::from_secs(5), false).unwrap();
        let client = ReportingClient::new(format!("{}/", server.uri()), transport);

        let report = ReportQuery::new("42")
            .page_token("abc")
            .get(&client)
            .await
            .unwrap();

        let raw = &report.raw.reports[0];
        assert_eq!(raw.next_page_token.as_deref(), Some("10000"));
        assert_eq!(raw.data.rows[0].metrics[0].values, vec!["7"]);
        assert_eq!(
            raw.column_header.metric_header.metric_header_entries[0]
                .metric_type
                .as_deref(),
            Some("INTEGER")
        );
    }

    #[tokio::test]
    async fn test_get_sends_quota_project_header() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v4/reports:batchGet"))
            .and(header("Authorization", "Bearer ya29.quota"))
            .and(header("x-goog-user-project", "billing-project"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"reports": []})))
            .expect(1)
            .mount(&server)
            .await;

        let auth = GoogleAuth::with_static_token(
            "ya29.quota".to_string(),
            Some("billing-project".to_string()),
        );
        let transport =
            GoogleTransport::new(auth, std::time::Duration::from_secs(5), false).unwrap();
        let client = ReportingClient::new(server.uri(), transport);

        let report = ReportQuery::new("42").get(&client).await.unwrap();
        assert!(report.raw.reports.is_empty());
    }

    #[tokio::test]
    async fn test_get_surfaces_api_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v4/reports:batchGet"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "error": {"code": 429, "message": "Quota exceeded", "status": "RESOURCE_EXHAUSTED"}
            })))
            .mount(&server)
            .await;

        let auth = GoogleAuth::with_static_token("t".to_string(), Some("billing-project".to_string()));
        let transport =
            GoogleTransport::new(auth, std::time::Duration::from_secs(5), true).unwrap();
        let client = ReportingClient::new(server.uri(), transport);

        let err = ReportQuery::new("42").get(&client).await.unwrap_err();
        assert!(matches!(err, ApiError::GoogleError { code: 429, .. }));
    }
}
