//! Page-token driven fetching of a complete report.

use crate::error::EtlError;
use crate::flatten::{flatten_report, ReportTable};
use crate::reporting::{BatchGetResponse, ReportQuery, ReportingBackend};

/// Token sent with the first request.
pub const FIRST_PAGE_TOKEN: &str = "0";

/// Fetch every page of `query` and flatten all rows into one table.
///
/// Stops as soon as a response carries no `nextPageToken`.
pub async fn fetch_all_pages(
    backend: &dyn ReportingBackend,
    query: &ReportQuery,
) -> Result<ReportTable, EtlError> {
    let mut table = ReportTable::new();
    let mut page_token = Some(FIRST_PAGE_TOKEN.to_string());
    let mut pages = 0usize;

    while let Some(token) = page_token {
        let report = query.clone().page_token(token).get(backend).await?;
        pages += 1;

        page_token = next_page_token(&report.raw);
        for raw in &report.raw.reports {
            flatten_report(raw, &mut table)?;
        }

        tracing::debug!(page = pages, rows = table.len(), "Fetched report page");
    }

    tracing::debug!(pages, rows = table.len(), "Report complete");
    Ok(table)
}

/// Continuation token of the last report in the response, if any.
fn next_page_token(response: &BatchGetResponse) -> Option<String> {
    response
        .reports
        .last()
        .and_then(|report| report.next_page_token.clone())
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use crate::reporting::BatchGetRequest;
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned responses and records the page tokens it was asked for.
    struct ScriptedBackend {
        responses: Mutex<VecDeque<Result<BatchGetResponse, ApiError>>>,
        tokens: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedBackend {
        fn new(responses: Vec<Result<BatchGetResponse, ApiError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                tokens: Mutex::new(Vec::new()),
            }
        }

        fn tokens(&self) -> Vec<Option<String>> {
            self.tokens.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReportingBackend for ScriptedBackend {
        async fn batch_get(&self, request: &BatchGetRequest) -> Result<BatchGetResponse, ApiError> {
            self.tokens
                .lock()
                .unwrap()
                .push(request.report_requests[0].page_token.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .expect("backend called more often than scripted")
        }
    }

    fn page(day: &str, next: Option<&str>) -> Result<BatchGetResponse, ApiError> {
        Ok(serde_json::from_value(json!({
            "reports": [{
                "columnHeader": {
                    "dimensions": ["ga:date"],
                    "metricHeader": {"metricHeaderEntries": [{"name": "ga:users"}]}
                },
                "data": {"rows": [{"dimensions": [day], "metrics": [{"values": ["1"]}]}]},
                "nextPageToken": next
            }]
        }))
        .unwrap())
    }

    #[tokio::test]
    async fn test_follows_tokens_until_absent() {
        let backend = ScriptedBackend::new(vec![
            page("20230101", Some("1")),
            page("20230102", Some("2")),
            page("20230103", None),
        ]);

        let table = fetch_all_pages(&backend, &ReportQuery::new("1")).await.unwrap();

        assert_eq!(
            backend.tokens(),
            vec![
                Some("0".to_string()),
                Some("1".to_string()),
                Some("2".to_string())
            ]
        );
        assert_eq!(table.len(), 3);
        assert_eq!(
            table.rows()[2]["ga:date"].as_text(),
            Some("20230103")
        );
    }

    #[tokio::test]
    async fn test_zero_reports_yields_empty_table() {
        let backend = ScriptedBackend::new(vec![Ok(BatchGetResponse::default())]);

        let table = fetch_all_pages(&backend, &ReportQuery::new("1")).await.unwrap();

        assert!(table.is_empty());
        assert_eq!(backend.tokens().len(), 1);
    }

    #[tokio::test]
    async fn test_transport_error_aborts() {
        let backend = ScriptedBackend::new(vec![
            page("20230101", Some("1")),
            Err(ApiError::HttpError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: "boom".to_string(),
            }),
        ]);

        let err = fetch_all_pages(&backend, &ReportQuery::new("1")).await.unwrap_err();
        assert!(matches!(err, EtlError::Transport(_)));
        assert_eq!(backend.tokens().len(), 2);
    }

    #[test]
    fn test_empty_token_ends_pagination() {
        let response: BatchGetResponse =
            serde_json::from_value(json!({"reports": [{"nextPageToken": ""}]})).unwrap();
        assert_eq!(next_page_token(&response), None);
    }
}
