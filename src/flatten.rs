//! Flattening of nested report rows into header-keyed records.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::EtlError;
use crate::reporting::Report;

lazy_static! {
    static ref GROUPED_NUMBER: Regex =
        Regex::new(r"^-?[0-9]{1,3}(?:,[0-9]{3})+(?:\.[0-9]+)?$").unwrap();
}

/// A single flattened cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    Text(String),
    Integer(i64),
    Float(f64),
}

impl CellValue {
    #[cfg(test)]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// One report row keyed by header name (`ga:date`, `ga:users`, ...).
pub type FlatRow = BTreeMap<String, CellValue>;

/// All rows fetched for one date window, in arrival order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportTable {
    rows: Vec<FlatRow>,
}

impl ReportTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, row: FlatRow) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[FlatRow] {
        &self.rows
    }
}

/// Coerce a metric value from its API string form.
///
/// Anything with a `.` or `,` is a float, everything else an integer.
/// Commas are only accepted as thousands grouping (`1,234.5`).
pub fn coerce_metric(name: &str, value: &str) -> Result<CellValue, EtlError> {
    let not_numeric = || {
        EtlError::MalformedReport(format!("value '{}' of metric {} is not numeric", value, name))
    };

    if value.contains(',') && !GROUPED_NUMBER.is_match(value) {
        return Err(not_numeric());
    }

    if value.contains(',') || value.contains('.') {
        value
            .replace(',', "")
            .parse::<f64>()
            .map(CellValue::Float)
            .map_err(|_| not_numeric())
    } else {
        value
            .parse::<i64>()
            .map(CellValue::Integer)
            .map_err(|_| not_numeric())
    }
}

/// Append every row of `report` to `table`.
///
/// Headers and values are paired by position; a count mismatch is an error.
pub fn flatten_report(report: &Report, table: &mut ReportTable) -> Result<(), EtlError> {
    let dimension_headers = &report.column_header.dimensions;
    let metric_headers = &report.column_header.metric_header.metric_header_entries;

    for (index, row) in report.data.rows.iter().enumerate() {
        if row.dimensions.len() != dimension_headers.len() {
            return Err(EtlError::MalformedReport(format!(
                "row {} has {} dimension values for {} headers",
                index,
                row.dimensions.len(),
                dimension_headers.len()
            )));
        }

        let mut flat: FlatRow = dimension_headers
            .iter()
            .zip(&row.dimensions)
            .map(|(header, value)| (header.clone(), CellValue::Text(value.clone())))
            .collect();

        // One value set per date range; later ranges overwrite earlier ones.
        for date_range_values in &row.metrics {
            if date_range_values.values.len() != metric_headers.len() {
                return Err(EtlError::MalformedReport(format!(
                    "row {} has {} metric values for {} headers",
                    index,
                    date_range_values.values.len(),
                    metric_headers.len()
                )));
            }

            for (header, value) in metric_headers.iter().zip(&date_range_values.values) {
                flat.insert(header.name.clone(), coerce_metric(&header.name, value)?);
            }
        }

        table.push(flat);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporting::BatchGetResponse;

    fn report(json: &str) -> Report {
        let response: BatchGetResponse = serde_json::from_str(json).unwrap();
        response.reports.into_iter().next().unwrap()
    }

    #[test]
    fn test_coerce_integers() {
        assert_eq!(coerce_metric("ga:users", "42").unwrap(), CellValue::Integer(42));
        assert_eq!(coerce_metric("ga:users", "0").unwrap(), CellValue::Integer(0));
        assert_eq!(coerce_metric("ga:users", "-3").unwrap(), CellValue::Integer(-3));
    }

    #[test]
    fn test_coerce_floats() {
        assert_eq!(
            coerce_metric("ga:timeOnPage", "12.5").unwrap(),
            CellValue::Float(12.5)
        );
        assert_eq!(
            coerce_metric("ga:transactionRevenue", "1,234.5").unwrap(),
            CellValue::Float(1234.5)
        );
        assert_eq!(coerce_metric("ga:users", "1,000").unwrap(), CellValue::Float(1000.0));
    }

    #[test]
    fn test_zero_in_float_form_stays_float() {
        assert_eq!(coerce_metric("ga:users", "0.0").unwrap(), CellValue::Float(0.0));
    }

    #[test]
    fn test_coerce_rejects_garbage() {
        let err = coerce_metric("ga:users", "n/a").unwrap_err();
        assert!(err.to_string().contains("ga:users"));
        assert!(coerce_metric("ga:users", "1.2.3").is_err());
    }

    #[test]
    fn test_coerce_rejects_misplaced_commas() {
        for bad in ["1,5", "1,2,3", "12,34.5", ",100", "100,", "1234,567", "1,000.5,0"] {
            let err = coerce_metric("ga:transactionRevenue", bad).unwrap_err();
            assert!(matches!(err, EtlError::MalformedReport(_)), "{bad}");
        }
        assert_eq!(
            coerce_metric("ga:transactionRevenue", "-12,345,678.25").unwrap(),
            CellValue::Float(-12_345_678.25)
        );
    }

    #[test]
    fn test_flatten_pairs_headers_by_position() {
        let report = report(
            r#"{"reports": [{
                "columnHeader": {
                    "dimensions": ["ga:date", "ga:hostname"],
                    "metricHeader": {"metricHeaderEntries": [
                        {"name": "ga:users", "type": "INTEGER"},
                        {"name": "ga:timeOnPage", "type": "TIME"}
                    ]}
                },
                "data": {"rows": [
                    {"dimensions": ["20230101", "example.com"], "metrics": [{"values": ["5", "30.5"]}]},
                    {"dimensions": ["20230102", "shop.example.com"], "metrics": [{"values": ["0", "0"]}]}
                ]}
            }]}"#,
        );

        let mut table = ReportTable::new();
        flatten_report(&report, &mut table).unwrap();

        assert_eq!(table.len(), 2);
        let first = &table.rows()[0];
        assert_eq!(first["ga:date"], CellValue::Text("20230101".to_string()));
        assert_eq!(first["ga:hostname"], CellValue::Text("example.com".to_string()));
        assert_eq!(first["ga:users"], CellValue::Integer(5));
        assert_eq!(first["ga:timeOnPage"], CellValue::Float(30.5));

        let second = &table.rows()[1];
        assert_eq!(second["ga:timeOnPage"], CellValue::Integer(0));
    }

    #[test]
    fn test_flatten_rejects_short_dimension_row() {
        let report = report(
            r#"{"reports": [{
                "columnHeader": {"dimensions": ["ga:date", "ga:hostname"]},
                "data": {"rows": [{"dimensions": ["20230101"], "metrics": []}]}
            }]}"#,
        );

        let mut table = ReportTable::new();
        let err = flatten_report(&report, &mut table).unwrap_err();
        assert!(matches!(err, EtlError::MalformedReport(ref m) if m.contains("dimension")));
        assert!(table.is_empty());
    }

    #[test]
    fn test_flatten_rejects_extra_metric_value() {
        let report = report(
            r#"{"reports": [{
                "columnHeader": {
                    "dimensions": ["ga:date"],
                    "metricHeader": {"metricHeaderEntries": [{"name": "ga:users"}]}
                },
                "data": {"rows": [{"dimensions": ["20230101"], "metrics": [{"values": ["1", "2"]}]}]}
            }]}"#,
        );

        let err = flatten_report(&report, &mut ReportTable::new()).unwrap_err();
        assert!(matches!(err, EtlError::MalformedReport(ref m) if m.contains("metric")));
    }

    #[test]
    fn test_flatten_report_without_rows() {
        let report = report(r#"{"reports": [{"columnHeader": {"dimensions": ["ga:date"]}}]}"#);
        let mut table = ReportTable::new();
        flatten_report(&report, &mut table).unwrap();
        assert!(table.is_empty());
    }
}
