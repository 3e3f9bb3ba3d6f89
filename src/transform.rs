//! Mapping of flattened report rows onto the warehouse schema.

use chrono::NaiveDate;
use serde::Serialize;

use crate::error::EtlError;
use crate::flatten::{CellValue, FlatRow, ReportTable};

/// Landing page value the API uses when no page was recorded.
pub const NOT_SET: &str = "(not set)";

/// Dimensions requested for every window, in request order.
pub const DIMENSIONS: [&str; 9] = [
    "ga:date",
    "ga:hostname",
    "ga:landingPagePath",
    "ga:country",
    "ga:region",
    "ga:city",
    "ga:source",
    "ga:medium",
    "ga:campaign",
];

/// Metrics requested for every window, with the goal metric in the middle.
pub fn metrics(goal_metric: &str) -> Vec<String> {
    [
        "ga:users",
        "ga:newUsers",
        "ga:entrances",
        "ga:sessions",
        "ga:pageviews",
        "ga:uniquePageviews",
        "ga:timeOnPage",
        goal_metric,
        "ga:transactionRevenue",
        "ga:transactions",
    ]
    .iter()
    .map(|m| m.to_string())
    .collect()
}

/// BigQuery column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldType {
    Date,
    String,
    Integer,
    Float,
}

/// One destination row. Field order matches the table schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WarehouseRow {
    pub date: NaiveDate,
    pub landing_page: String,
    pub country: String,
    pub region: String,
    pub city: String,
    pub utm_source: String,
    pub utm_medium: String,
    pub utm_campaign: String,
    pub users: i64,
    pub new_users: i64,
    pub entrances: i64,
    pub sessions: i64,
    pub page_views: i64,
    pub unique_page_views: i64,
    pub engagment_time_sec_per_session: f64,
    pub conversions: i64,
    pub ecommerce_revenue: f64,
    pub ecommerce_transactions: i64,
}

impl WarehouseRow {
    /// Destination schema, with `date` pinned to DATE.
    pub const SCHEMA: [(&'static str, FieldType); 18] = [
        ("date", FieldType::Date),
        ("landing_page", FieldType::String),
        ("country", FieldType::String),
        ("region", FieldType::String),
        ("city", FieldType::String),
        ("utm_source", FieldType::String),
        ("utm_medium", FieldType::String),
        ("utm_campaign", FieldType::String),
        ("users", FieldType::Integer),
        ("new_users", FieldType::Integer),
        ("entrances", FieldType::Integer),
        ("sessions", FieldType::Integer),
        ("page_views", FieldType::Integer),
        ("unique_page_views", FieldType::Integer),
        ("engagment_time_sec_per_session", FieldType::Float),
        ("conversions", FieldType::Integer),
        ("ecommerce_revenue", FieldType::Float),
        ("ecommerce_transactions", FieldType::Integer),
    ];
}

/// Per-run transform settings.
#[derive(Debug, Clone)]
pub struct TransformOptions {
    pub goal_metric: String,
    /// Prefix for landing pages; `https://<hostname>` per row when `None`.
    pub site_base_url: Option<String>,
}

/// Turn a relative landing page into an absolute URL.
pub fn rewrite_landing_page(path: &str, hostname: &str, site_base_url: Option<&str>) -> String {
    if path == NOT_SET {
        return path.to_string();
    }
    match site_base_url {
        Some(base) => format!("{}{}", base.trim_end_matches('/'), path),
        None => format!("https://{}{}", hostname, path),
    }
}

/// Parse `ga:date` (`YYYYMMDD`, or ISO as a fallback).
pub fn parse_report_date(value: &str) -> Result<NaiveDate, EtlError> {
    NaiveDate::parse_from_str(value, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%Y-%m-%d"))
        .map_err(|_| EtlError::MalformedReport(format!("unparseable ga:date '{}'", value)))
}

/// Select, rename and normalize every row of a window's table.
pub fn transform_table(
    table: &ReportTable,
    options: &TransformOptions,
) -> Result<Vec<WarehouseRow>, EtlError> {
    table
        .rows()
        .iter()
        .map(|row| transform_row(row, options))
        .collect()
}

fn transform_row(row: &FlatRow, options: &TransformOptions) -> Result<WarehouseRow, EtlError> {
    let reader = RowReader(row);

    let landing_page = rewrite_landing_page(
        reader.text("ga:landingPagePath")?,
        reader.text("ga:hostname")?,
        options.site_base_url.as_deref(),
    );

    Ok(WarehouseRow {
        date: parse_report_date(reader.text("ga:date")?)?,
        landing_page,
        country: reader.text("ga:country")?.to_string(),
        region: reader.text("ga:region")?.to_string(),
        city: reader.text("ga:city")?.to_string(),
        utm_source: reader.text("ga:source")?.to_string(),
        utm_medium: reader.text("ga:medium")?.to_string(),
        utm_campaign: reader.text("ga:campaign")?.to_string(),
        users: reader.integer("ga:users")?,
        new_users: reader.integer("ga:newUsers")?,
        entrances: reader.integer("ga:entrances")?,
        sessions: reader.integer("ga:sessions")?,
        page_views: reader.integer("ga:pageviews")?,
        unique_page_views: reader.integer("ga:uniquePageviews")?,
        engagment_time_sec_per_session: reader.float("ga:timeOnPage")?,
        conversions: reader.integer(&options.goal_metric)?,
        ecommerce_revenue: reader.float("ga:transactionRevenue")?,
        ecommerce_transactions: reader.integer("ga:transactions")?,
    })
}

/// Typed column access over a flat row.
struct RowReader<'a>(&'a FlatRow);

impl<'a> RowReader<'a> {
    fn get(&self, key: &str) -> Result<&'a CellValue, EtlError> {
        self.0
            .get(key)
            .ok_or_else(|| EtlError::MalformedReport(format!("missing column {}", key)))
    }

    fn text(&self, key: &str) -> Result<&'a str, EtlError> {
        match self.get(key)? {
            CellValue::Text(s) => Ok(s),
            other => Err(type_error(key, "text", other)),
        }
    }

    /// Float cells are accepted only when they hold a whole number.
    fn integer(&self, key: &str) -> Result<i64, EtlError> {
        match self.get(key)? {
            CellValue::Integer(n) => Ok(*n),
            CellValue::Float(f) if f.fract() == 0.0 => Ok(*f as i64),
            other => Err(type_error(key, "integer", other)),
        }
    }

    fn float(&self, key: &str) -> Result<f64, EtlError> {
        match self.get(key)? {
            CellValue::Float(f) => Ok(*f),
            CellValue::Integer(n) => Ok(*n as f64),
            other => Err(type_error(key, "float", other)),
        }
    }
}

fn type_error(key: &str, expected: &str, found: &CellValue) -> EtlError {
    EtlError::MalformedReport(format!(
        "column {} expected {}, found {:?}",
        key, expected, found
    ))
}
