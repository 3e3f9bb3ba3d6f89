//! The backfill run: plan windows, then fetch, transform and load each one.

use chrono::NaiveDate;
use indicatif::ProgressBar;

use crate::config::Config;
use crate::error::{ConfigError, EtlError};
use crate::pagination::fetch_all_pages;
use crate::partition::{plan_windows, DateWindow};
use crate::reporting::{ReportQuery, ReportingBackend, SamplingLevel};
use crate::transform::{self, transform_table, TransformOptions};
use crate::warehouse::{TableRef, Warehouse};

/// Everything a run needs besides its backends.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub view_id: String,
    pub pull_start_date: NaiveDate,
    pub destination: TableRef,
    pub page_size: u32,
    pub sampling_level: SamplingLevel,
    pub transform: TransformOptions,
    /// Fetch and transform, but never submit load jobs.
    pub dry_run: bool,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            view_id: config.view_id.clone(),
            pull_start_date: config.pull_start_date,
            destination: config.destination()?,
            page_size: config.page_size,
            sampling_level: config.sampling_level,
            transform: TransformOptions {
                goal_metric: config.goal_metric.clone(),
                site_base_url: config.site_base_url.clone(),
            },
            dry_run: false,
        })
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub windows: usize,
    pub rows: usize,
    pub load_jobs: Vec<String>,
}

/// Sequential backfill over explicit reporting and warehouse backends.
pub struct Pipeline<'a> {
    reporting: &'a dyn ReportingBackend,
    warehouse: &'a dyn Warehouse,
    settings: PipelineSettings,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        reporting: &'a dyn ReportingBackend,
        warehouse: &'a dyn Warehouse,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            reporting,
            warehouse,
            settings,
        }
    }

    /// Windows still missing from the destination, newest first.
    pub async fn plan(&self) -> Result<Vec<DateWindow>, EtlError> {
        let destination = &self.settings.destination;
        let watermark = self
            .warehouse
            .min_date(destination)
            .await?
            .ok_or_else(|| EtlError::NoWatermark(destination.to_string()))?;

        let windows = plan_windows(self.settings.pull_start_date, watermark);
        tracing::info!(
            %watermark,
            start = %self.settings.pull_start_date,
            windows = windows.len(),
            "Planned backfill"
        );
        Ok(windows)
    }

    /// Report query for one window.
    pub fn window_query(&self, window: &DateWindow) -> Result<ReportQuery, EtlError> {
        let (start, end) = window.iso();
        Ok(ReportQuery::new(self.settings.view_id.as_str())
            .date_range(&[(start.as_str(), end.as_str())])?
            .dimensions(transform::DIMENSIONS.as_slice())
            .metrics(transform::metrics(&self.settings.transform.goal_metric).as_slice())
            .page_size(self.settings.page_size)
            .sampling_level(self.settings.sampling_level))
    }

    /// Fetch, transform and append one window. Returns rows and load job id.
    pub async fn run_window(&self, window: &DateWindow) -> Result<(usize, Option<String>), EtlError> {
        let query = self.window_query(window)?;
        let table = fetch_all_pages(self.reporting, &query).await?;
        if table.is_empty() {
            tracing::warn!(%window, "No rows reported, skipping load");
            return Ok((0, None));
        }

        let rows = transform_table(&table, &self.settings.transform)?;
        if self.settings.dry_run {
            tracing::info!(%window, rows = rows.len(), "Dry run, skipping load");
            return Ok((rows.len(), None));
        }

        tracing::info!(%window, rows = rows.len(), destination = %self.settings.destination, "Uploading to BigQuery");
        let job_id = self
            .warehouse
            .append_rows(&self.settings.destination, &rows)
            .await?;
        Ok((rows.len(), Some(job_id)))
    }

    /// Run every planned window in order, stopping at the first failure.
    pub async fn run(&self, progress: &ProgressBar) -> Result<RunSummary, EtlError> {
        let windows = self.plan().await?;
        progress.set_length(windows.len() as u64);

        let mut summary = RunSummary::default();
        for window in &windows {
            progress.set_message(window.to_string());
            let (rows, job_id) = self.run_window(window).await?;

            summary.windows += 1;
            summary.rows += rows;
            summary.load_jobs.extend(job_id);
            progress.inc(1);
        }

        progress.finish_and_clear();
        Ok(summary)
    }
}
