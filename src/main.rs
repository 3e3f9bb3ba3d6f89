//! GA3 backfill
//!
//! Pulls Universal Analytics reports month by month and appends them to a
//! BigQuery table, working backward from the oldest row already loaded.

mod auth;
mod config;
mod error;
mod flatten;
mod google;
mod pagination;
mod partition;
mod pipeline;
mod reporting;
mod transform;
mod warehouse;

use anyhow::Context;
use chrono::NaiveDate;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use tracing_subscriber::EnvFilter;

use crate::auth::{GoogleAuth, ANALYTICS_READONLY_SCOPE, BIGQUERY_SCOPE};
use crate::config::Config;
use crate::google::GoogleTransport;
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::reporting::ReportingClient;
use crate::warehouse::BigQueryClient;

#[derive(Parser, Debug)]
#[command(name = "ga3-backfill")]
#[command(author, version, about = "Backfill Universal Analytics reports into BigQuery", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.json")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Fetch and transform reports without loading them
    #[arg(long)]
    dry_run: bool,

    /// Override pull_start_date from the configuration (YYYY-MM-DD)
    #[arg(long)]
    start_date: Option<NaiveDate>,
}

/// Log sink that clears the progress bar while a line is written.
struct ProgressWriter(ProgressBar);

impl Write for ProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.suspend(|| std::io::stderr().write(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.suspend(|| std::io::stderr().flush())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config))?;
    config.debug = args.debug || config.debug;
    if let Some(start) = args.start_date {
        config.pull_start_date = start;
    }

    let progress = ProgressBar::new(0);
    progress.set_style(
        ProgressStyle::with_template("Loading GA3 data [{bar:30}] {pos}/{len} {msg}")
            .context("invalid progress template")?,
    );

    let level = if config.debug { "debug" } else { "info" };
    let log_progress = progress.clone();
    tracing_subscriber::fmt()
        .with_writer(move || ProgressWriter(log_progress.clone()))
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(level.parse().context("failed to parse log directive")?),
        )
        .init();

    tracing::debug!(config = %args.config, view_id = %config.view_id, "Starting backfill");

    let reporting_auth = GoogleAuth::from_config(&config, ANALYTICS_READONLY_SCOPE)?;
    let warehouse_auth = GoogleAuth::from_config(&config, BIGQUERY_SCOPE)?;

    let reporting = ReportingClient::new(
        config.reporting_api_url.clone(),
        GoogleTransport::new(reporting_auth, config.timeout(), config.debug)?,
    );
    let warehouse = BigQueryClient::new(
        config.bigquery_api_url.clone(),
        GoogleTransport::new(warehouse_auth, config.timeout(), config.debug)?,
        config.location.clone(),
    );

    let mut settings = PipelineSettings::from_config(&config)?;
    settings.dry_run = args.dry_run;
    let destination = settings.destination.clone();

    let pipeline = Pipeline::new(&reporting, &warehouse, settings);
    let summary = pipeline.run(&progress).await.inspect_err(|_| progress.abandon())?;

    tracing::info!(
        windows = summary.windows,
        rows = summary.rows,
        load_jobs = summary.load_jobs.len(),
        "Backfill complete"
    );

    if args.dry_run {
        println!(
            "Dry run: {} rows in {} windows not loaded to the table {}",
            summary.rows, summary.windows, destination
        );
    } else {
        println!("Query results loaded to the table {}", destination);
    }

    Ok(())
}
