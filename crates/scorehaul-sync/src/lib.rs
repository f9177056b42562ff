//! Harvest orchestration: configuration, retries, session lifecycle, the run loop
//! and its reports.

pub mod config;
pub mod orchestrator;
pub mod report;
pub mod retry;
pub mod session;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use scorehaul_adapters::{locator_provider_for, supported_sites, SessionFactory, TokioSleeper};
use scorehaul_core::DateWindow;
use scorehaul_storage::AggregateStore;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use config::{load_harvest_file, ConfigError, HarvestEnv, HarvestFile, TargetConfig};
pub use orchestrator::{
    partition_targets, HarvestError, HarvestOrchestrator, HarvestSettings, PageHarvestWork,
    UnitOutcome,
};
pub use report::{
    render_summary_markdown, report_recent_runs_markdown, write_run_report, HarvestReport,
    TargetReport,
};
pub use retry::{BackoffPolicy, PageState, RetryController, UnitFailure, UnitHarvest, UnitWork};
pub use session::HarvestSession;

pub const CRATE_NAME: &str = "scorehaul-sync";

/// One invocation's choices on top of the harvest file.
#[derive(Debug, Clone)]
pub struct HarvestRequest {
    pub window: DateWindow,
    pub only: Vec<String>,
    pub workers: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct HarvestRunSummary {
    pub report: HarvestReport,
    pub report_dir: PathBuf,
}

/// Wires the harvest file and environment into an orchestrator, runs it and
/// writes the run report.
pub async fn run_harvest(
    env: &HarvestEnv,
    file: &HarvestFile,
    request: HarvestRequest,
    factory: Arc<dyn SessionFactory>,
    cancel: CancellationToken,
) -> Result<HarvestRunSummary> {
    file.validate().context("validating harvest file")?;
    let targets = file
        .enabled_targets(&request.only)
        .context("selecting targets")?;
    let locators = locator_provider_for(&file.site)
        .with_context(|| {
            format!(
                "no locator profile for site {} (known: {})",
                file.site,
                supported_sites().join(", ")
            )
        })?;

    let settings = file.settings();
    let work = PageHarvestWork::new(Arc::from(locators), &settings, Arc::new(TokioSleeper));
    let orchestrator = Arc::new(
        HarvestOrchestrator::new(
            factory,
            AggregateStore::new(env.output_dir.clone()),
            Arc::new(work),
            settings,
        )
        .with_cancellation(cancel),
    );

    let workers = request.workers.unwrap_or(file.workers).max(1);
    info!(
        site = %file.site,
        targets = targets.len(),
        workers,
        from = %request.window.start(),
        to = %request.window.end(),
        "starting harvest"
    );
    let report = orchestrator
        .run_partitioned(&targets, request.window, workers)
        .await?;
    let report_dir = write_run_report(&report, &env.reports_dir).await?;

    Ok(HarvestRunSummary { report, report_dir })
}
