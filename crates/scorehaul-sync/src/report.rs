//! Run reports: per-target counts, written as JSON plus a markdown summary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use scorehaul_core::{DateWindow, HarvestTarget};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::retry::{UnitFailure, UnitHarvest};

const REPORT_FILE: &str = "harvest_report.json";
const SUMMARY_FILE: &str = "summary.md";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetReport {
    pub competition_id: String,
    pub records_harvested: usize,
    pub units_succeeded: u32,
    pub units_empty: u32,
    pub units_failed: u32,
    pub fields_gapped: u32,
    #[serde(default)]
    pub rows_dropped: u32,
    #[serde(default)]
    pub expansions: u32,
    pub duplicates_dropped: usize,
    pub failures: Vec<UnitFailure>,
    pub persisted_path: Option<String>,
    pub persistence_warning: Option<String>,
    /// Set when the worker owning this target never got a session.
    #[serde(default)]
    pub startup_error: Option<String>,
}

impl TargetReport {
    pub fn new(competition_id: &str) -> Self {
        Self {
            competition_id: competition_id.to_string(),
            records_harvested: 0,
            units_succeeded: 0,
            units_empty: 0,
            units_failed: 0,
            fields_gapped: 0,
            rows_dropped: 0,
            expansions: 0,
            duplicates_dropped: 0,
            failures: Vec::new(),
            persisted_path: None,
            persistence_warning: None,
            startup_error: None,
        }
    }

    /// Counts what a page yielded besides records, whether or not it had any.
    pub fn absorb_page_stats(&mut self, harvest: &UnitHarvest) {
        self.fields_gapped += harvest.fields_gapped;
        self.rows_dropped += harvest.rows_dropped;
        self.expansions += harvest.expansions;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub cancelled: bool,
    pub targets: Vec<TargetReport>,
}

impl HarvestReport {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>, window: DateWindow) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            window_start: window.start(),
            window_end: window.end(),
            cancelled: false,
            targets: Vec::new(),
        }
    }

    /// Folds per-worker reports into one run.
    pub fn merge(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        window: DateWindow,
        parts: Vec<HarvestReport>,
    ) -> Self {
        let mut merged = Self::new(run_id, started_at, window);
        for part in parts {
            merged.cancelled |= part.cancelled;
            merged.finished_at = merged.finished_at.max(part.finished_at);
            merged.targets.extend(part.targets);
        }
        merged
    }

    /// Restores configured target order after a partitioned run.
    pub fn sort_targets_by(&mut self, order: &[HarvestTarget]) {
        let rank: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, t)| (t.competition_id.as_str(), i))
            .collect();
        self.targets.sort_by_key(|t| {
            rank.get(t.competition_id.as_str())
                .copied()
                .unwrap_or(usize::MAX)
        });
    }

    pub fn target(&self, competition_id: &str) -> Option<&TargetReport> {
        self.targets.iter().find(|t| t.competition_id == competition_id)
    }

    pub fn records_harvested(&self) -> usize {
        self.targets.iter().map(|t| t.records_harvested).sum()
    }

    pub fn units_failed(&self) -> u32 {
        self.targets.iter().map(|t| t.units_failed).sum()
    }

    pub fn fields_gapped(&self) -> u32 {
        self.targets.iter().map(|t| t.fields_gapped).sum()
    }

    pub fn persistence_warnings(&self) -> impl Iterator<Item = (&str, &str)> {
        self.targets.iter().filter_map(|t| {
            t.persistence_warning
                .as_deref()
                .map(|w| (t.competition_id.as_str(), w))
        })
    }
}

pub fn render_summary_markdown(report: &HarvestReport) -> String {
    let mut lines = vec![
        "# Scorehaul Harvest Summary".to_string(),
        String::new(),
        format!("- Run ID: `{}`", report.run_id),
        format!("- Window: {} .. {}", report.window_start, report.window_end),
        format!("- Started: {}", report.started_at),
        format!("- Finished: {}", report.finished_at),
        format!("- Records harvested: {}", report.records_harvested()),
        format!("- Units failed: {}", report.units_failed()),
        format!("- Fields gapped: {}", report.fields_gapped()),
    ];
    if report.cancelled {
        lines.push("- Cancelled before completion".to_string());
    }
    lines.push(String::new());
    lines.push("## Targets".to_string());
    lines.push(String::new());
    lines.push(
        "| competition | records | ok | empty | failed | gaps | rows dropped | duplicates |"
            .to_string(),
    );
    lines.push("|---|---|---|---|---|---|---|---|".to_string());
    for t in &report.targets {
        lines.push(format!(
            "| {} | {} | {} | {} | {} | {} | {} | {} |",
            t.competition_id,
            t.records_harvested,
            t.units_succeeded,
            t.units_empty,
            t.units_failed,
            t.fields_gapped,
            t.rows_dropped,
            t.duplicates_dropped
        ));
    }

    let startup: Vec<_> = report
        .targets
        .iter()
        .filter_map(|t| t.startup_error.as_deref().map(|e| (t.competition_id.as_str(), e)))
        .collect();
    if !startup.is_empty() {
        lines.push(String::new());
        lines.push("## Worker Startup Errors".to_string());
        for (id, error) in startup {
            lines.push(format!("- {id}: {error}"));
        }
    }

    let failures: Vec<_> = report.targets.iter().flat_map(|t| t.failures.iter()).collect();
    if !failures.is_empty() {
        lines.push(String::new());
        lines.push("## Failed Units".to_string());
        for f in failures {
            lines.push(format!(
                "- {} {} after {} attempt(s): {}",
                f.competition_id, f.date, f.attempts, f.reason
            ));
        }
    }

    let warnings: Vec<_> = report.persistence_warnings().collect();
    if !warnings.is_empty() {
        lines.push(String::new());
        lines.push("## Persistence Warnings".to_string());
        for (id, warning) in warnings {
            lines.push(format!("- {id}: {warning}"));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Writes `<reports_dir>/<run_id>/{harvest_report.json, summary.md}` and returns the run directory.
pub async fn write_run_report(report: &HarvestReport, reports_dir: &Path) -> Result<PathBuf> {
    let run_dir = reports_dir.join(report.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing harvest report")?;
    fs::write(run_dir.join(REPORT_FILE), json)
        .await
        .with_context(|| format!("writing {REPORT_FILE}"))?;
    fs::write(run_dir.join(SUMMARY_FILE), render_summary_markdown(report))
        .await
        .with_context(|| format!("writing {SUMMARY_FILE}"))?;
    Ok(run_dir)
}

/// Markdown digest of the newest `runs` reports under `reports_dir`.
pub fn report_recent_runs_markdown(runs: usize, reports_dir: &Path) -> Result<String> {
    let mut reports = std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .map(|entry| entry.path().join(REPORT_FILE))
        .filter(|path| path.exists())
        .map(|path| {
            let data = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str::<HarvestReport>(&data)
                .with_context(|| format!("parsing {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    reports.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    let mut lines = vec!["# Scorehaul Recent Runs".to_string(), String::new()];
    for report in reports.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}`", report.run_id));
        lines.push(format!("- window: {} .. {}", report.window_start, report.window_end));
        lines.push(format!("- started: {}", report.started_at));
        lines.push(format!("- records: {}", report.records_harvested()));
        lines.push(format!("- units failed: {}", report.units_failed()));
        if report.cancelled {
            lines.push("- cancelled".to_string());
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
