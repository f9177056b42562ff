//! The harvest loop: competitions × dates through the retry controller into the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use scorehaul_adapters::{
    dismiss_consent, open_ready, AutomationSession, Condition, DelayRange, Extractor,
    LocatorProvider, Pager, PagerSettings, SessionError, SessionFactory, Sleeper, TokioSleeper,
};
use scorehaul_core::{DateWindow, HarvestTarget, HarvestUnit, MatchRecord, StatisticTable};
use scorehaul_storage::{competition_slug, AggregateStore};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::report::{HarvestReport, TargetReport};
use crate::retry::{BackoffPolicy, PageState, RetryController, UnitFailure, UnitHarvest, UnitWork};
use crate::session::HarvestSession;

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("automation session could not be created: {0}")]
    SessionStartup(#[source] SessionError),
    #[error("harvest worker stopped unexpectedly: {0}")]
    Worker(String),
    #[error("competitions {first:?} and {second:?} would share one artifact")]
    ArtifactCollision { first: String, second: String },
}

#[derive(Debug, Clone)]
pub struct HarvestSettings {
    pub backoff: BackoffPolicy,
    pub pager: PagerSettings,
    pub inter_target_delay: DelayRange,
    pub inter_unit_delay: DelayRange,
    pub page_ready_timeout: Duration,
    pub content_timeout: Duration,
    pub consent_timeout: Duration,
    pub fetch_details: bool,
}

impl Default for HarvestSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            pager: PagerSettings::default(),
            inter_target_delay: DelayRange::from_millis(3_000, 5_000),
            inter_unit_delay: DelayRange::from_millis(1_000, 2_000),
            page_ready_timeout: Duration::from_secs(30),
            content_timeout: Duration::from_secs(10),
            consent_timeout: Duration::from_secs(5),
            fetch_details: false,
        }
    }
}

/// How one unit ended, as seen by the orchestrator. An empty page keeps its
/// harvest so gaps and dropped rows still reach the report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Success(UnitHarvest),
    EmptyPage(UnitHarvest),
    Failure(UnitFailure),
}

impl From<Result<UnitHarvest, UnitFailure>> for UnitOutcome {
    fn from(result: Result<UnitHarvest, UnitFailure>) -> Self {
        match result {
            Ok(harvest) if harvest.page == PageState::Empty => Self::EmptyPage(harvest),
            Ok(harvest) => Self::Success(harvest),
            Err(failure) => Self::Failure(failure),
        }
    }
}

/// Loads one results page, expands it and extracts every row.
pub struct PageHarvestWork {
    locators: Arc<dyn LocatorProvider>,
    pager: Pager,
    sleeper: Arc<dyn Sleeper>,
    page_ready_timeout: Duration,
    content_timeout: Duration,
    consent_timeout: Duration,
    fetch_details: bool,
    detail_pause: DelayRange,
}

impl PageHarvestWork {
    pub fn new(
        locators: Arc<dyn LocatorProvider>,
        settings: &HarvestSettings,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let pager = Pager::new(locators.locators().load_more.clone(), settings.pager);
        Self {
            locators,
            pager,
            sleeper,
            page_ready_timeout: settings.page_ready_timeout,
            content_timeout: settings.content_timeout,
            consent_timeout: settings.consent_timeout,
            fetch_details: settings.fetch_details,
            detail_pause: settings.inter_unit_delay,
        }
    }

    /// Fills statistics from each match's detail page. Returns the gaps it hit.
    async fn attach_details(
        &self,
        session: &mut dyn AutomationSession,
        records: &mut [MatchRecord],
    ) -> Result<u32, SessionError> {
        let extractor = Extractor::new(self.locators.locators());
        let mut gaps = 0;
        for record in records.iter_mut() {
            let Some(url) = record
                .external_id
                .as_deref()
                .and_then(|id| self.locators.match_detail_url(id))
            else {
                continue;
            };
            self.sleeper.sleep(self.detail_pause.sample()).await;
            match self.detail_statistics(session, &extractor, &url).await {
                Ok((table, missed)) => {
                    record.statistics.absorb(table);
                    gaps += missed;
                }
                // An unreachable detail page only costs its statistics.
                Err(err) if err.is_fatal() && !matches!(err, SessionError::Navigation { .. }) => {
                    return Err(err)
                }
                Err(err) => {
                    debug!(url = %url, error = %err, "detail statistics unavailable");
                    gaps += 1;
                }
            }
        }
        Ok(gaps)
    }

    async fn detail_statistics(
        &self,
        session: &mut dyn AutomationSession,
        extractor: &Extractor<'_>,
        url: &str,
    ) -> Result<(StatisticTable, u32), SessionError> {
        open_ready(session, url, self.page_ready_timeout).await?;
        if let Some(ready) = &self.locators.locators().detail_ready {
            session
                .wait_for_condition(&Condition::Present(ready.clone()), self.content_timeout)
                .await?;
        }
        extractor.extract_detail_statistics(session).await
    }
}

#[async_trait]
impl UnitWork for PageHarvestWork {
    async fn run(
        &self,
        session: &mut dyn AutomationSession,
        unit: &HarvestUnit,
    ) -> Result<UnitHarvest, SessionError> {
        let locators = self.locators.locators();
        let url = self.locators.results_url(&unit.target, unit.date);
        debug!(url = %url, "opening results page");

        open_ready(session, &url, self.page_ready_timeout).await?;
        dismiss_consent(session, locators.consent_button.as_ref(), self.consent_timeout).await?;

        let has_results = session
            .wait_for_condition(
                &Condition::Present(locators.results_container.clone()),
                self.content_timeout,
            )
            .await?;
        if !has_results {
            info!("no results container, treating day as empty");
            return Ok(UnitHarvest::empty());
        }

        let paging = self.pager.expand(session, self.sleeper.as_ref()).await?;
        let page = Extractor::new(locators)
            .extract_page(session, unit.competition_id(), unit.date)
            .await?;
        debug!(
            rows = page.rows_seen,
            dropped = page.rows_dropped,
            expansions = paging.expansions,
            "results page extracted"
        );

        let mut records = page.records;
        let mut gaps = page.fields_gapped;
        if self.fetch_details && !records.is_empty() {
            gaps += self.attach_details(session, &mut records).await?;
        }

        let mut harvest = UnitHarvest::loaded(records, gaps);
        harvest.expansions = paging.expansions;
        harvest.rows_dropped = u32::try_from(page.rows_dropped).unwrap_or(u32::MAX);
        Ok(harvest)
    }
}

pub struct HarvestOrchestrator {
    factory: Arc<dyn SessionFactory>,
    store: AggregateStore,
    work: Arc<dyn UnitWork>,
    settings: HarvestSettings,
    sleeper: Arc<dyn Sleeper>,
    cancel: CancellationToken,
}

impl HarvestOrchestrator {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        store: AggregateStore,
        work: Arc<dyn UnitWork>,
        settings: HarvestSettings,
    ) -> Self {
        Self {
            factory,
            store,
            work,
            settings,
            sleeper: Arc::new(TokioSleeper),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &AggregateStore {
        &self.store
    }

    pub async fn run(
        &self,
        targets: &[HarvestTarget],
        window: DateWindow,
    ) -> Result<HarvestReport, HarvestError> {
        check_artifact_names(targets)?;
        self.run_with_id(Uuid::new_v4(), targets, window).await
    }

    async fn run_with_id(
        &self,
        run_id: Uuid,
        targets: &[HarvestTarget],
        window: DateWindow,
    ) -> Result<HarvestReport, HarvestError> {
        let span = info_span!("harvest_run", run_id = %run_id);
        async move {
            let mut report = HarvestReport::new(run_id, Utc::now(), window);
            info!(targets = targets.len(), days = window.len(), "harvest run starting");

            let mut session = HarvestSession::start(Arc::clone(&self.factory))
                .await
                .map_err(HarvestError::SessionStartup)?;
            let retry = RetryController::new(self.settings.backoff, Arc::clone(&self.sleeper));

            for (index, target) in targets.iter().enumerate() {
                if self.cancel.is_cancelled() {
                    report.cancelled = true;
                    break;
                }
                if index > 0 {
                    self.sleeper
                        .sleep(self.settings.inter_target_delay.sample())
                        .await;
                }
                let target_report = self
                    .harvest_target(target, window, &mut session, &retry, &mut report.cancelled)
                    .await;
                report.targets.push(target_report);
                if report.cancelled {
                    break;
                }
            }

            session.release().await;
            report.finished_at = Utc::now();
            info!(
                records = report.records_harvested(),
                units_failed = report.units_failed(),
                cancelled = report.cancelled,
                "harvest run finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Walks every date of one target and flushes what it found, even when
    /// cancellation cuts the walk short.
    async fn harvest_target(
        &self,
        target: &HarvestTarget,
        window: DateWindow,
        session: &mut HarvestSession,
        retry: &RetryController,
        cancelled: &mut bool,
    ) -> TargetReport {
        let mut target_report = TargetReport::new(&target.competition_id);
        let mut buffer: Vec<MatchRecord> = Vec::new();

        for (day_index, date) in window.days().enumerate() {
            if self.cancel.is_cancelled() {
                info!(competition = %target.competition_id, "cancellation requested, stopping");
                *cancelled = true;
                break;
            }
            if day_index > 0 {
                self.sleeper
                    .sleep(self.settings.inter_unit_delay.sample())
                    .await;
            }

            let unit = HarvestUnit::new(target.clone(), date);
            let span = info_span!("harvest_unit", competition = %target.competition_id, date = %date);
            let outcome: UnitOutcome = retry
                .execute(&unit, session, self.work.as_ref())
                .instrument(span)
                .await
                .into();

            match outcome {
                UnitOutcome::Success(harvest) => {
                    target_report.units_succeeded += 1;
                    target_report.absorb_page_stats(&harvest);
                    target_report.records_harvested += harvest.records.len();
                    buffer.extend(harvest.records.into_iter().map(|mut record| {
                        record.competition_id = target.competition_id.clone();
                        record
                    }));
                }
                UnitOutcome::EmptyPage(harvest) => {
                    debug!(
                        competition = %target.competition_id,
                        %date,
                        rows_dropped = harvest.rows_dropped,
                        "no matches"
                    );
                    target_report.units_empty += 1;
                    target_report.absorb_page_stats(&harvest);
                }
                UnitOutcome::Failure(failure) => {
                    warn!(competition = %target.competition_id, %date, error = %failure, "unit skipped");
                    target_report.units_failed += 1;
                    target_report.failures.push(failure);
                }
            }
        }

        self.flush(&target.competition_id, buffer, &mut target_report)
            .await;
        target_report
    }

    async fn flush(
        &self,
        competition_id: &str,
        buffer: Vec<MatchRecord>,
        target_report: &mut TargetReport,
    ) {
        if buffer.is_empty() {
            debug!(competition = competition_id, "nothing to persist");
            return;
        }
        match self.store.merge_and_persist(competition_id, buffer).await {
            Ok(outcome) => {
                target_report.duplicates_dropped = outcome.duplicates_dropped;
                target_report.persisted_path = Some(outcome.path.display().to_string());
            }
            Err(err) => {
                warn!(competition = competition_id, error = %err, "aggregate not persisted");
                target_report.persistence_warning = Some(err.to_string());
            }
        }
    }

    /// Splits targets across `workers` independent sessions. Each worker owns
    /// its targets' artifacts outright.
    pub async fn run_partitioned(
        self: Arc<Self>,
        targets: &[HarvestTarget],
        window: DateWindow,
        workers: usize,
    ) -> Result<HarvestReport, HarvestError> {
        check_artifact_names(targets)?;
        let partitions = partition_targets(targets, workers);
        if partitions.len() <= 1 {
            return self.run(targets, window).await;
        }

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut tasks = JoinSet::new();
        for (worker, part) in partitions.into_iter().enumerate() {
            let orchestrator = Arc::clone(&self);
            tasks.spawn(
                async move {
                    let result = orchestrator.run_with_id(run_id, &part, window).await;
                    (part, result)
                }
                .instrument(info_span!("harvest_worker", worker)),
            );
        }

        let mut reports = Vec::new();
        let mut startup_failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(report))) => reports.push(report),
                Ok((part, Err(err))) => {
                    warn!(error = %err, targets = part.len(), "harvest worker could not start");
                    startup_failures.push((part, err));
                }
                Err(join_err) => return Err(HarvestError::Worker(join_err.to_string())),
            }
        }

        if reports.is_empty() && !startup_failures.is_empty() {
            return Err(startup_failures.swap_remove(0).1);
        }

        let mut merged = HarvestReport::merge(run_id, started_at, window, reports);
        for (part, err) in startup_failures {
            for target in &part {
                merged
                    .targets
                    .push(startup_failure_report(target, window, &err));
            }
        }
        merged.sort_targets_by(targets);
        Ok(merged)
    }
}

/// Every date of a target whose worker never got a session counts as failed
/// without an attempt.
fn startup_failure_report(
    target: &HarvestTarget,
    window: DateWindow,
    err: &HarvestError,
) -> TargetReport {
    let reason = err.to_string();
    let mut report = TargetReport::new(&target.competition_id);
    report.failures = window
        .days()
        .map(|date| UnitFailure {
            competition_id: target.competition_id.clone(),
            date,
            attempts: 0,
            reason: reason.clone(),
        })
        .collect();
    report.units_failed = u32::try_from(report.failures.len()).unwrap_or(u32::MAX);
    report.startup_error = Some(reason);
    report
}

/// Rejects target lists where two competitions map onto the same artifact file.
fn check_artifact_names(targets: &[HarvestTarget]) -> Result<(), HarvestError> {
    let mut owners: HashMap<String, &str> = HashMap::new();
    for target in targets {
        let slug = competition_slug(&target.competition_id);
        if let Some(first) = owners.insert(slug, &target.competition_id) {
            if first != target.competition_id {
                return Err(HarvestError::ArtifactCollision {
                    first: first.to_string(),
                    second: target.competition_id.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Round-robin split preserving input order inside each partition. Never
/// returns more partitions than targets, and always at least one.
pub fn partition_targets(targets: &[HarvestTarget], workers: usize) -> Vec<Vec<HarvestTarget>> {
    let count = workers.max(1).min(targets.len().max(1));
    let mut partitions = vec![Vec::new(); count];
    for (index, target) in targets.iter().enumerate() {
        partitions[index % count].push(target.clone());
    }
    partitions
}
