use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use scorehaul_adapters::{
    AutomationSession, FlashscoreLocators, HtmlDocumentFactory, RecordingSleeper, SessionError,
    SessionFactory,
};
use scorehaul_core::{DateWindow, HarvestTarget, HarvestUnit};
use scorehaul_storage::AggregateStore;
use scorehaul_sync::{
    BackoffPolicy, HarvestError, HarvestOrchestrator, HarvestSettings, PageHarvestWork, PageState,
    UnitHarvest, UnitWork,
};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

const DEMO_URL: &str = "https://fixtures.scorehaul.test/football/demo-league/";

fn fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/demo-league")
}

fn window() -> DateWindow {
    DateWindow::new(
        NaiveDate::from_ymd_opt(2024, 8, 1).expect("date"),
        NaiveDate::from_ymd_opt(2024, 8, 2).expect("date"),
    )
    .expect("window")
}

fn settings() -> HarvestSettings {
    HarvestSettings {
        backoff: BackoffPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            jitter: Duration::ZERO,
        },
        ..HarvestSettings::default()
    }
}

fn fixtures() -> Arc<HtmlDocumentFactory> {
    Arc::new(HtmlDocumentFactory::from_fixture_dir(fixture_dir()).expect("fixture pages"))
}

fn page_work(sleeper: Arc<RecordingSleeper>) -> PageHarvestWork {
    PageHarvestWork::new(Arc::new(FlashscoreLocators::new()), &settings(), sleeper)
}

/// Fails the first `failures` calls with `error`, then delegates.
struct FlakyWork {
    inner: PageHarvestWork,
    failures: AtomicU32,
    error: SessionError,
}

#[async_trait]
impl UnitWork for FlakyWork {
    async fn run(
        &self,
        session: &mut dyn AutomationSession,
        unit: &HarvestUnit,
    ) -> Result<UnitHarvest, SessionError> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(self.error.clone());
        }
        self.inner.run(session, unit).await
    }
}

/// Cancels the run as soon as the first unit has been harvested.
struct CancelAfterFirst {
    inner: PageHarvestWork,
    token: CancellationToken,
}

#[async_trait]
impl UnitWork for CancelAfterFirst {
    async fn run(
        &self,
        session: &mut dyn AutomationSession,
        unit: &HarvestUnit,
    ) -> Result<UnitHarvest, SessionError> {
        let result = self.inner.run(session, unit).await;
        self.token.cancel();
        result
    }
}

struct NoDriver;

#[async_trait]
impl SessionFactory for NoDriver {
    async fn create(&self) -> Result<Box<dyn AutomationSession>, SessionError> {
        Err(SessionError::Startup("connection refused".into()))
    }
}

/// Refuses the first session it is asked for, then behaves like `inner`.
struct FirstStartRefused {
    inner: HtmlDocumentFactory,
    refused: AtomicBool,
}

#[async_trait]
impl SessionFactory for FirstStartRefused {
    async fn create(&self) -> Result<Box<dyn AutomationSession>, SessionError> {
        if !self.refused.swap(true, Ordering::SeqCst) {
            return Err(SessionError::Startup("driver busy".into()));
        }
        self.inner.create().await
    }
}

/// Every page loads but yields only identity-less rows.
struct FacelessRows;

#[async_trait]
impl UnitWork for FacelessRows {
    async fn run(
        &self,
        _session: &mut dyn AutomationSession,
        _unit: &HarvestUnit,
    ) -> Result<UnitHarvest, SessionError> {
        Ok(UnitHarvest {
            records: Vec::new(),
            fields_gapped: 2,
            expansions: 1,
            rows_dropped: 3,
            page: PageState::Empty,
        })
    }
}

#[tokio::test]
async fn one_broken_competition_does_not_block_the_others() {
    let dir = tempdir().expect("tempdir");
    let sleeper = Arc::new(RecordingSleeper::new());
    let orchestrator = HarvestOrchestrator::new(
        fixtures(),
        AggregateStore::new(dir.path()),
        Arc::new(page_work(sleeper.clone())),
        settings(),
    )
    .with_sleeper(sleeper.clone());

    let targets = [
        HarvestTarget::new("ghost-league", "https://fixtures.scorehaul.test/football/ghost-league/"),
        HarvestTarget::new("demo-league", DEMO_URL),
    ];
    let report = orchestrator.run(&targets, window()).await.expect("run completes");

    let ghost = report.target("ghost-league").expect("ghost report");
    assert_eq!(ghost.units_failed, 2);
    assert_eq!(ghost.failures.len(), 2);
    assert!(ghost.failures.iter().all(|f| f.attempts == 3));
    assert!(ghost.persisted_path.is_none());

    let demo = report.target("demo-league").expect("demo report");
    assert_eq!(demo.units_failed, 0);
    assert_eq!(demo.records_harvested, 2);
    assert_eq!(report.units_failed(), 2);

    assert!(!orchestrator.store().artifact_path("ghost-league").exists());
    assert!(orchestrator.store().artifact_path("demo-league").exists());

    // The pause between competitions comes from the inter-target range.
    assert!(sleeper
        .recorded()
        .iter()
        .any(|d| *d >= Duration::from_secs(3) && *d <= Duration::from_secs(5)));
}

#[tokio::test]
async fn transient_unit_failures_are_retried_transparently() {
    let dir = tempdir().expect("tempdir");
    let sleeper = Arc::new(RecordingSleeper::new());
    let work = FlakyWork {
        inner: page_work(sleeper.clone()),
        failures: AtomicU32::new(2),
        error: SessionError::Timeout("results never rendered".into()),
    };
    let orchestrator = HarvestOrchestrator::new(
        fixtures(),
        AggregateStore::new(dir.path()),
        Arc::new(work),
        settings(),
    )
    .with_sleeper(sleeper.clone());

    let report = orchestrator
        .run(&[HarvestTarget::new("demo-league", DEMO_URL)], window())
        .await
        .expect("run");

    let demo = report.target("demo-league").expect("demo report");
    assert_eq!(demo.units_failed, 0);
    assert_eq!(demo.records_harvested, 2);
    let slept = sleeper.recorded();
    assert!(slept.contains(&Duration::from_secs(1)));
    assert!(slept.contains(&Duration::from_secs(2)));
}

#[tokio::test]
async fn cancellation_stops_between_units_and_keeps_flushed_records() {
    let dir = tempdir().expect("tempdir");
    let token = CancellationToken::new();
    let sleeper = Arc::new(RecordingSleeper::new());
    let work = CancelAfterFirst {
        inner: page_work(sleeper.clone()),
        token: token.clone(),
    };
    let orchestrator = HarvestOrchestrator::new(
        fixtures(),
        AggregateStore::new(dir.path()),
        Arc::new(work),
        settings(),
    )
    .with_sleeper(sleeper)
    .with_cancellation(token);

    let targets = [
        HarvestTarget::new("demo-league", DEMO_URL),
        HarvestTarget::new("demo-mirror", DEMO_URL),
    ];
    let report = orchestrator.run(&targets, window()).await.expect("run");

    assert!(report.cancelled);
    assert_eq!(report.targets.len(), 1);
    let demo = report.target("demo-league").expect("demo report");
    assert_eq!(demo.units_succeeded + demo.units_empty + demo.units_failed, 1);

    let aggregate = orchestrator
        .store()
        .load("demo-league")
        .await
        .expect("load")
        .expect("partial results persisted");
    assert_eq!(aggregate.len(), 2);
    assert!(!orchestrator.store().artifact_path("demo-mirror").exists());
}

#[tokio::test]
async fn run_fails_only_when_no_session_can_be_created() {
    let dir = tempdir().expect("tempdir");
    let orchestrator = HarvestOrchestrator::new(
        Arc::new(NoDriver),
        AggregateStore::new(dir.path()),
        Arc::new(page_work(Arc::new(RecordingSleeper::new()))),
        settings(),
    )
    .with_sleeper(Arc::new(RecordingSleeper::new()));

    let err = orchestrator
        .run(&[HarvestTarget::new("demo-league", DEMO_URL)], window())
        .await
        .unwrap_err();
    assert!(matches!(err, HarvestError::SessionStartup(_)));
}

#[tokio::test]
async fn partitioned_workers_write_disjoint_artifacts() {
    let dir = tempdir().expect("tempdir");
    let sleeper = Arc::new(RecordingSleeper::new());
    let orchestrator = Arc::new(
        HarvestOrchestrator::new(
            fixtures(),
            AggregateStore::new(dir.path()),
            Arc::new(page_work(sleeper.clone())),
            settings(),
        )
        .with_sleeper(sleeper),
    );

    let targets = [
        HarvestTarget::new("demo-league", DEMO_URL),
        HarvestTarget::new("demo-mirror", DEMO_URL),
        HarvestTarget::new("demo-reserve", DEMO_URL),
    ];
    let report = Arc::clone(&orchestrator)
        .run_partitioned(&targets, window(), 2)
        .await
        .expect("run");

    let ids: Vec<_> = report.targets.iter().map(|t| t.competition_id.as_str()).collect();
    assert_eq!(ids, vec!["demo-league", "demo-mirror", "demo-reserve"]);
    assert_eq!(report.records_harvested(), 6);
    assert_eq!(report.units_failed(), 0);

    for target in &targets {
        let aggregate = orchestrator
            .store()
            .load(&target.competition_id)
            .await
            .expect("load")
            .expect("artifact");
        assert_eq!(aggregate.len(), 2);
        assert!(aggregate
            .records()
            .iter()
            .all(|r| r.competition_id == target.competition_id));
    }
}

#[tokio::test]
async fn competitions_sharing_an_artifact_are_refused_before_harvesting() {
    let dir = tempdir().expect("tempdir");
    let orchestrator = Arc::new(
        HarvestOrchestrator::new(
            fixtures(),
            AggregateStore::new(dir.path()),
            Arc::new(page_work(Arc::new(RecordingSleeper::new()))),
            settings(),
        )
        .with_sleeper(Arc::new(RecordingSleeper::new())),
    );
    let targets = [
        HarvestTarget::new("Demo League", DEMO_URL),
        HarvestTarget::new("demo-league", DEMO_URL),
    ];

    let err = orchestrator.run(&targets, window()).await.unwrap_err();
    assert!(matches!(err, HarvestError::ArtifactCollision { .. }));
    let err = Arc::clone(&orchestrator)
        .run_partitioned(&targets, window(), 2)
        .await
        .unwrap_err();
    assert!(matches!(err, HarvestError::ArtifactCollision { .. }));
    assert!(!orchestrator.store().artifact_path("demo-league").exists());
}

#[tokio::test]
async fn worker_that_cannot_start_reports_failed_units() {
    let dir = tempdir().expect("tempdir");
    let factory = FirstStartRefused {
        inner: HtmlDocumentFactory::from_fixture_dir(fixture_dir()).expect("fixture pages"),
        refused: AtomicBool::new(false),
    };
    let sleeper = Arc::new(RecordingSleeper::new());
    let orchestrator = Arc::new(
        HarvestOrchestrator::new(
            Arc::new(factory),
            AggregateStore::new(dir.path()),
            Arc::new(page_work(sleeper.clone())),
            settings(),
        )
        .with_sleeper(sleeper),
    );
    let targets = [
        HarvestTarget::new("demo-league", DEMO_URL),
        HarvestTarget::new("demo-mirror", DEMO_URL),
    ];

    let report = orchestrator
        .run_partitioned(&targets, window(), 2)
        .await
        .expect("one worker still runs");

    let (stranded, harvested): (Vec<_>, Vec<_>) =
        report.targets.iter().partition(|t| t.startup_error.is_some());
    assert_eq!(stranded.len(), 1);
    assert_eq!(harvested.len(), 1);

    let stranded = stranded[0];
    assert_eq!(stranded.units_failed, 2);
    assert_eq!(stranded.failures.len(), 2);
    assert!(stranded.failures.iter().all(|f| f.attempts == 0));
    assert!(stranded.persistence_warning.is_none());
    assert_eq!(harvested[0].records_harvested, 2);
}

#[tokio::test]
async fn empty_pages_keep_their_gap_and_drop_counts() {
    let dir = tempdir().expect("tempdir");
    let orchestrator = HarvestOrchestrator::new(
        fixtures(),
        AggregateStore::new(dir.path()),
        Arc::new(FacelessRows),
        settings(),
    )
    .with_sleeper(Arc::new(RecordingSleeper::new()));

    let report = orchestrator
        .run(&[HarvestTarget::new("demo-league", DEMO_URL)], window())
        .await
        .expect("run");

    let demo = report.target("demo-league").expect("demo report");
    assert_eq!(demo.units_empty, 2);
    assert_eq!(demo.records_harvested, 0);
    assert_eq!(demo.fields_gapped, 4);
    assert_eq!(demo.rows_dropped, 6);
    assert_eq!(demo.expansions, 2);
}
