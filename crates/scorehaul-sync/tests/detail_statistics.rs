use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use scorehaul_adapters::{
    AutomationSession, Condition, ElementHandle, FlashscoreLocators, HtmlDocumentFactory, Locator,
    ReadyState, RecordingSleeper, SessionError, SessionFactory,
};
use scorehaul_core::{DateWindow, HarvestTarget};
use scorehaul_storage::AggregateStore;
use scorehaul_sync::{BackoffPolicy, HarvestOrchestrator, HarvestReport, HarvestSettings, PageHarvestWork};
use serde_json::Value as JsonValue;
use tempfile::{tempdir, TempDir};

const DEMO_URL: &str = "https://fixtures.scorehaul.test/football/demo-league/";
const FIXTURE_HOST: &str = "https://fixtures.scorehaul.test";

fn fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/demo-league")
}

fn first_day() -> DateWindow {
    DateWindow::single(NaiveDate::from_ymd_opt(2024, 8, 1).expect("date"))
}

fn settings(fetch_details: bool) -> HarvestSettings {
    HarvestSettings {
        backoff: BackoffPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            jitter: Duration::ZERO,
        },
        fetch_details,
        ..HarvestSettings::default()
    }
}

fn fixtures() -> HtmlDocumentFactory {
    HtmlDocumentFactory::from_fixture_dir(fixture_dir()).expect("fixture pages")
}

async fn harvest(
    factory: Arc<dyn SessionFactory>,
    fetch_details: bool,
) -> (HarvestReport, HarvestOrchestrator, TempDir) {
    let dir = tempdir().expect("tempdir");
    let settings = settings(fetch_details);
    let sleeper = Arc::new(RecordingSleeper::new());
    let work = PageHarvestWork::new(
        Arc::new(FlashscoreLocators::with_base_url(FIXTURE_HOST)),
        &settings,
        sleeper.clone(),
    );
    let orchestrator = HarvestOrchestrator::new(
        factory,
        AggregateStore::new(dir.path()),
        Arc::new(work),
        settings,
    )
    .with_sleeper(sleeper);
    let report = orchestrator
        .run(&[HarvestTarget::new("demo-league", DEMO_URL)], first_day())
        .await
        .expect("run");
    (report, orchestrator, dir)
}

/// Counts sessions and drops the first `drops` of them when they open a match page.
struct DetailDroppingFactory {
    inner: HtmlDocumentFactory,
    created: AtomicU32,
    drops: Arc<AtomicU32>,
}

#[async_trait]
impl SessionFactory for DetailDroppingFactory {
    async fn create(&self) -> Result<Box<dyn AutomationSession>, SessionError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.create().await?;
        Ok(Box::new(DetailDroppingSession {
            inner,
            drops: Arc::clone(&self.drops),
        }))
    }
}

struct DetailDroppingSession {
    inner: Box<dyn AutomationSession>,
    drops: Arc<AtomicU32>,
}

#[async_trait]
impl AutomationSession for DetailDroppingSession {
    async fn open(&mut self, url: &str) -> Result<(), SessionError> {
        if url.contains("/match/")
            && self
                .drops
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(SessionError::SessionLost("browser crashed".into()));
        }
        self.inner.open(url).await
    }

    async fn refresh(&mut self) -> Result<(), SessionError> {
        self.inner.refresh().await
    }

    async fn ready_state(&mut self) -> Result<ReadyState, SessionError> {
        self.inner.ready_state().await
    }

    async fn execute_script(
        &mut self,
        script: &str,
        args: Vec<JsonValue>,
    ) -> Result<JsonValue, SessionError> {
        self.inner.execute_script(script, args).await
    }

    async fn find_all(&mut self, locator: &Locator) -> Result<Vec<ElementHandle>, SessionError> {
        self.inner.find_all(locator).await
    }

    async fn find_within(
        &mut self,
        scope: &ElementHandle,
        locator: &Locator,
    ) -> Result<Vec<ElementHandle>, SessionError> {
        self.inner.find_within(scope, locator).await
    }

    async fn text(&mut self, element: &ElementHandle) -> Result<String, SessionError> {
        self.inner.text(element).await
    }

    async fn attribute(
        &mut self,
        element: &ElementHandle,
        name: &str,
    ) -> Result<Option<String>, SessionError> {
        self.inner.attribute(element, name).await
    }

    async fn is_displayed(&mut self, element: &ElementHandle) -> Result<bool, SessionError> {
        self.inner.is_displayed(element).await
    }

    async fn click(&mut self, element: &ElementHandle) -> Result<(), SessionError> {
        self.inner.click(element).await
    }

    async fn wait_for_condition(
        &mut self,
        condition: &Condition,
        timeout: Duration,
    ) -> Result<bool, SessionError> {
        self.inner.wait_for_condition(condition, timeout).await
    }

    async fn quit(&mut self) -> Result<(), SessionError> {
        self.inner.quit().await
    }
}

#[tokio::test]
async fn detail_statistics_merge_into_the_row_statistics() {
    let (report, orchestrator, _dir) = harvest(Arc::new(fixtures()), true).await;
    assert_eq!(report.units_failed(), 0);

    let aggregate = orchestrator
        .store()
        .load("demo-league")
        .await
        .expect("load")
        .expect("artifact");
    let played = &aggregate.records()[0];
    let labels: Vec<_> = played.statistics.labels().collect();
    assert_eq!(
        labels,
        vec!["Goal Attempts", "Shots on Goal", "Expected Goals (xG)", "Fouls"]
    );
    // The detail page wins for labels both pages carry.
    let attempts = played.statistics.get("Goal Attempts").expect("goal attempts");
    assert_eq!(attempts.home.as_deref(), Some("15"));
    let xg = played.statistics.get("Expected Goals (xG)").expect("xg");
    assert_eq!((xg.home.as_deref(), xg.away.as_deref()), (Some("1.84"), Some("0.92")));

    // The unplayed fixture has no detail page and keeps an empty table.
    assert!(aggregate.records()[1].statistics.is_empty());
}

#[tokio::test]
async fn unreachable_detail_page_costs_one_gap() {
    let (without, _, _dir_a) = harvest(Arc::new(fixtures()), false).await;
    let (with, _, _dir_b) = harvest(Arc::new(fixtures()), true).await;

    let before = without.target("demo-league").expect("report").fields_gapped;
    let after = with.target("demo-league").expect("report").fields_gapped;
    assert_eq!(before, 1);
    assert_eq!(after, before + 1);
    assert_eq!(with.units_failed(), 0);
    assert_eq!(with.records_harvested(), 2);
}

#[tokio::test]
async fn lost_session_on_detail_page_rebuilds_and_retries_the_unit() {
    let factory = Arc::new(DetailDroppingFactory {
        inner: fixtures(),
        created: AtomicU32::new(0),
        drops: Arc::new(AtomicU32::new(1)),
    });
    let (report, orchestrator, _dir) = harvest(factory.clone(), true).await;

    // One session at start, one rebuild after the crash.
    assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    let demo = report.target("demo-league").expect("report");
    assert_eq!(demo.units_failed, 0);
    assert_eq!(demo.units_succeeded, 1);

    let aggregate = orchestrator
        .store()
        .load("demo-league")
        .await
        .expect("load")
        .expect("artifact");
    assert!(aggregate.records()[0]
        .statistics
        .get("Expected Goals (xG)")
        .is_some());
}
