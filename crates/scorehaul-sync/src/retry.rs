//! Bounded retries for one harvest unit, with in-place and session-rebuild recovery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use scorehaul_adapters::{AutomationSession, FailureClass, SessionError, Sleeper};
use scorehaul_core::{HarvestUnit, MatchRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::session::HarvestSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random extra added to every delay.
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            jitter: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    /// Exponential from `base_delay`, capped at `max_delay`, before jitter.
    pub fn base_delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            fastrand::u64(0..=jitter_ms)
        };
        self.base_delay_for_attempt(attempt_index) + Duration::from_millis(extra)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageState {
    Loaded,
    /// A valid page with nothing on it.
    Empty,
}

/// What one successful unit attempt produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitHarvest {
    pub records: Vec<MatchRecord>,
    pub fields_gapped: u32,
    pub expansions: u32,
    /// Rows seen on the page but dropped for lacking any identity.
    pub rows_dropped: u32,
    pub page: PageState,
}

impl UnitHarvest {
    pub fn empty() -> Self {
        Self {
            records: Vec::new(),
            fields_gapped: 0,
            expansions: 0,
            rows_dropped: 0,
            page: PageState::Empty,
        }
    }

    pub fn loaded(records: Vec<MatchRecord>, fields_gapped: u32) -> Self {
        let page = if records.is_empty() {
            PageState::Empty
        } else {
            PageState::Loaded
        };
        Self {
            records,
            fields_gapped,
            expansions: 0,
            rows_dropped: 0,
            page,
        }
    }
}

/// A unit that exhausted its attempts. Never escapes past the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{competition_id}@{date} failed after {attempts} attempt(s): {reason}")]
pub struct UnitFailure {
    pub competition_id: String,
    pub date: NaiveDate,
    pub attempts: u32,
    pub reason: String,
}

impl UnitFailure {
    fn new(unit: &HarvestUnit, attempts: u32, reason: impl Into<String>) -> Self {
        Self {
            competition_id: unit.competition_id().to_string(),
            date: unit.date,
            attempts,
            reason: reason.into(),
        }
    }
}

/// The body retried per unit: fetch one results page and extract it.
#[async_trait]
pub trait UnitWork: Send + Sync {
    async fn run(
        &self,
        session: &mut dyn AutomationSession,
        unit: &HarvestUnit,
    ) -> Result<UnitHarvest, SessionError>;
}

pub struct RetryController {
    policy: BackoffPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryController {
    pub fn new(policy: BackoffPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { policy, sleeper }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Runs `work` for `unit` up to `max_attempts` times.
    ///
    /// Transient errors wait, refresh the page and try again on the same session.
    /// Fatal errors tear the session down and rebuild it; every rebuild belongs to
    /// the attempt that triggered it. If a rebuild fails the unit fails at once.
    pub async fn execute(
        &self,
        unit: &HarvestUnit,
        session: &mut HarvestSession,
        work: &dyn UnitWork,
    ) -> Result<UnitHarvest, UnitFailure> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_reason = String::from("no attempt was made");

        for attempt in 1..=max_attempts {
            session.record_attempt(unit);

            if !session.is_known_good() {
                if let Err(err) = session.recreate().await {
                    error!(attempt, error = %err, "session could not be rebuilt");
                    return Err(UnitFailure::new(
                        unit,
                        attempt,
                        format!("session recreation failed: {err}"),
                    ));
                }
            }
            let Some(live) = session.session() else {
                return Err(UnitFailure::new(unit, attempt, "no live session"));
            };

            let err = match work.run(live, unit).await {
                Ok(harvest) => {
                    debug!(attempt, records = harvest.records.len(), "unit attempt succeeded");
                    return Ok(harvest);
                }
                Err(err) => err,
            };
            last_reason = err.to_string();
            let last_attempt = attempt == max_attempts;

            match err.classify() {
                FailureClass::Transient => {
                    warn!(attempt, max_attempts, error = %err, "transient failure");
                    if last_attempt {
                        break;
                    }
                    self.sleeper
                        .sleep(self.policy.delay_for_attempt(attempt - 1))
                        .await;
                    if let Some(live) = session.session() {
                        match live.refresh().await {
                            Ok(()) => {}
                            Err(refresh_err) if refresh_err.is_fatal() => {
                                warn!(error = %refresh_err, "refresh failed, session marked for rebuild");
                                session.invalidate();
                            }
                            Err(refresh_err) => debug!(error = %refresh_err, "refresh failed"),
                        }
                    }
                }
                FailureClass::Fatal => {
                    warn!(attempt, max_attempts, error = %err, "fatal failure, rebuilding session");
                    session.invalidate();
                    if let Err(rebuild_err) = session.recreate().await {
                        error!(attempt, error = %rebuild_err, "session could not be rebuilt");
                        return Err(UnitFailure::new(
                            unit,
                            attempt,
                            format!("{err}; session recreation failed: {rebuild_err}"),
                        ));
                    }
                    if last_attempt {
                        break;
                    }
                    self.sleeper
                        .sleep(self.policy.delay_for_attempt(attempt - 1))
                        .await;
                }
            }
        }

        error!(attempts = max_attempts, reason = %last_reason, "unit abandoned");
        Err(UnitFailure::new(unit, max_attempts, last_reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scorehaul_adapters::{HtmlDocumentFactory, RecordingSleeper, SessionFactory};
    use scorehaul_core::HarvestTarget;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn unit() -> HarvestUnit {
        HarvestUnit::new(
            HarvestTarget::new("demo-league", "https://site.test/demo-league"),
            NaiveDate::from_ymd_opt(2024, 8, 1).expect("date"),
        )
    }

    fn policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            jitter: Duration::ZERO,
        }
    }

    /// Fails with the scripted errors in order, then succeeds.
    struct ScriptedWork {
        failures: Mutex<Vec<SessionError>>,
        calls: AtomicU32,
    }

    impl ScriptedWork {
        fn new(mut failures: Vec<SessionError>) -> Self {
            failures.reverse();
            Self {
                failures: Mutex::new(failures),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl UnitWork for ScriptedWork {
        async fn run(
            &self,
            _session: &mut dyn AutomationSession,
            unit: &HarvestUnit,
        ) -> Result<UnitHarvest, SessionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.failures.lock().expect("lock").pop() {
                return Err(err);
            }
            let mut record = MatchRecord::new(unit.competition_id(), unit.date);
            record.home_team = Some("Alpha".into());
            Ok(UnitHarvest::loaded(vec![record], 0))
        }
    }

    struct AlwaysFatal;

    #[async_trait]
    impl UnitWork for AlwaysFatal {
        async fn run(
            &self,
            _session: &mut dyn AutomationSession,
            _unit: &HarvestUnit,
        ) -> Result<UnitHarvest, SessionError> {
            Err(SessionError::SessionLost("browser crashed".into()))
        }
    }

    /// Succeeds `healthy` times, then refuses to build sessions.
    struct ExhaustibleFactory {
        inner: HtmlDocumentFactory,
        healthy: AtomicU32,
    }

    #[async_trait]
    impl SessionFactory for ExhaustibleFactory {
        async fn create(&self) -> Result<Box<dyn AutomationSession>, SessionError> {
            if self.healthy.load(Ordering::SeqCst) == 0 {
                return Err(SessionError::Startup("driver refused".into()));
            }
            self.healthy.fetch_sub(1, Ordering::SeqCst);
            self.inner.create().await
        }
    }

    async fn session(healthy: u32) -> HarvestSession {
        let factory = ExhaustibleFactory {
            inner: HtmlDocumentFactory::new(HashMap::new()),
            healthy: AtomicU32::new(healthy),
        };
        HarvestSession::start(Arc::new(factory)).await.expect("start")
    }

    #[test]
    fn backoff_grows_and_caps() {
        let p = policy(5);
        assert_eq!(p.base_delay_for_attempt(0), Duration::from_secs(10));
        assert_eq!(p.base_delay_for_attempt(1), Duration::from_secs(20));
        assert_eq!(p.base_delay_for_attempt(5), Duration::from_secs(60));
        assert_eq!(p.base_delay_for_attempt(40), Duration::from_secs(60));

        let jittered = BackoffPolicy {
            jitter: Duration::from_millis(500),
            ..p
        };
        let d = jittered.delay_for_attempt(0);
        assert!(d >= Duration::from_secs(10) && d <= Duration::from_millis(10_500));
    }

    #[tokio::test]
    async fn transient_failures_retry_in_place() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let controller = RetryController::new(policy(5), sleeper.clone());
        let mut session = session(10).await;
        let work = ScriptedWork::new(vec![
            SessionError::Timeout("slow".into()),
            SessionError::StaleElement("row".into()),
        ]);

        let harvest = controller
            .execute(&unit(), &mut session, &work)
            .await
            .expect("third attempt succeeds");

        assert_eq!(harvest.records.len(), 1);
        assert_eq!(work.calls.load(Ordering::SeqCst), 3);
        assert_eq!(session.attempts_for(&unit()), 3);
        assert_eq!(session.recreations(), 0);
        assert_eq!(
            sleeper.recorded(),
            vec![Duration::from_secs(10), Duration::from_secs(20)]
        );
    }

    #[tokio::test]
    async fn fatal_failures_rebuild_once_per_attempt() {
        let controller = RetryController::new(policy(4), Arc::new(RecordingSleeper::new()));
        let mut session = session(100).await;

        let failure = controller
            .execute(&unit(), &mut session, &AlwaysFatal)
            .await
            .unwrap_err();

        assert_eq!(failure.attempts, 4);
        assert_eq!(session.recreations(), 4);
        assert!(failure.reason.contains("browser crashed"));
        assert!(session.is_known_good());
    }

    #[tokio::test]
    async fn failed_rebuild_ends_the_unit_immediately() {
        let controller = RetryController::new(policy(5), Arc::new(RecordingSleeper::new()));
        // One session for start-up, none after.
        let mut session = session(1).await;

        let failure = controller
            .execute(&unit(), &mut session, &AlwaysFatal)
            .await
            .unwrap_err();

        assert_eq!(failure.attempts, 1);
        assert!(failure.reason.contains("session recreation failed"));
        assert_eq!(session.recreations(), 1);
    }
}
