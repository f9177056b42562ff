//! Bounded "load more" expansion of a results listing.

use tracing::{debug, warn};

use crate::pacing::{DelayRange, Sleeper};
use crate::session::{AutomationSession, ElementHandle, Locator, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagerSettings {
    pub max_expansions: u32,
    /// Jittered pause after each activation so new rows can render.
    pub settle: DelayRange,
}

impl Default for PagerSettings {
    fn default() -> Self {
        Self {
            max_expansions: 50,
            settle: DelayRange::from_millis(1_000, 3_000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PagerOutcome {
    pub expansions: u32,
    /// The control was still offered when the cap was reached.
    pub capped: bool,
}

#[derive(Debug, Clone)]
pub struct Pager {
    load_more: Locator,
    settings: PagerSettings,
}

impl Pager {
    pub fn new(load_more: Locator, settings: PagerSettings) -> Self {
        Self {
            load_more,
            settings,
        }
    }

    /// Activates the load-more control until it disappears, stops responding, or the
    /// cap is hit. Only fatal session errors escape.
    pub async fn expand(
        &self,
        session: &mut dyn AutomationSession,
        sleeper: &dyn Sleeper,
    ) -> Result<PagerOutcome, SessionError> {
        let mut outcome = PagerOutcome::default();
        loop {
            if outcome.expansions >= self.settings.max_expansions {
                outcome.capped = self.control_offered(session).await?;
                if outcome.capped {
                    warn!(
                        expansions = outcome.expansions,
                        "load-more cap reached with control still present"
                    );
                }
                return Ok(outcome);
            }

            let Some(control) = self.visible_control(session).await? else {
                break;
            };
            match session.click(&control).await {
                Ok(()) => outcome.expansions += 1,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    debug!(error = %err, "load-more control stopped responding");
                    break;
                }
            }
            sleeper.sleep(self.settings.settle.sample()).await;
        }
        debug!(expansions = outcome.expansions, "listing fully expanded");
        Ok(outcome)
    }

    async fn visible_control(
        &self,
        session: &mut dyn AutomationSession,
    ) -> Result<Option<ElementHandle>, SessionError> {
        let controls = match session.find_all(&self.load_more).await {
            Ok(found) => found,
            Err(err) if err.is_fatal() => return Err(err),
            Err(_) => return Ok(None),
        };
        for control in controls {
            match session.is_displayed(&control).await {
                Ok(true) => return Ok(Some(control)),
                Ok(false) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(_) => {}
            }
        }
        Ok(None)
    }

    async fn control_offered(
        &self,
        session: &mut dyn AutomationSession,
    ) -> Result<bool, SessionError> {
        Ok(self.visible_control(session).await?.is_some())
    }
}
