//! Lifecycle of the one automation session a worker owns.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use scorehaul_adapters::{AutomationSession, SessionError, SessionFactory};
use scorehaul_core::HarvestUnit;
use tracing::{debug, info, warn};

pub struct HarvestSession {
    factory: Arc<dyn SessionFactory>,
    live: Option<Box<dyn AutomationSession>>,
    known_good: bool,
    attempts: HashMap<(String, NaiveDate), u32>,
    recreations: u32,
}

impl HarvestSession {
    /// Builds the first session. Failing here is the only run-fatal error.
    pub async fn start(factory: Arc<dyn SessionFactory>) -> Result<Self, SessionError> {
        let live = factory.create().await?;
        info!("automation session started");
        Ok(Self {
            factory,
            live: Some(live),
            known_good: true,
            attempts: HashMap::new(),
            recreations: 0,
        })
    }

    pub fn session(&mut self) -> Option<&mut (dyn AutomationSession + 'static)> {
        self.live.as_deref_mut()
    }

    pub fn is_known_good(&self) -> bool {
        self.known_good && self.live.is_some()
    }

    /// Marks the session for rebuild before the next attempt.
    pub fn invalidate(&mut self) {
        self.known_good = false;
    }

    /// Quits the current session (best effort) and builds a new one.
    pub async fn recreate(&mut self) -> Result<(), SessionError> {
        if let Some(mut old) = self.live.take() {
            if let Err(err) = old.quit().await {
                debug!(error = %err, "old session did not quit cleanly");
            }
        }
        self.recreations += 1;
        match self.factory.create().await {
            Ok(fresh) => {
                info!(recreations = self.recreations, "automation session rebuilt");
                self.live = Some(fresh);
                self.known_good = true;
                Ok(())
            }
            Err(err) => {
                self.known_good = false;
                Err(err)
            }
        }
    }

    pub async fn release(mut self) {
        if let Some(mut live) = self.live.take() {
            match live.quit().await {
                Ok(()) => debug!("automation session released"),
                Err(err) => warn!(error = %err, "automation session did not quit cleanly"),
            }
        }
    }

    pub fn record_attempt(&mut self, unit: &HarvestUnit) -> u32 {
        let count = self
            .attempts
            .entry((unit.competition_id().to_string(), unit.date))
            .or_default();
        *count += 1;
        *count
    }

    pub fn attempts_for(&self, unit: &HarvestUnit) -> u32 {
        self.attempts
            .get(&(unit.competition_id().to_string(), unit.date))
            .copied()
            .unwrap_or(0)
    }

    pub fn recreations(&self) -> u32 {
        self.recreations
    }
}
