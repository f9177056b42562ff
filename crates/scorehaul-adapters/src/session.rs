//! The automation session capability the harvester drives, and its error taxonomy.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

/// A CSS selector. Site profiles build these; sessions evaluate them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locator(String);

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Self(selector.into())
    }

    pub fn id(id: &str) -> Self {
        Self(format!("#{id}"))
    }

    pub fn class(name: &str) -> Self {
        Self(format!(".{name}"))
    }

    /// Selector list matching any of `locators`, yielded in document order.
    pub fn any_of(locators: &[&Locator]) -> Self {
        Self(
            locators
                .iter()
                .map(|l| l.0.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        )
    }

    pub fn as_css(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque reference to a live element, valid until the document changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementHandle(String);

impl ElementHandle {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Loading,
    Interactive,
    Complete,
    Unknown,
}

impl ReadyState {
    pub fn parse(value: &str) -> Self {
        match value {
            "loading" => Self::Loading,
            "interactive" => Self::Interactive,
            "complete" => Self::Complete,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    ReadyStateComplete,
    Present(Locator),
    /// Present and displayed.
    Clickable(Locator),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retry on the same session.
    Transient,
    /// Tear the session down and build a new one.
    Fatal,
}

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("stale element reference: {0}")]
    StaleElement(String),
    #[error("no such element: {0}")]
    NoSuchElement(String),
    #[error("element not interactable: {0}")]
    NotInteractable(String),
    #[error("temporarily unavailable: {0}")]
    Unavailable(String),
    #[error("session lost: {0}")]
    SessionLost(String),
    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("session could not be started: {0}")]
    Startup(String),
}

impl SessionError {
    pub fn classify(&self) -> FailureClass {
        match self {
            Self::Timeout(_)
            | Self::StaleElement(_)
            | Self::NoSuchElement(_)
            | Self::NotInteractable(_)
            | Self::Unavailable(_) => FailureClass::Transient,
            Self::SessionLost(_)
            | Self::Navigation { .. }
            | Self::Protocol(_)
            | Self::Startup(_) => FailureClass::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.classify() == FailureClass::Fatal
    }
}

/// A stateful remote UI: one open document, queried and driven in place.
///
/// Every call may fail with a transient or fatal [`SessionError`]. Implementations
/// are owned by exactly one worker and are never shared.
#[async_trait]
pub trait AutomationSession: Send {
    async fn open(&mut self, url: &str) -> Result<(), SessionError>;

    /// Lightweight recovery: reload the current document.
    async fn refresh(&mut self) -> Result<(), SessionError>;

    async fn ready_state(&mut self) -> Result<ReadyState, SessionError>;

    async fn execute_script(
        &mut self,
        script: &str,
        args: Vec<JsonValue>,
    ) -> Result<JsonValue, SessionError>;

    async fn find_all(&mut self, locator: &Locator) -> Result<Vec<ElementHandle>, SessionError>;

    async fn find_within(
        &mut self,
        scope: &ElementHandle,
        locator: &Locator,
    ) -> Result<Vec<ElementHandle>, SessionError>;

    async fn text(&mut self, element: &ElementHandle) -> Result<String, SessionError>;

    async fn attribute(
        &mut self,
        element: &ElementHandle,
        name: &str,
    ) -> Result<Option<String>, SessionError>;

    async fn is_displayed(&mut self, element: &ElementHandle) -> Result<bool, SessionError>;

    async fn click(&mut self, element: &ElementHandle) -> Result<(), SessionError>;

    /// Polls `condition` until it holds or `timeout` elapses. `Ok(false)` on timeout.
    async fn wait_for_condition(
        &mut self,
        condition: &Condition,
        timeout: Duration,
    ) -> Result<bool, SessionError>;

    async fn quit(&mut self) -> Result<(), SessionError>;
}

/// Builds fresh sessions; used at start-up and for fatal-failure recovery.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn AutomationSession>, SessionError>;
}

/// Evaluates `condition` once against the current document.
pub async fn check_condition(
    session: &mut dyn AutomationSession,
    condition: &Condition,
) -> Result<bool, SessionError> {
    match condition {
        Condition::ReadyStateComplete => Ok(session.ready_state().await? == ReadyState::Complete),
        Condition::Present(locator) => Ok(!session.find_all(locator).await?.is_empty()),
        Condition::Clickable(locator) => {
            for element in session.find_all(locator).await? {
                if session.is_displayed(&element).await? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

pub fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_splits_transient_from_fatal() {
        assert_eq!(SessionError::Timeout("x".into()).classify(), FailureClass::Transient);
        assert_eq!(SessionError::StaleElement("x".into()).classify(), FailureClass::Transient);
        assert!(SessionError::SessionLost("x".into()).is_fatal());
        assert!(SessionError::Navigation {
            url: "u".into(),
            message: "m".into()
        }
        .is_fatal());
    }

    #[test]
    fn locator_helpers_build_css() {
        assert_eq!(Locator::id("consent").as_css(), "#consent");
        assert_eq!(Locator::class("event__match").as_css(), ".event__match");
        let both = Locator::any_of(&[&Locator::class("a"), &Locator::class("b")]);
        assert_eq!(both.as_css(), ".a, .b");
    }

    #[test]
    fn text_is_trimmed_and_collapsed() {
        assert_eq!(text_or_none("  Alpha \n FC ".into()), Some("Alpha FC".into()));
        assert_eq!(text_or_none(" \t ".into()), None);
    }
}
