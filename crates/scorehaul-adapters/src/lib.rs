//! Site-facing layer: the automation session capability, locator profiles, row
//! extraction, listing expansion, pacing and an offline document session.

pub mod document;
pub mod extract;
pub mod locators;
pub mod navigation;
pub mod pacing;
pub mod pager;
pub mod session;

pub use document::{load_fixture_pages, HtmlDocumentFactory, HtmlDocumentSession};
pub use extract::{
    parse_external_id, parse_score_pair, CompetitionRows, ExtractedMatch, Extractor,
    PageExtraction, RowContext,
};
pub use locators::{
    flashscore_locators, locator_provider_for, FlashscoreLocators, LocatorProvider, SiteLocators,
};
pub use navigation::{dismiss_consent, open_ready};
pub use pacing::{DelayRange, RecordingSleeper, Sleeper, TokioSleeper};
pub use pager::{Pager, PagerOutcome, PagerSettings};
pub use session::{
    check_condition, AutomationSession, Condition, ElementHandle, FailureClass, Locator,
    ReadyState, SessionError, SessionFactory,
};

pub const CRATE_NAME: &str = "scorehaul-adapters";

/// Site profiles this build knows how to harvest.
pub fn supported_sites() -> &'static [&'static str] {
    &["flashscore"]
}
