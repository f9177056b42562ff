//! Per-site locator profiles. The harvesting core only sees [`LocatorProvider`].

use chrono::NaiveDate;
use scorehaul_core::HarvestTarget;

use crate::session::Locator;

/// Every selector the harvester needs from one site's markup.
#[derive(Debug, Clone)]
pub struct SiteLocators {
    pub consent_button: Option<Locator>,
    pub results_container: Locator,
    pub load_more: Locator,
    pub competition_header: Locator,
    pub match_row: Locator,
    /// Attribute on a match row holding the external id, e.g. `g_1_AbCdEf12`.
    pub row_id_attribute: String,
    pub row_time: Locator,
    pub home_team: Locator,
    pub away_team: Locator,
    pub home_score: Locator,
    pub away_score: Locator,
    pub combined_score: Option<Locator>,
    pub possession_value: Locator,
    pub card: Locator,
    pub card_home_class: String,
    pub card_away_class: String,
    pub corner: Locator,
    pub corner_home_class: String,
    pub corner_away_class: String,
    pub stat_row: Locator,
    pub stat_label: Locator,
    pub stat_value: Locator,
    /// Present once a match detail page has rendered.
    pub detail_ready: Option<Locator>,
}

pub trait LocatorProvider: Send + Sync {
    fn site_id(&self) -> &'static str;
    fn results_url(&self, target: &HarvestTarget, date: NaiveDate) -> String;
    fn match_detail_url(&self, external_id: &str) -> Option<String>;
    fn locators(&self) -> &SiteLocators;
}

#[derive(Debug, Clone)]
pub struct FlashscoreLocators {
    base_url: String,
    locators: SiteLocators,
}

impl FlashscoreLocators {
    pub fn new() -> Self {
        Self::with_base_url("https://www.flashscore.com")
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            locators: SiteLocators {
                consent_button: Some(Locator::id("onetrust-accept-btn-handler")),
                results_container: Locator::css(".sportName.soccer"),
                load_more: Locator::class("event__more"),
                competition_header: Locator::class("event__title--name"),
                match_row: Locator::class("event__match"),
                row_id_attribute: "id".to_string(),
                row_time: Locator::class("event__time"),
                home_team: Locator::class("event__participant--home"),
                away_team: Locator::class("event__participant--away"),
                home_score: Locator::class("event__score--home"),
                away_score: Locator::class("event__score--away"),
                combined_score: Some(Locator::class("detailScore__wrapper")),
                possession_value: Locator::class("event__possession"),
                card: Locator::class("event__card"),
                card_home_class: "event__card--home".to_string(),
                card_away_class: "event__card--away".to_string(),
                corner: Locator::class("event__corner"),
                corner_home_class: "event__corner--home".to_string(),
                corner_away_class: "event__corner--away".to_string(),
                stat_row: Locator::class("stat__row"),
                stat_label: Locator::class("stat__categoryName"),
                stat_value: Locator::class("stat__value"),
                detail_ready: Some(Locator::class("duelParticipant")),
            },
        }
    }
}

impl Default for FlashscoreLocators {
    fn default() -> Self {
        Self::new()
    }
}

impl LocatorProvider for FlashscoreLocators {
    fn site_id(&self) -> &'static str {
        "flashscore"
    }

    fn results_url(&self, target: &HarvestTarget, date: NaiveDate) -> String {
        format!(
            "{}/results/?d={}",
            target.competition_url.trim_end_matches('/'),
            date.format("%Y%m%d")
        )
    }

    fn match_detail_url(&self, external_id: &str) -> Option<String> {
        Some(format!(
            "{}/match/{}/#/match-summary/match-statistics",
            self.base_url, external_id
        ))
    }

    fn locators(&self) -> &SiteLocators {
        &self.locators
    }
}

pub fn flashscore_locators() -> impl LocatorProvider {
    FlashscoreLocators::new()
}

pub fn locator_provider_for(site_id: &str) -> Option<Box<dyn LocatorProvider>> {
    match site_id {
        "flashscore" => Some(Box::new(FlashscoreLocators::new())),
        _ => None,
    }
}
