use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use scorehaul_adapters::{
    AutomationSession, Extractor, FlashscoreLocators, HtmlDocumentFactory, LocatorProvider,
    SessionFactory,
};
use scorehaul_core::{HarvestTarget, Tally};

fn fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/demo-league")
}

fn target() -> HarvestTarget {
    HarvestTarget::new(
        "demo-league",
        "https://fixtures.scorehaul.test/football/demo-league/",
    )
}

#[test]
fn demo_league_fixture_pages_are_indexed() {
    let factory = HtmlDocumentFactory::from_fixture_dir(fixture_dir()).expect("fixture index");
    assert_eq!(factory.page_count(), 3);
}

#[tokio::test]
async fn demo_league_results_page_extracts_both_rows() {
    let profile = FlashscoreLocators::new();
    let factory = HtmlDocumentFactory::from_fixture_dir(fixture_dir()).expect("fixture index");
    let mut session = factory.create().await.expect("session");
    let day = NaiveDate::from_ymd_opt(2024, 8, 1).expect("date");

    session
        .open(&profile.results_url(&target(), day))
        .await
        .expect("fixture page for the day");
    let page = Extractor::new(profile.locators())
        .extract_page(session.as_mut(), "demo-league", day)
        .await
        .expect("extraction");

    assert_eq!(page.rows_seen, 2);
    assert_eq!(page.rows_dropped, 0);
    assert_eq!(page.records.len(), 2);
    // Only the unplayed fixture's score is missing.
    assert_eq!(page.fields_gapped, 1);

    let played = &page.records[0];
    assert_eq!(played.home_team.as_deref(), Some("Northbridge FC"));
    assert_eq!(played.away_team.as_deref(), Some("Riverside Athletic"));
    assert_eq!(played.score, Some(Tally::new(2, 1)));
    assert_eq!(played.statistics.len(), 2);

    let pending = &page.records[1];
    assert_eq!(pending.score, None);
    assert_eq!(pending.competition_name.as_deref(), Some("Demo League"));

    session.quit().await.expect("quit");
}
