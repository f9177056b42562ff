//! Match-row extraction with per-field fault isolation.
//!
//! Each field is read on its own. A transient failure leaves that field absent and
//! counts a gap; a fatal failure aborts the row and reaches the retry layer.

use chrono::NaiveDate;
use scorehaul_core::{MatchRecord, SidePair, StatisticTable, Tally};
use tracing::{debug, trace};

use crate::locators::SiteLocators;
use crate::session::{
    text_or_none, AutomationSession, ElementHandle, FailureClass, Locator, SessionError,
};

/// Rows found under one competition heading on a results page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompetitionRows {
    pub competition_name: Option<String>,
    pub rows: Vec<ElementHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedMatch {
    pub record: MatchRecord,
    pub gaps: u32,
}

/// Everything pulled from one results page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageExtraction {
    pub records: Vec<MatchRecord>,
    pub rows_seen: usize,
    pub rows_dropped: usize,
    pub fields_gapped: u32,
}

/// Per-row facts the page knows but the row does not.
#[derive(Debug, Clone, Copy)]
pub struct RowContext<'a> {
    pub competition_id: &'a str,
    pub competition_name: Option<&'a str>,
    pub harvest_date: NaiveDate,
}

#[derive(Debug, Default)]
struct GapLedger {
    count: u32,
}

impl GapLedger {
    /// Missing and failed reads both count.
    fn required<T>(
        &mut self,
        field: &'static str,
        read: Result<Option<T>, SessionError>,
    ) -> Result<Option<T>, SessionError> {
        match read {
            Ok(Some(value)) => Ok(Some(value)),
            Ok(None) => {
                trace!(field, "field missing");
                self.count += 1;
                Ok(None)
            }
            Err(err) => self.absorb(field, err).map(|()| None),
        }
    }

    /// Only failed reads count; absence is normal for these fields.
    fn optional<T>(
        &mut self,
        field: &'static str,
        read: Result<Option<T>, SessionError>,
    ) -> Result<Option<T>, SessionError> {
        match read {
            Ok(value) => Ok(value),
            Err(err) => self.absorb(field, err).map(|()| None),
        }
    }

    fn absorb(&mut self, field: &'static str, err: SessionError) -> Result<(), SessionError> {
        if err.classify() == FailureClass::Fatal {
            return Err(err);
        }
        debug!(field, error = %err, "field extraction failed");
        self.count += 1;
        Ok(())
    }
}

pub struct Extractor<'a> {
    locators: &'a SiteLocators,
}

impl<'a> Extractor<'a> {
    pub fn new(locators: &'a SiteLocators) -> Self {
        Self { locators }
    }

    /// Groups match rows under the competition heading that precedes them in
    /// document order. Rows before any heading form an unnamed group.
    pub async fn extract_competition_rows(
        &self,
        session: &mut dyn AutomationSession,
    ) -> Result<Vec<CompetitionRows>, SessionError> {
        let l = self.locators;
        let headers = session.find_all(&l.competition_header).await?;
        let nodes = session
            .find_all(&Locator::any_of(&[&l.competition_header, &l.match_row]))
            .await?;

        let mut groups: Vec<CompetitionRows> = Vec::new();
        for node in nodes {
            if headers.contains(&node) {
                let name = match session.text(&node).await {
                    Ok(text) => text_or_none(text),
                    Err(err) if !err.is_fatal() => {
                        debug!(error = %err, "competition heading unreadable");
                        None
                    }
                    Err(err) => return Err(err),
                };
                groups.push(CompetitionRows {
                    competition_name: name,
                    rows: Vec::new(),
                });
            } else {
                match groups.last_mut() {
                    Some(group) => group.rows.push(node),
                    None => groups.push(CompetitionRows {
                        competition_name: None,
                        rows: vec![node],
                    }),
                }
            }
        }
        groups.retain(|g| !g.rows.is_empty());
        Ok(groups)
    }

    /// Extracts every row on the current results page.
    pub async fn extract_page(
        &self,
        session: &mut dyn AutomationSession,
        competition_id: &str,
        harvest_date: NaiveDate,
    ) -> Result<PageExtraction, SessionError> {
        let mut page = PageExtraction::default();
        for group in self.extract_competition_rows(session).await? {
            let ctx = RowContext {
                competition_id,
                competition_name: group.competition_name.as_deref(),
                harvest_date,
            };
            for row in &group.rows {
                page.rows_seen += 1;
                match self.extract_match(session, row, ctx).await? {
                    Some(extracted) => {
                        page.fields_gapped += extracted.gaps;
                        page.records.push(extracted.record);
                    }
                    None => page.rows_dropped += 1,
                }
            }
        }
        Ok(page)
    }

    /// Builds one record from a row. `Ok(None)` when the row has neither an id nor a team.
    pub async fn extract_match(
        &self,
        session: &mut dyn AutomationSession,
        row: &ElementHandle,
        ctx: RowContext<'_>,
    ) -> Result<Option<ExtractedMatch>, SessionError> {
        let l = self.locators;
        let mut gaps = GapLedger::default();

        let external_id = gaps.required("external_id", self.read_external_id(session, row).await)?;
        let date_text = gaps.required("date", read_text(session, row, &l.row_time).await)?;
        let home_team = gaps.required("home_team", read_text(session, row, &l.home_team).await)?;
        let away_team = gaps.required("away_team", read_text(session, row, &l.away_team).await)?;
        let score = gaps.required("score", self.read_score(session, row).await)?;
        let possession = gaps.optional("possession", self.read_possession(session, row).await)?;
        let cards = gaps.optional(
            "cards",
            read_tally(session, row, &l.card, &l.card_home_class, &l.card_away_class).await,
        )?;
        let corners = gaps.optional(
            "corners",
            read_tally(
                session,
                row,
                &l.corner,
                &l.corner_home_class,
                &l.corner_away_class,
            )
            .await,
        )?;
        let statistics = self.read_statistics(session, Some(row), &mut gaps).await?;

        let mut record = MatchRecord::new(ctx.competition_id, ctx.harvest_date);
        record.external_id = external_id;
        record.competition_name = ctx.competition_name.map(str::to_string);
        record.date_text = date_text;
        record.home_team = home_team;
        record.away_team = away_team;
        record.score = score;
        record.possession = possession;
        record.cards = cards;
        record.corners = corners;
        record.statistics = statistics;

        if !record.has_identity() {
            debug!(row = row.as_str(), "dropping row without id or teams");
            return Ok(None);
        }
        Ok(Some(ExtractedMatch {
            record,
            gaps: gaps.count,
        }))
    }

    /// Reads the statistic rows on the current match detail page.
    /// Returns the table and the number of rows that could not be read.
    pub async fn extract_detail_statistics(
        &self,
        session: &mut dyn AutomationSession,
    ) -> Result<(StatisticTable, u32), SessionError> {
        let mut gaps = GapLedger::default();
        let table = self.read_statistics(session, None, &mut gaps).await?;
        Ok((table, gaps.count))
    }

    async fn read_external_id(
        &self,
        session: &mut dyn AutomationSession,
        row: &ElementHandle,
    ) -> Result<Option<String>, SessionError> {
        let raw = session
            .attribute(row, &self.locators.row_id_attribute)
            .await?;
        Ok(raw.as_deref().and_then(parse_external_id))
    }

    async fn read_score(
        &self,
        session: &mut dyn AutomationSession,
        row: &ElementHandle,
    ) -> Result<Option<Tally>, SessionError> {
        let l = self.locators;
        let home = read_text(session, row, &l.home_score).await?;
        let away = read_text(session, row, &l.away_score).await?;
        if let (Some(home), Some(away)) = (home.as_deref(), away.as_deref()) {
            if let (Ok(home), Ok(away)) = (home.parse::<u32>(), away.parse::<u32>()) {
                return Ok(Some(Tally::new(home, away)));
            }
        }
        if let Some(combined) = &l.combined_score {
            if let Some(text) = read_text(session, row, combined).await? {
                return Ok(parse_score_pair(&text));
            }
        }
        Ok(None)
    }

    async fn read_possession(
        &self,
        session: &mut dyn AutomationSession,
        row: &ElementHandle,
    ) -> Result<Option<SidePair<String>>, SessionError> {
        let values = session
            .find_within(row, &self.locators.possession_value)
            .await?;
        let mut texts = Vec::with_capacity(2);
        for value in values.iter().take(2) {
            texts.push(text_or_none(session.text(value).await?));
        }
        let mut texts = texts.into_iter();
        let pair = SidePair::new(texts.next().flatten(), texts.next().flatten());
        Ok(if pair.is_empty() { None } else { Some(pair) })
    }

    async fn read_statistics(
        &self,
        session: &mut dyn AutomationSession,
        scope: Option<&ElementHandle>,
        gaps: &mut GapLedger,
    ) -> Result<StatisticTable, SessionError> {
        let l = self.locators;
        let mut table = StatisticTable::default();
        let rows = match scope {
            Some(scope) => session.find_within(scope, &l.stat_row).await,
            None => session.find_all(&l.stat_row).await,
        };
        let Some(rows) = gaps.optional("statistics", rows.map(Some))? else {
            return Ok(table);
        };

        for row in rows {
            match self.read_stat_row(session, &row).await {
                Ok(Some((label, values))) => table.insert(label, values),
                Ok(None) => gaps.count += 1,
                Err(err) => gaps.absorb("statistic", err)?,
            }
        }
        Ok(table)
    }

    async fn read_stat_row(
        &self,
        session: &mut dyn AutomationSession,
        row: &ElementHandle,
    ) -> Result<Option<(String, SidePair<String>)>, SessionError> {
        let l = self.locators;
        let Some(label) = read_text(session, row, &l.stat_label).await? else {
            return Ok(None);
        };
        let values = session.find_within(row, &l.stat_value).await?;
        let mut texts = Vec::with_capacity(2);
        for value in values.iter().take(2) {
            texts.push(text_or_none(session.text(value).await?));
        }
        let mut texts = texts.into_iter();
        Ok(Some((
            label,
            SidePair::new(texts.next().flatten(), texts.next().flatten()),
        )))
    }
}

async fn read_text(
    session: &mut dyn AutomationSession,
    scope: &ElementHandle,
    locator: &Locator,
) -> Result<Option<String>, SessionError> {
    let found = session.find_within(scope, locator).await?;
    match found.first() {
        Some(element) => Ok(text_or_none(session.text(element).await?)),
        None => Ok(None),
    }
}

async fn read_tally(
    session: &mut dyn AutomationSession,
    row: &ElementHandle,
    locator: &Locator,
    home_class: &str,
    away_class: &str,
) -> Result<Option<Tally>, SessionError> {
    let markers = session.find_within(row, locator).await?;
    if markers.is_empty() {
        return Ok(None);
    }
    let mut tally = Tally::new(0, 0);
    for marker in &markers {
        let classes = session.attribute(marker, "class").await?.unwrap_or_default();
        let mut tokens = classes.split_whitespace();
        if tokens.clone().any(|c| c == home_class) {
            tally.home += 1;
        } else if tokens.any(|c| c == away_class) {
            tally.away += 1;
        }
    }
    Ok(Some(tally))
}

/// `g_1_AbCd1234` -> `AbCd1234`: the last `_`-separated segment.
pub fn parse_external_id(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let id = raw.rsplit('_').next().unwrap_or(raw).trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// Parses combined score text such as `2 - 1` or `3:0`.
pub fn parse_score_pair(text: &str) -> Option<Tally> {
    let (home, away) = text.split_once(['-', ':'])?;
    let home = home.trim().parse().ok()?;
    let away = away.trim().parse().ok()?;
    Some(Tally::new(home, away))
}
