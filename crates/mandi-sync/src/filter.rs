//! Quality filter: turns normalized candidates into accepted observations.

use std::collections::BTreeSet;

use chrono::{Days, NaiveDate};
use mandi_core::{PriceCandidate, PriceObservation};
use serde::Serialize;
use tracing::info;

/// Target sets and retention window. All names are stored lowercased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterConfig {
    commodities: BTreeSet<String>,
    state: String,
    districts: BTreeSet<String>,
    retention_days: u32,
}

fn fold(value: &str) -> String {
    value.trim().to_lowercase()
}

impl FilterConfig {
    pub fn new<C, D>(commodities: C, state: &str, districts: D, retention_days: u32) -> Self
    where
        C: IntoIterator,
        C::Item: AsRef<str>,
        D: IntoIterator,
        D::Item: AsRef<str>,
    {
        Self {
            commodities: commodities.into_iter().map(|c| fold(c.as_ref())).collect(),
            state: fold(state),
            districts: districts.into_iter().map(|d| fold(d.as_ref())).collect(),
            retention_days,
        }
    }

    pub fn commodities(&self) -> &BTreeSet<String> {
        &self.commodities
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn districts(&self) -> &BTreeSet<String> {
        &self.districts
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    pub fn with_retention_days(mut self, retention_days: u32) -> Self {
        self.retention_days = retention_days;
        self
    }

    fn commodity_matches(&self, commodity: Option<&str>) -> bool {
        commodity.is_some_and(|c| self.commodities.contains(&fold(c)))
    }

    fn region_matches(&self, state: Option<&str>, district: Option<&str>) -> bool {
        state.is_some_and(|s| fold(s) == self.state)
            && district.is_some_and(|d| self.districts.contains(&fold(d)))
    }
}

/// Day-first formats come before ISO so `05/10/2026` is 5 October.
const DATE_FORMATS: [&str; 5] = ["%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%Y-%m-%d", "%Y/%m/%d"];

/// Parse a source arrival date. A trailing time component is ignored.
pub fn parse_arrival_date(raw: &str) -> Option<NaiveDate> {
    let date_part = raw.split_whitespace().next()?;
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(date_part, fmt).ok())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageCount {
    pub stage: &'static str,
    pub kept: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterReport {
    pub input: usize,
    pub stages: Vec<StageCount>,
    pub accepted: usize,
}

impl FilterReport {
    fn record(&mut self, stage: &'static str, before: usize, after: usize) {
        info!(stage, kept = after, dropped = before - after, "quality filter stage");
        self.stages.push(StageCount {
            stage,
            kept: after,
            dropped: before - after,
        });
    }

    pub fn dropped_at(&self, stage: &str) -> Option<usize> {
        self.stages.iter().find(|s| s.stage == stage).map(|s| s.dropped)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterOutcome {
    pub accepted: Vec<PriceObservation>,
    pub report: FilterReport,
}

#[derive(Debug, Clone)]
pub struct QualityFilter {
    config: FilterConfig,
}

impl QualityFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Apply the rules in order and return the survivors newest first.
    ///
    /// `today` anchors the retention window; records dated on or after
    /// `today - retention_days` are kept.
    pub fn apply(&self, candidates: Vec<PriceCandidate>, today: NaiveDate) -> FilterOutcome {
        let mut report = FilterReport {
            input: candidates.len(),
            ..FilterReport::default()
        };

        let before = candidates.len();
        let rows = candidates
            .into_iter()
            .filter(|c| c.modal_price.is_some_and(|p| p > 0.0))
            .collect::<Vec<_>>();
        report.record("modal_price", before, rows.len());

        let before = rows.len();
        let rows = rows
            .into_iter()
            .filter(|c| self.config.commodity_matches(c.commodity.as_deref()))
            .collect::<Vec<_>>();
        report.record("commodity", before, rows.len());

        let before = rows.len();
        let rows = rows
            .into_iter()
            .filter(|c| self.config.region_matches(c.state.as_deref(), c.district.as_deref()))
            .collect::<Vec<_>>();
        report.record("region", before, rows.len());

        let before = rows.len();
        let dated = rows
            .into_iter()
            .filter_map(|c| {
                let date = c.arrival_date.as_deref().and_then(parse_arrival_date)?;
                Some((date, c))
            })
            .collect::<Vec<_>>();
        report.record("arrival_date", before, dated.len());

        let cutoff = today
            .checked_sub_days(Days::new(u64::from(self.config.retention_days)))
            .unwrap_or(NaiveDate::MIN);
        let before = dated.len();
        let mut accepted = dated
            .into_iter()
            .filter(|(date, _)| *date >= cutoff)
            .filter_map(|(date, c)| into_observation(date, c))
            .collect::<Vec<_>>();
        report.record("retention", before, accepted.len());

        accepted.sort_by(|a, b| b.arrival_date.cmp(&a.arrival_date));
        report.accepted = accepted.len();
        FilterOutcome { accepted, report }
    }
}

/// Earlier stages guarantee commodity, state and district are present.
fn into_observation(arrival_date: NaiveDate, c: PriceCandidate) -> Option<PriceObservation> {
    Some(PriceObservation {
        commodity: c.commodity?,
        variety: c.variety,
        state: c.state?,
        district: c.district?,
        market: c.market,
        arrival_date,
        min_price: c.min_price,
        max_price: c.max_price,
        modal_price: c.modal_price,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 18).unwrap()
    }

    fn config() -> FilterConfig {
        FilterConfig::new(["Onion"], "Maharashtra", ["Nashik", "Pune"], 20)
    }

    fn candidate(district: &str, date: &str, modal: Option<f64>) -> PriceCandidate {
        PriceCandidate {
            commodity: Some("Onion".into()),
            variety: Some("Red".into()),
            state: Some("Maharashtra".into()),
            district: Some(district.into()),
            market: Some("Main".into()),
            arrival_date: Some(date.into()),
            min_price: Some(1000.0),
            max_price: Some(2000.0),
            modal_price: modal,
        }
    }

    #[test]
    fn empty_input_is_an_empty_success() {
        let outcome = QualityFilter::new(config()).apply(Vec::new(), today());
        assert!(outcome.accepted.is_empty());
        assert_eq!(outcome.report.input, 0);
        assert_eq!(outcome.report.stages.len(), 5);
    }

    #[test]
    fn absent_and_non_positive_modal_prices_are_rejected() {
        let outcome = QualityFilter::new(config()).apply(
            vec![
                candidate("Nashik", "14/10/2026", None),
                candidate("Nashik", "14/10/2026", Some(0.0)),
                candidate("Nashik", "14/10/2026", Some(-5.0)),
                candidate("Nashik", "14/10/2026", Some(1500.0)),
            ],
            today(),
        );
        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.report.dropped_at("modal_price"), Some(3));
    }

    #[test]
    fn commodity_state_and_district_match_case_insensitively() {
        let mut shouting = candidate("NASHIK", "14/10/2026", Some(1500.0));
        shouting.commodity = Some("ONION".into());
        shouting.state = Some("maharashtra".into());

        let mut tomato = candidate("Nashik", "14/10/2026", Some(900.0));
        tomato.commodity = Some("Tomato".into());

        let mut gujarat = candidate("Nashik", "14/10/2026", Some(900.0));
        gujarat.state = Some("Gujarat".into());

        let satara = candidate("Satara", "14/10/2026", Some(1500.0));

        let outcome =
            QualityFilter::new(config()).apply(vec![shouting, tomato, gujarat, satara], today());
        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.accepted[0].district, "NASHIK");
        assert_eq!(outcome.report.dropped_at("commodity"), Some(1));
        assert_eq!(outcome.report.dropped_at("region"), Some(2));
    }

    #[test]
    fn ambiguous_dates_are_day_first() {
        assert_eq!(
            parse_arrival_date("05/10/2026"),
            NaiveDate::from_ymd_opt(2026, 10, 5)
        );
        assert_eq!(
            parse_arrival_date("05-10-2026 00:00:00"),
            NaiveDate::from_ymd_opt(2026, 10, 5)
        );
        assert_eq!(
            parse_arrival_date("2026-10-05"),
            NaiveDate::from_ymd_opt(2026, 10, 5)
        );
        assert_eq!(parse_arrival_date("31/02/2026"), None);
        assert_eq!(parse_arrival_date("10/13/2026"), None);
        assert_eq!(parse_arrival_date(""), None);
    }

    #[test]
    fn unparseable_and_stale_dates_are_dropped() {
        let outcome = QualityFilter::new(config()).apply(
            vec![
                candidate("Nashik", "31/02/2026", Some(1500.0)),
                candidate("Nashik", "not a date", Some(1500.0)),
                candidate("Nashik", "27/09/2026", Some(1500.0)),
                candidate("Nashik", "28/09/2026", Some(1500.0)),
            ],
            today(),
        );
        assert_eq!(outcome.report.dropped_at("arrival_date"), Some(2));
        assert_eq!(outcome.report.dropped_at("retention"), Some(1));
        assert_eq!(
            outcome.accepted[0].arrival_date,
            NaiveDate::from_ymd_opt(2026, 9, 28).unwrap()
        );
    }

    #[test]
    fn accepted_rows_are_newest_first_and_satisfy_every_rule() {
        let cfg = config();
        let outcome = QualityFilter::new(cfg.clone()).apply(
            vec![
                candidate("Pune", "01/10/2026", Some(1400.0)),
                candidate("Nashik", "15/10/2026", Some(1600.0)),
                candidate("Nashik", "07/10/2026", Some(1500.0)),
                candidate("Satara", "16/10/2026", Some(1500.0)),
            ],
            today(),
        );
        let dates = outcome
            .accepted
            .iter()
            .map(|o| o.arrival_date.format("%d/%m").to_string())
            .collect::<Vec<_>>();
        assert_eq!(dates, vec!["15/10", "07/10", "01/10"]);

        let cutoff = today() - Days::new(u64::from(cfg.retention_days()));
        for o in &outcome.accepted {
            assert!(o.modal_price.unwrap() > 0.0);
            assert!(cfg.commodities().contains(&o.commodity.to_lowercase()));
            assert_eq!(o.state.to_lowercase(), cfg.state());
            assert!(cfg.districts().contains(&o.district.to_lowercase()));
            assert!(o.arrival_date >= cutoff);
        }
        assert!(outcome.accepted.len() <= outcome.report.input);
    }
}
