//! Core domain model for mandi price ingestion and forecasting.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "mandi-core";

/// Number of daily steps produced by one forecast call.
pub const HORIZON_DAYS: usize = 7;

/// Separator placed between the parts of a [`ModelKey`].
pub const MODEL_KEY_SEPARATOR: char = '_';

/// Normalizer output: one candidate per raw source record, nothing validated yet.
///
/// Absent or unparseable values are `None`. Prices that failed numeric coercion are
/// `None`, never zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceCandidate {
    pub commodity: Option<String>,
    pub variety: Option<String>,
    pub state: Option<String>,
    pub district: Option<String>,
    pub market: Option<String>,
    pub arrival_date: Option<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub modal_price: Option<f64>,
}

/// One accepted market-day price record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub commodity: String,
    pub variety: Option<String>,
    pub state: String,
    pub district: String,
    pub market: Option<String>,
    pub arrival_date: NaiveDate,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub modal_price: Option<f64>,
}

impl PriceObservation {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            commodity: fold_key_text(&self.commodity),
            variety: fold_key_text(self.variety.as_deref().unwrap_or_default()),
            state: fold_key_text(&self.state),
            district: fold_key_text(&self.district),
            market: fold_key_text(self.market.as_deref().unwrap_or_default()),
            arrival_date: self.arrival_date,
        }
    }

    /// True when the non-key fields differ from `other`.
    pub fn prices_differ(&self, other: &PriceObservation) -> bool {
        self.min_price != other.min_price
            || self.max_price != other.max_price
            || self.modal_price != other.modal_price
    }
}

/// Trimmed, lowercased form of a natural-key text field.
pub fn fold_key_text(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Upsert identity of a [`PriceObservation`].
///
/// Text fields are folded with [`fold_key_text`], so `ONION`/`NASHIK` and `Onion`/`Nashik`
/// name the same market-day. Absent `variety` / `market` are the empty string so that two
/// absent values compare equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    pub commodity: String,
    pub variety: String,
    pub state: String,
    pub district: String,
    pub market: String,
    pub arrival_date: NaiveDate,
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}@{}",
            self.commodity, self.variety, self.state, self.district, self.market, self.arrival_date
        )
    }
}

/// Deterministic lookup key of a forecast model artifact.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModelKey(String);

impl ModelKey {
    pub fn new(region: &str, commodity: &str, variety: &str) -> Self {
        let key = [region, commodity, variety]
            .iter()
            .map(|part| normalize_key_part(part))
            .collect::<Vec<_>>()
            .join(&MODEL_KEY_SEPARATOR.to_string());
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn normalize_key_part(input: &str) -> String {
    input
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

/// `log(1 + x)`, the space every price lives in inside the engine.
pub fn to_log_space(price: f64) -> f64 {
    price.ln_1p()
}

/// `exp(y) - 1`, inverse of [`to_log_space`].
pub fn from_log_space(value: f64) -> f64 {
    value.exp_m1()
}

/// One step of a forecast horizon.
///
/// `min_price_log`, `max_price_log` and `yesterday_price_log` are the log-space features the
/// model saw; `predicted_price`, `lower_bound` and `upper_bound` are back in currency units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastHorizonPoint {
    pub ds: NaiveDate,
    pub min_price_log: f64,
    pub max_price_log: f64,
    pub yesterday_price_log: f64,
    pub predicted_price: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub model_key: ModelKey,
    /// Date of the stored observation the horizon is anchored to.
    pub anchor_date: NaiveDate,
    pub points: Vec<ForecastHorizonPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotFoundReason {
    UnsupportedCombination,
    NoRecentData,
}

impl fmt::Display for NotFoundReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedCombination => f.write_str("unsupported combination"),
            Self::NoRecentData => f.write_str("no recent data"),
        }
    }
}

/// Result of a forecast request. Absence of a model or of data is a value, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum ForecastOutcome {
    Ready(Forecast),
    NotFound(NotFoundReason),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required setting {var} is not set")]
    Missing { var: &'static str },
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}
