//! Model contract and the linear artifact format loaded from disk.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One row of model input. Every price is in log space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub ds: NaiveDate,
    pub min_price: f64,
    pub max_price: f64,
    pub yesterday_price: f64,
}

/// Model output for one row, in log space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub mean: f64,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model returned {actual} predictions for {expected} rows")]
    Shape { expected: usize, actual: usize },
    #[error("model produced a non-finite {field} for {ds}")]
    NonFinite { ds: NaiveDate, field: &'static str },
    #[error("model future index {got:?} is not the {periods} days after {anchor}")]
    FutureIndex {
        anchor: NaiveDate,
        periods: usize,
        got: Vec<NaiveDate>,
    },
    #[error("invalid model artifact: {0}")]
    Artifact(String),
}

/// `periods` consecutive calendar days starting the day after `anchor`.
pub fn daily_index(anchor: NaiveDate, periods: usize) -> Vec<NaiveDate> {
    std::iter::successors(anchor.succ_opt(), |day| day.succ_opt())
        .take(periods)
        .collect()
}

/// A trained regressor over [`FeatureRow`]s.
///
/// Implementations must return exactly one prediction per input row, in input order.
pub trait ForecastModel: Send + Sync {
    fn predict(&self, rows: &[FeatureRow]) -> Result<Vec<Prediction>, ModelError>;

    /// Dates the model will be asked about after `anchor`. Daily models keep the default.
    fn generate_future_index(&self, anchor: NaiveDate, periods: usize) -> Vec<NaiveDate> {
        daily_index(anchor, periods)
    }
}

pub const LINEAR_ARTIFACT_FORMAT: u32 = 1;

fn default_interval_z() -> f64 {
    1.2816
}

fn default_format() -> u32 {
    LINEAR_ARTIFACT_FORMAT
}

/// Linear model with an optional day-of-week effect and a symmetric interval.
///
/// `mean = intercept + min_coef·min + max_coef·max + yesterday_coef·yesterday + weekday[ds]`
/// and the interval is `mean ± interval_z·residual_sigma`, all in log space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearArtifact {
    #[serde(default = "default_format")]
    pub format: u32,
    pub intercept: f64,
    pub min_price_coef: f64,
    pub max_price_coef: f64,
    pub yesterday_price_coef: f64,
    /// Additive effects indexed Monday = 0.
    #[serde(default)]
    pub weekday_effects: Option<[f64; 7]>,
    pub residual_sigma: f64,
    #[serde(default = "default_interval_z")]
    pub interval_z: f64,
}

impl LinearArtifact {
    pub fn from_json(bytes: &[u8]) -> Result<Self, ModelError> {
        let artifact: Self =
            serde_json::from_slice(bytes).map_err(|err| ModelError::Artifact(err.to_string()))?;
        artifact.validate()?;
        Ok(artifact)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.format != LINEAR_ARTIFACT_FORMAT {
            return Err(ModelError::Artifact(format!(
                "unsupported format {}",
                self.format
            )));
        }
        let mut values = vec![
            self.intercept,
            self.min_price_coef,
            self.max_price_coef,
            self.yesterday_price_coef,
            self.residual_sigma,
            self.interval_z,
        ];
        values.extend(self.weekday_effects.iter().flatten());
        if values.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::Artifact("non-finite parameter".to_string()));
        }
        if self.residual_sigma < 0.0 || self.interval_z < 0.0 {
            return Err(ModelError::Artifact(
                "residual_sigma and interval_z must be non-negative".to_string(),
            ));
        }
        Ok(())
    }

    fn weekday_effect(&self, ds: NaiveDate) -> f64 {
        self.weekday_effects
            .map(|effects| effects[ds.weekday().num_days_from_monday() as usize])
            .unwrap_or(0.0)
    }
}

impl ForecastModel for LinearArtifact {
    fn predict(&self, rows: &[FeatureRow]) -> Result<Vec<Prediction>, ModelError> {
        let half_width = self.interval_z * self.residual_sigma;
        Ok(rows
            .iter()
            .map(|row| {
                let mean = self.intercept
                    + self.min_price_coef * row.min_price
                    + self.max_price_coef * row.max_price
                    + self.yesterday_price_coef * row.yesterday_price
                    + self.weekday_effect(row.ds);
                Prediction {
                    mean,
                    lower: mean - half_width,
                    upper: mean + half_width,
                }
            })
            .collect())
    }
}
