//! Seven-day recursive forecast anchored on the latest stored observation.

use std::future::Future;
use std::path::PathBuf;
use std::slice;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use mandi_core::{
    from_log_space, to_log_space, ConfigError, Forecast, ForecastHorizonPoint, ForecastOutcome,
    ModelKey, NotFoundReason, PriceObservation, HORIZON_DAYS,
};
use mandi_storage::{PriceStore, StoreError};
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};

use crate::model::{daily_index, FeatureRow, ForecastModel, ModelError, Prediction};
use crate::registry::{ModelRegistry, RegistryError};

pub const DEFAULT_MODELS_DIR: &str = "./models";
pub const DEFAULT_DEPENDENCY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub models_dir: PathBuf,
    /// Upper bound on each model load and store lookup.
    pub dependency_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from(DEFAULT_MODELS_DIR),
            dependency_timeout: DEFAULT_DEPENDENCY_TIMEOUT,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(dir) = lookup("MANDI_MODELS_DIR").filter(|v| !v.trim().is_empty()) {
            config.models_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup("MANDI_DEPENDENCY_TIMEOUT_SECS").filter(|v| !v.trim().is_empty()) {
            let secs = raw
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or_else(|| ConfigError::Invalid {
                    var: "MANDI_DEPENDENCY_TIMEOUT_SECS",
                    value: raw.clone(),
                    reason: "expected a positive number of seconds".to_string(),
                })?;
            config.dependency_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("{dependency} did not respond within {timeout:?}")]
    Timeout {
        dependency: &'static str,
        timeout: Duration,
    },
    #[error("price store: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("model {key} failed: {source}")]
    Model {
        key: ModelKey,
        #[source]
        source: ModelError,
    },
}

impl ForecastError {
    /// Transient dependency trouble, as opposed to a broken model or artifact.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Store(err) => err.is_retryable(),
            Self::Registry(err) => err.is_retryable(),
            Self::Model { .. } => false,
        }
    }
}

/// Seed features taken from one observation, in log space.
#[derive(Debug, Clone, Copy, PartialEq)]
struct SeedFeatures {
    min_price: f64,
    max_price: f64,
    modal_price: f64,
}

fn usable_price(price: Option<f64>) -> Option<f64> {
    price.filter(|p| p.is_finite() && *p > 0.0)
}

/// Absent min/max fall back to the modal price. Without a usable modal price the
/// observation cannot seed a forecast.
fn seed_features(observation: &PriceObservation) -> Option<SeedFeatures> {
    let modal = usable_price(observation.modal_price)?;
    Some(SeedFeatures {
        min_price: to_log_space(usable_price(observation.min_price).unwrap_or(modal)),
        max_price: to_log_space(usable_price(observation.max_price).unwrap_or(modal)),
        modal_price: to_log_space(modal),
    })
}

/// The `HORIZON_DAYS` calendar days following `anchor`.
pub fn horizon_dates(anchor: NaiveDate) -> Vec<NaiveDate> {
    daily_index(anchor, HORIZON_DAYS)
}

/// The model's own future index must agree with the contiguous daily horizon.
fn future_index(model: &dyn ForecastModel, anchor: NaiveDate) -> Result<Vec<NaiveDate>, ModelError> {
    let expected = horizon_dates(anchor);
    let got = model.generate_future_index(anchor, HORIZON_DAYS);
    if got == expected {
        Ok(got)
    } else {
        Err(ModelError::FutureIndex {
            anchor,
            periods: HORIZON_DAYS,
            got,
        })
    }
}

fn checked_len(expected: usize, actual: usize) -> Result<(), ModelError> {
    if expected == actual {
        Ok(())
    } else {
        Err(ModelError::Shape { expected, actual })
    }
}

fn predict_step(model: &dyn ForecastModel, row: &FeatureRow) -> Result<Prediction, ModelError> {
    let mut out = model.predict(slice::from_ref(row))?;
    checked_len(1, out.len())?;
    let step = out.remove(0);
    if !step.mean.is_finite() {
        return Err(ModelError::NonFinite {
            ds: row.ds,
            field: "mean",
        });
    }
    Ok(step)
}

/// Build the horizon feature table one day at a time. Each day's `yesterday_price` is the
/// previous day's predicted mean; the first day uses the observed modal price.
fn recursive_features(
    model: &dyn ForecastModel,
    seed: SeedFeatures,
    anchor: NaiveDate,
) -> Result<Vec<FeatureRow>, ModelError> {
    let mut rows = Vec::with_capacity(HORIZON_DAYS);
    let mut yesterday = seed.modal_price;
    for ds in future_index(model, anchor)? {
        let row = FeatureRow {
            ds,
            min_price: seed.min_price,
            max_price: seed.max_price,
            yesterday_price: yesterday,
        };
        let step = predict_step(model, &row)?;
        debug!(%ds, yesterday = row.yesterday_price, mean = step.mean, "recursive step");
        yesterday = step.mean;
        rows.push(row);
    }
    Ok(rows)
}

fn horizon_points(
    rows: &[FeatureRow],
    predictions: &[Prediction],
) -> Result<Vec<ForecastHorizonPoint>, ModelError> {
    checked_len(rows.len(), predictions.len())?;
    rows.iter()
        .zip(predictions)
        .map(|(row, prediction)| {
            let point = ForecastHorizonPoint {
                ds: row.ds,
                min_price_log: row.min_price,
                max_price_log: row.max_price,
                yesterday_price_log: row.yesterday_price,
                predicted_price: from_log_space(prediction.mean),
                lower_bound: from_log_space(prediction.lower),
                upper_bound: from_log_space(prediction.upper),
            };
            for (field, value) in [
                ("predicted_price", point.predicted_price),
                ("lower_bound", point.lower_bound),
                ("upper_bound", point.upper_bound),
            ] {
                if !value.is_finite() {
                    return Err(ModelError::NonFinite { ds: row.ds, field });
                }
            }
            Ok(point)
        })
        .collect()
}

pub struct ForecastEngine {
    store: Arc<dyn PriceStore>,
    models: Arc<dyn ModelRegistry>,
    config: EngineConfig,
}

impl ForecastEngine {
    pub fn new(store: Arc<dyn PriceStore>, models: Arc<dyn ModelRegistry>, config: EngineConfig) -> Self {
        Self {
            store,
            models,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn PriceStore> {
        &self.store
    }

    async fn bounded<T, E>(
        &self,
        dependency: &'static str,
        work: impl Future<Output = Result<T, E>>,
    ) -> Result<T, ForecastError>
    where
        ForecastError: From<E>,
    {
        let timeout = self.config.dependency_timeout;
        match tokio::time::timeout(timeout, work).await {
            Ok(result) => result.map_err(ForecastError::from),
            Err(_) => Err(ForecastError::Timeout {
                dependency,
                timeout,
            }),
        }
    }

    /// Forecast the next [`HORIZON_DAYS`] days for a (region, commodity, variety).
    ///
    /// The horizon starts the day after the latest stored observation, however old it is.
    pub async fn forecast(
        &self,
        region: &str,
        commodity: &str,
        variety: &str,
    ) -> Result<ForecastOutcome, ForecastError> {
        let key = ModelKey::new(region, commodity, variety);
        let span = info_span!("forecast", model_key = %key);
        self.forecast_inner(key, region, commodity, variety)
            .instrument(span)
            .await
    }

    async fn forecast_inner(
        &self,
        key: ModelKey,
        region: &str,
        commodity: &str,
        variety: &str,
    ) -> Result<ForecastOutcome, ForecastError> {
        let Some(model) = self.bounded("model registry", self.models.load(&key)).await? else {
            info!(reason = %NotFoundReason::UnsupportedCombination, "no forecast");
            return Ok(ForecastOutcome::NotFound(NotFoundReason::UnsupportedCombination));
        };

        let latest = self
            .bounded(
                "price store",
                self.store.find_latest(commodity, variety, region),
            )
            .await?;
        let Some((observation, seed)) =
            latest.and_then(|obs| seed_features(&obs).map(|seed| (obs, seed)))
        else {
            info!(reason = %NotFoundReason::NoRecentData, "no forecast");
            return Ok(ForecastOutcome::NotFound(NotFoundReason::NoRecentData));
        };

        let anchor = observation.arrival_date;
        let model_failure = |source| ForecastError::Model {
            key: key.clone(),
            source,
        };
        let rows = recursive_features(model.as_ref(), seed, anchor).map_err(model_failure)?;
        let predictions = model.predict(&rows).map_err(model_failure)?;
        let points = horizon_points(&rows, &predictions).map_err(model_failure)?;

        info!(%anchor, points = points.len(), "forecast ready");
        Ok(ForecastOutcome::Ready(Forecast {
            model_key: key,
            anchor_date: anchor,
            points,
        }))
    }
}
