//! Recursive multi-step price forecasting over stored mandi observations.
//!
//! A [`ForecastEngine`] looks up the model for a (region, commodity, variety), anchors on the
//! most recent stored observation and walks the horizon one day at a time, feeding each
//! predicted mean back in as the next day's `yesterday_price`.

mod engine;
mod model;
mod registry;

pub use engine::{
    horizon_dates, EngineConfig, ForecastEngine, ForecastError, DEFAULT_DEPENDENCY_TIMEOUT,
    DEFAULT_MODELS_DIR,
};
pub use model::{
    daily_index, FeatureRow, ForecastModel, LinearArtifact, ModelError, Prediction,
    LINEAR_ARTIFACT_FORMAT,
};
pub use registry::{FsModelRegistry, InMemoryModelRegistry, ModelRegistry, RegistryError};

pub const CRATE_NAME: &str = "mandi-forecast";
