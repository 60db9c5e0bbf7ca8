use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use mandi_core::{ForecastOutcome, NotFoundReason, PriceObservation, HORIZON_DAYS};
use mandi_forecast::{EngineConfig, ForecastEngine, FsModelRegistry};
use mandi_storage::{MemoryPriceStore, ModelArtifactStore, PriceStore};

fn models_dir() -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/models")
}

fn lasalgaon(day: u32, modal: f64) -> PriceObservation {
    PriceObservation {
        commodity: "Onion".into(),
        variety: Some("Red".into()),
        state: "Maharashtra".into(),
        district: "Nashik".into(),
        market: Some("Lasalgaon".into()),
        arrival_date: NaiveDate::from_ymd_opt(2026, 10, day).unwrap(),
        min_price: Some(1100.0),
        max_price: Some(2011.0),
        modal_price: Some(modal),
    }
}

async fn engine() -> ForecastEngine {
    let store = MemoryPriceStore::new();
    store
        .upsert_batch(&[lasalgaon(13, 1700.0), lasalgaon(14, 1750.0)])
        .await
        .unwrap();
    ForecastEngine::new(
        Arc::new(store),
        Arc::new(FsModelRegistry::new(ModelArtifactStore::new(models_dir()))),
        EngineConfig::default(),
    )
}

#[tokio::test]
async fn fixture_model_produces_a_plausible_week() {
    let outcome = engine().await.forecast("Nashik", "Onion", "Red").await.unwrap();
    let forecast = match outcome {
        ForecastOutcome::Ready(forecast) => forecast,
        other => panic!("expected a forecast, got {other:?}"),
    };

    assert_eq!(forecast.model_key.as_str(), "nashik_onion_red");
    assert_eq!(forecast.anchor_date, NaiveDate::from_ymd_opt(2026, 10, 14).unwrap());
    assert_eq!(forecast.points.len(), HORIZON_DAYS);
    assert_eq!(
        forecast.points.last().unwrap().ds,
        NaiveDate::from_ymd_opt(2026, 10, 21).unwrap()
    );
    for point in &forecast.points {
        assert!(point.predicted_price > 500.0 && point.predicted_price < 5000.0);
        assert!(point.lower_bound < point.predicted_price);
        assert!(point.predicted_price < point.upper_bound);
    }
}

#[tokio::test]
async fn combination_without_an_artifact_is_unsupported() {
    let outcome = engine().await.forecast("Pune", "Onion", "Other").await.unwrap();
    assert_eq!(
        outcome,
        ForecastOutcome::NotFound(NotFoundReason::UnsupportedCombination)
    );
}
