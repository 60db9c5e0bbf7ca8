//! Axum JSON API over the forecast engine and the price store.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use mandi_core::{ForecastHorizonPoint, ForecastOutcome, NotFoundReason, PriceObservation};
use mandi_forecast::{EngineConfig, ForecastEngine, ForecastError, FsModelRegistry};
use mandi_storage::{ModelArtifactStore, PgPriceStore, PriceStore, StoreError};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "mandi-web";

pub const DEFAULT_DATA_LIMIT: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ForecastEngine>,
    pub store: Arc<dyn PriceStore>,
}

impl AppState {
    pub fn new(engine: ForecastEngine, store: Arc<dyn PriceStore>) -> Self {
        Self {
            engine: Arc::new(engine),
            store,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForecastRequest {
    pub region: String,
    #[serde(alias = "crop_name")]
    pub commodity: String,
    #[serde(alias = "variety_name")]
    pub variety: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForecastPointBody {
    pub ds: NaiveDate,
    pub predicted_price: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

impl From<&ForecastHorizonPoint> for ForecastPointBody {
    fn from(point: &ForecastHorizonPoint) -> Self {
        Self {
            ds: point.ds,
            predicted_price: point.predicted_price,
            lower_bound: point.lower_bound,
            upper_bound: point.upper_bound,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ForecastResponse {
    pub forecast: Vec<ForecastPointBody>,
}

#[derive(Debug, Deserialize, Default)]
struct DataQuery {
    limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/forecast", post(forecast_handler))
        .route("/data", get(data_handler))
        .with_state(Arc::new(state))
}

/// Connect to Postgres and open the models directory named by the environment.
pub async fn state_from_env() -> anyhow::Result<AppState> {
    let store_config = mandi_sync::store_config_from_lookup(&|var: &str| std::env::var(var).ok())?;
    let engine_config = EngineConfig::from_env()?;

    let store: Arc<dyn PriceStore> = Arc::new(
        PgPriceStore::connect(&store_config)
            .await
            .context("connecting to price store")?,
    );
    store.ensure_schema().await.context("ensuring price store schema")?;
    let registry = FsModelRegistry::new(ModelArtifactStore::new(&engine_config.models_dir));
    info!(models_dir = %engine_config.models_dir.display(), "models load on demand");
    let engine = ForecastEngine::new(store.clone(), Arc::new(registry), engine_config);
    Ok(AppState::new(engine, store))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = match std::env::var("MANDI_WEB_PORT") {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("MANDI_WEB_PORT={raw:?} is not a port"))?,
        Err(_) => 8000,
    };
    let state = state_from_env().await?;
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "forecast api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler() -> Response {
    Json(serde_json::json!({ "status": "Forecast API is running." })).into_response()
}

async fn forecast_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ForecastRequest>,
) -> Response {
    let outcome = state
        .engine
        .forecast(&request.region, &request.commodity, &request.variety)
        .await;
    match outcome {
        Ok(ForecastOutcome::Ready(forecast)) => Json(ForecastResponse {
            forecast: forecast.points.iter().map(ForecastPointBody::from).collect(),
        })
        .into_response(),
        Ok(ForecastOutcome::NotFound(reason)) => not_found(reason),
        Err(err) => forecast_error(err),
    }
}

async fn data_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DataQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_DATA_LIMIT);
    let timeout = state.engine.config().dependency_timeout;
    match tokio::time::timeout(timeout, state.store.list_recent(limit)).await {
        Ok(Ok(rows)) => Json::<Vec<PriceObservation>>(rows).into_response(),
        Ok(Err(err)) => store_error(err),
        Err(_) => {
            warn!(?timeout, "price store timed out listing observations");
            error_response(StatusCode::SERVICE_UNAVAILABLE, "price store timed out".to_string())
        }
    }
}

fn error_response(status: StatusCode, detail: String) -> Response {
    (status, Json(serde_json::json!({ "detail": detail }))).into_response()
}

fn not_found(reason: NotFoundReason) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({
            "detail": format!("Could not generate forecast: {reason}"),
            "reason": reason,
        })),
    )
        .into_response()
}

fn forecast_error(err: ForecastError) -> Response {
    if err.is_retryable() {
        warn!(error = %err, "forecast dependency unavailable");
        error_response(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
    } else {
        error!(error = %err, "forecast failed");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

fn store_error(err: StoreError) -> Response {
    if err.is_retryable() {
        warn!(error = %err, "price store unavailable");
        error_response(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
    } else {
        error!(error = %err, "price store query failed");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use mandi_core::ModelKey;
    use mandi_forecast::{
        FeatureRow, ForecastModel, InMemoryModelRegistry, ModelError, ModelRegistry, Prediction,
        RegistryError,
    };
    use mandi_storage::{MemoryPriceStore, UpsertCounts};
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    struct Persistence;

    impl ForecastModel for Persistence {
        fn predict(&self, rows: &[FeatureRow]) -> Result<Vec<Prediction>, ModelError> {
            Ok(rows
                .iter()
                .map(|r| Prediction {
                    mean: r.yesterday_price,
                    lower: r.yesterday_price - 0.1,
                    upper: r.yesterday_price + 0.1,
                })
                .collect())
        }
    }

    fn observation(day: u32, modal: f64) -> PriceObservation {
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

    fn state_with(registry: Arc<dyn ModelRegistry>, store: Arc<dyn PriceStore>) -> AppState {
        let engine = ForecastEngine::new(
            store.clone(),
            registry,
            EngineConfig {
                dependency_timeout: Duration::from_millis(200),
                ..EngineConfig::default()
            },
        );
        AppState::new(engine, store)
    }

    async fn seeded_state() -> AppState {
        let store = MemoryPriceStore::new();
        store
            .upsert_batch(&[observation(12, 1600.0), observation(13, 1700.0), observation(14, 1750.0)])
            .await
            .unwrap();
        let registry = InMemoryModelRegistry::new()
            .with_model(ModelKey::new("Nashik", "Onion", "Red"), Arc::new(Persistence));
        state_with(Arc::new(registry), Arc::new(store))
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn index_reports_running() {
        let resp = app(seeded_state().await)
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            body_json(resp).await,
            serde_json::json!({ "status": "Forecast API is running." })
        );
    }

    #[tokio::test]
    async fn forecast_returns_seven_points_and_accepts_legacy_field_names() {
        let resp = app(seeded_state().await)
            .oneshot(post_json(
                "/forecast",
                serde_json::json!({ "region": "Nashik", "crop_name": "Onion", "variety_name": "Red" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        let points = body["forecast"].as_array().unwrap();
        assert_eq!(points.len(), 7);
        assert_eq!(points[0]["ds"], "2026-10-15");
        assert_eq!(points[6]["ds"], "2026-10-21");
        let predicted = points[0]["predicted_price"].as_f64().unwrap();
        assert!((predicted - 1750.0).abs() < 1e-6);
        assert!(points[0]["lower_bound"].as_f64().unwrap() < predicted);
        assert!(points[0]["upper_bound"].as_f64().unwrap() > predicted);
    }

    #[tokio::test]
    async fn unknown_combination_is_a_404_with_reason() {
        let resp = app(seeded_state().await)
            .oneshot(post_json(
                "/forecast",
                serde_json::json!({ "region": "Pune", "commodity": "Onion", "variety": "Red" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["reason"], "unsupported_combination");
    }

    #[tokio::test]
    async fn model_without_observations_is_a_404_no_recent_data() {
        let registry = InMemoryModelRegistry::new()
            .with_model(ModelKey::new("Nashik", "Onion", "Red"), Arc::new(Persistence));
        let state = state_with(Arc::new(registry), Arc::new(MemoryPriceStore::new()));
        let resp = app(state)
            .oneshot(post_json(
                "/forecast",
                serde_json::json!({ "region": "Nashik", "commodity": "Onion", "variety": "Red" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["reason"], "no_recent_data");
    }

    #[tokio::test]
    async fn missing_request_field_is_rejected() {
        let resp = app(seeded_state().await)
            .oneshot(post_json("/forecast", serde_json::json!({ "region": "Nashik" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    struct HangingStore;

    #[async_trait]
    impl PriceStore for HangingStore {
        async fn ensure_schema(&self) -> Result<(), StoreError> {
            Ok(())
        }

        async fn upsert_batch(&self, _: &[PriceObservation]) -> Result<UpsertCounts, StoreError> {
            Ok(UpsertCounts::default())
        }

        async fn find_latest(&self, _: &str, _: &str, _: &str) -> Result<Option<PriceObservation>, StoreError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(None)
        }

        async fn list_recent(&self, _: usize) -> Result<Vec<PriceObservation>, StoreError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn unreachable_store_is_a_503_not_a_404() {
        let registry = InMemoryModelRegistry::new()
            .with_model(ModelKey::new("Nashik", "Onion", "Red"), Arc::new(Persistence));
        let state = state_with(Arc::new(registry), Arc::new(HangingStore));
        let app = app(state);

        let resp = app
            .clone()
            .oneshot(post_json(
                "/forecast",
                serde_json::json!({ "region": "Nashik", "commodity": "Onion", "variety": "Red" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let resp = app
            .oneshot(Request::builder().uri("/data").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    struct CorruptRegistry;

    #[async_trait]
    impl ModelRegistry for CorruptRegistry {
        async fn load(&self, key: &ModelKey) -> Result<Option<Arc<dyn ForecastModel>>, RegistryError> {
            Err(RegistryError::Corrupt {
                key: key.clone(),
                source: ModelError::Artifact("truncated".to_string()),
            })
        }
    }

    #[tokio::test]
    async fn corrupt_artifact_is_a_500() {
        let state = state_with(Arc::new(CorruptRegistry), Arc::new(MemoryPriceStore::new()));
        let resp = app(state)
            .oneshot(post_json(
                "/forecast",
                serde_json::json!({ "region": "Nashik", "commodity": "Onion", "variety": "Red" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_json(resp).await["detail"]
            .as_str()
            .unwrap()
            .contains("truncated"));
    }

    #[tokio::test]
    async fn data_lists_recent_observations_newest_first() {
        let app = app(seeded_state().await);
        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/data?limit=2").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let rows = body_json(resp).await;
        let dates = rows
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["arrival_date"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        assert_eq!(dates, vec!["2026-10-14", "2026-10-13"]);

        let resp = app
            .oneshot(Request::builder().uri("/data").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(resp).await.as_array().unwrap().len(), 3);
    }
}
