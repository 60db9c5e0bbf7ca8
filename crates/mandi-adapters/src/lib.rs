//! Source adapter contracts, the data.gov.in price feed, and record normalization.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mandi_core::ConfigError;
use mandi_storage::{FetchError, HttpFetcher};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

mod normalize;

pub use normalize::{normalize_record, normalize_records};

pub const CRATE_NAME: &str = "mandi-adapters";

/// A semi-structured source record: arbitrary keys, string-typed values.
pub type RawRecord = serde_json::Map<String, JsonValue>;

pub const DATA_GOV_IN_BASE_URL: &str = "https://api.data.gov.in/resource";
pub const DATA_GOV_IN_RESOURCE_ID: &str = "9ef84268-d588-465a-a308-a864a43d0070";
pub const DATA_GOV_IN_FIELDS: &str =
    "commodity,state,district,market,variety,arrival_date,min_price,max_price,modal_price";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            fetched_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{source_id} payload is not a records document: {source}")]
    Payload {
        source_id: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid base url {url}: {reason}")]
    BaseUrl { url: String, reason: String },
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_records(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawRecord>, AdapterError>;
}

/// The `{"records": [...]}` envelope returned by data.gov.in and stored in fixtures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordsPayload {
    #[serde(default)]
    pub records: Vec<RawRecord>,
    #[serde(default)]
    pub total: Option<JsonValue>,
}

pub fn parse_records_payload(
    source_id: &'static str,
    bytes: &[u8],
) -> Result<Vec<RawRecord>, AdapterError> {
    serde_json::from_slice::<RecordsPayload>(bytes)
        .map(|payload| payload.records)
        .map_err(|source| AdapterError::Payload { source_id, source })
}

#[derive(Debug, Clone)]
pub struct DataGovInConfig {
    pub api_key: String,
    pub base_url: String,
    pub resource_id: String,
    pub page_limit: usize,
    pub max_pages: usize,
}

impl DataGovInConfig {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ConfigError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(ConfigError::Missing {
                var: "DATA_GOV_API_KEY",
            });
        }
        Ok(Self {
            api_key,
            base_url: DATA_GOV_IN_BASE_URL.to_string(),
            resource_id: DATA_GOV_IN_RESOURCE_ID.to_string(),
            page_limit: 499,
            max_pages: 1,
        })
    }

    /// Query values are percent-encoded, the api key included.
    pub fn page_url(&self, offset: usize) -> Result<Url, AdapterError> {
        let endpoint = format!("{}/{}", self.base_url.trim_end_matches('/'), self.resource_id);
        let (offset, limit) = (offset.to_string(), self.page_limit.to_string());
        Url::parse_with_params(
            &endpoint,
            [
                ("api-key", self.api_key.as_str()),
                ("format", "json"),
                ("offset", offset.as_str()),
                ("limit", limit.as_str()),
                ("fields", DATA_GOV_IN_FIELDS),
            ],
        )
        .map_err(|err| AdapterError::BaseUrl {
            url: endpoint,
            reason: err.to_string(),
        })
    }
}

/// Daily mandi prices from the data.gov.in open data API.
#[derive(Debug, Clone)]
pub struct DataGovInAdapter {
    config: DataGovInConfig,
}

impl DataGovInAdapter {
    pub fn new(config: DataGovInConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SourceAdapter for DataGovInAdapter {
    fn source_id(&self) -> &'static str {
        "data-gov-in"
    }

    async fn fetch_records(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let page_limit = self.config.page_limit.max(1);
        let mut out = Vec::new();

        for page in 0..self.config.max_pages.max(1) {
            let offset = page * page_limit;
            let url = self.config.page_url(offset)?;
            let response = http
                .fetch_bytes(ctx.run_id, self.source_id(), url.as_str())
                .await?;
            let records = parse_records_payload(self.source_id(), &response.body)?;
            let page_len = records.len();
            debug!(page, offset, records = page_len, "fetched data.gov.in page");
            out.extend(records);
            if page_len < page_limit {
                break;
            }
        }

        info!(run_id = %ctx.run_id, records = out.len(), "fetched records from data.gov.in");
        Ok(out)
    }
}

/// Reads a captured records payload from disk; used for offline runs and tests.
#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    path: PathBuf,
}

impl FixtureAdapter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_records(
        &self,
        _http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| AdapterError::Io {
                path: self.path.clone(),
                source,
            })?;
        let records = parse_records_payload(self.source_id(), &bytes)?;
        info!(run_id = %ctx.run_id, path = %self.path.display(), records = records.len(), "loaded fixture records");
        Ok(records)
    }
}

#[derive(Debug, Clone)]
pub enum SourceSelection {
    DataGovIn(DataGovInConfig),
    Fixture(PathBuf),
}

pub fn adapter_for_source(selection: SourceSelection) -> Box<dyn SourceAdapter> {
    match selection {
        SourceSelection::DataGovIn(config) => Box::new(DataGovInAdapter::new(config)),
        SourceSelection::Fixture(path) => Box::new(FixtureAdapter::new(path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_gov_in_requires_an_api_key() {
        let err = DataGovInConfig::new("  ").unwrap_err();
        assert!(matches!(err, ConfigError::Missing { var: "DATA_GOV_API_KEY" }));
    }

    #[test]
    fn page_url_carries_offset_limit_and_fields() {
        let mut config = DataGovInConfig::new("k3y").unwrap();
        config.page_limit = 100;
        let url = config.page_url(200).unwrap();
        assert!(url.as_str().starts_with(
            "https://api.data.gov.in/resource/9ef84268-d588-465a-a308-a864a43d0070?api-key=k3y"
        ));
        assert!(url.as_str().contains("&offset=200&limit=100&"));
        let fields = url.query_pairs().find(|(k, _)| k == "fields").map(|(_, v)| v.into_owned());
        assert_eq!(fields.as_deref(), Some(DATA_GOV_IN_FIELDS));
    }

    #[test]
    fn api_key_with_query_syntax_is_escaped() {
        let config = DataGovInConfig::new("a&limit=1 b=c").unwrap();
        let url = config.page_url(0).unwrap();
        assert!(!url.as_str().contains("&limit=1 "), "{url}");
        let pairs = url.query_pairs().into_owned().collect::<Vec<_>>();
        assert_eq!(pairs[0], ("api-key".to_string(), "a&limit=1 b=c".to_string()));
        assert_eq!(pairs.iter().filter(|(k, _)| k == "limit").count(), 1);
    }

    #[test]
    fn unusable_base_url_is_an_error() {
        let mut config = DataGovInConfig::new("k3y").unwrap();
        config.base_url = "not a url".to_string();
        let err = config.page_url(0).unwrap_err();
        assert!(matches!(err, AdapterError::BaseUrl { .. }));
        assert!(!err.to_string().contains("k3y"));
    }

    #[test]
    fn payload_without_records_is_empty_not_an_error() {
        let records = parse_records_payload("fixture", br#"{"status":"ok"}"#).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn malformed_payload_is_reported() {
        let err = parse_records_payload("fixture", b"<html>rate limited</html>").unwrap_err();
        assert!(matches!(err, AdapterError::Payload { source_id: "fixture", .. }));
    }

    #[test]
    fn selection_picks_the_adapter() {
        let adapter = adapter_for_source(SourceSelection::Fixture(PathBuf::from("x.json")));
        assert_eq!(adapter.source_id(), "fixture");
    }
}
