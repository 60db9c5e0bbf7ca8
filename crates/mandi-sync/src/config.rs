//! Ingestion configuration from the environment and the targets file.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use mandi_adapters::{DataGovInConfig, SourceSelection};
use mandi_core::ConfigError;
use mandi_storage::PgStoreConfig;
use serde::Deserialize;

use crate::filter::FilterConfig;

pub const DEFAULT_RETENTION_DAYS: u32 = 20;
pub const DEFAULT_TARGETS_FILE: &str = "./targets.yaml";
pub const DEFAULT_FIXTURE_PATH: &str = "./fixtures/data-gov-in/sample.json";
pub const DEFAULT_DEPENDENCY_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_DISTRICTS: [&str; 25] = [
    "Ahmednagar",
    "Akola",
    "Amarawati",
    "Beed",
    "Buldhana",
    "Chandrapur",
    "Chattrapati Sambhajinagar",
    "Dharashiv(Usmanabad)",
    "Dhule",
    "Jalana",
    "Jalgaon",
    "Kolhapur",
    "Latur",
    "Mumbai",
    "Nagpur",
    "Nandurbar",
    "Nashik",
    "Pune",
    "Raigad",
    "Ratnagiri",
    "Sangli",
    "Satara",
    "Sholapur",
    "Thane",
    "Wardha",
];

#[derive(Debug, Clone, Deserialize)]
pub struct TargetsFile {
    pub commodities: Vec<String>,
    pub state: String,
    pub districts: Vec<String>,
    #[serde(default)]
    pub retention_days: Option<u32>,
}

impl Default for TargetsFile {
    fn default() -> Self {
        Self {
            commodities: vec!["Onion".to_string()],
            state: "Maharashtra".to_string(),
            districts: DEFAULT_DISTRICTS.iter().map(ToString::to_string).collect(),
            retention_days: None,
        }
    }
}

impl TargetsFile {
    /// Load `path`, or the built-in Maharashtra onion targets when it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(ConfigError::Invalid {
                    var: "MANDI_TARGETS_FILE",
                    value: path.display().to_string(),
                    reason: err.to_string(),
                })
            }
        };
        serde_yaml::from_str(&text).map_err(|err| ConfigError::Invalid {
            var: "MANDI_TARGETS_FILE",
            value: path.display().to_string(),
            reason: err.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub store: PgStoreConfig,
    pub source: SourceSelection,
    pub filter: FilterConfig,
    pub http_timeout: Duration,
    /// Upper bound on each call into the price store.
    pub store_timeout: Duration,
    pub user_agent: String,
    pub sync_cron: String,
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|err: T::Err| ConfigError::Invalid {
                var,
                value,
                reason: err.to_string(),
            }),
    }
}

pub(crate) fn required_var(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<String, ConfigError> {
    lookup(var)
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing { var })
}

/// `MANDI_DEPENDENCY_TIMEOUT_SECS`, defaulting to 5s. Zero is rejected.
pub fn dependency_timeout_from_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<Duration, ConfigError> {
    const VAR: &str = "MANDI_DEPENDENCY_TIMEOUT_SECS";
    match parse_var::<u64>(lookup, VAR)? {
        None => Ok(DEFAULT_DEPENDENCY_TIMEOUT),
        Some(0) => Err(ConfigError::Invalid {
            var: VAR,
            value: "0".to_string(),
            reason: "expected a positive number of seconds".to_string(),
        }),
        Some(secs) => Ok(Duration::from_secs(secs)),
    }
}

/// Postgres settings shared by every component that talks to the store.
pub fn store_config_from_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<PgStoreConfig, ConfigError> {
    let mut store = PgStoreConfig::new(required_var(lookup, "DATABASE_URL")?);
    if let Some(max) = parse_var(lookup, "MANDI_DB_MAX_CONNECTIONS")? {
        store.max_connections = max;
    }
    store.acquire_timeout = dependency_timeout_from_lookup(lookup)?;
    Ok(store)
}

impl IngestConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let store = store_config_from_lookup(&lookup)?;

        let source = match lookup("MANDI_SOURCE").as_deref().map(str::trim) {
            None | Some("") | Some("data-gov-in") => {
                let mut api = DataGovInConfig::new(lookup("DATA_GOV_API_KEY").unwrap_or_default())?;
                if let Some(limit) = parse_var(&lookup, "MANDI_FETCH_LIMIT")? {
                    api.page_limit = limit;
                }
                if let Some(pages) = parse_var(&lookup, "MANDI_FETCH_MAX_PAGES")? {
                    api.max_pages = pages;
                }
                SourceSelection::DataGovIn(api)
            }
            Some("fixture") => SourceSelection::Fixture(
                lookup("MANDI_FIXTURE_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_FIXTURE_PATH)),
            ),
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "MANDI_SOURCE",
                    value: other.to_string(),
                    reason: "expected data-gov-in or fixture".to_string(),
                })
            }
        };

        let targets_path = lookup("MANDI_TARGETS_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TARGETS_FILE));
        let targets = TargetsFile::load_or_default(&targets_path)?;
        let retention_days = parse_var(&lookup, "MANDI_RETENTION_DAYS")?
            .or(targets.retention_days)
            .unwrap_or(DEFAULT_RETENTION_DAYS);
        let filter = FilterConfig::new(
            &targets.commodities,
            &targets.state,
            &targets.districts,
            retention_days,
        );

        Ok(Self {
            store,
            source,
            filter,
            http_timeout: Duration::from_secs(
                parse_var(&lookup, "MANDI_HTTP_TIMEOUT_SECS")?.unwrap_or(30),
            ),
            store_timeout: dependency_timeout_from_lookup(&lookup)?,
            user_agent: lookup("MANDI_USER_AGENT").unwrap_or_else(|| "mandi-bot/0.1".to_string()),
            sync_cron: lookup("MANDI_SYNC_CRON").unwrap_or_else(|| "0 30 6 * * *".to_string()),
        })
    }
}
