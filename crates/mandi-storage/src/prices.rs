//! The price store seam and its in-memory implementation.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use async_trait::async_trait;
use mandi_core::{NaturalKey, PriceObservation};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

/// Outcome of one `upsert_batch` call.
///
/// `matched` counts rows whose natural key already existed, `modified` the subset of those
/// whose prices changed. Rows that failed are counted in `failed` and do not abort the batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertCounts {
    pub matched: usize,
    pub inserted: usize,
    pub modified: usize,
    pub failed: usize,
}

impl UpsertCounts {
    pub fn attempted(&self) -> usize {
        self.matched + self.inserted + self.failed
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored row for {key} could not be decoded: {reason}")]
    Decode { key: String, reason: String },
}

impl StoreError {
    /// Connection-level failures are worth retrying; decode failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::WorkerCrashed
            ),
            Self::Decode { .. } => false,
        }
    }
}

pub const MAX_LIST_LIMIT: usize = 500;

/// Time-ordered store of price observations keyed by [`NaturalKey`].
///
/// Every write is atomic per observation: a concurrent reader sees a record either before or
/// after an upsert, never half of it.
#[async_trait]
pub trait PriceStore: Send + Sync {
    /// Create the backing table and the natural-key unique index if they do not exist.
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    /// Insert unseen keys and replace the prices of matched keys.
    async fn upsert_batch(&self, observations: &[PriceObservation]) -> Result<UpsertCounts, StoreError>;

    /// Most recent observation for (commodity, variety, district), compared case-insensitively.
    async fn find_latest(
        &self,
        commodity: &str,
        variety: &str,
        region: &str,
    ) -> Result<Option<PriceObservation>, StoreError>;

    /// Up to `limit` observations (at most [`MAX_LIST_LIMIT`]), newest `arrival_date` first.
    async fn list_recent(&self, limit: usize) -> Result<Vec<PriceObservation>, StoreError>;
}

/// Process-local store used for tests, offline runs and as the reference behavior.
#[derive(Debug, Default)]
pub struct MemoryPriceStore {
    rows: RwLock<BTreeMap<NaturalKey, PriceObservation>>,
}

impl MemoryPriceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    pub async fn get(&self, key: &NaturalKey) -> Option<PriceObservation> {
        self.rows.read().await.get(key).cloned()
    }
}

fn eq_folded(stored: &str, wanted: &str) -> bool {
    stored.to_lowercase() == wanted.trim().to_lowercase()
}

#[async_trait]
impl PriceStore for MemoryPriceStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn upsert_batch(&self, observations: &[PriceObservation]) -> Result<UpsertCounts, StoreError> {
        let mut counts = UpsertCounts::default();
        for observation in observations {
            // One lock per record mirrors per-document atomicity of the database store.
            let mut rows = self.rows.write().await;
            let key = observation.natural_key();
            match rows.get_mut(&key) {
                // Only prices move on a match; the first-seen casing of the key text stays.
                Some(existing) => {
                    counts.matched += 1;
                    if existing.prices_differ(observation) {
                        existing.min_price = observation.min_price;
                        existing.max_price = observation.max_price;
                        existing.modal_price = observation.modal_price;
                        counts.modified += 1;
                    }
                }
                None => {
                    rows.insert(key, observation.clone());
                    counts.inserted += 1;
                }
            }
        }
        Ok(counts)
    }

    async fn find_latest(
        &self,
        commodity: &str,
        variety: &str,
        region: &str,
    ) -> Result<Option<PriceObservation>, StoreError> {
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .filter(|o| {
                eq_folded(&o.commodity, commodity)
                    && eq_folded(o.variety.as_deref().unwrap_or_default(), variety)
                    && eq_folded(&o.district, region)
            })
            .min_by_key(|o| (Reverse(o.arrival_date), o.market.clone().unwrap_or_default()))
            .cloned())
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<PriceObservation>, StoreError> {
        let rows = self.rows.read().await;
        let mut out = rows.values().cloned().collect::<Vec<_>>();
        out.sort_by_key(|o| Reverse(o.arrival_date));
        out.truncate(limit.min(MAX_LIST_LIMIT));
        Ok(out)
    }
}
