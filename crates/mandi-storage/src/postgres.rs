//! Postgres-backed [`PriceStore`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use mandi_core::PriceObservation;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{info, warn};

use crate::prices::{PriceStore, StoreError, UpsertCounts, MAX_LIST_LIMIT};

const SCHEMA_STATEMENTS: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS price_observations (
        id            BIGSERIAL PRIMARY KEY,
        commodity     TEXT NOT NULL,
        variety       TEXT NOT NULL DEFAULT '',
        state         TEXT NOT NULL,
        district      TEXT NOT NULL,
        market        TEXT NOT NULL DEFAULT '',
        arrival_date  DATE NOT NULL,
        min_price     DOUBLE PRECISION,
        max_price     DOUBLE PRECISION,
        modal_price   DOUBLE PRECISION,
        ingested_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    DROP INDEX IF EXISTS price_observations_natural_key
    "#,
    // Mirrors `NaturalKey`: rows differing only in casing are one market-day.
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS price_observations_folded_key
        ON price_observations
           (lower(commodity), lower(variety), lower(state), lower(district), lower(market), arrival_date)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS price_observations_latest
        ON price_observations (lower(commodity), lower(variety), lower(district), arrival_date DESC)
    "#,
];

const UPSERT_SQL: &str = r#"
    INSERT INTO price_observations AS p
        (commodity, variety, state, district, market, arrival_date, min_price, max_price, modal_price)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
    ON CONFLICT (lower(commodity), lower(variety), lower(state), lower(district), lower(market), arrival_date)
    DO UPDATE SET min_price = EXCLUDED.min_price,
                  max_price = EXCLUDED.max_price,
                  modal_price = EXCLUDED.modal_price,
                  updated_at = NOW()
     WHERE (p.min_price, p.max_price, p.modal_price)
           IS DISTINCT FROM (EXCLUDED.min_price, EXCLUDED.max_price, EXCLUDED.modal_price)
    RETURNING (xmax = 0) AS inserted
"#;

const SELECT_COLUMNS: &str =
    "commodity, variety, state, district, market, arrival_date, min_price, max_price, modal_price";

#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl PgStoreConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 8,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgPriceStore {
    pool: PgPool,
}

impl PgPriceStore {
    /// Connect eagerly so a bad `DATABASE_URL` fails at startup, not on first request.
    pub async fn connect(config: &PgStoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn upsert_one(&self, observation: &PriceObservation) -> Result<UpsertEffect, sqlx::Error> {
        let row = sqlx::query(UPSERT_SQL)
            .bind(&observation.commodity)
            .bind(observation.variety.as_deref().unwrap_or_default())
            .bind(&observation.state)
            .bind(&observation.district)
            .bind(observation.market.as_deref().unwrap_or_default())
            .bind(observation.arrival_date)
            .bind(observation.min_price)
            .bind(observation.max_price)
            .bind(observation.modal_price)
            .fetch_optional(&self.pool)
            .await?;

        let effect = match row {
            Some(row) if row.try_get::<bool, _>("inserted")? => UpsertEffect::Inserted,
            Some(_) => UpsertEffect::Modified,
            None => UpsertEffect::Unchanged,
        };
        Ok(effect)
    }
}

enum UpsertEffect {
    Inserted,
    Modified,
    Unchanged,
}

fn empty_to_none(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn observation_from_row(row: &PgRow) -> Result<PriceObservation, StoreError> {
    let commodity: String = row.try_get("commodity")?;
    let district: String = row.try_get("district")?;
    let arrival_date: NaiveDate = row.try_get("arrival_date")?;

    let mut prices = [None; 3];
    for (slot, column) in prices.iter_mut().zip(["min_price", "max_price", "modal_price"]) {
        *slot = row
            .try_get::<Option<f64>, _>(column)
            .map_err(|e| StoreError::Decode {
                key: format!("{commodity}/{district}@{arrival_date}"),
                reason: e.to_string(),
            })?;
    }
    let [min_price, max_price, modal_price] = prices;

    Ok(PriceObservation {
        commodity,
        variety: empty_to_none(row.try_get("variety")?),
        state: row.try_get("state")?,
        district,
        market: empty_to_none(row.try_get("market")?),
        arrival_date,
        min_price,
        max_price,
        modal_price,
    })
}

#[async_trait]
impl PriceStore for PgPriceStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn upsert_batch(&self, observations: &[PriceObservation]) -> Result<UpsertCounts, StoreError> {
        let mut counts = UpsertCounts::default();
        for observation in observations {
            match self.upsert_one(observation).await {
                Ok(UpsertEffect::Inserted) => counts.inserted += 1,
                Ok(UpsertEffect::Modified) => {
                    counts.matched += 1;
                    counts.modified += 1;
                }
                Ok(UpsertEffect::Unchanged) => counts.matched += 1,
                Err(err) => {
                    counts.failed += 1;
                    warn!(key = %observation.natural_key(), error = %err, "upsert failed");
                }
            }
        }
        info!(
            matched = counts.matched,
            inserted = counts.inserted,
            modified = counts.modified,
            failed = counts.failed,
            "price upsert batch finished"
        );
        Ok(counts)
    }

    async fn find_latest(
        &self,
        commodity: &str,
        variety: &str,
        region: &str,
    ) -> Result<Option<PriceObservation>, StoreError> {
        let sql = format!(
            r#"
            SELECT {SELECT_COLUMNS}
              FROM price_observations
             WHERE lower(commodity) = lower($1)
               AND lower(variety) = lower($2)
               AND lower(district) = lower($3)
             ORDER BY arrival_date DESC, market ASC
             LIMIT 1
            "#
        );
        let row = sqlx::query(&sql)
            .bind(commodity.trim())
            .bind(variety.trim())
            .bind(region.trim())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(observation_from_row).transpose()
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<PriceObservation>, StoreError> {
        let sql = format!(
            r#"
            SELECT {SELECT_COLUMNS}
              FROM price_observations
             ORDER BY arrival_date DESC, commodity, district, market
             LIMIT $1
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit.min(MAX_LIST_LIMIT)).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(observation_from_row).collect()
    }
}
