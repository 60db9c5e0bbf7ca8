//! Ingestion pipeline: fetch → normalize → quality filter → idempotent upsert.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use mandi_adapters::{adapter_for_source, normalize_records, AdapterContext, SourceAdapter};
use mandi_storage::{HttpClientConfig, HttpFetcher, PgPriceStore, PriceStore, UpsertCounts};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod config;
mod filter;

pub use config::{
    dependency_timeout_from_lookup, store_config_from_lookup, IngestConfig, TargetsFile,
    DEFAULT_DEPENDENCY_TIMEOUT, DEFAULT_FIXTURE_PATH, DEFAULT_RETENTION_DAYS, DEFAULT_TARGETS_FILE,
};
pub use filter::{
    parse_arrival_date, FilterConfig, FilterOutcome, FilterReport, QualityFilter, StageCount,
};

pub const CRATE_NAME: &str = "mandi-sync";

#[derive(Debug, Clone, Serialize)]
pub struct IngestRunSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: usize,
    pub normalized: usize,
    pub filter: FilterReport,
    pub upsert: UpsertCounts,
}

pub struct IngestPipeline {
    adapter: Box<dyn SourceAdapter>,
    http: HttpFetcher,
    store: Arc<dyn PriceStore>,
    store_timeout: Duration,
    filter: QualityFilter,
}

impl IngestPipeline {
    pub fn new(
        adapter: Box<dyn SourceAdapter>,
        http: HttpFetcher,
        store: Arc<dyn PriceStore>,
        filter: QualityFilter,
    ) -> Self {
        Self {
            adapter,
            http,
            store,
            store_timeout: DEFAULT_DEPENDENCY_TIMEOUT,
            filter,
        }
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn from_config(config: &IngestConfig, store: Arc<dyn PriceStore>) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })
        .context("building http client")?;
        Ok(Self::new(
            adapter_for_source(config.source.clone()),
            http,
            store,
            QualityFilter::new(config.filter.clone()),
        )
        .with_store_timeout(config.store_timeout))
    }

    async fn bounded<T, E>(&self, work: impl Future<Output = Result<T, E>>) -> Result<T>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        match tokio::time::timeout(self.store_timeout, work).await {
            Ok(result) => Ok(result?),
            Err(_) => bail!("price store did not respond within {:?}", self.store_timeout),
        }
    }

    /// Run one ingestion pass. `now` anchors the retention window.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<IngestRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_run", %run_id, source = self.adapter.source_id());
        self.run_inner(run_id, now).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<IngestRunSummary> {
        let started_at = Utc::now();
        let ctx = AdapterContext {
            run_id,
            fetched_at: now,
        };

        let records = self
            .adapter
            .fetch_records(&self.http, &ctx)
            .await
            .with_context(|| format!("fetching records from {}", self.adapter.source_id()))?;
        let candidates = normalize_records(&records);
        let normalized = candidates.len();

        let outcome = self.filter.apply(candidates, now.date_naive());

        let upsert = if outcome.accepted.is_empty() {
            info!("no new observations this run");
            UpsertCounts::default()
        } else {
            self.bounded(self.store.ensure_schema())
                .await
                .context("ensuring price store schema")?;
            let counts = self
                .bounded(self.store.upsert_batch(&outcome.accepted))
                .await
                .context("upserting accepted observations")?;
            if counts.failed == outcome.accepted.len() {
                bail!("all {} upserts failed; price store unavailable?", counts.failed);
            }
            if counts.failed > 0 {
                warn!(failed = counts.failed, "some observations were not written");
            }
            counts
        };

        let summary = IngestRunSummary {
            run_id,
            source_id: self.adapter.source_id().to_string(),
            started_at,
            finished_at: Utc::now(),
            fetched: records.len(),
            normalized,
            filter: outcome.report,
            upsert,
        };
        info!(
            fetched = summary.fetched,
            accepted = summary.filter.accepted,
            inserted = summary.upsert.inserted,
            modified = summary.upsert.modified,
            "ingest run complete"
        );
        Ok(summary)
    }
}

/// Cron-driven trigger for [`IngestPipeline::run_once`]. The caller starts and owns it.
pub async fn build_scheduler(pipeline: Arc<IngestPipeline>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.run_once(Utc::now()).await {
                Ok(summary) => info!(run_id = %summary.run_id, "scheduled ingest finished"),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled ingest failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn pipeline_from_env() -> Result<IngestPipeline> {
    let config = IngestConfig::from_env()?;
    let store = PgPriceStore::connect(&config.store)
        .await
        .context("connecting to price store")?;
    IngestPipeline::from_config(&config, Arc::new(store))
}

pub async fn run_ingest_once_from_env() -> Result<IngestRunSummary> {
    pipeline_from_env().await?.run_once(Utc::now()).await
}
