use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use mandi_core::{ForecastOutcome, ModelKey};
use mandi_forecast::{EngineConfig, LinearArtifact};
use mandi_storage::{ModelArtifactStore, PgPriceStore, PriceStore};
use mandi_sync::{build_scheduler, IngestConfig, IngestPipeline};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "mandi-cli")]
#[command(about = "Mandi price ingestion and forecasting")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Args)]
struct Combination {
    #[arg(long)]
    region: String,
    #[arg(long)]
    commodity: String,
    #[arg(long)]
    variety: String,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, filter and store one batch of prices.
    Ingest,
    /// Create the price table and its indexes.
    Migrate,
    /// Print a 7-day forecast as JSON.
    Forecast(Combination),
    /// Run the JSON API.
    Serve,
    /// Run ingestion on the MANDI_SYNC_CRON schedule until interrupted.
    Schedule,
    /// Validate a linear model artifact and install it under its model key.
    InstallModel {
        #[command(flatten)]
        combination: Combination,
        file: PathBuf,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "mandi_cli=info,mandi_sync=info,mandi_storage=info,mandi_adapters=info,\
                 mandi_forecast=info,mandi_web=info"
                    .into()
            }),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let summary = mandi_sync::run_ingest_once_from_env().await?;
            println!(
                "ingest complete: run_id={} source={} fetched={} accepted={} inserted={} modified={} unchanged={} failed={}",
                summary.run_id,
                summary.source_id,
                summary.fetched,
                summary.filter.accepted,
                summary.upsert.inserted,
                summary.upsert.modified,
                summary.upsert.matched.saturating_sub(summary.upsert.modified),
                summary.upsert.failed
            );
            for stage in &summary.filter.stages {
                println!("  {:<13} kept={:<5} dropped={}", stage.stage, stage.kept, stage.dropped);
            }
        }
        Commands::Migrate => {
            let store_config =
                mandi_sync::store_config_from_lookup(&|var: &str| std::env::var(var).ok())?;
            let store = PgPriceStore::connect(&store_config)
                .await
                .context("connecting to price store")?;
            store.ensure_schema().await.context("creating price schema")?;
            println!("price store schema is up to date");
        }
        Commands::Forecast(combination) => {
            let state = mandi_web::state_from_env().await?;
            let outcome = state
                .engine
                .forecast(&combination.region, &combination.commodity, &combination.variety)
                .await?;
            match outcome {
                ForecastOutcome::Ready(forecast) => {
                    println!("{}", serde_json::to_string_pretty(&forecast)?);
                }
                ForecastOutcome::NotFound(reason) => {
                    anyhow::bail!(
                        "no forecast for {}: {reason}",
                        ModelKey::new(&combination.region, &combination.commodity, &combination.variety)
                    );
                }
            }
        }
        Commands::Serve => {
            mandi_web::serve_from_env().await?;
        }
        Commands::Schedule => {
            let config = IngestConfig::from_env()?;
            let store = PgPriceStore::connect(&config.store)
                .await
                .context("connecting to price store")?;
            let pipeline = Arc::new(IngestPipeline::from_config(&config, Arc::new(store))?);
            let mut scheduler = build_scheduler(pipeline, &config.sync_cron).await?;
            scheduler.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "ingest scheduled; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
        Commands::InstallModel { combination, file } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            LinearArtifact::from_json(&bytes)
                .with_context(|| format!("{} is not a usable model artifact", file.display()))?;
            let models_dir = EngineConfig::from_env()?.models_dir;
            let key = ModelKey::new(&combination.region, &combination.commodity, &combination.variety);
            let stored = ModelArtifactStore::new(models_dir).install(&key, &bytes).await?;
            println!(
                "model {key}: {} sha256={} bytes={}{}",
                stored.absolute_path.display(),
                stored.content_hash,
                stored.byte_size,
                if stored.unchanged { " (unchanged)" } else { "" }
            );
        }
    }

    Ok(())
}
