use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tradewatch_core::SystemClock;
use tradewatch_storage::{HttpFetcher, PgStore, Stores, MEMORY_URL};
use tradewatch_sync::{Pipeline, PipelineConfig, SourceRegistry};

#[derive(Debug, Parser)]
#[command(name = "tradewatch")]
#[command(about = "Trade listing watcher: scrape, match alerts, notify")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the scrape loop for one source until Ctrl-C.
    Scrape {
        /// Source name from the registry; defaults to the first enabled one.
        #[arg(long)]
        source: Option<String>,
    },
    /// Serve the JSON API and run the scheduled jobs.
    Serve,
    /// Run one retention sweep.
    Sweep,
    /// Run one notification refresh.
    Refresh,
    /// Apply SQL migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradewatch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env().context("reading configuration")?;

    match cli.command {
        Commands::Scrape { source } => scrape(&config, source.as_deref()).await?,
        Commands::Serve => serve(&config).await?,
        Commands::Sweep => {
            let pipeline = pipeline(&config).await?;
            let report = pipeline.sweeper.sweep(config.retention).await?;
            println!(
                "sweep complete: notifications_deleted={} offers_deleted={}",
                report.notifications_deleted, report.offers_deleted
            );
        }
        Commands::Refresh => {
            let pipeline = pipeline(&config).await?;
            let report = pipeline.refresher.refresh().await?;
            println!(
                "refresh complete: candidates={} created={}",
                report.candidates, report.created
            );
        }
        Commands::Migrate => {
            if config.database_url.starts_with(MEMORY_URL) {
                bail!("the in-memory store has no migrations");
            }
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}

async fn pipeline(config: &PipelineConfig) -> Result<Pipeline> {
    let stores = Stores::connect(&config.database_url)
        .await
        .context("opening store")?;
    Ok(Pipeline::from_config(stores, Arc::new(SystemClock), config))
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "could not listen for ctrl-c");
            return;
        }
        info!("shutdown requested");
        token.cancel();
    });
    cancel
}

async fn scrape(config: &PipelineConfig, source: Option<&str>) -> Result<()> {
    let registry = SourceRegistry::load(&config.sources_path).await?;
    let source = registry.select(source)?;
    let http = HttpFetcher::new(config.http_client_config())?;
    let adapter = source.build_adapter(&http)?;
    let pipeline = pipeline(config).await?;

    info!(source = %source.name, marketplace = source.marketplace.as_str(), "starting scrape loop");
    let mut scraper = pipeline.scrape_loop(adapter, config.scrape.clone());
    scraper
        .run(cancel_on_ctrl_c())
        .await
        .with_context(|| format!("scrape loop for {} stopped", source.name))?;
    println!("scrape loop for {} stopped", source.name);
    Ok(())
}

async fn serve(config: &PipelineConfig) -> Result<()> {
    let pipeline = pipeline(config).await?;
    let mut scheduler = pipeline.scheduler(config).await?;
    scheduler.start().await.context("starting scheduler")?;

    let result = tradewatch_web::serve(pipeline, config.web_port, cancel_on_ctrl_c()).await;
    if let Err(err) = scheduler.shutdown().await {
        warn!(error = %err, "scheduler shutdown failed");
    }
    result
}
