use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use cinestream_common::{CityKey, Config};
use cinestream_store::{migrate::migrate, MongoStore, StoreClient};
use cinestream_scout::extraction::ClaudeExtractor;
use cinestream_scout::posters::PosterCache;
use cinestream_scout::refresh::RefreshAgent;
use cinestream_scout::{
    Clock, ExtractionClient, LocationStore, MovieStore, Orchestrator, ScrapeService,
    ScrapeSettings, SystemClock,
};

#[derive(Parser)]
#[command(name = "scout", about = "CineStream showtime scrape coordinator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create collection indexes.
    Migrate,
    /// Bring one city up to date, scraping inline if it is stale.
    Scrape {
        /// "City", "City, Country" or "City, Region, Country".
        city: String,
    },
    /// Print a city's freshness status.
    Status { city: String },
    /// Refresh this agent's share of known cities.
    Refresh {
        #[arg(long)]
        agent_id: u32,
        /// Defaults to TOTAL_AGENTS.
        #[arg(long)]
        total_agents: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    match cli.command {
        Command::Migrate => {
            let config = Config::store_from_env()?;
            config.log_redacted();
            let client = connect(&config).await?;
            migrate(&client).await.context("Index migration failed")?;
            info!("Migrations complete");
        }
        Command::Status { city } => {
            let city = CityKey::parse(&city)?;
            let config = Config::store_from_env()?;
            let service = build(&config, false).await?.0;
            let status = service.status(&city).await?;
            println!("{city}: {status}");
        }
        Command::Scrape { city } => {
            let city = CityKey::parse(&city)?;
            let config = Config::from_env()?;
            config.log_redacted();
            let service = build(&config, true).await?.0;
            let freshness = service.ensure_fresh(&city).await?;
            println!("{city}: {}", serde_json::to_string(&freshness)?);
        }
        Command::Refresh {
            agent_id,
            total_agents,
        } => {
            let config = Config::from_env()?;
            config.log_redacted();
            let (_, parts) = build(&config, true).await?;
            let mut agent = RefreshAgent::new(
                agent_id,
                total_agents.unwrap_or(config.total_agents),
                parts.locations,
                parts.orchestrator,
                parts.clock,
            )?;
            if let Some(posters) = parts.posters {
                agent = agent.with_posters(posters);
            }
            let stats = agent.run().await?;
            info!("{stats}");
        }
    }

    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("cinestream=info".parse()?);
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

async fn connect(config: &Config) -> Result<StoreClient> {
    StoreClient::connect(&config.mongo_uri, &config.mongo_database)
        .await
        .context("Failed to connect to MongoDB")
}

struct Parts {
    locations: Arc<dyn LocationStore>,
    orchestrator: Arc<Orchestrator>,
    clock: Arc<dyn Clock>,
    posters: Option<PosterCache>,
}

/// Wire the store, extractor and engine. Read-only commands pass
/// `scraping = false` and never call the extractor.
///
/// Scraping commands run the index migration first: the unique
/// `locations.city_key` index backs lock exclusion for unseen cities.
async fn build(config: &Config, scraping: bool) -> Result<(ScrapeService, Parts)> {
    let client = connect(config).await?;
    if scraping {
        migrate(&client).await.context("Index migration failed")?;
    }
    let store = Arc::new(MongoStore::new(client));
    let locations: Arc<dyn LocationStore> = store.clone();
    let movies: Arc<dyn MovieStore> = store;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let mut claude = ClaudeExtractor::new(&config.anthropic_api_key, &config.claude_model)
        .with_timeout(Duration::from_secs(config.step_timeout_secs))
        .with_clock(clock.clone());
    if let Some(base_url) = &config.anthropic_base_url {
        claude = claude.with_base_url(base_url);
    }
    if scraping {
        info!(model = claude.model(), "Extraction client ready");
    }
    let extractor: Arc<dyn ExtractionClient> = Arc::new(claude);
    let posters = if scraping {
        Some(PosterCache::new(&config.poster_dir)?)
    } else {
        None
    };

    let mut orchestrator = Orchestrator::new(
        locations.clone(),
        movies,
        extractor,
        clock.clone(),
        ScrapeSettings::from(config),
    );
    if let Some(posters) = &posters {
        orchestrator = orchestrator.with_posters(posters.clone());
    }
    let orchestrator = Arc::new(orchestrator);

    let service = ScrapeService::new(locations.clone(), orchestrator.clone(), clock.clone());
    Ok((
        service,
        Parts {
            locations,
            orchestrator,
            clock,
            posters,
        },
    ))
}
