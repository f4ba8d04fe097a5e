use anyhow::Result;
use clap::Parser;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

mod admin;
mod backoff;
mod config;
mod db;
mod error;
mod events;
mod feeds;
mod fixtures;
mod normalizer;
mod props;
mod providers;
mod settlement;

use admin::AppState;
use config::Config;
use db::Database;
use events::{spawn_event_logger, EventBus};
use feeds::transport::{WsTransport, WsTransportConfig};
use feeds::StreamManager;
use fixtures::{FixtureDirectory, HttpFixtureSource};
use normalizer::scoring::{NeutralScorer, RemoteScorer, Scorer};
use normalizer::{Normalizer, Pipeline};
use props::{LineMovementLedger, PropositionStore};
use providers::{RateLimiter, SeasonStats, StatsClient};
use settlement::SettlementEngine;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    let db = Database::open(&config.database_path)?;
    info!("Database opened: {}", config.database_path);

    let events = EventBus::new(1024);
    spawn_event_logger(&events);

    let limiter = Arc::new(RateLimiter::new(
        db.clone(),
        config.rate_limits(),
        Duration::from_secs(config.cache_fresh_secs),
        Duration::from_secs(config.provider_timeout_secs),
    ));

    let stats: Arc<dyn SeasonStats> = Arc::new(StatsClient::new(
        "stats",
        &config.stats_api_url,
        config.stats_api_key.clone(),
        Arc::clone(&limiter),
    )?);
    let fixture_source = HttpFixtureSource::new(
        "fixtures",
        &config.fixtures_api_url,
        config.fixtures_api_key.clone(),
        Arc::clone(&limiter),
    )?;
    let fixtures = FixtureDirectory::new(Arc::new(fixture_source), Duration::from_secs(config.fixture_ttl_secs));

    let scoring_timeout = Duration::from_secs(config.scoring_timeout_secs);
    let scorer: Arc<dyn Scorer> = match &config.scoring_url {
        Some(url) => {
            info!("Scoring via {}", url);
            Arc::new(RemoteScorer::new(url, scoring_timeout)?)
        }
        None => {
            warn!("No scoring service configured, propositions get neutral scores");
            Arc::new(NeutralScorer)
        }
    };
    let normalizer = Arc::new(Normalizer::new(fixtures.clone(), scorer, Some(stats), scoring_timeout));
    let quality = normalizer.quality();

    let ledger = LineMovementLedger::new(db.clone()).with_steam(
        chrono::Duration::minutes(config.steam_window_minutes),
        config.steam_threshold,
    );
    let store = Arc::new(PropositionStore::new(db.clone(), ledger.clone(), events.clone()));
    let settlement = SettlementEngine::new(db.clone(), events.clone());

    let pipeline = Arc::new(Pipeline::new(
        normalizer,
        Arc::clone(&store),
        settlement.clone(),
        Arc::new(Semaphore::new(config.worker_permits)),
    ));

    let transport = Arc::new(WsTransport::new(WsTransportConfig {
        url: config.feed_ws_url.clone(),
        api_key: config.feed_api_key.clone(),
        connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        heartbeat_grace: Duration::from_secs(config.heartbeat_grace_secs),
        ping_interval: Duration::from_secs(config.ping_interval_secs),
    }));
    let streams = StreamManager::new(transport, pipeline, Some(fixtures), config.session_limits());

    for stream in config.stream_specs()? {
        if let Err(e) = streams.start_stream(&stream.sport, &stream.providers, BTreeMap::new()) {
            error!("Failed to start stream for {}: {}", stream.sport, e);
        }
    }

    let state = AppState {
        streams: streams.clone(),
        store,
        ledger,
        settlement,
        limiter,
        quality,
    };
    let app = admin::router(state);
    let addr: SocketAddr = config.admin_addr.parse()?;
    info!("Admin API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown requested");
        })
        .await?;

    streams.stop_all();
    Ok(())
}
