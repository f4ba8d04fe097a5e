use clap::Parser;
use rust_decimal::Decimal;
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::feeds::session::SessionLimits;
use crate::providers::RateLimits;

/// Player-proposition odds ingestion and settlement service
#[derive(Parser, Debug, Clone)]
#[command(name = "propstream", version, about)]
pub struct Config {
    /// Admin API listen address
    #[arg(long, env = "ADMIN_ADDR", default_value = "0.0.0.0:8080")]
    pub admin_addr: String,

    /// SQLite database path (`:memory:` for a throwaway database)
    #[arg(long, env = "DATABASE_PATH", default_value = "propstream.db")]
    pub database_path: String,

    /// Odds feed WebSocket URL
    #[arg(long, env = "FEED_WS_URL", default_value = "ws://127.0.0.1:9000/feed")]
    pub feed_ws_url: String,

    /// Odds feed API key
    #[arg(long, env = "FEED_API_KEY")]
    pub feed_api_key: Option<String>,

    /// Stream to start at boot, as `sport:providerA,providerB` (repeatable)
    #[arg(long = "stream", env = "STREAMS", value_delimiter = ';')]
    pub streams: Vec<String>,

    /// Player statistics API base URL
    #[arg(long, env = "STATS_API_URL", default_value = "https://stats.example.com/v1")]
    pub stats_api_url: String,

    /// Player statistics API key
    #[arg(long, env = "STATS_API_KEY")]
    pub stats_api_key: Option<String>,

    /// Fixture listing API base URL
    #[arg(long, env = "FIXTURES_API_URL", default_value = "https://api.the-odds-api.com/v4")]
    pub fixtures_api_url: String,

    /// Fixture listing API key
    #[arg(long, env = "FIXTURES_API_KEY")]
    pub fixtures_api_key: Option<String>,

    /// Scoring service URL; neutral scores are used when unset
    #[arg(long, env = "SCORING_URL")]
    pub scoring_url: Option<String>,

    /// Scoring call timeout in seconds
    #[arg(long, env = "SCORING_TIMEOUT_SECS", default_value = "15")]
    pub scoring_timeout_secs: u64,

    /// Feed connect timeout in seconds
    #[arg(long, env = "CONNECT_TIMEOUT_SECS", default_value = "15")]
    pub connect_timeout_secs: u64,

    /// Seconds without any frame before the feed is considered dead
    #[arg(long, env = "HEARTBEAT_GRACE_SECS", default_value = "45")]
    pub heartbeat_grace_secs: u64,

    /// Seconds between client-side ping frames
    #[arg(long, env = "PING_INTERVAL_SECS", default_value = "20")]
    pub ping_interval_secs: u64,

    /// Consecutive failures without data before a stream gives up
    #[arg(long, env = "FAILURE_CEILING", default_value = "10")]
    pub failure_ceiling: u32,

    /// Reconnect attempts without a successful handshake before a stream gives up
    #[arg(long, env = "EPISODE_CEILING", default_value = "5")]
    pub episode_ceiling: u32,

    /// First reconnect delay in seconds
    #[arg(long, env = "BACKOFF_INITIAL_SECS", default_value = "5")]
    pub backoff_initial_secs: u64,

    /// Maximum reconnect delay in seconds
    #[arg(long, env = "BACKOFF_CAP_SECS", default_value = "300")]
    pub backoff_cap_secs: u64,

    /// Concurrent normalization permits shared by all sessions
    #[arg(long, env = "WORKER_PERMITS", default_value = "8")]
    pub worker_permits: usize,

    /// Fixture directory entry lifetime in seconds
    #[arg(long, env = "FIXTURE_TTL_SECS", default_value = "300")]
    pub fixture_ttl_secs: u64,

    /// Provider calls allowed per minute
    #[arg(long, env = "RATE_PER_MINUTE", default_value = "30")]
    pub rate_per_minute: u32,

    /// Provider calls allowed per hour
    #[arg(long, env = "RATE_PER_HOUR", default_value = "500")]
    pub rate_per_hour: u32,

    /// Provider calls allowed per day
    #[arg(long, env = "RATE_PER_DAY", default_value = "5000")]
    pub rate_per_day: u32,

    /// Cached provider responses younger than this are served without a call
    #[arg(long, env = "CACHE_FRESH_SECS", default_value = "60")]
    pub cache_fresh_secs: u64,

    /// Provider call timeout in seconds
    #[arg(long, env = "PROVIDER_TIMEOUT_SECS", default_value = "10")]
    pub provider_timeout_secs: u64,

    /// Trailing window for steam-move detection, in minutes
    #[arg(long, env = "STEAM_WINDOW_MINUTES", default_value = "15")]
    pub steam_window_minutes: i64,

    /// Net line movement that counts as a steam move
    #[arg(long, env = "STEAM_THRESHOLD", default_value = "1.0")]
    pub steam_threshold: Decimal,
}

/// A boot-time stream: sport plus provider set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    pub sport: String,
    pub providers: Vec<String>,
}

/// Parse `nba:draftkings,fanduel`.
pub fn parse_stream_spec(raw: &str) -> anyhow::Result<StreamSpec> {
    let (sport, providers) = raw
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("stream {:?} must look like sport:providerA,providerB", raw))?;
    let sport = sport.trim();
    let providers: Vec<String> = providers
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    if sport.is_empty() || providers.is_empty() {
        anyhow::bail!("stream {:?} needs a sport and at least one provider", raw);
    }
    Ok(StreamSpec {
        sport: sport.to_string(),
        providers,
    })
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.failure_ceiling == 0 || self.episode_ceiling == 0 {
            anyhow::bail!("failure_ceiling and episode_ceiling must be at least 1");
        }
        if self.backoff_initial_secs == 0 || self.backoff_initial_secs > self.backoff_cap_secs {
            anyhow::bail!("backoff_initial_secs must be positive and not above backoff_cap_secs");
        }
        if self.ping_interval_secs == 0 || self.ping_interval_secs >= self.heartbeat_grace_secs {
            anyhow::bail!("ping_interval_secs must be positive and below heartbeat_grace_secs");
        }
        if self.worker_permits == 0 {
            anyhow::bail!("worker_permits must be at least 1");
        }
        if self.steam_window_minutes <= 0 || self.steam_threshold <= Decimal::ZERO {
            anyhow::bail!("steam window and threshold must be positive");
        }
        for raw in &self.streams {
            parse_stream_spec(raw)?;
        }
        Ok(())
    }

    pub fn stream_specs(&self) -> anyhow::Result<Vec<StreamSpec>> {
        self.streams.iter().map(|s| parse_stream_spec(s)).collect()
    }

    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            failure_ceiling: self.failure_ceiling,
            episode_ceiling: self.episode_ceiling,
            backoff: BackoffPolicy {
                initial: Duration::from_secs(self.backoff_initial_secs),
                multiplier: 2.0,
                cap: Duration::from_secs(self.backoff_cap_secs),
                max_attempts: self.episode_ceiling,
                jitter: 0.0,
            },
        }
    }

    pub fn rate_limits(&self) -> RateLimits {
        RateLimits {
            per_minute: self.rate_per_minute,
            per_hour: self.rate_per_hour,
            per_day: self.rate_per_day,
        }
    }
}
