//! Short-lived, per-sport cache of upcoming fixtures.
//!
//! The stream manager refreshes a sport before opening its stream; the
//! normalizer resolves team and opponent from here on the hot path. Reads and
//! refreshes may overlap. Staleness up to one TTL is accepted.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::backoff::{self, BackoffPolicy};
use crate::providers::rate_limit::{ProviderResponse, RateLimiter};

pub const UNKNOWN_TEAM: &str = "TBD";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fixture {
    pub id: String,
    pub sport: String,
    pub home_team: String,
    pub away_team: String,
    pub start_time: Option<DateTime<Utc>>,
}

impl Fixture {
    /// (team, opponent) for a player whose team is `team_hint`.
    ///
    /// Without a usable hint the player's side is unknown, so the team is the
    /// placeholder and the opponent names the matchup.
    pub fn sides(&self, team_hint: Option<&str>) -> (String, String) {
        match team_hint.map(str::trim).filter(|t| !t.is_empty()) {
            Some(t) if same_team(t, &self.home_team) => (self.home_team.clone(), self.away_team.clone()),
            Some(t) if same_team(t, &self.away_team) => (self.away_team.clone(), self.home_team.clone()),
            Some(t) => (t.to_string(), UNKNOWN_TEAM.to_string()),
            None => (
                UNKNOWN_TEAM.to_string(),
                format!("{} @ {}", self.away_team, self.home_team),
            ),
        }
    }
}

/// "Lakers" matches "Los Angeles Lakers"; comparison ignores case.
fn same_team(hint: &str, name: &str) -> bool {
    let hint = hint.to_lowercase();
    let name = name.to_lowercase();
    hint == name || name.ends_with(&format!(" {}", hint)) || hint.ends_with(&format!(" {}", name))
}

/// Upstream listing of a sport's fixtures.
#[async_trait]
pub trait FixtureSource: Send + Sync {
    async fn fetch_fixtures(&self, sport: &str) -> Result<Vec<Fixture>>;
}

struct SportFixtures {
    fetched_at: Instant,
    by_id: HashMap<String, Fixture>,
}

#[derive(Clone)]
pub struct FixtureDirectory {
    source: Arc<dyn FixtureSource>,
    ttl: Duration,
    retry: BackoffPolicy,
    inner: Arc<RwLock<HashMap<String, SportFixtures>>>,
    /// One expired-entry refresh at a time
    refresh_gate: Arc<Mutex<()>>,
}

impl FixtureDirectory {
    pub fn new(source: Arc<dyn FixtureSource>, ttl: Duration) -> Self {
        FixtureDirectory {
            source,
            ttl,
            retry: BackoffPolicy::for_requests(),
            inner: Arc::new(RwLock::new(HashMap::new())),
            refresh_gate: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_retry(mut self, retry: BackoffPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Fetch the sport's fixtures and replace its cache entry.
    /// On failure the previous entry is kept.
    pub async fn refresh(&self, sport: &str) -> Result<usize> {
        let sport_key = sport.to_lowercase();
        let source = Arc::clone(&self.source);
        let fixtures = backoff::retry(self.retry, &format!("fixture fetch for {}", sport_key), || {
            let source = Arc::clone(&source);
            let sport_key = sport_key.clone();
            async move { source.fetch_fixtures(&sport_key).await }
        })
        .await?;

        let count = fixtures.len();
        let by_id = fixtures.into_iter().map(|f| (f.id.clone(), f)).collect();
        self.inner.write().await.insert(
            sport_key.clone(),
            SportFixtures {
                fetched_at: Instant::now(),
                by_id,
            },
        );
        info!("Fixture directory: {} fixture(s) for {}", count, sport_key);
        Ok(count)
    }

    /// Refresh only when the sport is missing or older than the TTL.
    pub async fn ensure_fresh(&self, sport: &str) {
        if !self.is_stale(sport).await {
            return;
        }
        let _gate = self.refresh_gate.lock().await;
        // Whoever held the gate may have refreshed this sport already.
        if !self.is_stale(sport).await {
            return;
        }
        if let Err(e) = self.refresh(sport).await {
            warn!("Fixture refresh for {} failed, serving stale entries: {:#}", sport, e);
        }
    }

    async fn is_stale(&self, sport: &str) -> bool {
        let inner = self.inner.read().await;
        match inner.get(&sport.to_lowercase()) {
            Some(entry) => entry.fetched_at.elapsed() >= self.ttl,
            None => true,
        }
    }

    /// Look up a fixture, refreshing the sport first if its entry expired.
    pub async fn resolve(&self, sport: &str, fixture_id: &str) -> Option<Fixture> {
        self.ensure_fresh(sport).await;
        let inner = self.inner.read().await;
        let found = inner
            .get(&sport.to_lowercase())
            .and_then(|entry| entry.by_id.get(fixture_id))
            .cloned();
        if found.is_none() {
            debug!("Fixture {} not in directory for {}", fixture_id, sport);
        }
        found
    }
}

// ── HTTP source ────────────────────────────────────────────────────────────────

/// Fixture listing over the provider's REST API, through the rate limiter.
pub struct HttpFixtureSource {
    http: Client,
    provider: String,
    base_url: String,
    api_key: Option<String>,
    limiter: Arc<RateLimiter>,
}

impl HttpFixtureSource {
    pub fn new(provider: &str, base_url: &str, api_key: Option<String>, limiter: Arc<RateLimiter>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(HttpFixtureSource {
            http,
            provider: provider.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            limiter,
        })
    }

    async fn get_json(&self, url: Url) -> Result<serde_json::Value> {
        let resp = self.http.get(url).send().await.context("fixture request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("fixture API error {}: {}", status, body);
        }
        resp.json().await.context("Failed to parse fixture response")
    }
}

#[async_trait]
impl FixtureSource for HttpFixtureSource {
    async fn fetch_fixtures(&self, sport: &str) -> Result<Vec<Fixture>> {
        let mut url = Url::parse(&format!("{}/sports/{}/events", self.base_url, sport))
            .context("bad fixture url")?;
        if let Some(key) = self.api_key.as_deref() {
            url.query_pairs_mut().append_pair("apiKey", key);
        }
        let cache_key = format!("fixtures:{}", sport);
        match self
            .limiter
            .call(&self.provider, &cache_key, || self.get_json(url))
            .await
        {
            ProviderResponse::Unavailable(reason) => anyhow::bail!("fixtures unavailable: {}", reason),
            resp => Ok(resp.body().map(|b| parse_fixtures(sport, b)).unwrap_or_default()),
        }
    }
}

fn parse_fixtures(sport: &str, raw: &serde_json::Value) -> Vec<Fixture> {
    let items = raw
        .as_array()
        .or_else(|| raw.get("fixtures").and_then(|v| v.as_array()))
        .or_else(|| raw.get("events").and_then(|v| v.as_array()));
    let Some(items) = items else {
        return vec![];
    };
    items
        .iter()
        .filter_map(|item| {
            let id = item["id"].as_str()?.to_string();
            let home = item["home_team"].as_str().or_else(|| item["home"].as_str())?;
            let away = item["away_team"].as_str().or_else(|| item["away"].as_str())?;
            let start_time = item["commence_time"]
                .as_str()
                .or_else(|| item["start_time"].as_str())
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc));
            Some(Fixture {
                id,
                sport: sport.to_string(),
                home_team: home.to_string(),
                away_team: away.to_string(),
                start_time,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct FakeSource {
        calls: AtomicU32,
        failing: AtomicBool,
    }

    impl FakeSource {
        fn new() -> Arc<Self> {
            Arc::new(FakeSource {
                calls: AtomicU32::new(0),
                failing: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl FixtureSource for FakeSource {
        async fn fetch_fixtures(&self, sport: &str) -> Result<Vec<Fixture>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("upstream down");
            }
            Ok(vec![Fixture {
                id: "F1".into(),
                sport: sport.into(),
                home_team: "Boston Celtics".into(),
                away_team: "Miami Heat".into(),
                start_time: None,
            }])
        }
    }

    fn fast_retry() -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(1),
            multiplier: 2.0,
            cap: Duration::from_millis(2),
            max_attempts: 2,
            jitter: 0.0,
        }
    }

    #[tokio::test]
    async fn test_resolve_fetches_once_within_ttl() {
        let source = FakeSource::new();
        let dir = FixtureDirectory::new(source.clone(), Duration::from_secs(300)).with_retry(fast_retry());
        let f = dir.resolve("NBA", "F1").await.unwrap();
        assert_eq!(f.home_team, "Boston Celtics");
        assert!(dir.resolve("nba", "F1").await.is_some());
        assert!(dir.resolve("nba", "F404").await.is_none());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_entries() {
        let source = FakeSource::new();
        let dir = FixtureDirectory::new(source.clone(), Duration::ZERO).with_retry(fast_retry());
        assert_eq!(dir.refresh("nba").await.unwrap(), 1);

        source.failing.store(true, Ordering::SeqCst);
        assert!(dir.refresh("nba").await.is_err());
        // TTL zero forces another (failing) refresh, the old entry still answers
        assert!(dir.resolve("nba", "F1").await.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resolves_share_one_refresh() {
        let source = FakeSource::new();
        let dir = FixtureDirectory::new(source.clone(), Duration::from_secs(300)).with_retry(fast_retry());
        let lookups: Vec<_> = (0..8)
            .map(|_| {
                let dir = dir.clone();
                tokio::spawn(async move { dir.resolve("nba", "F1").await })
            })
            .collect();
        for lookup in lookups {
            assert!(lookup.await.unwrap().is_some());
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sides_from_team_hint() {
        let f = Fixture {
            id: "F1".into(),
            sport: "nba".into(),
            home_team: "Boston Celtics".into(),
            away_team: "Miami Heat".into(),
            start_time: None,
        };
        assert_eq!(f.sides(Some("heat")), ("Miami Heat".to_string(), "Boston Celtics".to_string()));
        assert_eq!(
            f.sides(Some("Boston Celtics")),
            ("Boston Celtics".to_string(), "Miami Heat".to_string())
        );
        assert_eq!(f.sides(Some("Knicks")), ("Knicks".to_string(), UNKNOWN_TEAM.to_string()));
        assert_eq!(
            f.sides(None),
            (UNKNOWN_TEAM.to_string(), "Miami Heat @ Boston Celtics".to_string())
        );
    }

    #[test]
    fn test_parse_fixtures_skips_incomplete_rows() {
        let raw = serde_json::json!([
            {"id": "a", "home_team": "H", "away_team": "A", "commence_time": "2024-03-10T19:00:00Z"},
            {"id": "b", "home": "H2", "away": "A2"},
            {"id": "c", "home_team": "H3"}
        ]);
        let f = parse_fixtures("nba", &raw);
        assert_eq!(f.len(), 2);
        assert!(f[0].start_time.is_some());
        assert_eq!(f[1].away_team, "A2");
    }
}
