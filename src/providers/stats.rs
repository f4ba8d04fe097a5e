use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use url::Url;

use super::rate_limit::{ProviderResponse, RateLimiter};

/// The provider could not answer and there was nothing cached.
#[derive(Debug, Clone, Error)]
#[error("stat provider unavailable: {0}")]
pub struct Unavailable(pub String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerCandidate {
    pub id: String,
    pub name: String,
    pub team: Option<String>,
}

/// Season statistics lookup used to enrich scoring features.
#[async_trait]
pub trait SeasonStats: Send + Sync {
    /// Per-game season average for a canonical stat, if the provider knows it.
    async fn season_average(&self, player: &str, stat: &str) -> Option<f64>;
}

/// Client for the player statistics REST API. Every call goes through the
/// rate limiter and may be answered from its cache.
#[derive(Clone)]
pub struct StatsClient {
    http: Client,
    provider: String,
    base_url: String,
    api_key: Option<String>,
    limiter: Arc<RateLimiter>,
}

impl StatsClient {
    pub fn new(
        provider: &str,
        base_url: &str,
        api_key: Option<String>,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(StatsClient {
            http,
            provider: provider.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            limiter,
        })
    }

    fn url(&self, path: &str, query: &[(&str, &str)]) -> Result<Url> {
        let mut pairs: Vec<(&str, &str)> = query.to_vec();
        if let Some(key) = self.api_key.as_deref() {
            pairs.push(("api_key", key));
        }
        Url::parse_with_params(&format!("{}{}", self.base_url, path), pairs)
            .with_context(|| format!("bad stats url for {}", path))
    }

    async fn get_json(&self, url: Url) -> Result<serde_json::Value> {
        debug!("GET {}", url.path());
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .context("stats API request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("stats API error {}: {}", status, body);
        }
        resp.json().await.context("Failed to parse stats API response")
    }

    /// Find players matching a display name.
    pub async fn search_player(&self, name: &str) -> std::result::Result<Vec<PlayerCandidate>, Unavailable> {
        let url = self.url("/players/search", &[("name", name)]).map_err(|e| Unavailable(e.to_string()))?;
        let cache_key = format!("search:{}", name.to_lowercase());
        let resp = self
            .limiter
            .call(&self.provider, &cache_key, || self.get_json(url))
            .await;
        match resp {
            ProviderResponse::Unavailable(reason) => Err(Unavailable(reason)),
            other => Ok(other.body().map(parse_candidates).unwrap_or_default()),
        }
    }

    /// Season stat map for a player id, keyed by lower-case stat key.
    pub async fn season_stats(&self, player_id: &str) -> std::result::Result<HashMap<String, f64>, Unavailable> {
        let url = self
            .url(&format!("/players/{}/season", player_id), &[])
            .map_err(|e| Unavailable(e.to_string()))?;
        let cache_key = format!("season:{}", player_id);
        let resp = self
            .limiter
            .call(&self.provider, &cache_key, || self.get_json(url))
            .await;
        match resp {
            ProviderResponse::Unavailable(reason) => Err(Unavailable(reason)),
            other => Ok(other.body().map(parse_stat_map).unwrap_or_default()),
        }
    }
}

#[async_trait]
impl SeasonStats for StatsClient {
    async fn season_average(&self, player: &str, stat: &str) -> Option<f64> {
        let candidates = match self.search_player(player).await {
            Ok(c) => c,
            Err(e) => {
                debug!("{}: {}", player, e);
                return None;
            }
        };
        let best = best_candidate(&candidates, player)?;
        let stats = self.season_stats(&best.id).await.ok()?;
        stats.get(&stat_key(stat)).copied()
    }
}

// ── Parsing helpers ────────────────────────────────────────────────────────────

/// "Pts+Rebs+Asts" → "pts_rebs_asts", "Passing Yards" → "passing_yards"
pub fn stat_key(stat: &str) -> String {
    stat.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

fn parse_candidates(raw: &serde_json::Value) -> Vec<PlayerCandidate> {
    let items = match raw.as_array() {
        Some(a) => a,
        None => match raw.get("players").and_then(|v| v.as_array()) {
            Some(a) => a,
            None => return vec![],
        },
    };
    items
        .iter()
        .filter_map(|item| {
            let id = item["id"]
                .as_str()
                .map(str::to_string)
                .or_else(|| item["id"].as_u64().map(|n| n.to_string()))?;
            let name = item["name"].as_str()?.to_string();
            Some(PlayerCandidate {
                id,
                name,
                team: item["team"].as_str().map(str::to_string),
            })
        })
        .collect()
}

fn parse_stat_map(raw: &serde_json::Value) -> HashMap<String, f64> {
    let obj = raw
        .get("stats")
        .and_then(|v| v.as_object())
        .or_else(|| raw.as_object());
    let Some(obj) = obj else {
        return HashMap::new();
    };
    obj.iter()
        .filter_map(|(k, v)| {
            let n = v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))?;
            Some((stat_key(k), n))
        })
        .collect()
}

/// Exact (case-insensitive) name match first, else the first candidate.
fn best_candidate<'a>(candidates: &'a [PlayerCandidate], name: &str) -> Option<&'a PlayerCandidate> {
    candidates
        .iter()
        .find(|c| c.name.eq_ignore_ascii_case(name))
        .or_else(|| candidates.first())
}
