//! Scoring collaborator. The model itself is external; this module only
//! defines what goes in, what comes back and how to call it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::db::models::Direction;

#[derive(Debug, Clone, Serialize)]
pub struct Features {
    pub sport: String,
    pub player: String,
    pub team: String,
    pub opponent: String,
    pub stat: String,
    pub line: Decimal,
    pub direction: Direction,
    /// Decimal odds of the selection
    pub price: Decimal,
    /// 1 / price, 0 when the price is unusable
    pub implied_probability: f64,
    pub season_average: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Score {
    pub confidence: i32,
    pub expected_value: Decimal,
    pub probability: f64,
}

impl Score {
    /// Used when the scorer is slow or failing.
    pub fn neutral() -> Self {
        Score {
            confidence: 50,
            expected_value: Decimal::ZERO,
            probability: 0.5,
        }
    }

    fn clamped(self) -> Self {
        Score {
            confidence: self.confidence.clamp(0, 100),
            expected_value: self.expected_value,
            probability: if self.probability.is_finite() {
                self.probability.clamp(0.0, 1.0)
            } else {
                0.5
            },
        }
    }
}

#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(&self, features: &Features) -> Result<Score>;
}

/// Always returns the neutral score.
pub struct NeutralScorer;

#[async_trait]
impl Scorer for NeutralScorer {
    async fn score(&self, _features: &Features) -> Result<Score> {
        Ok(Score::neutral())
    }
}

/// POSTs features as JSON to a scoring service.
pub struct RemoteScorer {
    http: Client,
    url: String,
}

impl RemoteScorer {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(RemoteScorer {
            http,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Scorer for RemoteScorer {
    async fn score(&self, features: &Features) -> Result<Score> {
        debug!("Scoring {} {} {}", features.player, features.direction, features.stat);
        let resp = self
            .http
            .post(&self.url)
            .json(features)
            .send()
            .await
            .context("scoring request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("scoring service returned {}", resp.status());
        }
        let score: Score = resp.json().await.context("Failed to parse score")?;
        Ok(score.clamped())
    }
}
