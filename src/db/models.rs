use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Side of a proposition or wager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Over,
    Under,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Over => "over",
            Direction::Under => "under",
        }
    }

    /// +1 for over, -1 for under. Used to sign line-value calculations.
    pub fn sign(&self) -> Decimal {
        match self {
            Direction::Over => Decimal::ONE,
            Direction::Under => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "over" => Ok(Direction::Over),
            "under" => Ok(Direction::Under),
            other => anyhow::bail!("unknown direction: {}", other),
        }
    }
}

/// One tradable player-stat line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposition {
    pub id: i64,
    pub sport: String,
    pub player: String,
    pub team: String,
    pub opponent: String,
    /// Canonical stat name, e.g. "Points"
    pub stat: String,
    /// Opening line; part of the identity key
    pub line: Decimal,
    /// Latest line seen for this proposition
    pub current_line: Option<Decimal>,
    pub direction: Direction,
    pub period: String,
    pub provider: String,
    pub fixture_id: Option<String>,
    pub market_id: Option<String>,
    /// 0–100
    pub confidence: i32,
    pub expected_value: Decimal,
    /// 0.0–1.0
    pub model_probability: f64,
    pub scheduled_start: Option<DateTime<Utc>>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Proposition {
    /// The line bettors currently see.
    pub fn effective_line(&self) -> Decimal {
        self.current_line.unwrap_or(self.line)
    }
}

/// A canonical proposition record produced by the normalizer, not yet stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProposition {
    pub sport: String,
    pub player: String,
    pub team: String,
    pub opponent: String,
    pub stat: String,
    pub line: Decimal,
    pub direction: Direction,
    pub period: String,
    pub provider: String,
    pub fixture_id: Option<String>,
    pub market_id: Option<String>,
    /// Listed in an alternate-lines market; each line is its own proposition
    #[serde(default)]
    pub alternate: bool,
    pub confidence: i32,
    pub expected_value: Decimal,
    pub model_probability: f64,
    pub scheduled_start: Option<DateTime<Utc>>,
}

impl NewProposition {
    /// Deduplication key. The fixture id only participates when present.
    pub fn identity_key(&self) -> String {
        identity_key(
            &self.sport,
            &self.player,
            &self.stat,
            self.line,
            self.direction,
            &self.provider,
            self.fixture_id.as_deref(),
            self.alternate,
        )
    }

    /// Identity without the line: every line offered for one player/stat/side
    /// by one provider in one fixture.
    pub fn slot_key(&self) -> String {
        slot_key(
            &self.sport,
            &self.player,
            &self.stat,
            self.direction,
            &self.provider,
            self.fixture_id.as_deref(),
            self.alternate,
        )
    }
}

pub fn identity_key(
    sport: &str,
    player: &str,
    stat: &str,
    line: Decimal,
    direction: Direction,
    provider: &str,
    fixture_id: Option<&str>,
    alternate: bool,
) -> String {
    let base = format!(
        "{}|{}|{}{}|{}|{}|{}",
        sport.to_lowercase(),
        player.to_lowercase(),
        stat.to_lowercase(),
        alt_marker(alternate),
        line.normalize(),
        direction,
        provider.to_lowercase()
    );
    match fixture_id {
        Some(f) => format!("{}|{}", base, f),
        None => base,
    }
}

pub fn slot_key(
    sport: &str,
    player: &str,
    stat: &str,
    direction: Direction,
    provider: &str,
    fixture_id: Option<&str>,
    alternate: bool,
) -> String {
    format!(
        "{}|{}|{}{}|{}|{}|{}",
        sport.to_lowercase(),
        player.to_lowercase(),
        stat.to_lowercase(),
        alt_marker(alternate),
        direction,
        provider.to_lowercase(),
        fixture_id.unwrap_or("-")
    )
}

fn alt_marker(alternate: bool) -> &'static str {
    if alternate {
        "~alt"
    } else {
        ""
    }
}

/// Immutable record of a line change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineMovementRecord {
    pub id: i64,
    pub proposition_id: i64,
    pub provider: String,
    pub old_line: Decimal,
    pub new_line: Decimal,
    pub delta: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Persisted per-provider call counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRateLimitCounter {
    pub provider: String,
    pub per_minute_count: u32,
    pub per_hour_count: u32,
    pub per_day_count: u32,
    /// Start of the current minute bucket
    pub window_started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    pub provider: String,
    pub cache_key: String,
    pub body: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WagerStatus {
    Pending,
    Won,
    Lost,
    Pushed,
}

impl WagerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WagerStatus::Pending => "pending",
            WagerStatus::Won => "won",
            WagerStatus::Lost => "lost",
            WagerStatus::Pushed => "pushed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, WagerStatus::Pending)
    }
}

impl fmt::Display for WagerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WagerStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WagerStatus::Pending),
            "won" => Ok(WagerStatus::Won),
            "lost" => Ok(WagerStatus::Lost),
            "pushed" => Ok(WagerStatus::Pushed),
            other => anyhow::bail!("unknown wager status: {}", other),
        }
    }
}

/// A user's bet on a proposition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wager {
    pub id: i64,
    pub user_id: i64,
    pub proposition_id: Option<i64>,
    /// Stake, debited at placement
    pub amount: Decimal,
    /// Decimal odds, e.g. 1.9
    pub odds: Decimal,
    /// amount × odds, credited in full on a win
    pub potential_return: Decimal,
    pub direction: Direction,
    pub opening_line: Decimal,
    pub closing_line: Option<Decimal>,
    pub clv: Option<Decimal>,
    pub status: WagerStatus,
    pub placed_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: i64,
    pub bankroll: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Final statistic for one player in one fixture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalStat {
    pub fixture_id: String,
    pub sport: String,
    pub player: String,
    pub stat: String,
    pub value: Decimal,
    pub recorded_at: DateTime<Utc>,
}

/// A pending wager joined with the proposition it was placed on.
#[derive(Debug, Clone)]
pub struct PendingGrade {
    pub wager: Wager,
    pub proposition: Proposition,
}
