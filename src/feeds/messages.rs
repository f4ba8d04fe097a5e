//! Wire format of the odds feed.
//!
//! Every frame is one JSON object tagged by `type`. Unknown types are a
//! parse error and are dropped by the transport.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One raw odds update for a single selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTick {
    pub provider: String,
    /// Provider market code, e.g. `player_points`
    pub market: String,
    /// Selection text, e.g. `J. Doe Over 24.5`
    pub selection: String,
    /// Decimal odds
    pub price: Decimal,
    #[serde(default, alias = "point")]
    pub line: Option<Decimal>,
    #[serde(default, alias = "fixtureId", alias = "event_id")]
    pub fixture_id: Option<String>,
    #[serde(default, alias = "playerId")]
    pub player_id: Option<String>,
    #[serde(default, alias = "playerName", alias = "description")]
    pub player_name: Option<String>,
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default, alias = "marketId")]
    pub market_id: Option<String>,
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default, alias = "commenceTime")]
    pub commence_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalStatLine {
    pub player: String,
    pub stat: String,
    pub value: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedEvent {
    Odds {
        #[serde(default)]
        resume_token: Option<String>,
        /// Full snapshot of the provider's board; untouched propositions are superseded
        #[serde(default)]
        refresh: bool,
        ticks: Vec<RawTick>,
    },
    Locked {
        #[serde(default)]
        resume_token: Option<String>,
        fixture_ids: Vec<String>,
    },
    Final {
        #[serde(default)]
        resume_token: Option<String>,
        fixture_id: String,
        #[serde(default)]
        stats: Vec<FinalStatLine>,
    },
    Heartbeat {
        #[serde(default)]
        resume_token: Option<String>,
    },
}

impl FeedEvent {
    pub fn resume_token(&self) -> Option<&str> {
        match self {
            FeedEvent::Odds { resume_token, .. }
            | FeedEvent::Locked { resume_token, .. }
            | FeedEvent::Final { resume_token, .. }
            | FeedEvent::Heartbeat { resume_token } => resume_token.as_deref(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FeedEvent::Odds { .. } => "odds",
            FeedEvent::Locked { .. } => "locked",
            FeedEvent::Final { .. } => "final",
            FeedEvent::Heartbeat { .. } => "heartbeat",
        }
    }
}

pub fn parse_frame(text: &str) -> Result<FeedEvent, serde_json::Error> {
    serde_json::from_str(text)
}

/// First frame sent after connecting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionRequest {
    pub action: &'static str,
    pub sport: String,
    pub providers: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub filters: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
}

impl SubscriptionRequest {
    pub fn new(sport: &str, providers: &[String], filters: &BTreeMap<String, String>) -> Self {
        SubscriptionRequest {
            action: "subscribe",
            sport: sport.to_string(),
            providers: providers.to_vec(),
            filters: filters.clone(),
            resume_token: None,
        }
    }

    pub fn resuming(mut self, token: Option<String>) -> Self {
        self.resume_token = token;
        self
    }

    pub fn to_json(&self) -> String {
        // Plain strings and maps cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_odds_frame() {
        let text = r#"{
            "type": "odds",
            "resume_token": "r-17",
            "ticks": [{
                "provider": "X", "market": "player_points",
                "selection": "J. Doe Over 24.5", "price": 1.9,
                "line": 24.5, "fixtureId": "F1"
            }]
        }"#;
        let ev = parse_frame(text).unwrap();
        assert_eq!(ev.kind(), "odds");
        assert_eq!(ev.resume_token(), Some("r-17"));
        match ev {
            FeedEvent::Odds { refresh, ticks, .. } => {
                assert!(!refresh);
                assert_eq!(ticks[0].line, Some(dec!(24.5)));
                assert_eq!(ticks[0].fixture_id.as_deref(), Some("F1"));
                assert_eq!(ticks[0].player_name, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_locked_final_and_heartbeat() {
        let locked = parse_frame(r#"{"type":"locked","fixture_ids":["F1","F2"]}"#).unwrap();
        assert_eq!(
            locked,
            FeedEvent::Locked { resume_token: None, fixture_ids: vec!["F1".into(), "F2".into()] }
        );

        let fin = parse_frame(
            r#"{"type":"final","resume_token":"9","fixture_id":"F1","stats":[{"player":"J. Doe","stat":"Points","value":26}]}"#,
        )
        .unwrap();
        match fin {
            FeedEvent::Final { stats, .. } => assert_eq!(stats[0].value, dec!(26)),
            other => panic!("unexpected {:?}", other),
        }

        let hb = parse_frame(r#"{"type":"heartbeat","resume_token":"10"}"#).unwrap();
        assert_eq!(hb.resume_token(), Some("10"));
    }

    #[test]
    fn test_unknown_type_is_an_error() {
        assert!(parse_frame(r#"{"type":"scores"}"#).is_err());
        assert!(parse_frame("not json").is_err());
    }

    #[test]
    fn test_subscription_request_json() {
        let req = SubscriptionRequest::new("nba", &["a".to_string(), "b".to_string()], &BTreeMap::new());
        let v: serde_json::Value = serde_json::from_str(&req.to_json()).unwrap();
        assert_eq!(v["action"], "subscribe");
        assert!(v.get("resume_token").is_none());
        assert!(v.get("filters").is_none());

        let resumed = req.resuming(Some("r-3".into()));
        let v: serde_json::Value = serde_json::from_str(&resumed.to_json()).unwrap();
        assert_eq!(v["resume_token"], "r-3");
        assert_eq!(v["providers"][1], "b");
    }
}
