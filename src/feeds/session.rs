//! Per-session reconnect state.
//!
//! Pure bookkeeping with no I/O: the manager's read loop reports connects,
//! events and failures, and this decides whether and when to reconnect.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use super::messages::SubscriptionRequest;
use crate::backoff::{Backoff, BackoffPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connecting,
    Connected,
    Backoff,
    Exhausted,
    Stopped,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// Consecutive failures without a single inbound event
    pub failure_ceiling: u32,
    /// Reconnect attempts without a successful handshake
    pub episode_ceiling: u32,
    pub backoff: BackoffPolicy,
}

impl Default for SessionLimits {
    fn default() -> Self {
        SessionLimits {
            failure_ceiling: 10,
            episode_ceiling: 5,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustReason {
    FailureCeiling,
    EpisodeCeiling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    Reconnect(Duration),
    Exhausted(ExhaustReason),
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub sport: String,
    pub providers: Vec<String>,
    pub status: SessionStatus,
    pub consecutive_failures: u32,
    pub episode_reconnect_attempts: u32,
    pub current_backoff_ms: u64,
    pub last_resume_token: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct StreamSession {
    pub id: Uuid,
    pub sport: String,
    pub providers: Vec<String>,
    pub filters: BTreeMap<String, String>,
    last_resume_token: Option<String>,
    consecutive_failures: u32,
    episode_attempts: u32,
    backoff: Backoff,
    connected_at: Option<DateTime<Utc>>,
    status: SessionStatus,
    limits: SessionLimits,
}

impl StreamSession {
    pub fn new(
        sport: &str,
        providers: Vec<String>,
        filters: BTreeMap<String, String>,
        limits: SessionLimits,
    ) -> Self {
        StreamSession {
            id: Uuid::new_v4(),
            sport: sport.to_string(),
            providers,
            filters,
            last_resume_token: None,
            consecutive_failures: 0,
            episode_attempts: 0,
            backoff: limits.backoff.start(),
            connected_at: None,
            status: SessionStatus::Connecting,
            limits,
        }
    }

    /// Request for the next connect, resuming from the last token seen.
    pub fn subscription_request(&self) -> SubscriptionRequest {
        SubscriptionRequest::new(&self.sport, &self.providers, &self.filters)
            .resuming(self.last_resume_token.clone())
    }

    pub fn on_connecting(&mut self) {
        self.status = SessionStatus::Connecting;
    }

    /// Handshake succeeded: the failure episode is over.
    pub fn on_connected(&mut self, now: DateTime<Utc>) {
        self.episode_attempts = 0;
        self.connected_at = Some(now);
        self.status = SessionStatus::Connected;
    }

    /// Any inbound application event proves the entitlement works.
    pub fn on_event(&mut self, resume_token: Option<&str>) {
        self.consecutive_failures = 0;
        self.backoff.reset();
        if let Some(token) = resume_token {
            self.last_resume_token = Some(token.to_string());
        }
    }

    pub fn on_transport_error(&mut self) -> FailureDecision {
        self.consecutive_failures += 1;
        self.connected_at = None;

        if self.consecutive_failures >= self.limits.failure_ceiling {
            self.status = SessionStatus::Exhausted;
            return FailureDecision::Exhausted(ExhaustReason::FailureCeiling);
        }
        if self.episode_attempts >= self.limits.episode_ceiling {
            self.status = SessionStatus::Exhausted;
            return FailureDecision::Exhausted(ExhaustReason::EpisodeCeiling);
        }

        self.episode_attempts += 1;
        self.status = SessionStatus::Backoff;
        FailureDecision::Reconnect(self.backoff.next_delay_jittered())
    }

    pub fn on_stopped(&mut self) {
        self.status = SessionStatus::Stopped;
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn last_resume_token(&self) -> Option<&str> {
        self.last_resume_token.as_deref()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id,
            sport: self.sport.clone(),
            providers: self.providers.clone(),
            status: self.status,
            consecutive_failures: self.consecutive_failures,
            episode_reconnect_attempts: self.episode_attempts,
            current_backoff_ms: self.backoff.current().as_millis() as u64,
            last_resume_token: self.last_resume_token.clone(),
            connected_at: self.connected_at,
        }
    }
}
