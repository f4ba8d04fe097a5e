//! Per-provider call budget with a persisted response cache.
//!
//! Counters live in the database so every process sharing it sees roughly the
//! same usage. The check-then-increment is not serialized across processes;
//! a race can only overcount, which makes the limiter slightly more
//! conservative.

use anyhow::Result;
use chrono::{DateTime, Timelike, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::db::models::ProviderRateLimitCounter;
use crate::db::Database;

/// Source of the current time. Injected so tests can move time by hand.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimits {
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        RateLimits {
            per_minute: 30,
            per_hour: 500,
            per_day: 5000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitWindow {
    Minute,
    Hour,
    Day,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Limited(LimitWindow),
}

/// Result of a rate-limited provider call. Callers proceed with defaults on
/// `Unavailable` instead of failing.
#[derive(Debug, Clone)]
pub enum ProviderResponse {
    Fresh(serde_json::Value),
    Cached {
        body: serde_json::Value,
        fetched_at: DateTime<Utc>,
    },
    Unavailable(String),
}

impl ProviderResponse {
    pub fn body(&self) -> Option<&serde_json::Value> {
        match self {
            ProviderResponse::Fresh(b) => Some(b),
            ProviderResponse::Cached { body, .. } => Some(body),
            ProviderResponse::Unavailable(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CounterView {
    #[serde(flatten)]
    pub counter: ProviderRateLimitCounter,
    pub limits: RateLimits,
}

pub struct RateLimiter {
    db: Database,
    default_limits: RateLimits,
    overrides: HashMap<String, RateLimits>,
    /// Cached responses younger than this are served without calling upstream
    fresh_for: Duration,
    call_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(db: Database, default_limits: RateLimits, fresh_for: Duration, call_timeout: Duration) -> Self {
        Self::with_clock(db, default_limits, fresh_for, call_timeout, Arc::new(SystemClock))
    }

    pub fn with_clock(
        db: Database,
        default_limits: RateLimits,
        fresh_for: Duration,
        call_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        RateLimiter {
            db,
            default_limits,
            overrides: HashMap::new(),
            fresh_for,
            call_timeout,
            clock,
        }
    }

    /// Use different limits for one provider.
    pub fn set_limits(&mut self, provider: &str, limits: RateLimits) {
        self.overrides.insert(provider.to_string(), limits);
    }

    pub fn limits_for(&self, provider: &str) -> RateLimits {
        self.overrides
            .get(provider)
            .copied()
            .unwrap_or(self.default_limits)
    }

    /// Consume one call from the provider's budget if any window has room.
    pub fn check_and_increment(&self, provider: &str) -> Result<Admission> {
        let now = self.clock.now();
        let limits = self.limits_for(provider);
        let mut counter = self
            .db
            .get_rate_limit_counter(provider)?
            .unwrap_or_else(|| ProviderRateLimitCounter {
                provider: provider.to_string(),
                per_minute_count: 0,
                per_hour_count: 0,
                per_day_count: 0,
                window_started_at: minute_bucket(now),
            });
        roll_windows(&mut counter, now);

        let admission = if counter.per_day_count >= limits.per_day {
            Admission::Limited(LimitWindow::Day)
        } else if counter.per_hour_count >= limits.per_hour {
            Admission::Limited(LimitWindow::Hour)
        } else if counter.per_minute_count >= limits.per_minute {
            Admission::Limited(LimitWindow::Minute)
        } else {
            counter.per_minute_count += 1;
            counter.per_hour_count += 1;
            counter.per_day_count += 1;
            Admission::Allowed
        };
        self.db.save_rate_limit_counter(&counter)?;
        Ok(admission)
    }

    /// Make one provider call under the budget, falling back to the cache.
    pub async fn call<F, Fut>(&self, provider: &str, cache_key: &str, fetch: F) -> ProviderResponse
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value>>,
    {
        let now = self.clock.now();
        let cached = match self.db.get_cached_response(provider, cache_key) {
            Ok(c) => c,
            Err(e) => {
                warn!("[{}] cache read failed for {}: {:#}", provider, cache_key, e);
                None
            }
        };

        if let Some(c) = &cached {
            let age = (now - c.fetched_at).to_std().unwrap_or_default();
            if age < self.fresh_for {
                debug!("[{}] cache hit for {} ({:?} old)", provider, cache_key, age);
                return ProviderResponse::Cached {
                    body: c.body.clone(),
                    fetched_at: c.fetched_at,
                };
            }
        }

        let admission = match self.check_and_increment(provider) {
            Ok(a) => a,
            Err(e) => {
                // Counter storage trouble must not block the call path.
                warn!("[{}] rate-limit counter unavailable: {:#}", provider, e);
                Admission::Allowed
            }
        };

        if let Admission::Limited(window) = admission {
            warn!("[{}] rate limit hit ({:?} window) for {}", provider, window, cache_key);
            return stale_or_unavailable(cached, format!("rate limited ({:?} window)", window));
        }

        match tokio::time::timeout(self.call_timeout, fetch()).await {
            Ok(Ok(body)) => {
                if let Err(e) = self.db.put_cached_response(provider, cache_key, &body, now) {
                    warn!("[{}] cache write failed for {}: {:#}", provider, cache_key, e);
                }
                ProviderResponse::Fresh(body)
            }
            Ok(Err(e)) => {
                warn!("[{}] call failed for {}: {:#}", provider, cache_key, e);
                stale_or_unavailable(cached, format!("{:#}", e))
            }
            Err(_) => {
                warn!("[{}] call timed out after {:?} for {}", provider, self.call_timeout, cache_key);
                stale_or_unavailable(cached, format!("timed out after {:?}", self.call_timeout))
            }
        }
    }

    /// Counters for every provider that has made a call, with their limits.
    pub fn snapshot(&self) -> Result<Vec<CounterView>> {
        let now = self.clock.now();
        Ok(self
            .db
            .list_rate_limit_counters()?
            .into_iter()
            .map(|mut counter| {
                roll_windows(&mut counter, now);
                let limits = self.limits_for(&counter.provider);
                CounterView { counter, limits }
            })
            .collect())
    }
}

fn stale_or_unavailable(
    cached: Option<crate::db::models::CachedResponse>,
    reason: String,
) -> ProviderResponse {
    match cached {
        Some(c) => ProviderResponse::Cached {
            body: c.body,
            fetched_at: c.fetched_at,
        },
        None => ProviderResponse::Unavailable(reason),
    }
}

fn minute_bucket(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

/// Zero the counts whose calendar window has passed since the counter's
/// window start, then move the window start to the current minute.
fn roll_windows(counter: &mut ProviderRateLimitCounter, now: DateTime<Utc>) {
    let start = counter.window_started_at;
    let same_day = start.date_naive() == now.date_naive();
    let same_hour = same_day && start.hour() == now.hour();
    let same_minute = same_hour && start.minute() == now.minute();

    if !same_day {
        counter.per_day_count = 0;
    }
    if !same_hour {
        counter.per_hour_count = 0;
    }
    if !same_minute {
        counter.per_minute_count = 0;
    }
    counter.window_started_at = minute_bucket(now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        fn at(t: DateTime<Utc>) -> Arc<Self> {
            Arc::new(ManualClock(Mutex::new(t)))
        }

        fn advance(&self, d: chrono::Duration) {
            let mut t = self.0.lock().unwrap();
            *t = *t + d;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    fn limiter(clock: Arc<ManualClock>, limits: RateLimits, fresh_for: Duration) -> RateLimiter {
        RateLimiter::with_clock(
            Database::open_in_memory().unwrap(),
            limits,
            fresh_for,
            Duration::from_secs(1),
            clock,
        )
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 12, 30, 15).unwrap()
    }

    #[test]
    fn test_minute_window_blocks_then_rolls() {
        let clock = ManualClock::at(t0());
        let rl = limiter(
            clock.clone(),
            RateLimits { per_minute: 2, per_hour: 100, per_day: 100 },
            Duration::ZERO,
        );
        assert_eq!(rl.check_and_increment("stats").unwrap(), Admission::Allowed);
        assert_eq!(rl.check_and_increment("stats").unwrap(), Admission::Allowed);
        assert_eq!(
            rl.check_and_increment("stats").unwrap(),
            Admission::Limited(LimitWindow::Minute)
        );

        clock.advance(chrono::Duration::seconds(60));
        assert_eq!(rl.check_and_increment("stats").unwrap(), Admission::Allowed);
        let snap = rl.snapshot().unwrap();
        assert_eq!(snap[0].counter.per_minute_count, 1);
        assert_eq!(snap[0].counter.per_hour_count, 3);
    }

    #[test]
    fn test_day_window_resets_at_midnight() {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2024, 3, 10, 23, 59, 0).unwrap());
        let rl = limiter(
            clock.clone(),
            RateLimits { per_minute: 10, per_hour: 10, per_day: 1 },
            Duration::ZERO,
        );
        assert_eq!(rl.check_and_increment("stats").unwrap(), Admission::Allowed);
        assert_eq!(
            rl.check_and_increment("stats").unwrap(),
            Admission::Limited(LimitWindow::Day)
        );
        clock.advance(chrono::Duration::minutes(2));
        assert_eq!(rl.check_and_increment("stats").unwrap(), Admission::Allowed);
    }

    #[test]
    fn test_limits_are_per_provider() {
        let clock = ManualClock::at(t0());
        let mut rl = limiter(clock, RateLimits { per_minute: 1, per_hour: 10, per_day: 10 }, Duration::ZERO);
        rl.set_limits("generous", RateLimits { per_minute: 5, per_hour: 10, per_day: 10 });
        assert_eq!(rl.check_and_increment("stats").unwrap(), Admission::Allowed);
        assert!(matches!(rl.check_and_increment("stats").unwrap(), Admission::Limited(_)));
        assert_eq!(rl.check_and_increment("generous").unwrap(), Admission::Allowed);
        assert_eq!(rl.check_and_increment("generous").unwrap(), Admission::Allowed);
    }

    #[tokio::test]
    async fn test_limited_call_serves_stale_cache() {
        let clock = ManualClock::at(t0());
        let rl = limiter(
            clock.clone(),
            RateLimits { per_minute: 1, per_hour: 100, per_day: 100 },
            Duration::ZERO,
        );
        let first = rl
            .call("stats", "player:1", || async { Ok(serde_json::json!({"pts": 25})) })
            .await;
        assert!(matches!(first, ProviderResponse::Fresh(_)));

        let calls = AtomicU32::new(0);
        let second = rl
            .call("stats", "player:1", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::json!({"pts": 99}))
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 0, "limited call must not reach upstream");
        match second {
            ProviderResponse::Cached { body, .. } => assert_eq!(body["pts"], 25),
            other => panic!("expected cached response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_limited_call_without_cache_is_unavailable() {
        let clock = ManualClock::at(t0());
        let rl = limiter(clock, RateLimits { per_minute: 0, per_hour: 100, per_day: 100 }, Duration::ZERO);
        let res = rl
            .call("stats", "player:1", || async { Ok(serde_json::json!({})) })
            .await;
        assert!(matches!(res, ProviderResponse::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_failed_call_falls_back_to_cache() {
        let clock = ManualClock::at(t0());
        let rl = limiter(clock, RateLimits::default(), Duration::ZERO);
        rl.call("stats", "k", || async { Ok(serde_json::json!({"v": 1})) }).await;
        let res = rl
            .call("stats", "k", || async { anyhow::bail!("503 from upstream") })
            .await;
        assert_eq!(res.body().unwrap()["v"], 1);
    }

    #[tokio::test]
    async fn test_fresh_cache_skips_upstream_and_budget() {
        let clock = ManualClock::at(t0());
        let rl = limiter(clock, RateLimits::default(), Duration::from_secs(60));
        rl.call("stats", "k", || async { Ok(serde_json::json!({"v": 1})) }).await;
        let res = rl
            .call("stats", "k", || async { Ok(serde_json::json!({"v": 2})) })
            .await;
        assert_eq!(res.body().unwrap()["v"], 1);
        assert_eq!(rl.snapshot().unwrap()[0].counter.per_minute_count, 1);
    }
}
