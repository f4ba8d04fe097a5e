//! Exponential backoff shared by the stream manager and outbound HTTP calls.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry policy: delays start at `initial`, grow by `multiplier` per attempt
/// and never exceed `cap`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub cap: Duration,
    /// Attempts allowed before giving up (bounds one failure episode)
    pub max_attempts: u32,
    /// Up to this fraction of the delay is added as random jitter
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            initial: Duration::from_secs(5),
            multiplier: 2.0,
            cap: Duration::from_secs(300),
            max_attempts: 5,
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    /// Short policy for request/response calls.
    pub fn for_requests() -> Self {
        BackoffPolicy {
            initial: Duration::from_millis(250),
            multiplier: 2.0,
            cap: Duration::from_secs(2),
            max_attempts: 3,
            jitter: 0.2,
        }
    }

    pub fn start(&self) -> Backoff {
        Backoff {
            policy: *self,
            current: self.initial,
        }
    }
}

/// Mutable backoff state for one retry episode.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl Backoff {
    /// The delay the next failure will wait, without jitter.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Return the delay to wait now and grow the stored delay for next time.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let grown = delay.mul_f64(self.policy.multiplier.max(1.0));
        self.current = grown.min(self.policy.cap);
        delay.min(self.policy.cap)
    }

    /// `next_delay` plus random jitter, for sleeping.
    pub fn next_delay_jittered(&mut self) -> Duration {
        let base = self.next_delay();
        if self.policy.jitter <= 0.0 {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.policy.jitter);
        base + base.mul_f64(extra)
    }

    pub fn reset(&mut self) {
        self.current = self.policy.initial;
    }
}

/// Run `op` until it succeeds or the policy's attempts are used up.
pub async fn retry<T, F, Fut>(policy: BackoffPolicy, what: &str, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut backoff = policy.start();
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= policy.max_attempts.max(1) => {
                return Err(e.context(format!("{} failed after {} attempts", what, attempt)));
            }
            Err(e) => {
                let delay = backoff.next_delay_jittered();
                warn!("{} failed (attempt {}): {:#}; retrying in {:?}", what, attempt, e, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_delays_double_until_cap() {
        let policy = BackoffPolicy::default();
        let mut b = policy.start();
        let delays: Vec<u64> = (0..9).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 160, 300, 300, 300]);
    }

    #[test]
    fn test_delays_never_decrease_and_respect_cap() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(7),
            multiplier: 3.0,
            cap: Duration::from_millis(1000),
            max_attempts: 5,
            jitter: 0.0,
        };
        let mut b = policy.start();
        let mut last = Duration::ZERO;
        for _ in 0..50 {
            let d = b.next_delay();
            assert!(d >= last);
            assert!(d <= policy.cap);
            last = d;
        }
    }

    #[test]
    fn test_reset_returns_to_initial() {
        let policy = BackoffPolicy::default();
        let mut b = policy.start();
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.current(), policy.initial);
        assert_eq!(b.next_delay(), policy.initial);
    }

    #[test]
    fn test_jitter_only_adds() {
        let policy = BackoffPolicy {
            jitter: 0.5,
            ..BackoffPolicy::default()
        };
        let mut b = policy.start();
        let d = b.next_delay_jittered();
        assert!(d >= Duration::from_secs(5));
        assert!(d <= Duration::from_millis(7500));
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = BackoffPolicy {
            initial: Duration::from_millis(1),
            cap: Duration::from_millis(2),
            max_attempts: 3,
            jitter: 0.0,
            multiplier: 2.0,
        };
        let c = Arc::clone(&calls);
        let res: anyhow::Result<()> = retry(policy, "fetch", || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("boom")
            }
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_returns_first_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = BackoffPolicy {
            initial: Duration::from_millis(1),
            ..BackoffPolicy::for_requests()
        };
        let c = Arc::clone(&calls);
        let res = retry(policy, "fetch", || {
            let c = Arc::clone(&c);
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("first call fails")
                }
                Ok(42)
            }
        })
        .await
        .unwrap();
        assert_eq!(res, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
