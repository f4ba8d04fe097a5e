//! Stream connection manager.
//!
//! ```text
//!  odds feed ──▶ read task (one per session) ──▶ ordered queue ──▶ processor task ──▶ FeedSink
//!                  │ reconnect/backoff via StreamSession
//!                  └ stop signal (watch)
//! ```
//!
//! Sessions are keyed by sport plus the sorted provider set, so starting the
//! same stream twice returns the existing session.

pub mod messages;
pub mod session;
pub mod transport;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::fixtures::FixtureDirectory;
use messages::FeedEvent;
use session::{FailureDecision, SessionLimits, SessionSnapshot, StreamSession};
use transport::FeedTransport;

/// Consumer of a session's events, called in delivery order.
#[async_trait]
pub trait FeedSink: Send + Sync {
    async fn handle(&self, sport: &str, event: FeedEvent);
}

const QUEUE_DEPTH: usize = 256;

struct SessionHandle {
    key: String,
    state: Arc<Mutex<StreamSession>>,
    shutdown: watch::Sender<bool>,
}

#[derive(Default)]
struct Registry {
    by_id: HashMap<Uuid, SessionHandle>,
    by_key: HashMap<String, Uuid>,
}

impl Registry {
    fn remove(&mut self, id: Uuid) -> Option<SessionHandle> {
        let handle = self.by_id.remove(&id)?;
        self.by_key.remove(&handle.key);
        Some(handle)
    }
}

struct ManagerInner {
    transport: Arc<dyn FeedTransport>,
    sink: Arc<dyn FeedSink>,
    fixtures: Option<FixtureDirectory>,
    limits: SessionLimits,
    registry: Mutex<Registry>,
}

impl ManagerInner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_registered(&self, id: Uuid) -> bool {
        self.registry().by_id.contains_key(&id)
    }
}

#[derive(Clone)]
pub struct StreamManager {
    inner: Arc<ManagerInner>,
}

/// `sport:provider,provider` with providers lower-cased, sorted and deduplicated.
pub fn session_key(sport: &str, providers: &[String]) -> (String, Vec<String>) {
    let mut normalized: Vec<String> = providers
        .iter()
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();
    let key = format!("{}:{}", sport.trim().to_lowercase(), normalized.join(","));
    (key, normalized)
}

fn lock_session(state: &Mutex<StreamSession>) -> MutexGuard<'_, StreamSession> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StreamManager {
    pub fn new(
        transport: Arc<dyn FeedTransport>,
        sink: Arc<dyn FeedSink>,
        fixtures: Option<FixtureDirectory>,
        limits: SessionLimits,
    ) -> Self {
        StreamManager {
            inner: Arc::new(ManagerInner {
                transport,
                sink,
                fixtures,
                limits,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    /// Start streaming a sport from a provider set, or return the session
    /// already doing so.
    pub fn start_stream(
        &self,
        sport: &str,
        providers: &[String],
        filters: BTreeMap<String, String>,
    ) -> Result<Uuid> {
        let (key, providers) = session_key(sport, providers);
        if providers.is_empty() {
            anyhow::bail!("at least one provider is required");
        }
        let sport = sport.trim().to_lowercase();
        if sport.is_empty() {
            anyhow::bail!("sport is required");
        }

        let mut registry = self.inner.registry();
        if let Some(id) = registry.by_key.get(&key) {
            return Ok(*id);
        }

        let session = StreamSession::new(&sport, providers, filters, self.inner.limits);
        let id = session.id;
        let state = Arc::new(Mutex::new(session));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_DEPTH);

        registry.by_key.insert(key.clone(), id);
        registry.by_id.insert(
            id,
            SessionHandle {
                key: key.clone(),
                state: Arc::clone(&state),
                shutdown: shutdown_tx,
            },
        );
        drop(registry);

        tokio::spawn(run_processor(Arc::clone(&self.inner.sink), sport.clone(), queue_rx));
        tokio::spawn(run_session(Arc::clone(&self.inner), id, state, queue_tx, shutdown_rx));

        info!("Stream {} started for {}", id, key);
        Ok(id)
    }

    /// Stop a session. Returns false for an unknown id.
    pub fn stop_stream(&self, id: Uuid) -> bool {
        let Some(handle) = self.inner.registry().remove(id) else {
            return false;
        };
        lock_session(&handle.state).on_stopped();
        let _ = handle.shutdown.send(true);
        info!("Stream {} stopped ({})", id, handle.key);
        true
    }

    pub fn list_active(&self) -> Vec<Uuid> {
        self.inner.registry().by_id.keys().copied().collect()
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let registry = self.inner.registry();
        let mut snaps: Vec<SessionSnapshot> = registry
            .by_id
            .values()
            .map(|h| lock_session(&h.state).snapshot())
            .collect();
        snaps.sort_by(|a, b| a.sport.cmp(&b.sport).then(a.providers.cmp(&b.providers)));
        snaps
    }

    pub fn stop_all(&self) {
        for id in self.list_active() {
            self.stop_stream(id);
        }
    }
}

/// Drain one session's queue in delivery order.
async fn run_processor(sink: Arc<dyn FeedSink>, sport: String, mut queue: mpsc::Receiver<FeedEvent>) {
    while let Some(event) = queue.recv().await {
        sink.handle(&sport, event).await;
    }
}

/// Connect, read and reconnect until stopped or a failure ceiling is hit.
async fn run_session(
    inner: Arc<ManagerInner>,
    id: Uuid,
    state: Arc<Mutex<StreamSession>>,
    queue: mpsc::Sender<FeedEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let sport = lock_session(&state).sport.clone();
    if let Some(fixtures) = &inner.fixtures {
        fixtures.ensure_fresh(&sport).await;
    }

    loop {
        // Also covers a stop that raced the reconnect timer.
        if !inner.is_registered(id) || *shutdown.borrow() {
            return;
        }

        let request = {
            let mut s = lock_session(&state);
            s.on_connecting();
            s.subscription_request()
        };

        let connected = tokio::select! {
            res = inner.transport.connect(&request) => res,
            _ = shutdown.changed() => return,
        };

        match connected {
            Ok(mut conn) => {
                lock_session(&state).on_connected(Utc::now());
                loop {
                    tokio::select! {
                        res = conn.next_event() => match res {
                            Ok(event) => {
                                lock_session(&state).on_event(event.resume_token());
                                if queue.send(event).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                warn!("[{}] Stream {} dropped: {}", sport, id, e);
                                break;
                            }
                        },
                        _ = shutdown.changed() => return,
                    }
                }
            }
            Err(e) => {
                warn!("[{}] Stream {} connect failed: {}", sport, id, e);
            }
        }

        let decision = lock_session(&state).on_transport_error();
        match decision {
            FailureDecision::Reconnect(delay) => {
                warn!("[{}] Stream {} reconnecting in {:?}", sport, id, delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => return,
                }
            }
            FailureDecision::Exhausted(reason) => {
                inner.registry().remove(id);
                let snap = lock_session(&state).snapshot();
                error!(
                    session_id = %id,
                    status = ?snap.status,
                    failures = snap.consecutive_failures,
                    "[{}] Stream gave up ({:?}); check the feed entitlement",
                    sport,
                    reason
                );
                return;
            }
        }
    }
}
