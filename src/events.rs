//! Observable events for downstream consumers (notifications, analytics).
//!
//! Delivery is best effort: a lagging subscriber misses events rather than
//! slowing ingestion down.

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::db::models::{LineMovementRecord, Proposition, Wager};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoreEvent {
    PropositionUpserted { proposition: Proposition, created: bool },
    LineMoved(LineMovementRecord),
    PropositionsDeactivated { reason: String, count: usize },
    WagerSettled { wager: Wager, bankroll_delta: Decimal, bankroll_after: Decimal },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        EventBus { tx }
    }

    pub fn publish(&self, event: CoreEvent) {
        // No receivers is normal when nothing has subscribed yet.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }
}

/// Log every core event. Stands in for the external notification consumers.
pub fn spawn_event_logger(bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(CoreEvent::PropositionUpserted { proposition, created }) => {
                    debug!(
                        id = proposition.id,
                        created,
                        "{} {} {} {}",
                        proposition.player,
                        proposition.direction,
                        proposition.effective_line(),
                        proposition.stat
                    );
                }
                Ok(CoreEvent::LineMoved(m)) => {
                    info!(
                        proposition_id = m.proposition_id,
                        provider = %m.provider,
                        "Line moved {} -> {} (delta {})",
                        m.old_line,
                        m.new_line,
                        m.delta
                    );
                }
                Ok(CoreEvent::PropositionsDeactivated { reason, count }) => {
                    info!("Deactivated {} proposition(s): {}", count, reason);
                }
                Ok(CoreEvent::WagerSettled { wager, bankroll_delta, bankroll_after }) => {
                    info!(
                        wager_id = wager.id,
                        user_id = wager.user_id,
                        "Wager settled {} (delta ${}, bankroll ${})",
                        wager.status,
                        bankroll_delta,
                        bankroll_after
                    );
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event logger lagged, {} event(s) skipped", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
