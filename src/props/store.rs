//! Proposition identity and upsert.
//!
//! At most one active row per identity key. Writers for one market slot are
//! serialized by an in-process async mutex; the partial unique index in
//! storage catches anything that slips past it.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::ledger::LineMovementLedger;
use crate::db::models::{LineMovementRecord, NewProposition, Proposition};
use crate::db::{apply_sighting, is_constraint_violation, Database};
use crate::error::StoreError;
use crate::events::{CoreEvent, EventBus};

#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub proposition: Proposition,
    pub created: bool,
    pub movement: Option<LineMovementRecord>,
}

pub struct PropositionStore {
    db: Database,
    ledger: LineMovementLedger,
    events: EventBus,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl PropositionStore {
    pub fn new(db: Database, ledger: LineMovementLedger, events: EventBus) -> Self {
        PropositionStore {
            db,
            ledger,
            events,
            locks: DashMap::new(),
        }
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Insert a first sighting or apply a repeat sighting.
    ///
    /// Lookup is by exact identity first. A main-market miss with a fixture
    /// id then checks the market slot: exactly one active proposition there,
    /// listed under the same market id when both carry one, means the line
    /// moved on it. Alternate-lines markets never take the slot path.
    pub async fn upsert(&self, rec: &NewProposition) -> Result<UpsertOutcome, StoreError> {
        let slot = rec.slot_key();
        let lock = self.key_lock(&slot);
        let outcome = {
            let _guard = lock.lock().await;
            self.upsert_locked(rec)
        };
        drop(lock);
        self.locks.remove_if(&slot, |_, l| Arc::strong_count(l) == 1);

        let outcome = outcome?;
        self.events.publish(CoreEvent::PropositionUpserted {
            proposition: outcome.proposition.clone(),
            created: outcome.created,
        });
        if let Some(m) = &outcome.movement {
            self.events.publish(CoreEvent::LineMoved(m.clone()));
        }
        Ok(outcome)
    }

    fn slot_match(&self, rec: &NewProposition) -> Result<Option<Proposition>, StoreError> {
        if rec.alternate || rec.fixture_id.is_none() {
            return Ok(None);
        }
        let mut in_slot = self.db.find_active_in_slot(&rec.slot_key())?;
        if in_slot.len() != 1 {
            if in_slot.len() > 1 {
                debug!("{} active lines in slot {}, treating {} as new", in_slot.len(), rec.slot_key(), rec.line);
            }
            return Ok(None);
        }
        let prev = in_slot.pop();
        Ok(prev.filter(|p| match (&p.market_id, &rec.market_id) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }))
    }

    fn upsert_locked(&self, rec: &NewProposition) -> Result<UpsertOutcome, StoreError> {
        let identity = rec.identity_key();
        let now = Utc::now();

        let existing = match self.db.find_active_by_identity(&identity)? {
            Some(p) => Some(p),
            None => self.slot_match(rec)?,
        };

        match existing {
            Some(prev) => {
                let old_line = prev.effective_line();
                self.db.transaction(|tx| {
                    let proposition = apply_sighting(tx, prev.id, rec, rec.line, now)?;
                    let movement = if old_line != rec.line {
                        Some(self.ledger.record_in(tx, prev.id, &rec.provider, old_line, rec.line)?)
                    } else {
                        None
                    };
                    Ok(UpsertOutcome {
                        proposition,
                        created: false,
                        movement,
                    })
                })
            }
            None => match self.db.insert_proposition(rec, now) {
                Ok(proposition) => Ok(UpsertOutcome {
                    proposition,
                    created: true,
                    movement: None,
                }),
                Err(e) if is_constraint_violation(&e) => {
                    warn!("Duplicate active proposition rejected: {}", identity);
                    Err(StoreError::DuplicateActive(identity))
                }
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Deactivate all active propositions on the given fixtures.
    pub fn deactivate_fixtures(&self, fixture_ids: &[String]) -> anyhow::Result<usize> {
        if fixture_ids.is_empty() {
            return Ok(0);
        }
        let count = self.db.deactivate_by_fixtures(fixture_ids, Utc::now())?;
        if count > 0 {
            self.events.publish(CoreEvent::PropositionsDeactivated {
                reason: format!("fixtures {} closed", fixture_ids.join(",")),
                count,
            });
        }
        Ok(count)
    }

    /// Deactivate the provider's propositions for a sport that a refresh
    /// batch did not touch.
    pub fn supersede(&self, sport: &str, provider: &str, keep_ids: &[i64]) -> anyhow::Result<usize> {
        let count = self
            .db
            .deactivate_superseded(sport, provider, keep_ids, Utc::now())?;
        if count > 0 {
            self.events.publish(CoreEvent::PropositionsDeactivated {
                reason: format!("superseded by {} refresh for {}", provider, sport),
                count,
            });
        }
        Ok(count)
    }

    pub fn get(&self, id: i64) -> anyhow::Result<Option<Proposition>> {
        self.db.get_proposition(id)
    }

    pub fn list_active(&self, sport: Option<&str>, limit: i64) -> anyhow::Result<Vec<Proposition>> {
        self.db.list_active_propositions(sport, limit)
    }
}
