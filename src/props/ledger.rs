//! Append-only record of line changes, plus the steam-move view over it.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::db::models::LineMovementRecord;
use crate::db::{insert_movement, Database};

/// A proposition whose line moved sharply within the trailing window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SteamMove {
    pub proposition_id: i64,
    pub provider: String,
    pub from_line: Decimal,
    pub to_line: Decimal,
    pub net_move: Decimal,
    pub moves: usize,
    pub last_moved_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct LineMovementLedger {
    db: Database,
    steam_window: Duration,
    steam_threshold: Decimal,
}

impl LineMovementLedger {
    pub fn new(db: Database) -> Self {
        LineMovementLedger {
            db,
            steam_window: Duration::minutes(15),
            steam_threshold: dec!(1.0),
        }
    }

    pub fn with_steam(mut self, window: Duration, threshold: Decimal) -> Self {
        self.steam_window = window;
        self.steam_threshold = threshold;
        self
    }

    pub fn record(
        &self,
        proposition_id: i64,
        provider: &str,
        old_line: Decimal,
        new_line: Decimal,
    ) -> Result<LineMovementRecord> {
        self.db
            .insert_line_movement(proposition_id, provider, old_line, new_line, Utc::now())
    }

    /// `record` inside a caller's transaction, so the move commits together
    /// with the line change it describes.
    pub fn record_in(
        &self,
        tx: &rusqlite::Transaction<'_>,
        proposition_id: i64,
        provider: &str,
        old_line: Decimal,
        new_line: Decimal,
    ) -> rusqlite::Result<LineMovementRecord> {
        insert_movement(tx, proposition_id, provider, old_line, new_line, Utc::now())
    }

    /// Every movement of one proposition, oldest first.
    pub fn history(&self, proposition_id: i64) -> Result<Vec<LineMovementRecord>> {
        self.db.line_movement_history(proposition_id)
    }

    pub fn recent(&self, window_minutes: i64) -> Result<Vec<LineMovementRecord>> {
        self.db
            .line_movements_since(Utc::now() - Duration::minutes(window_minutes.max(0)))
    }

    /// Propositions whose net movement inside the steam window reaches the
    /// threshold, largest first.
    pub fn steam_moves(&self, now: DateTime<Utc>) -> Result<Vec<SteamMove>> {
        let movements = self.db.line_movements_since(now - self.steam_window)?;
        Ok(classify_steam(&movements, self.steam_threshold))
    }
}

/// Group movements (oldest first) by proposition and keep the sharp ones.
fn classify_steam(movements: &[LineMovementRecord], threshold: Decimal) -> Vec<SteamMove> {
    let mut by_prop: BTreeMap<i64, SteamMove> = BTreeMap::new();
    for m in movements {
        by_prop
            .entry(m.proposition_id)
            .and_modify(|s| {
                s.to_line = m.new_line;
                s.net_move += m.delta;
                s.moves += 1;
                s.last_moved_at = m.timestamp;
            })
            .or_insert_with(|| SteamMove {
                proposition_id: m.proposition_id,
                provider: m.provider.clone(),
                from_line: m.old_line,
                to_line: m.new_line,
                net_move: m.delta,
                moves: 1,
                last_moved_at: m.timestamp,
            });
    }
    let mut steam: Vec<SteamMove> = by_prop
        .into_values()
        .filter(|s| s.net_move.abs() >= threshold)
        .collect();
    steam.sort_by(|a, b| b.net_move.abs().cmp(&a.net_move.abs()));
    steam
}
