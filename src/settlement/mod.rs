//! Wager placement, grading and settlement.
//!
//! Every bankroll mutation runs in one IMMEDIATE transaction on the single
//! connection, so a user's balance and wagers change in a total order and a
//! wager can only ever leave `pending` once.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::models::{Direction, FinalStat, PendingGrade, UserAccount, Wager, WagerStatus};
use crate::db::{self, Database};
use crate::error::SettlementError;
use crate::events::{CoreEvent, EventBus};

/// Results this close to the line grade as a push.
pub const PUSH_EPSILON: Decimal = dec!(0.000001);

pub fn grade(actual: Decimal, line: Decimal, direction: Direction) -> WagerStatus {
    // A difference too large to represent is nowhere near a push.
    let pushed = actual
        .checked_sub(line)
        .map(|d| d.abs() < PUSH_EPSILON)
        .unwrap_or(false);
    if pushed {
        return WagerStatus::Pushed;
    }
    let won = match direction {
        Direction::Over => actual > line,
        Direction::Under => actual < line,
    };
    if won {
        WagerStatus::Won
    } else {
        WagerStatus::Lost
    }
}

/// Closing line value: positive when the line moved toward the wager's side
/// after it was placed.
pub fn clv(opening: Decimal, closing: Decimal, direction: Direction) -> Decimal {
    closing.saturating_sub(opening) * direction.sign()
}

#[derive(Debug, Clone, Serialize)]
pub struct Settlement {
    pub wager: Wager,
    pub bankroll_delta: Decimal,
    pub bankroll_after: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SettlementSummary {
    pub examined: usize,
    pub won: usize,
    pub lost: usize,
    pub pushed: usize,
    /// No final stat recorded yet for the wager's player and stat
    pub awaiting_result: usize,
    pub conflicts: usize,
    pub errors: usize,
}

#[derive(Clone)]
pub struct SettlementEngine {
    db: Database,
    events: EventBus,
}

impl SettlementEngine {
    pub fn new(db: Database, events: EventBus) -> Self {
        SettlementEngine { db, events }
    }

    pub fn create_user(&self, bankroll: Decimal) -> Result<UserAccount, SettlementError> {
        if bankroll < Decimal::ZERO {
            return Err(SettlementError::InvalidAmount(bankroll));
        }
        Ok(self.db.insert_user(bankroll, Utc::now())?)
    }

    pub fn get_user(&self, id: i64) -> Result<UserAccount, SettlementError> {
        self.db.get_user(id)?.ok_or(SettlementError::UserNotFound(id))
    }

    pub fn list_wagers(&self, user_id: i64) -> Result<Vec<Wager>, SettlementError> {
        self.get_user(user_id)?;
        Ok(self.db.list_wagers_for_user(user_id)?)
    }

    /// Debit the stake and open a wager at the proposition's current line.
    pub fn place(
        &self,
        user_id: i64,
        proposition_id: i64,
        amount: Decimal,
        odds: Decimal,
    ) -> Result<Wager, SettlementError> {
        if amount <= Decimal::ZERO {
            return Err(SettlementError::InvalidAmount(amount));
        }
        if odds <= Decimal::ONE {
            return Err(SettlementError::InvalidOdds(odds));
        }

        let wager = self.db.transaction(|tx| {
            let user = db::user_by_id(tx, user_id)?.ok_or(SettlementError::UserNotFound(user_id))?;
            if amount > user.bankroll {
                return Err(SettlementError::InsufficientBankroll {
                    requested: amount,
                    available: user.bankroll,
                });
            }
            let prop = db::proposition_by_id(tx, proposition_id)?
                .ok_or(SettlementError::PropositionNotFound(proposition_id))?;
            if !prop.active {
                return Err(SettlementError::PropositionInactive(proposition_id));
            }

            let potential_return = amount
                .checked_mul(odds)
                .ok_or(SettlementError::OutOfRange("potential return"))?;
            db::set_bankroll(tx, user_id, user.bankroll - amount)?;
            let id = db::insert_wager(
                tx,
                user_id,
                Some(prop.id),
                amount,
                odds,
                potential_return,
                prop.direction,
                prop.effective_line(),
                Utc::now(),
            )?;
            db::wager_by_id(tx, id)?.ok_or(SettlementError::WagerNotFound(id))
        })?;

        info!(
            wager_id = wager.id,
            user_id,
            "Placed ${} at {} on proposition {} ({} {})",
            wager.amount,
            wager.odds,
            proposition_id,
            wager.direction,
            wager.opening_line
        );
        Ok(wager)
    }

    /// Line to close a wager at: its proposition's current line, else the
    /// line it was placed at.
    pub fn current_line(&self, wager_id: i64) -> Result<Decimal, SettlementError> {
        let wager = self
            .db
            .get_wager(wager_id)?
            .ok_or(SettlementError::WagerNotFound(wager_id))?;
        let Some(prop_id) = wager.proposition_id else {
            return Ok(wager.opening_line);
        };
        Ok(self
            .db
            .get_proposition(prop_id)?
            .map(|p| p.effective_line())
            .unwrap_or(wager.opening_line))
    }

    /// Grade and pay out one wager. A wager that already left `pending`
    /// yields `AlreadySettled` and nothing changes.
    pub fn settle(
        &self,
        wager_id: i64,
        actual: Decimal,
        closing_line: Decimal,
    ) -> Result<Settlement, SettlementError> {
        let settlement = self.db.transaction(|tx| {
            let wager = db::wager_by_id(tx, wager_id)?.ok_or(SettlementError::WagerNotFound(wager_id))?;
            if wager.status.is_terminal() {
                return Err(SettlementError::AlreadySettled(wager_id));
            }

            let status = grade(actual, wager.opening_line, wager.direction);
            let delta = match status {
                WagerStatus::Won => wager.potential_return,
                WagerStatus::Pushed => wager.amount,
                WagerStatus::Lost | WagerStatus::Pending => Decimal::ZERO,
            };
            let value = clv(wager.opening_line, closing_line, wager.direction);

            if db::finalize_wager(tx, wager_id, status, closing_line, value, Utc::now())? == 0 {
                return Err(SettlementError::AlreadySettled(wager_id));
            }
            let user = db::user_by_id(tx, wager.user_id)?.ok_or(SettlementError::UserNotFound(wager.user_id))?;
            let after = user
                .bankroll
                .checked_add(delta)
                .ok_or(SettlementError::OutOfRange("bankroll"))?;
            db::set_bankroll(tx, user.id, after)?;

            let wager = db::wager_by_id(tx, wager_id)?.ok_or(SettlementError::WagerNotFound(wager_id))?;
            Ok(Settlement {
                wager,
                bankroll_delta: delta,
                bankroll_after: after,
            })
        })?;

        self.events.publish(CoreEvent::WagerSettled {
            wager: settlement.wager.clone(),
            bankroll_delta: settlement.bankroll_delta,
            bankroll_after: settlement.bankroll_after,
        });
        Ok(settlement)
    }

    /// Store the final stats delivered for a fixture.
    pub fn record_final_stats(&self, stats: &[FinalStat]) -> anyhow::Result<usize> {
        for stat in stats {
            self.db.upsert_final_stat(stat)?;
        }
        Ok(stats.len())
    }

    /// Grade every pending wager on the fixture that has a final stat.
    pub fn settle_fixture(&self, fixture_id: &str) -> anyhow::Result<SettlementSummary> {
        let pending = self.db.pending_grades_for_fixture(fixture_id)?;
        Ok(self.settle_pending(pending))
    }

    /// Grade every pending wager in the sport that has a final stat.
    pub fn settle_sport(&self, sport: &str) -> anyhow::Result<SettlementSummary> {
        let pending = self.db.pending_grades_for_sport(&sport.to_lowercase())?;
        let summary = self.settle_pending(pending);
        info!("Settlement pass for {}: {:?}", sport, summary);
        Ok(summary)
    }

    fn settle_pending(&self, pending: Vec<PendingGrade>) -> SettlementSummary {
        let mut summary = SettlementSummary::default();
        for PendingGrade { wager, proposition } in pending {
            summary.examined += 1;
            let Some(fixture_id) = proposition.fixture_id.as_deref() else {
                summary.awaiting_result += 1;
                continue;
            };
            let actual = match self
                .db
                .final_stat_value(fixture_id, &proposition.player, &proposition.stat)
            {
                Ok(Some(v)) => v,
                Ok(None) => {
                    debug!("No final {} for {} in {}", proposition.stat, proposition.player, fixture_id);
                    summary.awaiting_result += 1;
                    continue;
                }
                Err(e) => {
                    warn!("Final stat lookup failed for wager {}: {:#}", wager.id, e);
                    summary.errors += 1;
                    continue;
                }
            };

            match self.settle(wager.id, actual, proposition.effective_line()) {
                Ok(s) => match s.wager.status {
                    WagerStatus::Won => summary.won += 1,
                    WagerStatus::Lost => summary.lost += 1,
                    WagerStatus::Pushed => summary.pushed += 1,
                    WagerStatus::Pending => {}
                },
                Err(SettlementError::AlreadySettled(id)) => {
                    debug!("Wager {} settled concurrently, skipping", id);
                    summary.conflicts += 1;
                }
                Err(e) => {
                    warn!("Settling wager {} failed: {}", wager.id, e);
                    summary.errors += 1;
                }
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::NewProposition;

    fn engine() -> (SettlementEngine, Database) {
        let db = Database::open_in_memory().unwrap();
        (SettlementEngine::new(db.clone(), EventBus::new(16)), db)
    }

    fn seed_prop(db: &Database, direction: Direction, line: Decimal) -> i64 {
        let rec = NewProposition {
            sport: "nba".into(),
            player: "J. Doe".into(),
            team: "Home".into(),
            opponent: "Away".into(),
            stat: "Points".into(),
            line,
            direction,
            period: "full_game".into(),
            provider: "X".into(),
            fixture_id: Some("F1".into()),
            market_id: None,
            alternate: false,
            confidence: 50,
            expected_value: Decimal::ZERO,
            model_probability: 0.5,
            scheduled_start: None,
        };
        db.insert_proposition(&rec, Utc::now()).unwrap().id
    }

    fn final_points(db: &Database, value: Decimal) {
        db.upsert_final_stat(&FinalStat {
            fixture_id: "F1".into(),
            sport: "nba".into(),
            player: "J. Doe".into(),
            stat: "Points".into(),
            value,
            recorded_at: Utc::now(),
        })
        .unwrap();
    }

    #[test]
    fn test_grade() {
        assert_eq!(grade(dec!(26), dec!(24.5), Direction::Over), WagerStatus::Won);
        assert_eq!(grade(dec!(23), dec!(24.5), Direction::Over), WagerStatus::Lost);
        assert_eq!(grade(dec!(23), dec!(24.5), Direction::Under), WagerStatus::Won);
        assert_eq!(grade(dec!(25), dec!(25), Direction::Under), WagerStatus::Pushed);
        assert_eq!(grade(dec!(25.0000001), dec!(25), Direction::Over), WagerStatus::Pushed);
    }

    #[test]
    fn test_clv_sign_follows_direction() {
        assert_eq!(clv(dec!(24.5), dec!(25.5), Direction::Over), dec!(1.0));
        assert_eq!(clv(dec!(24.5), dec!(25.5), Direction::Under), dec!(-1.0));
    }

    #[test]
    fn test_winning_over_pays_potential_return() {
        let (engine, db) = engine();
        let prop = seed_prop(&db, Direction::Over, dec!(24.5));
        let user = engine.create_user(dec!(100)).unwrap();

        let wager = engine.place(user.id, prop, dec!(10), dec!(1.9)).unwrap();
        assert_eq!(wager.potential_return, dec!(19.0));
        assert_eq!(wager.opening_line, dec!(24.5));
        assert_eq!(engine.get_user(user.id).unwrap().bankroll, dec!(90));

        let s = engine.settle(wager.id, dec!(26), dec!(25.5)).unwrap();
        assert_eq!(s.wager.status, WagerStatus::Won);
        assert_eq!(s.bankroll_delta, dec!(19.0));
        assert_eq!(s.bankroll_after, dec!(109));
        assert_eq!(s.wager.clv, Some(dec!(1.0)));
        assert_eq!(s.wager.closing_line, Some(dec!(25.5)));
        assert!(s.wager.settled_at.is_some());
    }

    #[test]
    fn test_settlement_is_single_shot() {
        let (engine, db) = engine();
        let prop = seed_prop(&db, Direction::Over, dec!(24.5));
        let user = engine.create_user(dec!(100)).unwrap();
        let wager = engine.place(user.id, prop, dec!(10), dec!(1.9)).unwrap();

        engine.settle(wager.id, dec!(26), dec!(24.5)).unwrap();
        let again = engine.settle(wager.id, dec!(26), dec!(24.5));
        assert!(matches!(again, Err(SettlementError::AlreadySettled(id)) if id == wager.id));
        assert_eq!(engine.get_user(user.id).unwrap().bankroll, dec!(109));
    }

    #[test]
    fn test_bankroll_conservation_by_outcome() {
        for (actual, expected) in [(dec!(26), dec!(109)), (dec!(20), dec!(90)), (dec!(24.5), dec!(100))] {
            let (engine, db) = engine();
            let prop = seed_prop(&db, Direction::Over, dec!(24.5));
            let user = engine.create_user(dec!(100)).unwrap();
            let wager = engine.place(user.id, prop, dec!(10), dec!(1.9)).unwrap();
            engine.settle(wager.id, actual, dec!(24.5)).unwrap();
            assert_eq!(engine.get_user(user.id).unwrap().bankroll, expected, "actual {}", actual);
        }
    }

    #[test]
    fn test_placement_rejections() {
        let (engine, db) = engine();
        let prop = seed_prop(&db, Direction::Under, dec!(24.5));
        let user = engine.create_user(dec!(50)).unwrap();

        let err = engine.place(user.id, prop, dec!(60), dec!(1.9)).unwrap_err();
        assert_eq!(err.to_string(), "insufficient bankroll: $60 exceeds available $50");
        assert!(matches!(engine.place(user.id, prop, dec!(0), dec!(1.9)), Err(SettlementError::InvalidAmount(_))));
        assert!(matches!(engine.place(user.id, prop, dec!(5), dec!(1)), Err(SettlementError::InvalidOdds(_))));
        assert!(matches!(engine.place(999, prop, dec!(5), dec!(1.9)), Err(SettlementError::UserNotFound(999))));
        assert!(matches!(engine.place(user.id, 999, dec!(5), dec!(1.9)), Err(SettlementError::PropositionNotFound(999))));

        db.deactivate_by_fixtures(&["F1".into()], Utc::now()).unwrap();
        assert!(matches!(
            engine.place(user.id, prop, dec!(5), dec!(1.9)),
            Err(SettlementError::PropositionInactive(_))
        ));
        // nothing was debited by the failed attempts
        assert_eq!(engine.get_user(user.id).unwrap().bankroll, dec!(50));
    }

    #[test]
    fn test_settle_fixture_grades_wagers_with_results() {
        let (engine, db) = engine();
        let over = seed_prop(&db, Direction::Over, dec!(24.5));
        let under = seed_prop(&db, Direction::Under, dec!(24.5));
        let user = engine.create_user(dec!(100)).unwrap();
        engine.place(user.id, over, dec!(10), dec!(2)).unwrap();
        engine.place(user.id, under, dec!(10), dec!(2)).unwrap();

        let before = engine.settle_fixture("F1").unwrap();
        assert_eq!(before.examined, 2);
        assert_eq!(before.awaiting_result, 2);

        final_points(&db, dec!(30));
        let summary = engine.settle_fixture("F1").unwrap();
        assert_eq!((summary.won, summary.lost, summary.errors), (1, 1, 0));
        assert_eq!(engine.get_user(user.id).unwrap().bankroll, dec!(100));
        assert!(engine
            .list_wagers(user.id)
            .unwrap()
            .iter()
            .all(|w| w.status.is_terminal()));
        assert_eq!(engine.settle_sport("NBA").unwrap().examined, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_settles_pay_once() {
        let (engine, db) = engine();
        let prop = seed_prop(&db, Direction::Over, dec!(24.5));
        let user = engine.create_user(dec!(100)).unwrap();
        let wager = engine.place(user.id, prop, dec!(10), dec!(1.9)).unwrap();

        let mut handles = vec![];
        for _ in 0..8 {
            let engine = engine.clone();
            handles.push(tokio::task::spawn_blocking(move || engine.settle(wager.id, dec!(26), dec!(24.5)).is_ok()));
        }
        let mut ok = 0;
        for h in handles {
            if h.await.unwrap() {
                ok += 1;
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(engine.get_user(user.id).unwrap().bankroll, dec!(109));
    }

    #[test]
    fn test_oversized_stake_is_rejected_without_side_effects() {
        let (engine, db) = engine();
        let prop = seed_prop(&db, Direction::Over, dec!(24.5));
        let whale = engine.create_user(Decimal::MAX).unwrap();
        let bystander = engine.create_user(dec!(50)).unwrap();

        let err = engine.place(whale.id, prop, Decimal::MAX, dec!(2)).unwrap_err();
        assert!(matches!(err, SettlementError::OutOfRange(_)));
        assert_eq!(engine.get_user(whale.id).unwrap().bankroll, Decimal::MAX);
        assert!(engine.list_wagers(whale.id).unwrap().is_empty());
        assert_eq!(engine.get_user(bystander.id).unwrap().bankroll, dec!(50));
    }

    #[test]
    fn test_payout_past_max_bankroll_leaves_wager_pending() {
        let (engine, db) = engine();
        let prop = seed_prop(&db, Direction::Over, dec!(24.5));
        let user = engine.create_user(Decimal::MAX).unwrap();
        let wager = engine.place(user.id, prop, dec!(10), dec!(2)).unwrap();

        let err = engine.settle(wager.id, dec!(26), dec!(24.5)).unwrap_err();
        assert!(matches!(err, SettlementError::OutOfRange(_)));
        let after = engine.list_wagers(user.id).unwrap();
        assert_eq!(after[0].status, WagerStatus::Pending);
        assert_eq!(engine.get_user(user.id).unwrap().bankroll, Decimal::MAX - dec!(10));
    }

    #[test]
    fn test_grade_and_clv_at_decimal_extremes() {
        assert_eq!(grade(Decimal::MAX, Decimal::MIN, Direction::Over), WagerStatus::Won);
        assert_eq!(grade(Decimal::MIN, Decimal::MAX, Direction::Over), WagerStatus::Lost);
        assert_eq!(clv(Decimal::MIN, Decimal::MAX, Direction::Under), -Decimal::MAX);
    }
}
