//! Odds event normalizer and the per-session batch pipeline.
//!
//! A raw tick becomes a proposition record in six steps: market filter, line
//! check, side, player name, stat name, then team/opponent and scoring.
//! Nothing here fails a batch: bad ticks are skipped and counted.

pub mod markets;
pub mod scoring;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::db::models::{FinalStat, NewProposition};
use crate::feeds::messages::{FeedEvent, FinalStatLine, RawTick};
use crate::feeds::FeedSink;
use crate::fixtures::{FixtureDirectory, UNKNOWN_TEAM};
use crate::props::PropositionStore;
use crate::providers::SeasonStats;
use crate::settlement::SettlementEngine;
use markets::{canonical_stat, is_alternate, is_player_prop, parse_direction, strip_player_name};
use scoring::{Features, Score, Scorer};

const DEFAULT_PERIOD: &str = "full_game";

// ── Data-quality counters ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct QualityCounters {
    unknown_market: AtomicU64,
    missing_line: AtomicU64,
    unsigned_line: AtomicU64,
    missing_player: AtomicU64,
    unknown_fixture: AtomicU64,
    scoring_fallback: AtomicU64,
    upsert_failed: AtomicU64,
    normalized: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QualitySnapshot {
    pub unknown_market: u64,
    pub missing_line: u64,
    pub unsigned_line: u64,
    pub missing_player: u64,
    pub unknown_fixture: u64,
    pub scoring_fallback: u64,
    pub upsert_failed: u64,
    pub normalized: u64,
}

impl QualityCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> QualitySnapshot {
        QualitySnapshot {
            unknown_market: self.unknown_market.load(Ordering::Relaxed),
            missing_line: self.missing_line.load(Ordering::Relaxed),
            unsigned_line: self.unsigned_line.load(Ordering::Relaxed),
            missing_player: self.missing_player.load(Ordering::Relaxed),
            unknown_fixture: self.unknown_fixture.load(Ordering::Relaxed),
            scoring_fallback: self.scoring_fallback.load(Ordering::Relaxed),
            upsert_failed: self.upsert_failed.load(Ordering::Relaxed),
            normalized: self.normalized.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    UnknownMarket,
    MissingLine,
    UnsignedLine,
    MissingPlayer,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Normalized(NewProposition),
    Skipped(SkipReason),
}

// ── Normalizer ─────────────────────────────────────────────────────────────────

pub struct Normalizer {
    fixtures: FixtureDirectory,
    scorer: Arc<dyn Scorer>,
    stats: Option<Arc<dyn SeasonStats>>,
    scoring_timeout: Duration,
    quality: Arc<QualityCounters>,
}

impl Normalizer {
    pub fn new(
        fixtures: FixtureDirectory,
        scorer: Arc<dyn Scorer>,
        stats: Option<Arc<dyn SeasonStats>>,
        scoring_timeout: Duration,
    ) -> Self {
        Normalizer {
            fixtures,
            scorer,
            stats,
            scoring_timeout,
            quality: Arc::new(QualityCounters::default()),
        }
    }

    pub fn quality(&self) -> Arc<QualityCounters> {
        Arc::clone(&self.quality)
    }

    fn skip(&self, reason: SkipReason, tick: &RawTick) -> TickOutcome {
        let counter = match reason {
            SkipReason::UnknownMarket => &self.quality.unknown_market,
            SkipReason::MissingLine => &self.quality.missing_line,
            SkipReason::UnsignedLine => &self.quality.unsigned_line,
            SkipReason::MissingPlayer => &self.quality.missing_player,
        };
        QualityCounters::bump(counter);
        debug!(
            "[{}] Skipping {} tick ({:?}): {:?}",
            tick.provider, tick.market, reason, tick.selection
        );
        TickOutcome::Skipped(reason)
    }

    pub async fn normalize(&self, sport: &str, tick: &RawTick) -> TickOutcome {
        if !is_player_prop(&tick.market) {
            return self.skip(SkipReason::UnknownMarket, tick);
        }
        let Some(line) = tick.line else {
            return self.skip(SkipReason::MissingLine, tick);
        };
        let Some(direction) = parse_direction(&tick.selection) else {
            return self.skip(SkipReason::UnsignedLine, tick);
        };
        let player = strip_player_name(&tick.selection).or_else(|| {
            tick.player_name
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
        });
        let Some(player) = player else {
            return self.skip(SkipReason::MissingPlayer, tick);
        };
        let stat = canonical_stat(&tick.market);

        let fixture = match tick.fixture_id.as_deref() {
            Some(id) => self.fixtures.resolve(sport, id).await,
            None => None,
        };
        let (team, opponent) = match &fixture {
            Some(f) => f.sides(tick.team.as_deref()),
            None => {
                QualityCounters::bump(&self.quality.unknown_fixture);
                warn!(
                    "[{}] Unknown fixture {:?} for {} {}, using placeholder",
                    tick.provider, tick.fixture_id, player, stat
                );
                (
                    tick.team.clone().unwrap_or_else(|| UNKNOWN_TEAM.to_string()),
                    UNKNOWN_TEAM.to_string(),
                )
            }
        };

        let season_average = match &self.stats {
            Some(stats) => stats.season_average(&player, &stat).await,
            None => None,
        };
        let features = Features {
            sport: sport.to_string(),
            player: player.clone(),
            team: team.clone(),
            opponent: opponent.clone(),
            stat: stat.clone(),
            line,
            direction,
            price: tick.price,
            implied_probability: tick
                .price
                .to_f64()
                .filter(|p| *p > 0.0)
                .map(|p| 1.0 / p)
                .unwrap_or(0.0),
            season_average,
        };
        let score = self.score(&features).await;

        QualityCounters::bump(&self.quality.normalized);
        TickOutcome::Normalized(NewProposition {
            sport: sport.to_string(),
            player,
            team,
            opponent,
            stat,
            line,
            direction,
            period: tick.period.clone().unwrap_or_else(|| DEFAULT_PERIOD.to_string()),
            provider: tick.provider.clone(),
            fixture_id: tick.fixture_id.clone(),
            market_id: tick.market_id.clone(),
            alternate: is_alternate(&tick.market),
            confidence: score.confidence,
            expected_value: score.expected_value,
            model_probability: score.probability,
            scheduled_start: tick
                .commence_time
                .or_else(|| fixture.as_ref().and_then(|f| f.start_time)),
        })
    }

    async fn score(&self, features: &Features) -> Score {
        match tokio::time::timeout(self.scoring_timeout, self.scorer.score(features)).await {
            Ok(Ok(score)) => score,
            Ok(Err(e)) => {
                QualityCounters::bump(&self.quality.scoring_fallback);
                debug!("Scoring failed for {}, using neutral score: {:#}", features.player, e);
                Score::neutral()
            }
            Err(_) => {
                QualityCounters::bump(&self.quality.scoring_fallback);
                warn!(
                    "Scoring timed out after {:?} for {}, using neutral score",
                    self.scoring_timeout, features.player
                );
                Score::neutral()
            }
        }
    }
}

// ── Pipeline ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub received: usize,
    pub skipped: usize,
    pub created: usize,
    pub updated: usize,
    pub moved: usize,
    pub failed: usize,
    pub superseded: usize,
}

/// Applies feed events: normalization runs concurrently on the shared worker
/// pool, upserts and signals are applied in delivery order.
pub struct Pipeline {
    normalizer: Arc<Normalizer>,
    store: Arc<PropositionStore>,
    settlement: SettlementEngine,
    workers: Arc<Semaphore>,
}

impl Pipeline {
    pub fn new(
        normalizer: Arc<Normalizer>,
        store: Arc<PropositionStore>,
        settlement: SettlementEngine,
        workers: Arc<Semaphore>,
    ) -> Self {
        Pipeline {
            normalizer,
            store,
            settlement,
            workers,
        }
    }

    pub async fn process_odds(&self, sport: &str, refresh: bool, ticks: &[RawTick]) -> BatchReport {
        let mut report = BatchReport {
            received: ticks.len(),
            ..BatchReport::default()
        };

        let outcomes: Vec<TickOutcome> = stream::iter(ticks.iter().cloned().map(|tick| {
            let workers = Arc::clone(&self.workers);
            let normalizer = Arc::clone(&self.normalizer);
            let sport = sport.to_string();
            async move {
                // The pool is never closed; a closed pool just runs unbounded.
                let _permit = workers.acquire_owned().await.ok();
                normalizer.normalize(&sport, &tick).await
            }
        }))
        .buffered(ticks.len().max(1))
        .collect()
        .await;

        let mut touched: HashMap<String, Vec<i64>> = HashMap::new();
        let mut failed_providers: BTreeSet<String> = BTreeSet::new();
        for outcome in outcomes {
            let rec = match outcome {
                TickOutcome::Normalized(rec) => rec,
                TickOutcome::Skipped(_) => {
                    report.skipped += 1;
                    continue;
                }
            };
            match self.store.upsert(&rec).await {
                Ok(o) => {
                    if o.created {
                        report.created += 1;
                    } else {
                        report.updated += 1;
                    }
                    if o.movement.is_some() {
                        report.moved += 1;
                    }
                    touched.entry(rec.provider.clone()).or_default().push(o.proposition.id);
                }
                Err(e) => {
                    QualityCounters::bump(&self.normalizer.quality.upsert_failed);
                    warn!("[{}] Upsert failed for {} {}: {}", rec.provider, rec.player, rec.stat, e);
                    report.failed += 1;
                    failed_providers.insert(rec.provider.clone());
                }
            }
        }

        if refresh {
            let providers: BTreeSet<&str> = ticks.iter().map(|t| t.provider.as_str()).collect();
            for provider in providers {
                // A failed upsert may be a proposition that is still offered.
                if failed_providers.contains(provider) {
                    warn!("[{}] Skipping {} refresh supersession after failed upserts", provider, sport);
                    continue;
                }
                let keep = touched.get(provider).map(Vec::as_slice).unwrap_or(&[]);
                match self.store.supersede(sport, provider, keep) {
                    Ok(n) => report.superseded += n,
                    Err(e) => warn!("[{}] Supersede for {} failed: {:#}", provider, sport, e),
                }
            }
        }

        debug!("[{}] Odds batch: {:?}", sport, report);
        report
    }

    pub fn process_locked(&self, sport: &str, fixture_ids: &[String]) -> usize {
        match self.store.deactivate_fixtures(fixture_ids) {
            Ok(n) => {
                info!("[{}] Locked {} fixture(s), {} proposition(s) closed", sport, fixture_ids.len(), n);
                n
            }
            Err(e) => {
                warn!("[{}] Locking fixtures {:?} failed: {:#}", sport, fixture_ids, e);
                0
            }
        }
    }

    /// Store the fixture's final stats, close its propositions and settle
    /// the wagers on them.
    pub fn process_final(&self, sport: &str, fixture_id: &str, stats: &[FinalStatLine]) {
        let now = Utc::now();
        let rows: Vec<FinalStat> = stats
            .iter()
            .map(|s| FinalStat {
                fixture_id: fixture_id.to_string(),
                sport: sport.to_string(),
                player: s.player.trim().to_string(),
                stat: canonical_stat_name(&s.stat),
                value: s.value,
                recorded_at: now,
            })
            .collect();
        if let Err(e) = self.settlement.record_final_stats(&rows) {
            warn!("[{}] Recording final stats for {} failed: {:#}", sport, fixture_id, e);
        }

        self.process_locked(sport, &[fixture_id.to_string()]);

        match self.settlement.settle_fixture(fixture_id) {
            Ok(summary) => info!("[{}] Fixture {} final: {:?}", sport, fixture_id, summary),
            Err(e) => warn!("[{}] Settling fixture {} failed: {:#}", sport, fixture_id, e),
        }
    }
}

/// Final stats may arrive as market codes or as display names.
fn canonical_stat_name(stat: &str) -> String {
    if is_player_prop(stat) {
        canonical_stat(stat)
    } else {
        stat.trim().to_string()
    }
}

#[async_trait]
impl FeedSink for Pipeline {
    async fn handle(&self, sport: &str, event: FeedEvent) {
        match event {
            FeedEvent::Odds { refresh, ticks, .. } => {
                self.process_odds(sport, refresh, &ticks).await;
            }
            FeedEvent::Locked { fixture_ids, .. } => {
                self.process_locked(sport, &fixture_ids);
            }
            FeedEvent::Final { fixture_id, stats, .. } => {
                self.process_final(sport, &fixture_id, &stats);
            }
            FeedEvent::Heartbeat { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Direction, WagerStatus};
    use crate::db::Database;
    use crate::events::EventBus;
    use crate::fixtures::{Fixture, FixtureSource};
    use crate::props::LineMovementLedger;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    struct StaticFixtures;

    #[async_trait]
    impl FixtureSource for StaticFixtures {
        async fn fetch_fixtures(&self, sport: &str) -> anyhow::Result<Vec<Fixture>> {
            Ok(vec![Fixture {
                id: "F1".into(),
                sport: sport.into(),
                home_team: "Boston Celtics".into(),
                away_team: "Miami Heat".into(),
                start_time: None,
            }])
        }
    }

    #[derive(Default)]
    struct RecordingScorer {
        seen: Mutex<Vec<Features>>,
    }

    #[async_trait]
    impl Scorer for RecordingScorer {
        async fn score(&self, features: &Features) -> anyhow::Result<Score> {
            self.seen.lock().unwrap().push(features.clone());
            Ok(Score {
                confidence: 77,
                expected_value: dec!(0.05),
                probability: 0.6,
            })
        }
    }

    struct SlowScorer;

    #[async_trait]
    impl Scorer for SlowScorer {
        async fn score(&self, _features: &Features) -> anyhow::Result<Score> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Score::neutral())
        }
    }

    struct FixedAverage(f64);

    #[async_trait]
    impl SeasonStats for FixedAverage {
        async fn season_average(&self, _player: &str, _stat: &str) -> Option<f64> {
            Some(self.0)
        }
    }

    fn directory() -> FixtureDirectory {
        FixtureDirectory::new(Arc::new(StaticFixtures), Duration::from_secs(300))
    }

    fn tick(market: &str, selection: &str, line: Option<Decimal>, fixture: Option<&str>) -> RawTick {
        RawTick {
            provider: "X".into(),
            market: market.into(),
            selection: selection.into(),
            price: dec!(1.9),
            line,
            fixture_id: fixture.map(str::to_string),
            player_id: None,
            player_name: None,
            team: Some("Celtics".into()),
            market_id: None,
            period: None,
            commence_time: None,
        }
    }

    fn scenario_a() -> RawTick {
        tick("player_points", "J. Doe Over 24.5", Some(dec!(24.5)), Some("F1"))
    }

    #[tokio::test]
    async fn test_scenario_a_normalizes() {
        let scorer = Arc::new(RecordingScorer::default());
        let n = Normalizer::new(directory(), scorer.clone(), Some(Arc::new(FixedAverage(26.1))), Duration::from_secs(1));
        let rec = match n.normalize("nba", &scenario_a()).await {
            TickOutcome::Normalized(rec) => rec,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(rec.player, "J. Doe");
        assert_eq!(rec.stat, "Points");
        assert_eq!(rec.line, dec!(24.5));
        assert_eq!(rec.direction, Direction::Over);
        assert_eq!((rec.team.as_str(), rec.opponent.as_str()), ("Boston Celtics", "Miami Heat"));
        assert_eq!(rec.confidence, 77);
        assert_eq!(rec.period, "full_game");

        let seen = scorer.seen.lock().unwrap();
        assert_eq!(seen[0].season_average, Some(26.1));
        approx::assert_relative_eq!(seen[0].implied_probability, 1.0 / 1.9, epsilon = 1e-9);
        assert_eq!(n.quality().snapshot().normalized, 1);
    }

    #[tokio::test]
    async fn test_skips_are_counted_by_reason() {
        let n = Normalizer::new(directory(), Arc::new(scoring::NeutralScorer), None, Duration::from_secs(1));
        assert_eq!(
            n.normalize("nba", &tick("h2h", "Celtics", Some(dec!(1)), None)).await,
            TickOutcome::Skipped(SkipReason::UnknownMarket)
        );
        assert_eq!(
            n.normalize("nba", &tick("player_points", "J. Doe Over", None, None)).await,
            TickOutcome::Skipped(SkipReason::MissingLine)
        );
        assert_eq!(
            n.normalize("nba", &tick("player_points", "J. Doe 24.5", Some(dec!(24.5)), None)).await,
            TickOutcome::Skipped(SkipReason::UnsignedLine)
        );
        assert_eq!(
            n.normalize("nba", &tick("player_points", "Over 24.5", Some(dec!(24.5)), None)).await,
            TickOutcome::Skipped(SkipReason::MissingPlayer)
        );

        let q = n.quality().snapshot();
        assert_eq!(
            (q.unknown_market, q.missing_line, q.unsigned_line, q.missing_player, q.normalized),
            (1, 1, 1, 1, 0)
        );
    }

    #[tokio::test]
    async fn test_player_name_fallback_and_unknown_fixture() {
        let n = Normalizer::new(directory(), Arc::new(scoring::NeutralScorer), None, Duration::from_secs(1));
        let mut t = tick("player_rebounds_alternate", "Under", Some(dec!(8.5)), Some("F404"));
        t.player_name = Some("A. Smith".into());
        let rec = match n.normalize("nba", &t).await {
            TickOutcome::Normalized(rec) => rec,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(rec.player, "A. Smith");
        assert_eq!(rec.stat, "Rebounds");
        assert_eq!(rec.direction, Direction::Under);
        assert_eq!(rec.team, "Celtics");
        assert_eq!(rec.opponent, UNKNOWN_TEAM);
        assert_eq!(n.quality().snapshot().unknown_fixture, 1);
    }

    #[tokio::test]
    async fn test_slow_scorer_falls_back_to_neutral() {
        let n = Normalizer::new(directory(), Arc::new(SlowScorer), None, Duration::from_millis(20));
        let rec = match n.normalize("nba", &scenario_a()).await {
            TickOutcome::Normalized(rec) => rec,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(rec.confidence, 50);
        assert_eq!(rec.expected_value, Decimal::ZERO);
        assert_eq!(rec.model_probability, 0.5);
        assert_eq!(n.quality().snapshot().scoring_fallback, 1);
    }

    struct Harness {
        db: Database,
        pipeline: Pipeline,
        store: Arc<PropositionStore>,
        ledger: LineMovementLedger,
        settlement: SettlementEngine,
    }

    fn harness() -> Harness {
        let db = Database::open_in_memory().unwrap();
        let bus = EventBus::new(64);
        let ledger = LineMovementLedger::new(db.clone());
        let store = Arc::new(PropositionStore::new(db.clone(), ledger.clone(), bus.clone()));
        let settlement = SettlementEngine::new(db.clone(), bus);
        let normalizer = Arc::new(Normalizer::new(
            directory(),
            Arc::new(scoring::NeutralScorer),
            None,
            Duration::from_secs(1),
        ));
        Harness {
            db: db.clone(),
            pipeline: Pipeline::new(normalizer, Arc::clone(&store), settlement.clone(), Arc::new(Semaphore::new(8))),
            store,
            ledger,
            settlement,
        }
    }

    #[tokio::test]
    async fn test_batch_upserts_in_order_and_tracks_moves() {
        let h = harness();
        let batch = vec![
            scenario_a(),
            tick("player_points", "J. Doe Over 25.5", Some(dec!(25.5)), Some("F1")),
            tick("totals", "Over 210.5", Some(dec!(210.5)), Some("F1")),
        ];
        let report = h.pipeline.process_odds("nba", false, &batch).await;
        assert_eq!(
            (report.received, report.created, report.updated, report.moved, report.skipped),
            (3, 1, 1, 1, 1)
        );
        let active = h.store.list_active(Some("nba"), 10).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].current_line, Some(dec!(25.5)));
        assert_eq!(h.ledger.history(active[0].id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_locked_batch_deactivates_fixture() {
        let h = harness();
        let mut other = scenario_a();
        other.fixture_id = Some("F2".into());
        other.selection = "K. Roe Over 10.5".into();
        h.pipeline.process_odds("nba", false, &[scenario_a(), other]).await;

        h.pipeline
            .handle("nba", FeedEvent::Locked { resume_token: None, fixture_ids: vec!["F1".into()] })
            .await;
        let active = h.store.list_active(None, 10).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].fixture_id.as_deref(), Some("F2"));
    }

    #[tokio::test]
    async fn test_refresh_supersedes_untouched_propositions() {
        let h = harness();
        let stale = tick("player_assists", "J. Doe Over 6.5", Some(dec!(6.5)), Some("F1"));
        h.pipeline.process_odds("nba", false, &[scenario_a(), stale]).await;

        let report = h.pipeline.process_odds("nba", true, &[scenario_a()]).await;
        assert_eq!(report.superseded, 1);
        let active = h.store.list_active(None, 10).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].stat, "Points");
    }

    #[tokio::test]
    async fn test_redelivered_board_with_alternates_is_stable() {
        let h = harness();
        let board = vec![
            scenario_a(),
            tick("player_points_alternate", "J. Doe Over 20.5", Some(dec!(20.5)), Some("F1")),
            tick("player_points_alternate", "J. Doe Over 29.5", Some(dec!(29.5)), Some("F1")),
        ];
        let first = h.pipeline.process_odds("nba", false, &board).await;
        assert_eq!((first.created, first.moved), (3, 0));

        let second = h.pipeline.process_odds("nba", false, &board).await;
        assert_eq!((second.created, second.updated, second.moved), (0, 3, 0));

        let mut lines: Vec<Decimal> = h
            .store
            .list_active(Some("nba"), 10)
            .unwrap()
            .iter()
            .map(|p| p.effective_line())
            .collect();
        lines.sort();
        assert_eq!(lines, vec![dec!(20.5), dec!(24.5), dec!(29.5)]);
        assert!(h.ledger.recent(60).unwrap().is_empty());
        assert!(h.ledger.steam_moves(Utc::now()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_keeps_provider_rows_when_an_upsert_fails() {
        let h = harness();
        let roe = tick("player_points", "K. Roe Over 10.5", Some(dec!(10.5)), Some("F1"));
        h.pipeline.process_odds("nba", false, &[scenario_a(), roe.clone()]).await;
        h.db
            .execute_batch(
                "CREATE TRIGGER reject_roe BEFORE UPDATE OF current_line ON propositions
                 WHEN OLD.player = 'K. Roe'
                 BEGIN SELECT RAISE(ABORT, 'row busy'); END;",
            )
            .unwrap();

        let report = h.pipeline.process_odds("nba", true, &[scenario_a(), roe]).await;
        assert_eq!((report.failed, report.superseded), (1, 0));
        let mut players: Vec<String> = h
            .store
            .list_active(None, 10)
            .unwrap()
            .into_iter()
            .map(|p| p.player)
            .collect();
        players.sort();
        assert_eq!(players, vec!["J. Doe", "K. Roe"]);
        assert_eq!(h.pipeline.normalizer.quality().snapshot().upsert_failed, 1);
    }

    #[tokio::test]
    async fn test_final_batch_settles_wagers() {
        let h = harness();
        h.pipeline.process_odds("nba", false, &[scenario_a()]).await;
        let prop = h.store.list_active(None, 10).unwrap().remove(0);
        let user = h.settlement.create_user(dec!(100)).unwrap();
        let wager = h.settlement.place(user.id, prop.id, dec!(10), dec!(1.9)).unwrap();

        h.pipeline
            .handle(
                "nba",
                FeedEvent::Final {
                    resume_token: None,
                    fixture_id: "F1".into(),
                    stats: vec![FinalStatLine { player: "J. Doe".into(), stat: "player_points".into(), value: dec!(26) }],
                },
            )
            .await;

        assert!(!h.store.get(prop.id).unwrap().unwrap().active);
        let wagers = h.settlement.list_wagers(user.id).unwrap();
        assert_eq!(wagers[0].id, wager.id);
        assert_eq!(wagers[0].status, WagerStatus::Won);
        assert_eq!(h.settlement.get_user(user.id).unwrap().bankroll, dec!(109));
    }
}
