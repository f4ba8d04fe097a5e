use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub mod models;
use models::*;

/// Thread-safe SQLite handle (single connection with mutex).
///
/// Every write goes through the one connection, so all mutations of a user's
/// bankroll and wagers are totally ordered.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("opening {}", path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    /// Private in-memory database, used by tests and `--database-path :memory:`.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    /// A panic while the lock was held leaves no half-applied state: open
    /// transactions roll back when dropped.
    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        Ok(self.conn.lock().unwrap_or_else(PoisonError::into_inner))
    }

    #[cfg(test)]
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn()?.execute_batch(sql)?;
        Ok(())
    }

    /// Run `f` inside an IMMEDIATE transaction. The write lock is taken up
    /// front so a read-check-write sequence cannot interleave with another.
    pub fn transaction<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> std::result::Result<T, E>,
        E: From<rusqlite::Error> + From<anyhow::Error>,
    {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    // ── Propositions ─────────────────────────────────────────────────────────

    pub fn find_active_by_identity(&self, identity_key: &str) -> Result<Option<Proposition>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM propositions WHERE identity_key=?1 AND active=1",
            PROPOSITION_COLUMNS
        );
        let prop = conn
            .query_row(&sql, params![identity_key], map_proposition)
            .optional()?;
        Ok(prop)
    }

    pub fn find_active_in_slot(&self, slot_key: &str) -> Result<Vec<Proposition>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM propositions WHERE slot_key=?1 AND active=1 ORDER BY id",
            PROPOSITION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let props = stmt
            .query_map(params![slot_key], map_proposition)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(props)
    }

    /// Insert a new active proposition. A second active row for the same
    /// identity key is rejected by the partial unique index.
    pub fn insert_proposition(&self, rec: &NewProposition, now: DateTime<Utc>) -> Result<Proposition> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO propositions (
                identity_key, slot_key, sport, player, team, opponent, stat,
                line, current_line, direction, period, provider, fixture_id,
                market_id, confidence, expected_value, model_probability,
                scheduled_start, active, created_at, updated_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,1,?19,?19)",
            params![
                rec.identity_key(),
                rec.slot_key(),
                rec.sport,
                rec.player,
                rec.team,
                rec.opponent,
                rec.stat,
                rec.line.to_string(),
                rec.line.to_string(),
                rec.direction.as_str(),
                rec.period,
                rec.provider,
                rec.fixture_id,
                rec.market_id,
                rec.confidence,
                rec.expected_value.to_string(),
                rec.model_probability,
                rec.scheduled_start,
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();
        let sql = format!("SELECT {} FROM propositions WHERE id=?1", PROPOSITION_COLUMNS);
        Ok(conn.query_row(&sql, params![id], map_proposition)?)
    }

    pub fn get_proposition(&self, id: i64) -> Result<Option<Proposition>> {
        let conn = self.conn()?;
        proposition_by_id(&conn, id).map_err(Into::into)
    }

    pub fn list_active_propositions(&self, sport: Option<&str>, limit: i64) -> Result<Vec<Proposition>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM propositions
             WHERE active=1 AND (?1 IS NULL OR sport=?1)
             ORDER BY updated_at DESC LIMIT ?2",
            PROPOSITION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let props = stmt
            .query_map(params![sport, limit], map_proposition)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(props)
    }

    /// Deactivate every active proposition on the given fixtures.
    pub fn deactivate_by_fixtures(&self, fixture_ids: &[String], now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let mut total = 0;
        for fixture_id in fixture_ids {
            total += conn.execute(
                "UPDATE propositions SET active=0, updated_at=?1 WHERE fixture_id=?2 AND active=1",
                params![now, fixture_id],
            )?;
        }
        Ok(total)
    }

    /// Deactivate the provider's active propositions for a sport, except `keep_ids`.
    pub fn deactivate_superseded(
        &self,
        sport: &str,
        provider: &str,
        keep_ids: &[i64],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute_batch("CREATE TEMP TABLE IF NOT EXISTS keep_ids (id INTEGER PRIMARY KEY); DELETE FROM keep_ids;")?;
        {
            let mut stmt = tx.prepare("INSERT OR IGNORE INTO keep_ids (id) VALUES (?1)")?;
            for id in keep_ids {
                stmt.execute(params![id])?;
            }
        }
        let n = tx.execute(
            "UPDATE propositions SET active=0, updated_at=?1
             WHERE sport=?2 AND provider=?3 AND active=1
               AND id NOT IN (SELECT id FROM keep_ids)",
            params![now, sport, provider],
        )?;
        tx.execute_batch("DELETE FROM keep_ids;")?;
        tx.commit()?;
        Ok(n)
    }

    // ── Line movements ───────────────────────────────────────────────────────

    pub fn insert_line_movement(
        &self,
        proposition_id: i64,
        provider: &str,
        old_line: Decimal,
        new_line: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Result<LineMovementRecord> {
        let conn = self.conn()?;
        Ok(insert_movement(&conn, proposition_id, provider, old_line, new_line, timestamp)?)
    }

    /// Movements for one proposition, oldest first
    pub fn line_movement_history(&self, proposition_id: i64) -> Result<Vec<LineMovementRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, proposition_id, provider, old_line, new_line, delta, timestamp
             FROM line_movements WHERE proposition_id=?1 ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![proposition_id], map_line_movement)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Movements across all propositions at or after `since`, oldest first
    pub fn line_movements_since(&self, since: DateTime<Utc>) -> Result<Vec<LineMovementRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, proposition_id, provider, old_line, new_line, delta, timestamp
             FROM line_movements WHERE timestamp >= ?1 ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![since], map_line_movement)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Rate limits & response cache ─────────────────────────────────────────

    pub fn get_rate_limit_counter(&self, provider: &str) -> Result<Option<ProviderRateLimitCounter>> {
        let conn = self.conn()?;
        let counter = conn
            .query_row(
                "SELECT provider, per_minute_count, per_hour_count, per_day_count, window_started_at
                 FROM rate_limit_counters WHERE provider=?1",
                params![provider],
                map_rate_limit_counter,
            )
            .optional()?;
        Ok(counter)
    }

    pub fn save_rate_limit_counter(&self, counter: &ProviderRateLimitCounter) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO rate_limit_counters
                (provider, per_minute_count, per_hour_count, per_day_count, window_started_at)
             VALUES (?1,?2,?3,?4,?5)
             ON CONFLICT(provider) DO UPDATE SET
                per_minute_count=excluded.per_minute_count,
                per_hour_count=excluded.per_hour_count,
                per_day_count=excluded.per_day_count,
                window_started_at=excluded.window_started_at",
            params![
                counter.provider,
                counter.per_minute_count,
                counter.per_hour_count,
                counter.per_day_count,
                counter.window_started_at,
            ],
        )?;
        Ok(())
    }

    pub fn list_rate_limit_counters(&self) -> Result<Vec<ProviderRateLimitCounter>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT provider, per_minute_count, per_hour_count, per_day_count, window_started_at
             FROM rate_limit_counters ORDER BY provider",
        )?;
        let rows = stmt
            .query_map([], map_rate_limit_counter)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get_cached_response(&self, provider: &str, cache_key: &str) -> Result<Option<CachedResponse>> {
        let conn = self.conn()?;
        let row: Option<(String, DateTime<Utc>)> = conn
            .query_row(
                "SELECT body, fetched_at FROM response_cache WHERE provider=?1 AND cache_key=?2",
                params![provider, cache_key],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        match row {
            Some((body, fetched_at)) => Ok(Some(CachedResponse {
                provider: provider.to_string(),
                cache_key: cache_key.to_string(),
                body: serde_json::from_str(&body).context("corrupt cached response body")?,
                fetched_at,
            })),
            None => Ok(None),
        }
    }

    pub fn put_cached_response(
        &self,
        provider: &str,
        cache_key: &str,
        body: &serde_json::Value,
        fetched_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO response_cache (provider, cache_key, body, fetched_at)
             VALUES (?1,?2,?3,?4)
             ON CONFLICT(provider, cache_key) DO UPDATE SET
                body=excluded.body, fetched_at=excluded.fetched_at",
            params![provider, cache_key, body.to_string(), fetched_at],
        )?;
        Ok(())
    }

    // ── Users & wagers ───────────────────────────────────────────────────────

    pub fn insert_user(&self, bankroll: Decimal, now: DateTime<Utc>) -> Result<UserAccount> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (bankroll, created_at) VALUES (?1, ?2)",
            params![bankroll.to_string(), now],
        )?;
        Ok(UserAccount {
            id: conn.last_insert_rowid(),
            bankroll,
            created_at: now,
        })
    }

    pub fn get_user(&self, id: i64) -> Result<Option<UserAccount>> {
        let conn = self.conn()?;
        user_by_id(&conn, id).map_err(Into::into)
    }

    pub fn get_wager(&self, id: i64) -> Result<Option<Wager>> {
        let conn = self.conn()?;
        wager_by_id(&conn, id).map_err(Into::into)
    }

    pub fn list_wagers_for_user(&self, user_id: i64) -> Result<Vec<Wager>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM wagers WHERE user_id=?1 ORDER BY placed_at DESC, id DESC",
            WAGER_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![user_id], map_wager)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Pending wagers on propositions of the given fixture.
    pub fn pending_grades_for_fixture(&self, fixture_id: &str) -> Result<Vec<PendingGrade>> {
        self.pending_grades("p.fixture_id=?1", fixture_id)
    }

    /// Pending wagers on propositions of the given sport.
    pub fn pending_grades_for_sport(&self, sport: &str) -> Result<Vec<PendingGrade>> {
        self.pending_grades("p.sport=?1", sport)
    }

    fn pending_grades(&self, filter: &str, arg: &str) -> Result<Vec<PendingGrade>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT w.id FROM wagers w JOIN propositions p ON p.id = w.proposition_id
             WHERE w.status='pending' AND {} ORDER BY w.id",
            filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params![arg], |r| r.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(wager) = wager_by_id(&conn, id)? else {
                continue;
            };
            let Some(prop_id) = wager.proposition_id else {
                continue;
            };
            if let Some(proposition) = proposition_by_id(&conn, prop_id)? {
                out.push(PendingGrade { wager, proposition });
            }
        }
        Ok(out)
    }

    // ── Final stats ──────────────────────────────────────────────────────────

    pub fn upsert_final_stat(&self, stat: &FinalStat) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO final_stats (fixture_id, sport, player, stat, value, recorded_at)
             VALUES (?1,?2,?3,?4,?5,?6)
             ON CONFLICT(fixture_id, player, stat) DO UPDATE SET
                value=excluded.value, recorded_at=excluded.recorded_at",
            params![
                stat.fixture_id,
                stat.sport,
                stat.player,
                stat.stat,
                stat.value.to_string(),
                stat.recorded_at,
            ],
        )?;
        Ok(())
    }

    pub fn final_stat_value(&self, fixture_id: &str, player: &str, stat: &str) -> Result<Option<Decimal>> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM final_stats WHERE fixture_id=?1 AND player=?2 AND stat=?3",
                params![fixture_id, player, stat],
                |r| r.get(0),
            )
            .optional()?;
        raw.map(|s| Decimal::from_str(&s).context("corrupt final stat value"))
            .transpose()
    }
}

// ── Transaction-scoped queries ────────────────────────────────────────────────

/// Apply a repeat sighting to an existing proposition.
pub fn apply_sighting(
    conn: &Connection,
    id: i64,
    rec: &NewProposition,
    current_line: Decimal,
    now: DateTime<Utc>,
) -> rusqlite::Result<Proposition> {
    conn.execute(
        "UPDATE propositions SET
            current_line=?1,
            scheduled_start=COALESCE(?2, scheduled_start),
            market_id=COALESCE(?3, market_id),
            team=?4, opponent=?5,
            confidence=?6, expected_value=?7, model_probability=?8,
            updated_at=?9
         WHERE id=?10",
        params![
            current_line.to_string(),
            rec.scheduled_start,
            rec.market_id,
            rec.team,
            rec.opponent,
            rec.confidence,
            rec.expected_value.to_string(),
            rec.model_probability,
            now,
            id,
        ],
    )?;
    let sql = format!("SELECT {} FROM propositions WHERE id=?1", PROPOSITION_COLUMNS);
    conn.query_row(&sql, params![id], map_proposition)
}

pub fn insert_movement(
    conn: &Connection,
    proposition_id: i64,
    provider: &str,
    old_line: Decimal,
    new_line: Decimal,
    timestamp: DateTime<Utc>,
) -> rusqlite::Result<LineMovementRecord> {
    let delta = new_line.saturating_sub(old_line);
    conn.execute(
        "INSERT INTO line_movements (proposition_id, provider, old_line, new_line, delta, timestamp)
         VALUES (?1,?2,?3,?4,?5,?6)",
        params![
            proposition_id,
            provider,
            old_line.to_string(),
            new_line.to_string(),
            delta.to_string(),
            timestamp,
        ],
    )?;
    Ok(LineMovementRecord {
        id: conn.last_insert_rowid(),
        proposition_id,
        provider: provider.to_string(),
        old_line,
        new_line,
        delta,
        timestamp,
    })
}

pub fn user_by_id(conn: &Connection, id: i64) -> rusqlite::Result<Option<UserAccount>> {
    conn.query_row(
        "SELECT id, bankroll, created_at FROM users WHERE id=?1",
        params![id],
        |row| {
            Ok(UserAccount {
                id: row.get(0)?,
                bankroll: get_decimal(row, 1)?,
                created_at: row.get(2)?,
            })
        },
    )
    .optional()
}

pub fn set_bankroll(conn: &Connection, user_id: i64, bankroll: Decimal) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE users SET bankroll=?1 WHERE id=?2",
        params![bankroll.to_string(), user_id],
    )
}

pub fn wager_by_id(conn: &Connection, id: i64) -> rusqlite::Result<Option<Wager>> {
    let sql = format!("SELECT {} FROM wagers WHERE id=?1", WAGER_COLUMNS);
    conn.query_row(&sql, params![id], map_wager).optional()
}

pub fn proposition_by_id(conn: &Connection, id: i64) -> rusqlite::Result<Option<Proposition>> {
    let sql = format!("SELECT {} FROM propositions WHERE id=?1", PROPOSITION_COLUMNS);
    conn.query_row(&sql, params![id], map_proposition).optional()
}

#[allow(clippy::too_many_arguments)]
pub fn insert_wager(
    conn: &Connection,
    user_id: i64,
    proposition_id: Option<i64>,
    amount: Decimal,
    odds: Decimal,
    potential_return: Decimal,
    direction: Direction,
    opening_line: Decimal,
    placed_at: DateTime<Utc>,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO wagers (
            user_id, proposition_id, amount, odds, potential_return,
            direction, opening_line, status, placed_at
         ) VALUES (?1,?2,?3,?4,?5,?6,?7,'pending',?8)",
        params![
            user_id,
            proposition_id,
            amount.to_string(),
            odds.to_string(),
            potential_return.to_string(),
            direction.as_str(),
            opening_line.to_string(),
            placed_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Move a wager out of `pending`. Returns the number of rows changed, which is
/// zero when the wager was already terminal.
pub fn finalize_wager(
    conn: &Connection,
    id: i64,
    status: WagerStatus,
    closing_line: Decimal,
    clv: Decimal,
    settled_at: DateTime<Utc>,
) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE wagers SET status=?1, closing_line=?2, clv=?3, settled_at=?4
         WHERE id=?5 AND status='pending'",
        params![
            status.as_str(),
            closing_line.to_string(),
            clv.to_string(),
            settled_at,
            id,
        ],
    )
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

const PROPOSITION_COLUMNS: &str = "id, sport, player, team, opponent, stat, line, current_line,
    direction, period, provider, fixture_id, market_id, confidence, expected_value,
    model_probability, scheduled_start, active, created_at, updated_at";

const WAGER_COLUMNS: &str = "id, user_id, proposition_id, amount, odds, potential_return,
    direction, opening_line, closing_line, clv, status, placed_at, settled_at";

fn conversion_error(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn get_decimal(row: &Row, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn get_opt_decimal(row: &Row, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| Decimal::from_str(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn get_parsed<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = anyhow::Error>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| conversion_error(idx, std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())))
}

fn map_proposition(row: &Row) -> rusqlite::Result<Proposition> {
    Ok(Proposition {
        id: row.get(0)?,
        sport: row.get(1)?,
        player: row.get(2)?,
        team: row.get(3)?,
        opponent: row.get(4)?,
        stat: row.get(5)?,
        line: get_decimal(row, 6)?,
        current_line: get_opt_decimal(row, 7)?,
        direction: get_parsed(row, 8)?,
        period: row.get(9)?,
        provider: row.get(10)?,
        fixture_id: row.get(11)?,
        market_id: row.get(12)?,
        confidence: row.get(13)?,
        expected_value: get_decimal(row, 14)?,
        model_probability: row.get(15)?,
        scheduled_start: row.get(16)?,
        active: row.get(17)?,
        created_at: row.get(18)?,
        updated_at: row.get(19)?,
    })
}

fn map_line_movement(row: &Row) -> rusqlite::Result<LineMovementRecord> {
    Ok(LineMovementRecord {
        id: row.get(0)?,
        proposition_id: row.get(1)?,
        provider: row.get(2)?,
        old_line: get_decimal(row, 3)?,
        new_line: get_decimal(row, 4)?,
        delta: get_decimal(row, 5)?,
        timestamp: row.get(6)?,
    })
}

fn map_rate_limit_counter(row: &Row) -> rusqlite::Result<ProviderRateLimitCounter> {
    Ok(ProviderRateLimitCounter {
        provider: row.get(0)?,
        per_minute_count: row.get(1)?,
        per_hour_count: row.get(2)?,
        per_day_count: row.get(3)?,
        window_started_at: row.get(4)?,
    })
}

fn map_wager(row: &Row) -> rusqlite::Result<Wager> {
    Ok(Wager {
        id: row.get(0)?,
        user_id: row.get(1)?,
        proposition_id: row.get(2)?,
        amount: get_decimal(row, 3)?,
        odds: get_decimal(row, 4)?,
        potential_return: get_decimal(row, 5)?,
        direction: get_parsed(row, 6)?,
        opening_line: get_decimal(row, 7)?,
        closing_line: get_opt_decimal(row, 8)?,
        clv: get_opt_decimal(row, 9)?,
        status: get_parsed(row, 10)?,
        placed_at: row.get(11)?,
        settled_at: row.get(12)?,
    })
}

/// Returns true when `err` is a SQLite constraint violation (e.g. the
/// one-active-row-per-identity index).
pub fn is_constraint_violation(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<rusqlite::Error>(),
        Some(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS propositions (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_key      TEXT    NOT NULL,
    slot_key          TEXT    NOT NULL,
    sport             TEXT    NOT NULL,
    player            TEXT    NOT NULL,
    team              TEXT    NOT NULL,
    opponent          TEXT    NOT NULL,
    stat              TEXT    NOT NULL,
    line              TEXT    NOT NULL,
    current_line      TEXT,
    direction         TEXT    NOT NULL,
    period            TEXT    NOT NULL,
    provider          TEXT    NOT NULL,
    fixture_id        TEXT,
    market_id         TEXT,
    confidence        INTEGER NOT NULL,
    expected_value    TEXT    NOT NULL,
    model_probability REAL    NOT NULL,
    scheduled_start   TEXT,
    active            INTEGER NOT NULL DEFAULT 1,
    created_at        TEXT    NOT NULL,
    updated_at        TEXT    NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_propositions_active_identity
    ON propositions(identity_key) WHERE active = 1;
CREATE INDEX IF NOT EXISTS idx_propositions_slot ON propositions(slot_key, active);
CREATE INDEX IF NOT EXISTS idx_propositions_fixture ON propositions(fixture_id, active);
CREATE INDEX IF NOT EXISTS idx_propositions_provider ON propositions(sport, provider, active);

CREATE TABLE IF NOT EXISTS line_movements (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    proposition_id INTEGER NOT NULL,
    provider       TEXT    NOT NULL,
    old_line       TEXT    NOT NULL,
    new_line       TEXT    NOT NULL,
    delta          TEXT    NOT NULL,
    timestamp      TEXT    NOT NULL,
    FOREIGN KEY (proposition_id) REFERENCES propositions(id)
);

CREATE INDEX IF NOT EXISTS idx_line_movements_prop ON line_movements(proposition_id);
CREATE INDEX IF NOT EXISTS idx_line_movements_ts ON line_movements(timestamp);

CREATE TABLE IF NOT EXISTS rate_limit_counters (
    provider          TEXT    PRIMARY KEY,
    per_minute_count  INTEGER NOT NULL DEFAULT 0,
    per_hour_count    INTEGER NOT NULL DEFAULT 0,
    per_day_count     INTEGER NOT NULL DEFAULT 0,
    window_started_at TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS response_cache (
    provider   TEXT NOT NULL,
    cache_key  TEXT NOT NULL,
    body       TEXT NOT NULL,
    fetched_at TEXT NOT NULL,
    PRIMARY KEY (provider, cache_key)
);

CREATE TABLE IF NOT EXISTS users (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    bankroll   TEXT    NOT NULL,
    created_at TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS wagers (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id          INTEGER NOT NULL,
    proposition_id   INTEGER,
    amount           TEXT    NOT NULL,
    odds             TEXT    NOT NULL,
    potential_return TEXT    NOT NULL,
    direction        TEXT    NOT NULL,
    opening_line     TEXT    NOT NULL,
    closing_line     TEXT,
    clv              TEXT,
    status           TEXT    NOT NULL DEFAULT 'pending',
    placed_at        TEXT    NOT NULL,
    settled_at       TEXT,
    FOREIGN KEY (user_id) REFERENCES users(id),
    FOREIGN KEY (proposition_id) REFERENCES propositions(id)
);

CREATE INDEX IF NOT EXISTS idx_wagers_status ON wagers(status);
CREATE INDEX IF NOT EXISTS idx_wagers_user ON wagers(user_id);

CREATE TABLE IF NOT EXISTS final_stats (
    fixture_id  TEXT NOT NULL,
    sport       TEXT NOT NULL,
    player      TEXT NOT NULL COLLATE NOCASE,
    stat        TEXT NOT NULL COLLATE NOCASE,
    value       TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    PRIMARY KEY (fixture_id, player, stat)
);
"#;
