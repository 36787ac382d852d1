use std::future::Future;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;

use crate::common::{Position, Region};

/// A non-default cell as persisted. Absence of a record means a hidden,
/// unflagged cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellRecord {
    pub x: u32,
    pub y: u32,
    pub revealed: bool,
    pub is_mine: bool,
    pub adjacent_mines: Option<u8>,
    pub flagged: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerRecord {
    pub score: i64,
    pub last_seen: i64,
}

/// Storage failures, split by what the caller may do about them: retry,
/// report the lost race, or give up on the session.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage busy: {0}")]
    Transient(#[source] sqlx::Error),
    #[error("storage write conflict: {0}")]
    Conflict(#[source] sqlx::Error),
    #[error("storage failure: {0}")]
    Fatal(#[source] sqlx::Error),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_) | StoreError::Conflict(_))
    }
}

fn classify(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => {
            let code = db.code().unwrap_or_default().into_owned();
            // SQLITE_BUSY, SQLITE_LOCKED and their extended codes
            if matches!(code.as_str(), "5" | "6" | "261" | "262" | "517" | "773") {
                StoreError::Transient(err)
            } else if code == "1555" || code == "2067" {
                StoreError::Conflict(err)
            } else {
                StoreError::Fatal(err)
            }
        }
        sqlx::Error::PoolTimedOut => StoreError::Transient(err),
        _ => StoreError::Fatal(err),
    }
}

/// Retries a storage operation a bounded number of times while it keeps
/// failing retryably, with a short growing pause between attempts.
pub async fn with_retry<T, Fut, F>(mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    const ATTEMPTS: u32 = 3;
    let mut attempt = 1;
    loop {
        match op().await {
            Err(err) if err.is_retryable() && attempt < ATTEMPTS => {
                log::debug!("retrying storage operation after {err}");
                tokio::time::sleep(Duration::from_millis(20 * attempt as u64)).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Durable cell and player state over an embedded SQLite file in WAL mode.
/// Clones share one pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(classify)?;
        let store = Store { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// A private in-memory database, one connection so it lives as long as
    /// the pool. Used by tests.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new().filename(":memory:");
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(classify)?;
        let store = Store { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS map_state (
                x INTEGER NOT NULL,
                y INTEGER NOT NULL,
                revealed INTEGER NOT NULL DEFAULT 0,
                is_mine INTEGER NOT NULL DEFAULT 0,
                adjacent_mines INTEGER,
                flag_state INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (x, y)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS players (
                player_id TEXT PRIMARY KEY,
                score INTEGER NOT NULL DEFAULT 0,
                last_seen INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn get_cell(&self, pos: Position) -> Result<Option<CellRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT x, y, revealed, is_mine, adjacent_mines, flag_state
             FROM map_state WHERE x = ?1 AND y = ?2",
        )
        .bind(pos.x() as i64)
        .bind(pos.y() as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;
        row.map(cell_from_row).transpose()
    }

    /// All non-default cells inside `region`. Each axis turns into a BETWEEN
    /// when the interval is contiguous and into a seam-spanning disjunction
    /// when it wraps.
    pub async fn cells_in_region(&self, region: Region) -> Result<Vec<CellRecord>, StoreError> {
        let x_clause = if region.x_min <= region.x_max {
            "x BETWEEN ?1 AND ?2"
        } else {
            "(x >= ?1 OR x <= ?2)"
        };
        let y_clause = if region.y_min <= region.y_max {
            "y BETWEEN ?3 AND ?4"
        } else {
            "(y >= ?3 OR y <= ?4)"
        };
        let sql = format!(
            "SELECT x, y, revealed, is_mine, adjacent_mines, flag_state
             FROM map_state WHERE {x_clause} AND {y_clause}"
        );
        let rows = sqlx::query(&sql)
            .bind(region.x_min as i64)
            .bind(region.x_max as i64)
            .bind(region.y_min as i64)
            .bind(region.y_max as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;
        rows.into_iter().map(cell_from_row).collect()
    }

    /// Marks a cell revealed, clearing any flag. Reveals are final; later
    /// writes to the same cell go through this same statement and can only
    /// restate a reveal.
    pub async fn upsert_revealed(
        &self,
        pos: Position,
        is_mine: bool,
        adjacent_mines: Option<u8>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO map_state (x, y, revealed, is_mine, adjacent_mines, flag_state)
             VALUES (?1, ?2, 1, ?3, ?4, 0)
             ON CONFLICT (x, y) DO UPDATE SET
                 revealed = 1,
                 is_mine = excluded.is_mine,
                 adjacent_mines = excluded.adjacent_mines,
                 flag_state = 0",
        )
        .bind(pos.x() as i64)
        .bind(pos.y() as i64)
        .bind(is_mine)
        .bind(adjacent_mines.map(|n| n as i64))
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }

    /// Raising a flag inserts a hidden-flagged record unless the cell is
    /// already revealed; lowering one deletes the record only while the cell
    /// is unrevealed, restoring the default-hidden state.
    pub async fn set_flag(&self, pos: Position, flagged: bool) -> Result<(), StoreError> {
        if flagged {
            sqlx::query(
                "INSERT INTO map_state (x, y, revealed, is_mine, adjacent_mines, flag_state)
                 VALUES (?1, ?2, 0, 0, NULL, 1)
                 ON CONFLICT (x, y) DO UPDATE SET flag_state = 1
                 WHERE map_state.revealed = 0",
            )
            .bind(pos.x() as i64)
            .bind(pos.y() as i64)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        } else {
            sqlx::query("DELETE FROM map_state WHERE x = ?1 AND y = ?2 AND revealed = 0")
                .bind(pos.x() as i64)
                .bind(pos.y() as i64)
                .execute(&self.pool)
                .await
                .map_err(classify)?;
        }
        Ok(())
    }

    /// Idempotent player bootstrap; refreshes `last_seen` either way.
    pub async fn find_or_create_player(&self, id: &str) -> Result<PlayerRecord, StoreError> {
        let row = sqlx::query(
            "INSERT INTO players (player_id, score, last_seen) VALUES (?1, 0, ?2)
             ON CONFLICT (player_id) DO UPDATE SET last_seen = excluded.last_seen
             RETURNING score, last_seen",
        )
        .bind(id)
        .bind(now_millis())
        .fetch_one(&self.pool)
        .await
        .map_err(classify)?;
        Ok(PlayerRecord {
            score: row.try_get("score").map_err(classify)?,
            last_seen: row.try_get("last_seen").map_err(classify)?,
        })
    }

    /// Atomic score increment. Returns the persisted total so callers can
    /// cache exactly what the database holds.
    pub async fn add_to_player_score(&self, id: &str, delta: i64) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "UPDATE players SET score = score + ?1 WHERE player_id = ?2 RETURNING score",
        )
        .bind(delta)
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)?;
        row.try_get("score").map_err(classify)
    }

    pub async fn touch_player(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE players SET last_seen = ?1 WHERE player_id = ?2")
            .bind(now_millis())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn cell_from_row(row: SqliteRow) -> Result<CellRecord, StoreError> {
    Ok(CellRecord {
        x: row.try_get::<i64, _>("x").map_err(classify)? as u32,
        y: row.try_get::<i64, _>("y").map_err(classify)? as u32,
        revealed: row.try_get("revealed").map_err(classify)?,
        is_mine: row.try_get("is_mine").map_err(classify)?,
        adjacent_mines: row
            .try_get::<Option<i64>, _>("adjacent_mines")
            .map_err(classify)?
            .map(|n| n as u8),
        flagged: row.try_get("flag_state").map_err(classify)?,
    })
}
