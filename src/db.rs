use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::error::{EngineError, Result};
use crate::models::{
    Attempt, AttemptRequest, Item, ItemId, Learner, NewItem, RatingChange, RecentAttempt, Topic,
    TopicId, TopicRating, TopicStanding,
};
use crate::rating::UpdateResult;

const ITEM_COLUMNS: &str = "id, topic_id, target_grade, rating, rd, active, anchor, answer_text, \
     metadata, attempt_count, created_at, last_attempt_at";

const ATTEMPT_COLUMNS: &str = "id, learner_id, item_id, topic_id, correct, response_time_ms, \
     attempted_at, idempotency_key, \
     learner_rating_before, learner_rating_after, learner_rd, \
     topic_rating_before, topic_rating_after, topic_rd, \
     item_rating_before, item_rating_after, item_rd";

/// Everything the rating update needs, read inside the attempt transaction.
#[derive(Debug, Clone)]
pub struct AttemptSnapshot {
    pub learner: Learner,
    pub item: Item,
    pub topic_rating: Option<TopicRating>,
    /// Attempt time, never earlier than the learner's previous attempt
    pub attempted_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Stats {
    pub learners: i64,
    pub topics: i64,
    pub active_items: i64,
    pub attempts: i64,
}

pub struct Database {
    conn: Connection,
    max_commit_retries: u32,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, &StorageConfig::default())
    }

    pub fn open_with<P: AsRef<Path>>(path: P, config: &StorageConfig) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        conn.pragma_update(None, "foreign_keys", true)?;
        Ok(Self {
            conn,
            max_commit_retries: config.max_commit_retries.max(1),
        })
    }

    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS learners (
                id TEXT PRIMARY KEY,
                rating REAL,
                rd REAL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                last_attempt_at TEXT
            );

            CREATE TABLE IF NOT EXISTS topics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS topic_ratings (
                learner_id TEXT NOT NULL,
                topic_id INTEGER NOT NULL,
                rating REAL NOT NULL,
                rd REAL NOT NULL,
                attempt_count INTEGER NOT NULL,
                last_attempt_at TEXT NOT NULL,
                PRIMARY KEY (learner_id, topic_id),
                FOREIGN KEY (learner_id) REFERENCES learners(id),
                FOREIGN KEY (topic_id) REFERENCES topics(id)
            );

            CREATE TABLE IF NOT EXISTS items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                topic_id INTEGER NOT NULL,
                target_grade TEXT,
                rating REAL,
                rd REAL,
                active INTEGER NOT NULL DEFAULT 1,
                anchor INTEGER NOT NULL DEFAULT 0,
                answer_text TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                attempt_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                last_attempt_at TEXT,
                FOREIGN KEY (topic_id) REFERENCES topics(id)
            );

            CREATE TABLE IF NOT EXISTS attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                learner_id TEXT NOT NULL,
                item_id INTEGER NOT NULL,
                topic_id INTEGER NOT NULL,
                correct INTEGER NOT NULL,
                response_time_ms INTEGER NOT NULL,
                attempted_at TEXT NOT NULL,
                idempotency_key TEXT UNIQUE,
                learner_rating_before REAL NOT NULL,
                learner_rating_after REAL NOT NULL,
                learner_rd REAL NOT NULL,
                topic_rating_before REAL NOT NULL,
                topic_rating_after REAL NOT NULL,
                topic_rd REAL NOT NULL,
                item_rating_before REAL NOT NULL,
                item_rating_after REAL NOT NULL,
                item_rd REAL NOT NULL,
                FOREIGN KEY (learner_id) REFERENCES learners(id),
                FOREIGN KEY (item_id) REFERENCES items(id),
                FOREIGN KEY (topic_id) REFERENCES topics(id)
            );

            CREATE INDEX IF NOT EXISTS idx_attempts_learner ON attempts(learner_id, id);
            CREATE INDEX IF NOT EXISTS idx_items_topic ON items(topic_id, active, rating);

            -- The attempt log is append-only
            CREATE TRIGGER IF NOT EXISTS attempts_no_update
            BEFORE UPDATE ON attempts
            BEGIN
                SELECT RAISE(ABORT, 'attempts are append-only');
            END;

            CREATE TRIGGER IF NOT EXISTS attempts_no_delete
            BEFORE DELETE ON attempts
            BEGIN
                SELECT RAISE(ABORT, 'attempts are append-only');
            END;
            "#,
        )?;

        Ok(())
    }

    // Learner operations
    pub fn add_learner(&self, id: &str) -> Result<Learner> {
        self.conn
            .execute(
                "INSERT INTO learners (id, created_at) VALUES (?1, ?2)",
                params![id, Utc::now()],
            )
            .map_err(|e| EngineError::from_insert(e, &format!("learner '{}'", id)))?;

        self.require_learner(id)
    }

    /// Returns the learner, creating it on first interaction.
    pub fn ensure_learner(&self, id: &str) -> Result<Learner> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO learners (id, created_at) VALUES (?1, ?2)",
            params![id, Utc::now()],
        )?;
        if inserted > 0 {
            debug!(learner = id, "created learner on first interaction");
        }

        self.require_learner(id)
    }

    pub fn get_learner(&self, id: &str) -> Result<Option<Learner>> {
        get_learner(&self.conn, id)
    }

    fn require_learner(&self, id: &str) -> Result<Learner> {
        self.get_learner(id)?
            .ok_or_else(|| EngineError::invalid(format!("unknown learner '{}'", id)))
    }

    /// Learners are never deleted; deactivation keeps their history intact.
    pub fn set_learner_active(&self, id: &str, active: bool) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE learners SET active = ?1 WHERE id = ?2",
            params![active, id],
        )?;
        Ok(rows > 0)
    }

    // Topic operations
    pub fn add_topic(&self, name: &str) -> Result<TopicId> {
        self.conn
            .execute(
                "INSERT INTO topics (name, created_at) VALUES (?1, ?2)",
                params![name, Utc::now()],
            )
            .map_err(|e| EngineError::from_insert(e, &format!("topic '{}'", name)))?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_topic(&self, id: TopicId) -> Result<Option<Topic>> {
        let topic = self
            .conn
            .query_row(
                "SELECT id, name, created_at FROM topics WHERE id = ?1",
                params![id],
                row_to_topic,
            )
            .optional()?;
        Ok(topic)
    }

    pub fn list_topics(&self) -> Result<Vec<Topic>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, created_at FROM topics ORDER BY name")?;
        let rows = stmt.query_map([], row_to_topic)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // Item operations
    pub fn add_item(&self, item: &NewItem) -> Result<ItemId> {
        if self.get_topic(item.topic_id)?.is_none() {
            return Err(EngineError::invalid(format!(
                "unknown topic {}",
                item.topic_id
            )));
        }
        if let Some(rating) = item.rating {
            if !rating.is_finite() {
                return Err(EngineError::invalid("item rating must be finite"));
            }
        }

        let metadata = item
            .metadata
            .clone()
            .unwrap_or_else(|| serde_json::json!({}))
            .to_string();

        self.conn.execute(
            r#"
            INSERT INTO items (topic_id, target_grade, rating, anchor, answer_text, metadata, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                item.topic_id,
                item.target_grade,
                item.rating,
                item.anchor,
                item.answer_text,
                metadata,
                Utc::now()
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_item(&self, id: ItemId) -> Result<Option<Item>> {
        get_item(&self.conn, id)
    }

    pub fn list_items(&self, topic_id: Option<TopicId>) -> Result<Vec<Item>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM items WHERE (?1 IS NULL OR topic_id = ?1) ORDER BY id",
            ITEM_COLUMNS
        ))?;
        let rows = stmt.query_map(params![topic_id], row_to_item)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Inactive items stay on record for audit but are never selected.
    pub fn set_item_active(&self, id: ItemId, active: bool) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE items SET active = ?1 WHERE id = ?2",
            params![active, id],
        )?;
        Ok(rows > 0)
    }

    /// Active items, optionally restricted to a topic and an inclusive rating
    /// window, least-attempted first then by id. Unrated items count as
    /// `default_rating`.
    pub fn candidate_items(
        &self,
        topic_id: Option<TopicId>,
        window: Option<(f64, f64)>,
        default_rating: f64,
    ) -> Result<Vec<Item>> {
        let (lo, hi) = match window {
            Some((lo, hi)) => (Some(lo), Some(hi)),
            None => (None, None),
        };

        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT {}
            FROM items
            WHERE active = 1
              AND (?1 IS NULL OR topic_id = ?1)
              AND (?2 IS NULL OR COALESCE(rating, ?4) >= ?2)
              AND (?3 IS NULL OR COALESCE(rating, ?4) <= ?3)
            ORDER BY attempt_count ASC, id ASC
            "#,
            ITEM_COLUMNS
        ))?;
        let rows = stmt.query_map(params![topic_id, lo, hi, default_rating], row_to_item)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn count_active_items(&self, topic_id: Option<TopicId>) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM items WHERE active = 1 AND (?1 IS NULL OR topic_id = ?1)",
            params![topic_id],
            |row| row.get(0),
        )?)
    }

    // Rating reads
    pub fn get_topic_rating(&self, learner_id: &str, topic_id: TopicId) -> Result<Option<TopicRating>> {
        get_topic_rating(&self.conn, learner_id, topic_id)
    }

    pub fn list_topic_ratings(&self, learner_id: &str) -> Result<Vec<TopicRating>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT tr.learner_id, tr.topic_id, t.name, tr.rating, tr.rd,
                   tr.attempt_count, tr.last_attempt_at
            FROM topic_ratings tr
            JOIN topics t ON t.id = tr.topic_id
            WHERE tr.learner_id = ?1
            ORDER BY t.name
            "#,
        )?;
        let rows = stmt.query_map(params![learner_id], row_to_topic_rating)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Topics with at least one active item, joined with the learner's rating in each.
    pub fn topic_standings(&self, learner_id: &str) -> Result<Vec<TopicStanding>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT t.id, tr.rating, tr.last_attempt_at
            FROM topics t
            LEFT JOIN topic_ratings tr ON tr.topic_id = t.id AND tr.learner_id = ?1
            WHERE EXISTS (SELECT 1 FROM items i WHERE i.topic_id = t.id AND i.active = 1)
            ORDER BY t.id
            "#,
        )?;
        let rows = stmt.query_map(params![learner_id], |row| {
            Ok(TopicStanding {
                topic_id: row.get(0)?,
                rating: row.get(1)?,
                last_attempt_at: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // Attempt log reads

    /// The learner's last `limit` attempts, oldest first. Served by the
    /// `(learner_id, id)` index, so cost is bounded by `limit`.
    pub fn recent_attempts(&self, learner_id: &str, limit: usize) -> Result<Vec<RecentAttempt>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT a.item_id, a.topic_id, i.answer_text
            FROM attempts a
            JOIN items i ON i.id = a.item_id
            WHERE a.learner_id = ?1
            ORDER BY a.id DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![learner_id, limit as i64], |row| {
            Ok(RecentAttempt {
                item_id: row.get(0)?,
                topic_id: row.get(1)?,
                answer_text: row.get(2)?,
            })
        })?;
        let mut recent = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        recent.reverse();
        Ok(recent)
    }

    pub fn list_attempts(&self, learner_id: &str) -> Result<Vec<Attempt>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM attempts WHERE learner_id = ?1 ORDER BY id",
            ATTEMPT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![learner_id], row_to_attempt)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn list_item_attempts(&self, item_id: ItemId) -> Result<Vec<Attempt>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM attempts WHERE item_id = ?1 ORDER BY id",
            ATTEMPT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![item_id], row_to_attempt)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Applies one attempt as a single atomic unit: learner rating, topic
    /// rating, item rating and the attempt record commit together or not at all.
    ///
    /// The snapshot handed to `compute` is read under the write lock, so the
    /// item rating it sees cannot be overwritten by a concurrent attempt
    /// before this one commits. Busy/locked failures are retried up to
    /// `max_commit_retries` times. Returns the attempt and whether it was
    /// replayed from an existing idempotency key.
    pub fn commit_attempt<F>(
        &self,
        request: &AttemptRequest,
        at: DateTime<Utc>,
        compute: F,
    ) -> Result<(Attempt, bool)>
    where
        F: Fn(&AttemptSnapshot) -> UpdateResult,
    {
        let mut tries = 0;
        loop {
            tries += 1;
            match self.try_commit_attempt(request, at, &compute) {
                Err(e) if e.is_retryable() && tries < self.max_commit_retries => {
                    warn!(
                        learner = %request.learner_id,
                        item = request.item_id,
                        tries,
                        "storage busy, retrying attempt commit"
                    );
                    std::thread::sleep(Duration::from_millis(10 << tries.min(6)));
                }
                other => return other,
            }
        }
    }

    fn try_commit_attempt<F>(
        &self,
        request: &AttemptRequest,
        at: DateTime<Utc>,
        compute: &F,
    ) -> Result<(Attempt, bool)>
    where
        F: Fn(&AttemptSnapshot) -> UpdateResult,
    {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;

        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = get_attempt_by_key(&tx, key)? {
                if existing.learner_id != request.learner_id || existing.item_id != request.item_id {
                    return Err(EngineError::invalid(format!(
                        "idempotency key '{}' belongs to another attempt",
                        key
                    )));
                }
                return Ok((existing, true));
            }
        }

        let learner = get_learner(&tx, &request.learner_id)?.ok_or_else(|| {
            EngineError::invalid(format!("unknown learner '{}'", request.learner_id))
        })?;
        if !learner.active {
            return Err(EngineError::invalid(format!(
                "learner '{}' is deactivated",
                learner.id
            )));
        }
        let item = get_item(&tx, request.item_id)?
            .ok_or_else(|| EngineError::invalid(format!("unknown item {}", request.item_id)))?;
        let topic_rating = get_topic_rating(&tx, &learner.id, item.topic_id)?;

        let attempted_at = match learner.last_attempt_at {
            Some(last) if last > at => last,
            _ => at,
        };

        let snapshot = AttemptSnapshot {
            learner,
            item,
            topic_rating,
            attempted_at,
        };
        let update = compute(&snapshot);

        for change in [update.learner, update.topic, update.item] {
            if !(change.after.is_finite() && change.rd.is_finite()) {
                return Err(EngineError::invalid("rating update produced a non-finite value"));
            }
        }

        tx.execute(
            r#"
            UPDATE learners
            SET rating = ?1, rd = ?2, attempt_count = attempt_count + 1, last_attempt_at = ?3
            WHERE id = ?4
            "#,
            params![update.learner.after, update.learner.rd, attempted_at, snapshot.learner.id],
        )?;

        tx.execute(
            r#"
            INSERT INTO topic_ratings (learner_id, topic_id, rating, rd, attempt_count, last_attempt_at)
            VALUES (?1, ?2, ?3, ?4, 1, ?5)
            ON CONFLICT (learner_id, topic_id) DO UPDATE SET
                rating = excluded.rating,
                rd = excluded.rd,
                attempt_count = attempt_count + 1,
                last_attempt_at = excluded.last_attempt_at
            "#,
            params![
                snapshot.learner.id,
                snapshot.item.topic_id,
                update.topic.after,
                update.topic.rd,
                attempted_at
            ],
        )?;

        // Anchor items keep whatever rating they were calibrated with
        tx.execute(
            r#"
            UPDATE items
            SET rating = CASE WHEN anchor = 1 THEN rating ELSE ?1 END,
                rd = CASE WHEN anchor = 1 THEN rd ELSE ?2 END,
                attempt_count = attempt_count + 1,
                last_attempt_at = ?3
            WHERE id = ?4
            "#,
            params![update.item.after, update.item.rd, attempted_at, snapshot.item.id],
        )?;

        tx.execute(
            r#"
            INSERT INTO attempts (
                learner_id, item_id, topic_id, correct, response_time_ms, attempted_at,
                idempotency_key,
                learner_rating_before, learner_rating_after, learner_rd,
                topic_rating_before, topic_rating_after, topic_rd,
                item_rating_before, item_rating_after, item_rd
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            "#,
            params![
                snapshot.learner.id,
                snapshot.item.id,
                snapshot.item.topic_id,
                request.correct,
                request.response_time_ms,
                attempted_at,
                request.idempotency_key,
                update.learner.before,
                update.learner.after,
                update.learner.rd,
                update.topic.before,
                update.topic.after,
                update.topic.rd,
                update.item.before,
                update.item.after,
                update.item.rd
            ],
        )?;
        let attempt_id = tx.last_insert_rowid();

        let attempt = get_attempt(&tx, attempt_id)?
            .ok_or(EngineError::StorageUnavailable(rusqlite::Error::QueryReturnedNoRows))?;
        tx.commit()?;

        Ok((attempt, false))
    }

    pub fn get_stats(&self) -> Result<Stats> {
        let count = |sql: &str| -> Result<i64> {
            Ok(self.conn.query_row(sql, [], |row| row.get(0))?)
        };

        Ok(Stats {
            learners: count("SELECT COUNT(*) FROM learners")?,
            topics: count("SELECT COUNT(*) FROM topics")?,
            active_items: self.count_active_items(None)?,
            attempts: count("SELECT COUNT(*) FROM attempts")?,
        })
    }
}

// Row readers shared by `Database` and the attempt transaction

fn get_learner(conn: &Connection, id: &str) -> Result<Option<Learner>> {
    let learner = conn
        .query_row(
            r#"
            SELECT id, rating, rd, attempt_count, active, created_at, last_attempt_at
            FROM learners WHERE id = ?1
            "#,
            params![id],
            |row| {
                Ok(Learner {
                    id: row.get(0)?,
                    rating: row.get(1)?,
                    rd: row.get(2)?,
                    attempt_count: row.get(3)?,
                    active: row.get(4)?,
                    created_at: row.get(5)?,
                    last_attempt_at: row.get(6)?,
                })
            },
        )
        .optional()?;
    Ok(learner)
}

fn get_item(conn: &Connection, id: ItemId) -> Result<Option<Item>> {
    let item = conn
        .query_row(
            &format!("SELECT {} FROM items WHERE id = ?1", ITEM_COLUMNS),
            params![id],
            row_to_item,
        )
        .optional()?;
    Ok(item)
}

fn get_topic_rating(conn: &Connection, learner_id: &str, topic_id: TopicId) -> Result<Option<TopicRating>> {
    let rating = conn
        .query_row(
            r#"
            SELECT tr.learner_id, tr.topic_id, t.name, tr.rating, tr.rd,
                   tr.attempt_count, tr.last_attempt_at
            FROM topic_ratings tr
            JOIN topics t ON t.id = tr.topic_id
            WHERE tr.learner_id = ?1 AND tr.topic_id = ?2
            "#,
            params![learner_id, topic_id],
            row_to_topic_rating,
        )
        .optional()?;
    Ok(rating)
}

fn get_attempt(conn: &Connection, id: i64) -> Result<Option<Attempt>> {
    let attempt = conn
        .query_row(
            &format!("SELECT {} FROM attempts WHERE id = ?1", ATTEMPT_COLUMNS),
            params![id],
            row_to_attempt,
        )
        .optional()?;
    Ok(attempt)
}

fn get_attempt_by_key(conn: &Connection, key: &str) -> Result<Option<Attempt>> {
    let attempt = conn
        .query_row(
            &format!(
                "SELECT {} FROM attempts WHERE idempotency_key = ?1",
                ATTEMPT_COLUMNS
            ),
            params![key],
            row_to_attempt,
        )
        .optional()?;
    Ok(attempt)
}

fn row_to_topic(row: &Row) -> rusqlite::Result<Topic> {
    Ok(Topic {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: row.get(2)?,
    })
}

fn row_to_topic_rating(row: &Row) -> rusqlite::Result<TopicRating> {
    Ok(TopicRating {
        learner_id: row.get(0)?,
        topic_id: row.get(1)?,
        topic_name: row.get(2)?,
        rating: row.get(3)?,
        rd: row.get(4)?,
        attempt_count: row.get(5)?,
        last_attempt_at: row.get(6)?,
    })
}

fn row_to_item(row: &Row) -> rusqlite::Result<Item> {
    let metadata_str: String = row.get(8)?;
    let metadata = serde_json::from_str(&metadata_str)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e)))?;

    Ok(Item {
        id: row.get(0)?,
        topic_id: row.get(1)?,
        target_grade: row.get(2)?,
        rating: row.get(3)?,
        rd: row.get(4)?,
        active: row.get(5)?,
        anchor: row.get(6)?,
        answer_text: row.get(7)?,
        metadata,
        attempt_count: row.get(9)?,
        created_at: row.get(10)?,
        last_attempt_at: row.get(11)?,
    })
}

fn row_to_attempt(row: &Row) -> rusqlite::Result<Attempt> {
    Ok(Attempt {
        id: row.get(0)?,
        learner_id: row.get(1)?,
        item_id: row.get(2)?,
        topic_id: row.get(3)?,
        correct: row.get(4)?,
        response_time_ms: row.get(5)?,
        attempted_at: row.get(6)?,
        idempotency_key: row.get(7)?,
        learner: RatingChange {
            before: row.get(8)?,
            after: row.get(9)?,
            rd: row.get(10)?,
        },
        topic: RatingChange {
            before: row.get(11)?,
            after: row.get(12)?,
            rd: row.get(13)?,
        },
        item: RatingChange {
            before: row.get(14)?,
            after: row.get(15)?,
            rd: row.get(16)?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RatingConfig;
    use crate::rating::{RatingModel, UpdateInput};
    use chrono::Duration as ChronoDuration;

    fn setup_db() -> Database {
        let db = Database::open(":memory:").expect("Failed to create in-memory database");
        db.init().expect("Failed to initialize database");
        db
    }

    fn model() -> RatingModel {
        RatingModel::new(RatingConfig::default())
    }

    fn apply(model: &RatingModel, snapshot: &AttemptSnapshot, correct: bool) -> UpdateResult {
        model.update(&UpdateInput {
            learner: snapshot.learner.rating_state(),
            topic: snapshot
                .topic_rating
                .as_ref()
                .map(|t| t.rating_state())
                .unwrap_or_default(),
            item: snapshot.item.rating_state(),
            item_fixed: snapshot.item.anchor,
            correct,
            response_time_ms: 4_000,
            at: snapshot.attempted_at,
        })
    }

    fn request(learner: &str, item: ItemId, correct: bool) -> AttemptRequest {
        AttemptRequest {
            learner_id: learner.to_string(),
            item_id: item,
            correct,
            response_time_ms: 4_000,
            idempotency_key: None,
        }
    }

    fn record(db: &Database, learner: &str, item: ItemId, correct: bool) -> Attempt {
        let m = model();
        db.commit_attempt(&request(learner, item, correct), Utc::now(), |s| {
            apply(&m, s, correct)
        })
        .expect("attempt should commit")
        .0
    }

    fn item_in(db: &Database, topic: TopicId, rating: Option<f64>) -> ItemId {
        db.add_item(&NewItem {
            topic_id: topic,
            rating,
            ..Default::default()
        })
        .unwrap()
    }

    fn count(db: &Database, table: &str) -> i64 {
        db.conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
            .unwrap()
    }

    mod init_tests {
        use super::*;

        #[test]
        fn init_creates_tables() {
            let db = setup_db();
            for table in ["learners", "topics", "topic_ratings", "items", "attempts"] {
                assert_eq!(count(&db, table), 0, "{} should exist and be empty", table);
            }
        }

        #[test]
        fn init_is_idempotent() {
            let db = setup_db();
            db.add_topic("intervals").unwrap();
            db.init().expect("Re-init should succeed");
            assert_eq!(db.list_topics().unwrap().len(), 1);
        }
    }

    mod learner_tests {
        use super::*;

        #[test]
        fn add_learner_starts_unrated() {
            let db = setup_db();
            let learner = db.add_learner("ana").unwrap();
            assert_eq!(learner.id, "ana");
            assert!(learner.rating.is_none());
            assert!(learner.rd.is_none());
            assert!(learner.active);
            assert_eq!(learner.attempt_count, 0);
        }

        #[test]
        fn add_learner_duplicate_fails() {
            let db = setup_db();
            db.add_learner("ana").unwrap();
            assert!(matches!(db.add_learner("ana"), Err(EngineError::Duplicate(_))));
        }

        #[test]
        fn ensure_learner_creates_once() {
            let db = setup_db();
            let first = db.ensure_learner("ana").unwrap();
            let second = db.ensure_learner("ana").unwrap();
            assert_eq!(first.created_at, second.created_at);
            assert_eq!(count(&db, "learners"), 1);
        }

        #[test]
        fn deactivate_learner() {
            let db = setup_db();
            db.add_learner("ana").unwrap();
            assert!(db.set_learner_active("ana", false).unwrap());
            assert!(!db.get_learner("ana").unwrap().unwrap().active);
            assert!(!db.set_learner_active("nobody", false).unwrap());
        }
    }

    mod topic_tests {
        use super::*;

        #[test]
        fn add_and_get_topic() {
            let db = setup_db();
            let id = db.add_topic("chords").unwrap();
            let topic = db.get_topic(id).unwrap().unwrap();
            assert_eq!(topic.name, "chords");
        }

        #[test]
        fn duplicate_topic_fails() {
            let db = setup_db();
            db.add_topic("chords").unwrap();
            assert!(matches!(db.add_topic("chords"), Err(EngineError::Duplicate(_))));
        }

        #[test]
        fn list_topics_sorted_by_name() {
            let db = setup_db();
            db.add_topic("rhythm").unwrap();
            db.add_topic("chords").unwrap();
            db.add_topic("intervals").unwrap();
            let names: Vec<String> = db.list_topics().unwrap().into_iter().map(|t| t.name).collect();
            assert_eq!(names, vec!["chords", "intervals", "rhythm"]);
        }

        #[test]
        fn get_topic_not_found() {
            let db = setup_db();
            assert!(db.get_topic(999).unwrap().is_none());
        }
    }

    mod item_tests {
        use super::*;

        #[test]
        fn add_item_round_trips_fields() {
            let db = setup_db();
            let topic = db.add_topic("intervals").unwrap();
            let id = db
                .add_item(&NewItem {
                    topic_id: topic,
                    target_grade: Some("Grade 2".to_string()),
                    rating: Some(1080.0),
                    anchor: true,
                    answer_text: Some("Major 3rd".to_string()),
                    metadata: Some(serde_json::json!({"clef": "treble"})),
                })
                .unwrap();

            let item = db.get_item(id).unwrap().unwrap();
            assert_eq!(item.topic_id, topic);
            assert_eq!(item.target_grade.as_deref(), Some("Grade 2"));
            assert_eq!(item.rating, Some(1080.0));
            assert!(item.anchor);
            assert!(item.active);
            assert_eq!(item.answer_text.as_deref(), Some("Major 3rd"));
            assert_eq!(item.metadata["clef"], "treble");
        }

        #[test]
        fn add_item_unknown_topic_fails() {
            let db = setup_db();
            let result = db.add_item(&NewItem {
                topic_id: 42,
                ..Default::default()
            });
            assert!(matches!(result, Err(EngineError::InvalidAttempt(_))));
        }

        #[test]
        fn add_item_non_finite_rating_fails() {
            let db = setup_db();
            let topic = db.add_topic("intervals").unwrap();
            let result = db.add_item(&NewItem {
                topic_id: topic,
                rating: Some(f64::NAN),
                ..Default::default()
            });
            assert!(result.is_err());
        }

        #[test]
        fn list_items_filters_by_topic() {
            let db = setup_db();
            let a = db.add_topic("a").unwrap();
            let b = db.add_topic("b").unwrap();
            item_in(&db, a, None);
            item_in(&db, b, None);
            item_in(&db, b, None);
            assert_eq!(db.list_items(None).unwrap().len(), 3);
            assert_eq!(db.list_items(Some(b)).unwrap().len(), 2);
        }

        #[test]
        fn inactive_items_are_not_candidates() {
            let db = setup_db();
            let topic = db.add_topic("a").unwrap();
            let id = item_in(&db, topic, Some(1000.0));
            assert!(db.set_item_active(id, false).unwrap());

            assert!(db.candidate_items(None, None, 1000.0).unwrap().is_empty());
            // still on record
            assert!(!db.get_item(id).unwrap().unwrap().active);
        }

        #[test]
        fn candidate_window_is_inclusive() {
            let db = setup_db();
            let topic = db.add_topic("a").unwrap();
            let low = item_in(&db, topic, Some(940.0));
            let mid = item_in(&db, topic, Some(1000.0));
            let high = item_in(&db, topic, Some(1060.0));
            item_in(&db, topic, Some(1061.0));

            let ids: Vec<ItemId> = db
                .candidate_items(Some(topic), Some((940.0, 1060.0)), 1000.0)
                .unwrap()
                .into_iter()
                .map(|i| i.id)
                .collect();
            assert_eq!(ids, vec![low, mid, high]);
        }

        #[test]
        fn unrated_items_use_default_rating() {
            let db = setup_db();
            let topic = db.add_topic("a").unwrap();
            let unrated = item_in(&db, topic, None);

            let inside = db.candidate_items(None, Some((990.0, 1010.0)), 1000.0).unwrap();
            assert_eq!(inside.len(), 1);
            assert_eq!(inside[0].id, unrated);
            assert!(db.candidate_items(None, Some((1100.0, 1200.0)), 1000.0).unwrap().is_empty());
        }

        #[test]
        fn candidates_ordered_by_attempts_then_id() {
            let db = setup_db();
            let topic = db.add_topic("a").unwrap();
            db.add_learner("ana").unwrap();
            let first = item_in(&db, topic, Some(1000.0));
            let second = item_in(&db, topic, Some(1000.0));
            record(&db, "ana", first, true);

            let ids: Vec<ItemId> = db
                .candidate_items(Some(topic), None, 1000.0)
                .unwrap()
                .into_iter()
                .map(|i| i.id)
                .collect();
            assert_eq!(ids, vec![second, first]);
        }
    }

    mod attempt_tests {
        use super::*;

        #[test]
        fn commit_updates_all_records() {
            let db = setup_db();
            let topic = db.add_topic("intervals").unwrap();
            let item = item_in(&db, topic, None);
            db.add_learner("ana").unwrap();

            let attempt = record(&db, "ana", item, true);

            let learner = db.get_learner("ana").unwrap().unwrap();
            assert!((learner.rating.unwrap() - 1016.0).abs() < 1e-9);
            assert_eq!(learner.attempt_count, 1);
            assert!(learner.rd.unwrap() < 350.0);

            let tr = db.get_topic_rating("ana", topic).unwrap().unwrap();
            assert!((tr.rating - 1016.0).abs() < 1e-9);
            assert_eq!(tr.attempt_count, 1);
            assert_eq!(tr.topic_name, "intervals");

            let stored = db.get_item(item).unwrap().unwrap();
            assert!((stored.rating.unwrap() - 994.6667).abs() < 1e-3);
            assert_eq!(stored.attempt_count, 1);

            assert_eq!(attempt.learner.after, learner.rating.unwrap());
            assert_eq!(attempt.item.after, stored.rating.unwrap());
            assert!(attempt.correct);
        }

        #[test]
        fn topic_rating_only_exists_after_attempt() {
            let db = setup_db();
            let a = db.add_topic("a").unwrap();
            let b = db.add_topic("b").unwrap();
            let item = item_in(&db, a, None);
            item_in(&db, b, None);
            db.add_learner("ana").unwrap();

            assert!(db.list_topic_ratings("ana").unwrap().is_empty());
            record(&db, "ana", item, false);
            record(&db, "ana", item, true);

            let ratings = db.list_topic_ratings("ana").unwrap();
            assert_eq!(ratings.len(), 1);
            assert_eq!(ratings[0].topic_id, a);
            assert_eq!(ratings[0].attempt_count, 2);
            assert!(db.get_topic_rating("ana", b).unwrap().is_none());
        }

        #[test]
        fn unknown_learner_is_rejected_without_writes() {
            let db = setup_db();
            let topic = db.add_topic("a").unwrap();
            let item = item_in(&db, topic, None);

            let m = model();
            let result = db.commit_attempt(&request("ghost", item, true), Utc::now(), |s| {
                apply(&m, s, true)
            });
            assert!(matches!(result, Err(EngineError::InvalidAttempt(_))));
            assert_eq!(count(&db, "attempts"), 0);
            assert_eq!(db.get_item(item).unwrap().unwrap().attempt_count, 0);
        }

        #[test]
        fn unknown_item_is_rejected_without_writes() {
            let db = setup_db();
            db.add_learner("ana").unwrap();

            let m = model();
            let result = db.commit_attempt(&request("ana", 77, true), Utc::now(), |s| {
                apply(&m, s, true)
            });
            assert!(matches!(result, Err(EngineError::InvalidAttempt(_))));
            assert_eq!(db.get_learner("ana").unwrap().unwrap().attempt_count, 0);
        }

        #[test]
        fn deactivated_learner_is_rejected() {
            let db = setup_db();
            let topic = db.add_topic("a").unwrap();
            let item = item_in(&db, topic, None);
            db.add_learner("ana").unwrap();
            db.set_learner_active("ana", false).unwrap();

            let m = model();
            let result = db.commit_attempt(&request("ana", item, true), Utc::now(), |s| {
                apply(&m, s, true)
            });
            assert!(matches!(result, Err(EngineError::InvalidAttempt(_))));
        }

        #[test]
        fn non_finite_update_rolls_back() {
            let db = setup_db();
            let topic = db.add_topic("a").unwrap();
            let item = item_in(&db, topic, None);
            db.add_learner("ana").unwrap();

            let m = model();
            let result = db.commit_attempt(&request("ana", item, true), Utc::now(), |s| {
                let mut update = apply(&m, s, true);
                update.item.after = f64::NAN;
                update
            });
            assert!(result.is_err());

            // Nothing from the failed attempt is observable
            let learner = db.get_learner("ana").unwrap().unwrap();
            assert!(learner.rating.is_none());
            assert_eq!(learner.attempt_count, 0);
            assert!(db.get_topic_rating("ana", topic).unwrap().is_none());
            assert_eq!(count(&db, "attempts"), 0);
        }

        #[test]
        fn anchor_item_rating_is_fixed() {
            let db = setup_db();
            let topic = db.add_topic("a").unwrap();
            let anchor = db
                .add_item(&NewItem {
                    topic_id: topic,
                    rating: Some(1100.0),
                    anchor: true,
                    ..Default::default()
                })
                .unwrap();
            db.add_learner("ana").unwrap();

            record(&db, "ana", anchor, true);

            let item = db.get_item(anchor).unwrap().unwrap();
            assert_eq!(item.rating, Some(1100.0));
            assert!(item.rd.is_none());
            assert_eq!(item.attempt_count, 1);
        }

        #[test]
        fn idempotency_key_replays_original() {
            let db = setup_db();
            let topic = db.add_topic("a").unwrap();
            let item = item_in(&db, topic, None);
            db.add_learner("ana").unwrap();

            let m = model();
            let mut req = request("ana", item, true);
            req.idempotency_key = Some("attempt-1".to_string());

            let (first, replayed) = db
                .commit_attempt(&req, Utc::now(), |s| apply(&m, s, true))
                .unwrap();
            assert!(!replayed);

            let (second, replayed) = db
                .commit_attempt(&req, Utc::now(), |s| apply(&m, s, true))
                .unwrap();
            assert!(replayed);
            assert_eq!(first.id, second.id);
            assert_eq!(first.learner, second.learner);
            assert_eq!(db.get_learner("ana").unwrap().unwrap().attempt_count, 1);
            assert_eq!(count(&db, "attempts"), 1);
        }

        #[test]
        fn idempotency_key_reuse_for_other_attempt_fails() {
            let db = setup_db();
            let topic = db.add_topic("a").unwrap();
            let first_item = item_in(&db, topic, None);
            let other_item = item_in(&db, topic, None);
            db.add_learner("ana").unwrap();

            let m = model();
            let mut req = request("ana", first_item, true);
            req.idempotency_key = Some("k".to_string());
            db.commit_attempt(&req, Utc::now(), |s| apply(&m, s, true)).unwrap();

            req.item_id = other_item;
            let result = db.commit_attempt(&req, Utc::now(), |s| apply(&m, s, true));
            assert!(matches!(result, Err(EngineError::InvalidAttempt(_))));
        }

        #[test]
        fn attempt_timestamps_never_go_backwards() {
            let db = setup_db();
            let topic = db.add_topic("a").unwrap();
            let item = item_in(&db, topic, None);
            db.add_learner("ana").unwrap();

            let m = model();
            let now = Utc::now();
            let (first, _) = db
                .commit_attempt(&request("ana", item, true), now, |s| apply(&m, s, true))
                .unwrap();
            let (second, _) = db
                .commit_attempt(
                    &request("ana", item, true),
                    now - ChronoDuration::hours(1),
                    |s| apply(&m, s, true),
                )
                .unwrap();

            assert_eq!(second.attempted_at, first.attempted_at);
            assert!(second.id > first.id);
        }

        #[test]
        fn attempts_are_append_only() {
            let db = setup_db();
            let topic = db.add_topic("a").unwrap();
            let item = item_in(&db, topic, None);
            db.add_learner("ana").unwrap();
            record(&db, "ana", item, true);

            assert!(db.conn.execute("UPDATE attempts SET correct = 0", []).is_err());
            assert!(db.conn.execute("DELETE FROM attempts", []).is_err());
            assert_eq!(count(&db, "attempts"), 1);
        }

        #[test]
        fn recent_attempts_are_bounded_and_chronological() {
            let db = setup_db();
            let topic = db.add_topic("a").unwrap();
            let items: Vec<ItemId> = (0..5).map(|_| item_in(&db, topic, None)).collect();
            db.add_learner("ana").unwrap();
            db.add_learner("ben").unwrap();
            for id in &items {
                record(&db, "ana", *id, true);
            }
            record(&db, "ben", items[0], true);

            let recent: Vec<ItemId> = db
                .recent_attempts("ana", 3)
                .unwrap()
                .into_iter()
                .map(|r| r.item_id)
                .collect();
            assert_eq!(recent, items[2..].to_vec());
        }

        #[test]
        fn list_attempts_in_order() {
            let db = setup_db();
            let topic = db.add_topic("a").unwrap();
            let item = item_in(&db, topic, None);
            db.add_learner("ana").unwrap();
            record(&db, "ana", item, true);
            record(&db, "ana", item, false);

            let attempts = db.list_attempts("ana").unwrap();
            assert_eq!(attempts.len(), 2);
            assert!(attempts[0].correct);
            assert!(!attempts[1].correct);
            assert_eq!(attempts[1].learner.before, attempts[0].learner.after);
        }
    }

    mod concurrency_tests {
        use super::*;
        use std::sync::{Arc, Barrier};

        #[test]
        fn concurrent_attempts_on_same_item_are_both_applied() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("etude.db");

            let db = Database::open(&path).unwrap();
            db.init().unwrap();
            let topic = db.add_topic("intervals").unwrap();
            let item = item_in(&db, topic, Some(1000.0));
            db.add_learner("ana").unwrap();
            db.add_learner("ben").unwrap();

            let barrier = Arc::new(Barrier::new(2));
            let handles: Vec<_> = ["ana", "ben"]
                .into_iter()
                .map(|learner| {
                    let path = path.clone();
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        let config = StorageConfig {
                            busy_timeout_ms: 5_000,
                            max_commit_retries: 5,
                        };
                        let conn = Database::open_with(&path, &config).unwrap();
                        let m = model();
                        barrier.wait();
                        conn.commit_attempt(&request(learner, item, true), Utc::now(), |s| {
                            apply(&m, s, true)
                        })
                        .map(|(attempt, _)| attempt)
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap().expect("both attempts should commit");
            }

            let stored = db.get_item(item).unwrap().unwrap();
            assert_eq!(stored.attempt_count, 2);

            // Each commit must build on the other, never on a stale snapshot
            let log = db.list_item_attempts(item).unwrap();
            assert_eq!(log.len(), 2);
            assert_eq!(log[0].item.before, 1000.0);
            assert_eq!(log[1].item.before, log[0].item.after);
            assert_eq!(stored.rating, Some(log[1].item.after));
            assert!(stored.rating.unwrap() < log[0].item.after);
        }
    }

    mod storage_failure_tests {
        use super::*;
        use std::time::Instant;

        #[test]
        fn locked_store_fails_retryably_without_writes() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("etude.db");

            let config = StorageConfig {
                busy_timeout_ms: 50,
                max_commit_retries: 2,
            };
            let db = Database::open_with(&path, &config).unwrap();
            db.init().unwrap();
            let topic = db.add_topic("intervals").unwrap();
            let item = item_in(&db, topic, Some(1000.0));
            db.add_learner("ana").unwrap();

            let locker = Connection::open(&path).unwrap();
            locker.execute_batch("BEGIN EXCLUSIVE;").unwrap();

            let m = model();
            let started = Instant::now();
            let result = db.commit_attempt(&request("ana", item, true), Utc::now(), |s| {
                apply(&m, s, true)
            });
            let elapsed = started.elapsed();

            let err = result.expect_err("commit should fail while the store is locked");
            assert!(matches!(err, EngineError::StorageUnavailable(_)));
            assert!(err.is_retryable());
            // two tries at 50ms each plus one short backoff
            assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);

            drop(locker);
            assert_eq!(count(&db, "attempts"), 0);
            let learner = db.get_learner("ana").unwrap().unwrap();
            assert_eq!(learner.attempt_count, 0);
            assert!(learner.rating.is_none());
            assert_eq!(db.get_item(item).unwrap().unwrap().rating, Some(1000.0));

            // The same request succeeds once the lock is gone
            db.commit_attempt(&request("ana", item, true), Utc::now(), |s| apply(&m, s, true))
                .unwrap();
            assert_eq!(count(&db, "attempts"), 1);
        }
    }

    mod stats_tests {
        use super::*;

        #[test]
        fn stats_empty_db() {
            let stats = setup_db().get_stats().unwrap();
            assert_eq!(stats.learners, 0);
            assert_eq!(stats.topics, 0);
            assert_eq!(stats.active_items, 0);
            assert_eq!(stats.attempts, 0);
        }

        #[test]
        fn stats_counts_records() {
            let db = setup_db();
            let topic = db.add_topic("a").unwrap();
            let item = item_in(&db, topic, None);
            let retired = item_in(&db, topic, None);
            db.set_item_active(retired, false).unwrap();
            db.add_learner("ana").unwrap();
            record(&db, "ana", item, true);

            let stats = db.get_stats().unwrap();
            assert_eq!(stats.learners, 1);
            assert_eq!(stats.topics, 1);
            assert_eq!(stats.active_items, 1);
            assert_eq!(stats.attempts, 1);
        }
    }
}
