//! SQLite storage backend.
//!
//! rusqlite is synchronous, so every query runs on tokio's blocking pool and
//! a locked database never stalls the async workers.

use super::{
    migrations, InterestStore, MatchStore, MessageStore, NewMessage, StoreError, WatermarkStore,
};
use crate::model::{
    from_micros, to_micros, Like, Match, MatchId, Message, MessageId, ReadWatermark, UserId,
    UserPair,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{ffi, params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

const MATCH_COLUMNS: &str = "id, user_a, user_b, created_at";
const MESSAGE_COLUMNS: &str = "id, match_id, sender_id, body, client_key, created_at";

/// Storage backed by a single SQLite connection.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file and run migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;

        // WAL mode for concurrent readers
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        let store = Self::init(conn)?;
        info!("Database opened at {}", path.display());
        Ok(store)
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| StoreError::Unavailable(format!("connection lock poisoned: {e}")))?;
            f(&conn)
        })
        .await
        .map_err(|e| {
            error!(error = %e, "Storage task failed");
            StoreError::Unavailable(format!("storage task failed: {e}"))
        })?
    }

    /// Run raw SQL against the connection, for fault injection in tests.
    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<(), StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("connection lock poisoned: {e}")))?;
        Ok(conn.execute_batch(sql)?)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        let conflict = match &err {
            rusqlite::Error::SqliteFailure(e, msg)
                if e.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
            {
                Some(msg.clone().unwrap_or_else(|| e.to_string()))
            }
            _ => None,
        };

        if let Some(constraint) = conflict {
            return StoreError::Conflict { constraint };
        }

        if matches!(
            err,
            rusqlite::Error::FromSqlConversionFailure(..)
                | rusqlite::Error::IntegralValueOutOfRange(..)
                | rusqlite::Error::InvalidColumnType(..)
        ) {
            return StoreError::Corrupt(err.to_string());
        }

        error!(error = %err, "SQLite failure");
        StoreError::Backend(Box::new(err))
    }
}

impl ToSql for UserId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for UserId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_str().map(UserId::from)
    }
}

impl ToSql for MatchId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.to_string()))
    }
}

impl FromSql for MatchId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        Uuid::parse_str(raw)
            .map(MatchId)
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

impl ToSql for MessageId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0))
    }
}

impl FromSql for MessageId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        i64::column_result(value).map(MessageId)
    }
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let micros: i64 = row.get(idx)?;
    from_micros(micros).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, micros))
}

fn like_from_row(row: &Row<'_>) -> rusqlite::Result<Like> {
    Ok(Like {
        liker: row.get(0)?,
        liked: row.get(1)?,
        created_at: timestamp(row, 2)?,
    })
}

fn match_from_row(row: &Row<'_>) -> rusqlite::Result<Match> {
    Ok(Match {
        id: row.get(0)?,
        user_a: row.get(1)?,
        user_b: row.get(2)?,
        created_at: timestamp(row, 3)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        match_id: row.get(1)?,
        sender_id: row.get(2)?,
        body: row.get(3)?,
        client_key: row.get(4)?,
        created_at: timestamp(row, 5)?,
    })
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl InterestStore for SqliteStore {
    async fn insert_like(&self, like: &Like) -> Result<(), StoreError> {
        let like = like.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO likes (liker_id, liked_id, created_at) VALUES (?1, ?2, ?3)",
                params![like.liker, like.liked, to_micros(like.created_at)],
            )?;
            Ok(())
        })
        .await
    }

    async fn find_like(
        &self,
        liker: &UserId,
        liked: &UserId,
    ) -> Result<Option<Like>, StoreError> {
        let (liker, liked) = (liker.clone(), liked.clone());
        self.with_conn(move |conn| {
            let like = conn
                .query_row(
                    "SELECT liker_id, liked_id, created_at FROM likes
                     WHERE liker_id = ?1 AND liked_id = ?2",
                    params![liker, liked],
                    like_from_row,
                )
                .optional()?;
            Ok(like)
        })
        .await
    }

    async fn delete_like(&self, liker: &UserId, liked: &UserId) -> Result<bool, StoreError> {
        let (liker, liked) = (liker.clone(), liked.clone());
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM likes WHERE liker_id = ?1 AND liked_id = ?2",
                params![liker, liked],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn likes_to(&self, user: &UserId) -> Result<Vec<Like>, StoreError> {
        let user = user.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT liker_id, liked_id, created_at FROM likes
                 WHERE liked_id = ?1 ORDER BY created_at ASC",
            )?;
            let likes = stmt
                .query_map(params![user], like_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(likes)
        })
        .await
    }

    async fn likes_from(&self, user: &UserId) -> Result<Vec<Like>, StoreError> {
        let user = user.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT liker_id, liked_id, created_at FROM likes
                 WHERE liker_id = ?1 ORDER BY created_at ASC",
            )?;
            let likes = stmt
                .query_map(params![user], like_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(likes)
        })
        .await
    }
}

#[async_trait]
impl MatchStore for SqliteStore {
    async fn insert_match(&self, record: &Match) -> Result<(), StoreError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO matches (id, user_a, user_b, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.id,
                    record.user_a,
                    record.user_b,
                    to_micros(record.created_at)
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn find_match_by_pair(&self, pair: &UserPair) -> Result<Option<Match>, StoreError> {
        let pair = pair.clone();
        self.with_conn(move |conn| {
            let found = conn
                .query_row(
                    &format!("SELECT {MATCH_COLUMNS} FROM matches WHERE user_a = ?1 AND user_b = ?2"),
                    params![pair.low(), pair.high()],
                    match_from_row,
                )
                .optional()?;
            Ok(found)
        })
        .await
    }

    async fn find_match(&self, id: &MatchId) -> Result<Option<Match>, StoreError> {
        let id = *id;
        self.with_conn(move |conn| {
            let found = conn
                .query_row(
                    &format!("SELECT {MATCH_COLUMNS} FROM matches WHERE id = ?1"),
                    params![id],
                    match_from_row,
                )
                .optional()?;
            Ok(found)
        })
        .await
    }

    async fn matches_for(&self, user: &UserId) -> Result<Vec<Match>, StoreError> {
        let user = user.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MATCH_COLUMNS} FROM matches
                 WHERE user_a = ?1 OR user_b = ?1
                 ORDER BY created_at DESC"
            ))?;
            let matches = stmt
                .query_map(params![user], match_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(matches)
        })
        .await
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn insert_message(&self, new: &NewMessage) -> Result<Message, StoreError> {
        let new = new.clone();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;

            let last: Option<i64> = tx.query_row(
                "SELECT MAX(created_at) FROM messages WHERE match_id = ?1",
                params![new.match_id],
                |row| row.get(0),
            )?;

            // Strictly increasing within a conversation even if the clock stalls or steps back.
            let sent = to_micros(new.sent_at);
            let created = match last {
                Some(last) if last >= sent => last + 1,
                _ => sent,
            };

            tx.execute(
                "INSERT INTO messages (match_id, sender_id, body, client_key, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![new.match_id, new.sender_id, new.body, new.client_key, created],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;

            let created_at = from_micros(created)
                .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {created}")))?;

            Ok(Message {
                id: MessageId(id),
                match_id: new.match_id,
                sender_id: new.sender_id,
                body: new.body,
                client_key: new.client_key,
                created_at,
            })
        })
        .await
    }

    async fn find_by_client_key(
        &self,
        match_id: &MatchId,
        sender: &UserId,
        client_key: &str,
    ) -> Result<Option<Message>, StoreError> {
        let (match_id, sender, client_key) = (*match_id, sender.clone(), client_key.to_string());
        self.with_conn(move |conn| {
            let found = conn
                .query_row(
                    &format!(
                        "SELECT {MESSAGE_COLUMNS} FROM messages
                         WHERE match_id = ?1 AND sender_id = ?2 AND client_key = ?3"
                    ),
                    params![match_id, sender, client_key],
                    message_from_row,
                )
                .optional()?;
            Ok(found)
        })
        .await
    }

    async fn messages_after(
        &self,
        match_id: &MatchId,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let match_id = *match_id;
        let after = after.map(to_micros).unwrap_or(i64::MIN);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE match_id = ?1 AND created_at > ?2
                 ORDER BY created_at ASC, id ASC
                 LIMIT ?3"
            ))?;
            let messages = stmt
                .query_map(params![match_id, after, sql_limit(limit)], message_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(messages)
        })
        .await
    }

    async fn last_message(&self, match_id: &MatchId) -> Result<Option<Message>, StoreError> {
        let match_id = *match_id;
        self.with_conn(move |conn| {
            let found = conn
                .query_row(
                    &format!(
                        "SELECT {MESSAGE_COLUMNS} FROM messages
                         WHERE match_id = ?1
                         ORDER BY created_at DESC, id DESC
                         LIMIT 1"
                    ),
                    params![match_id],
                    message_from_row,
                )
                .optional()?;
            Ok(found)
        })
        .await
    }

    async fn messages_after_id(
        &self,
        after: MessageId,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE id > ?1
                 ORDER BY id ASC
                 LIMIT ?2"
            ))?;
            let messages = stmt
                .query_map(params![after, sql_limit(limit)], message_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(messages)
        })
        .await
    }

    async fn latest_message_id(&self) -> Result<MessageId, StoreError> {
        self.with_conn(|conn| {
            let id = conn.query_row("SELECT COALESCE(MAX(id), 0) FROM messages", [], |row| {
                row.get(0)
            })?;
            Ok(id)
        })
        .await
    }

    async fn count_from_others(
        &self,
        match_id: &MatchId,
        reader: &UserId,
        after: Option<DateTime<Utc>>,
    ) -> Result<u64, StoreError> {
        let (match_id, reader) = (*match_id, reader.clone());
        let after = after.map(to_micros).unwrap_or(i64::MIN);
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE match_id = ?1 AND sender_id <> ?2 AND created_at > ?3",
                params![match_id, reader, after],
                |row| row.get(0),
            )?;
            Ok(u64::try_from(count).unwrap_or_default())
        })
        .await
    }
}

#[async_trait]
impl WatermarkStore for SqliteStore {
    async fn advance_watermark(&self, watermark: &ReadWatermark) -> Result<bool, StoreError> {
        let watermark = watermark.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "INSERT INTO read_watermarks (user_id, match_id, last_read_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (user_id, match_id) DO UPDATE
                 SET last_read_at = excluded.last_read_at
                 WHERE excluded.last_read_at > read_watermarks.last_read_at",
                params![
                    watermark.user_id,
                    watermark.match_id,
                    to_micros(watermark.last_read_at)
                ],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn find_watermark(
        &self,
        user: &UserId,
        match_id: &MatchId,
    ) -> Result<Option<ReadWatermark>, StoreError> {
        let (user, match_id) = (user.clone(), *match_id);
        self.with_conn(move |conn| {
            let found = conn
                .query_row(
                    "SELECT user_id, match_id, last_read_at FROM read_watermarks
                     WHERE user_id = ?1 AND match_id = ?2",
                    params![user, match_id],
                    |row| {
                        Ok(ReadWatermark {
                            user_id: row.get(0)?,
                            match_id: row.get(1)?,
                            last_read_at: timestamp(row, 2)?,
                        })
                    },
                )
                .optional()?;
            Ok(found)
        })
        .await
    }
}
