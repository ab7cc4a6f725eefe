use rusqlite::Connection;
use tracing::info;

/// Create the schema. Safe to run on every start.
///
/// Timestamps are integer microseconds since the Unix epoch.
pub(crate) fn run(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS likes (
            liker_id    TEXT NOT NULL,
            liked_id    TEXT NOT NULL,
            created_at  INTEGER NOT NULL,
            PRIMARY KEY (liker_id, liked_id),
            CHECK (liker_id <> liked_id)
        );

        CREATE INDEX IF NOT EXISTS idx_likes_liked
            ON likes(liked_id, created_at);

        CREATE TABLE IF NOT EXISTS matches (
            id          TEXT PRIMARY KEY,
            user_a      TEXT NOT NULL,
            user_b      TEXT NOT NULL,
            created_at  INTEGER NOT NULL,
            UNIQUE (user_a, user_b),
            CHECK (user_a < user_b)
        );

        CREATE INDEX IF NOT EXISTS idx_matches_user_b
            ON matches(user_b);

        CREATE TABLE IF NOT EXISTS messages (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            match_id    TEXT NOT NULL REFERENCES matches(id),
            sender_id   TEXT NOT NULL,
            body        TEXT NOT NULL,
            client_key  TEXT,
            created_at  INTEGER NOT NULL,
            UNIQUE (match_id, sender_id, client_key)
        );

        CREATE INDEX IF NOT EXISTS idx_messages_match
            ON messages(match_id, created_at, id);

        CREATE TABLE IF NOT EXISTS read_watermarks (
            user_id       TEXT NOT NULL,
            match_id      TEXT NOT NULL REFERENCES matches(id),
            last_read_at  INTEGER NOT NULL,
            PRIMARY KEY (user_id, match_id)
        );
        ",
    )?;

    info!("Storage migrations complete");
    Ok(())
}
