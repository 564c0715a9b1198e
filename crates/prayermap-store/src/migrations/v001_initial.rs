//! v001 -- Initial schema: `prayer_connections` and `user_presence`.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Prayer connections (memorial lines). Insert-only.
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS prayer_connections (
    id             TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    prayer_id      TEXT NOT NULL,               -- UUID v4
    requester_id   TEXT NOT NULL,
    responder_id   TEXT NOT NULL,
    requester_lat  REAL NOT NULL,
    requester_lng  REAL NOT NULL,
    responder_lat  REAL NOT NULL,
    responder_lng  REAL NOT NULL,
    created_at     TEXT NOT NULL,               -- RFC-3339
    expires_at     TEXT                         -- display hint only
);

CREATE INDEX IF NOT EXISTS idx_connections_prayer ON prayer_connections(prayer_id);
CREATE INDEX IF NOT EXISTS idx_connections_requester ON prayer_connections(requester_id);
CREATE INDEX IF NOT EXISTS idx_connections_responder ON prayer_connections(responder_id);

-- ----------------------------------------------------------------
-- Presence, one row per user, last write wins
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS user_presence (
    user_id          TEXT PRIMARY KEY NOT NULL,
    status           TEXT NOT NULL,             -- online | away | offline | active_task
    last_seen        TEXT NOT NULL,
    custom_status    TEXT,
    active_task_ids  TEXT NOT NULL DEFAULT '[]', -- JSON array of prayer UUIDs
    device_id        TEXT NOT NULL,
    connection_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_presence_status ON user_presence(status);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
