//! v001 -- Initial schema creation.
//!
//! Creates the two core tables: `messages` and `contacts`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,  -- durable or temp_ id
    dialog_id       TEXT NOT NULL,              -- hashA_hashB or room:<id>
    sender          TEXT NOT NULL,              -- lowercased wallet address
    recipient       TEXT,                       -- NULL for room messages
    ciphertext      TEXT NOT NULL,
    ciphertext_self TEXT,
    timestamp       INTEGER NOT NULL,           -- unix millis, logical send time
    status          TEXT NOT NULL,
    plaintext       TEXT,                       -- resolved display text
    reply_to        TEXT,
    reply_preview   TEXT,
    edited          INTEGER NOT NULL DEFAULT 0, -- boolean 0/1
    edit_count      INTEGER NOT NULL DEFAULT 0,
    reactions       TEXT NOT NULL DEFAULT '{}', -- JSON emoji -> [reactor]
    attachment_ref  TEXT,
    tx_id           TEXT
);

CREATE INDEX IF NOT EXISTS idx_messages_dialog_ts
    ON messages(dialog_id, timestamp DESC);

CREATE INDEX IF NOT EXISTS idx_messages_reply_to
    ON messages(reply_to);

-- ----------------------------------------------------------------
-- Contacts
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS contacts (
    address        TEXT PRIMARY KEY NOT NULL,  -- lowercased wallet address
    display_name   TEXT,
    dialog_id      TEXT NOT NULL,
    last_preview   TEXT,
    last_timestamp INTEGER,                    -- unix millis
    unread         INTEGER NOT NULL DEFAULT 0,
    blocked        INTEGER NOT NULL DEFAULT 0  -- boolean 0/1
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
