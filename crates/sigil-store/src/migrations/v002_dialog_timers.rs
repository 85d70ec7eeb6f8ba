use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS dialog_timers (
    dialog_id TEXT PRIMARY KEY NOT NULL,
    ttl_secs  INTEGER NOT NULL              -- disappearing-message TTL; no row = off
);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
