//! v003 -- Persisted admin job queue.
//!
//! FIFO with lease semantics: the control plane enqueues, the data-plane
//! worker claims, heartbeats `updated_at`, and finishes. Terminal rows are
//! retained for audit.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS admin_jobs (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    kind             TEXT NOT NULL,
    payload          TEXT NOT NULL,              -- JSON
    status           TEXT NOT NULL DEFAULT 'pending',
    created_by       INTEGER,
    created_at       TEXT NOT NULL,
    started_at       TEXT,
    finished_at      TEXT,
    updated_at       TEXT,                      -- lease heartbeat
    attempts         INTEGER NOT NULL DEFAULT 0,
    progress_current INTEGER NOT NULL DEFAULT 0,
    progress_total   INTEGER NOT NULL DEFAULT 0,
    last_error       TEXT
);

CREATE INDEX IF NOT EXISTS idx_admin_jobs_queue ON admin_jobs(status, created_at);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
