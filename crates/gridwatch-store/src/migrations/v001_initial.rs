//! v001 -- Initial schema creation.
//!
//! Creates the core tables: `buildings`, `sensors`, `section_power_state`,
//! `events`, `subscribers`, `general_services`, and `kv`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Buildings (static catalog, seeded at init)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS buildings (
    id             INTEGER PRIMARY KEY,
    name           TEXT NOT NULL,
    address        TEXT NOT NULL,
    sections_count INTEGER NOT NULL DEFAULT 1   -- 1..3
);

-- ----------------------------------------------------------------
-- Sensors (one row per field device, never deleted)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS sensors (
    uuid           TEXT PRIMARY KEY NOT NULL,   -- firmware-assigned id
    building_id    INTEGER NOT NULL,
    section_id     INTEGER NOT NULL DEFAULT 1,
    comment        TEXT,
    last_heartbeat TEXT,                        -- ISO-8601 / RFC-3339
    created_at     TEXT NOT NULL,
    is_active      INTEGER NOT NULL DEFAULT 1,  -- boolean 0/1

    FOREIGN KEY (building_id) REFERENCES buildings(id)
);

CREATE INDEX IF NOT EXISTS idx_sensors_section ON sensors(building_id, section_id);

-- ----------------------------------------------------------------
-- Derived per-section power state (lazily created)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS section_power_state (
    building_id INTEGER NOT NULL,
    section_id  INTEGER NOT NULL,
    is_up       INTEGER NOT NULL DEFAULT 1,
    last_change TEXT NOT NULL,
    updated_at  TEXT NOT NULL,

    PRIMARY KEY (building_id, section_id)
);

-- ----------------------------------------------------------------
-- Power transition log (append-only; up/down alternate per section)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type  TEXT NOT NULL,                  -- 'up' | 'down'
    building_id INTEGER NOT NULL,
    section_id  INTEGER NOT NULL,
    timestamp   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_section ON events(building_id, section_id, id);

-- ----------------------------------------------------------------
-- Subscribers (chat users)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS subscribers (
    chat_id                INTEGER PRIMARY KEY,
    username               TEXT,
    first_name             TEXT,
    subscribed_at          TEXT,
    building_id            INTEGER,
    section_id             INTEGER,
    light_notifications    INTEGER NOT NULL DEFAULT 1,
    alert_notifications    INTEGER NOT NULL DEFAULT 1,
    schedule_notifications INTEGER NOT NULL DEFAULT 1,
    quiet_start            INTEGER,             -- hour 0..23, NULL = off
    quiet_end              INTEGER,
    is_active              INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_subscribers_building ON subscribers(building_id);

-- ----------------------------------------------------------------
-- Service categories (catalog browsing lives in the mini-app; only
-- the seeded catalog belongs to this service)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS general_services (
    id   INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

-- ----------------------------------------------------------------
-- Process-wide switches and markers
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS kv (
    k TEXT PRIMARY KEY NOT NULL,
    v TEXT
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
