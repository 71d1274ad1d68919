//! v002 -- Maintenance freeze columns on `sensors`.
//!
//! `frozen_until` is non-null iff the sensor is currently under maintenance;
//! while set, the sensor contributes `frozen_is_up` to its section regardless
//! of heartbeats. `frozen_at` stamps bulk freezes so a deploy can unfreeze
//! only the rows it froze.

use rusqlite::Connection;

const UP_SQL: &str = r#"
ALTER TABLE sensors ADD COLUMN frozen_until TEXT;
ALTER TABLE sensors ADD COLUMN frozen_is_up INTEGER;
ALTER TABLE sensors ADD COLUMN frozen_at TEXT;
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
