//! Sensor rows: heartbeat upserts and the maintenance-freeze lifecycle.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::database::Store;
use crate::error::Result;
use crate::models::{opt_ts_from_col, ts_from_col, Sensor};

impl Store {
    /// Register a heartbeat for `uuid`, creating the sensor row on first
    /// contact. Returns `true` when the sensor is new.
    ///
    /// `last_heartbeat` is always advanced. Placement (`building_id`,
    /// `section_id`, `comment`) is refreshed only while the sensor is not
    /// frozen, so a mid-maintenance heartbeat cannot move the sensor.
    pub fn upsert_sensor_heartbeat(
        &self,
        uuid: &str,
        building_id: i64,
        section_id: i64,
        comment: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let now_str = now.to_rfc3339();
        self.with_tx(|tx| {
            let frozen_until: Option<Option<String>> = tx
                .query_row(
                    "SELECT frozen_until FROM sensors WHERE uuid = ?1",
                    params![uuid],
                    |row| row.get(0),
                )
                .optional()?;

            match frozen_until {
                None => {
                    tx.execute(
                        "INSERT INTO sensors (uuid, building_id, section_id, comment,
                                              last_heartbeat, created_at, is_active)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?5, 1)",
                        params![uuid, building_id, section_id, comment, now_str],
                    )?;
                    Ok(true)
                }
                Some(frozen_until) => {
                    let frozen = opt_ts_from_col(0, frozen_until)?
                        .is_some_and(|until| until > now);
                    if frozen {
                        tx.execute(
                            "UPDATE sensors SET last_heartbeat = ?2, is_active = 1
                             WHERE uuid = ?1",
                            params![uuid, now_str],
                        )?;
                    } else {
                        tx.execute(
                            "UPDATE sensors SET last_heartbeat = ?2, building_id = ?3,
                                    section_id = ?4, comment = ?5, is_active = 1
                             WHERE uuid = ?1",
                            params![uuid, now_str, building_id, section_id, comment],
                        )?;
                    }
                    Ok(false)
                }
            }
        })
    }

    pub fn get_sensor(&self, uuid: &str) -> Result<Option<Sensor>> {
        self.read(|conn| {
            conn.query_row(
                &format!("SELECT {SENSOR_COLUMNS} FROM sensors WHERE uuid = ?1"),
                params![uuid],
                row_to_sensor,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    /// All sensors with `is_active = 1`, the monitor's working set.
    pub fn all_active_sensors(&self) -> Result<Vec<Sensor>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SENSOR_COLUMNS} FROM sensors
                 WHERE is_active = 1
                 ORDER BY building_id ASC, section_id ASC, uuid ASC"
            ))?;
            let rows = stmt.query_map([], row_to_sensor)?;

            let mut sensors = Vec::new();
            for row in rows {
                sensors.push(row?);
            }
            Ok(sensors)
        })
    }

    /// Retire a sensor. The row is kept; it simply stops contributing.
    pub fn deactivate_sensor(&self, uuid: &str) -> Result<bool> {
        self.write(|conn| {
            let affected = conn.execute(
                "UPDATE sensors SET is_active = 0 WHERE uuid = ?1",
                params![uuid],
            )?;
            Ok(affected > 0)
        })
    }

    // ------------------------------------------------------------------
    // Maintenance freeze
    // ------------------------------------------------------------------

    /// Pin a sensor's contribution to `assumed_is_up` until `until`.
    pub fn freeze_sensor(
        &self,
        uuid: &str,
        until: DateTime<Utc>,
        assumed_is_up: bool,
        frozen_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.write(|conn| {
            let affected = conn.execute(
                "UPDATE sensors SET frozen_until = ?2, frozen_is_up = ?3, frozen_at = ?4
                 WHERE uuid = ?1",
                params![
                    uuid,
                    until.to_rfc3339(),
                    assumed_is_up as i64,
                    frozen_at.to_rfc3339()
                ],
            )?;
            Ok(affected > 0)
        })
    }

    /// Clear the freeze fields, returning the sensor to pure liveness.
    pub fn unfreeze_sensor(&self, uuid: &str) -> Result<bool> {
        self.write(|conn| {
            let affected = conn.execute(
                "UPDATE sensors SET frozen_until = NULL, frozen_is_up = NULL, frozen_at = NULL
                 WHERE uuid = ?1",
                params![uuid],
            )?;
            Ok(affected > 0)
        })
    }

    /// Bulk freeze for deploys. Every active sensor is stamped with
    /// `frozen_at` so the matching unfreeze touches only these rows.
    pub fn freeze_all_active(
        &self,
        until: DateTime<Utc>,
        assumed_is_up: bool,
        frozen_at: DateTime<Utc>,
    ) -> Result<usize> {
        self.write(|conn| {
            let affected = conn.execute(
                "UPDATE sensors SET frozen_until = ?1, frozen_is_up = ?2, frozen_at = ?3
                 WHERE is_active = 1",
                params![
                    until.to_rfc3339(),
                    assumed_is_up as i64,
                    frozen_at.to_rfc3339()
                ],
            )?;
            Ok(affected)
        })
    }

    /// Unfreeze only rows stamped by a specific bulk freeze.
    pub fn unfreeze_by_freeze_at(&self, frozen_at: DateTime<Utc>) -> Result<usize> {
        self.write(|conn| {
            let affected = conn.execute(
                "UPDATE sensors SET frozen_until = NULL, frozen_is_up = NULL, frozen_at = NULL
                 WHERE frozen_at = ?1",
                params![frozen_at.to_rfc3339()],
            )?;
            Ok(affected)
        })
    }

    /// Operator escape hatch: clear every freeze regardless of stamp.
    pub fn unfreeze_all_sensors(&self) -> Result<usize> {
        self.write(|conn| {
            let affected = conn.execute(
                "UPDATE sensors SET frozen_until = NULL, frozen_is_up = NULL, frozen_at = NULL
                 WHERE frozen_until IS NOT NULL",
                [],
            )?;
            Ok(affected)
        })
    }
}

const SENSOR_COLUMNS: &str = "uuid, building_id, section_id, comment, last_heartbeat, \
                              created_at, is_active, frozen_until, frozen_is_up, frozen_at";

fn row_to_sensor(row: &rusqlite::Row<'_>) -> rusqlite::Result<Sensor> {
    let last_heartbeat: Option<String> = row.get(4)?;
    let created_str: String = row.get(5)?;
    let frozen_until: Option<String> = row.get(7)?;
    let frozen_is_up: Option<i64> = row.get(8)?;
    let frozen_at: Option<String> = row.get(9)?;

    Ok(Sensor {
        uuid: row.get(0)?,
        building_id: row.get(1)?,
        section_id: row.get(2)?,
        comment: row.get(3)?,
        last_heartbeat: opt_ts_from_col(4, last_heartbeat)?,
        created_at: ts_from_col(5, &created_str)?,
        is_active: row.get::<_, i64>(6)? != 0,
        frozen_until: opt_ts_from_col(7, frozen_until)?,
        frozen_is_up: frozen_is_up.map(|v| v != 0),
        frozen_at: opt_ts_from_col(9, frozen_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        (dir, store)
    }

    fn t0() -> DateTime<Utc> {
        "2026-01-22T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn double_heartbeat_is_idempotent() {
        let (_dir, store) = open_store();

        let created = store
            .upsert_sensor_heartbeat("esp32-newcastle-001", 1, 2, None, t0())
            .unwrap();
        assert!(created);

        let later = t0() + Duration::seconds(30);
        let created = store
            .upsert_sensor_heartbeat("esp32-newcastle-001", 1, 2, None, later)
            .unwrap();
        assert!(!created);

        let sensor = store.get_sensor("esp32-newcastle-001").unwrap().unwrap();
        assert_eq!(sensor.last_heartbeat, Some(later));
        assert_eq!(sensor.created_at, t0());
        assert_eq!(store.all_active_sensors().unwrap().len(), 1);
    }

    #[test]
    fn frozen_sensor_keeps_placement_but_advances_heartbeat() {
        let (_dir, store) = open_store();
        store
            .upsert_sensor_heartbeat("esp32-newcastle-001", 1, 2, Some("roof"), t0())
            .unwrap();

        store
            .freeze_sensor(
                "esp32-newcastle-001",
                t0() + Duration::minutes(20),
                true,
                t0(),
            )
            .unwrap();

        // Heartbeat claiming a different section while frozen.
        let later = t0() + Duration::minutes(5);
        store
            .upsert_sensor_heartbeat("esp32-newcastle-001", 2, 1, Some("moved"), later)
            .unwrap();

        let sensor = store.get_sensor("esp32-newcastle-001").unwrap().unwrap();
        assert_eq!(sensor.last_heartbeat, Some(later));
        assert_eq!(sensor.building_id, 1);
        assert_eq!(sensor.section_id, 2);
        assert_eq!(sensor.comment.as_deref(), Some("roof"));

        // After expiry the placement follows the payload again.
        let after_expiry = t0() + Duration::minutes(25);
        store
            .upsert_sensor_heartbeat("esp32-newcastle-001", 2, 1, Some("moved"), after_expiry)
            .unwrap();
        let sensor = store.get_sensor("esp32-newcastle-001").unwrap().unwrap();
        assert_eq!(sensor.building_id, 2);
        assert_eq!(sensor.section_id, 1);
    }

    #[test]
    fn freeze_unfreeze_round_trip() {
        let (_dir, store) = open_store();
        store
            .upsert_sensor_heartbeat("esp32-newcastle-001", 1, 2, None, t0())
            .unwrap();

        store
            .freeze_sensor(
                "esp32-newcastle-001",
                t0() + Duration::minutes(20),
                false,
                t0(),
            )
            .unwrap();
        let sensor = store.get_sensor("esp32-newcastle-001").unwrap().unwrap();
        assert!(sensor.is_frozen(t0() + Duration::minutes(1)));
        assert_eq!(sensor.frozen_is_up, Some(false));

        store.unfreeze_sensor("esp32-newcastle-001").unwrap();
        let sensor = store.get_sensor("esp32-newcastle-001").unwrap().unwrap();
        assert!(sensor.frozen_until.is_none());
        assert!(sensor.frozen_is_up.is_none());
        assert!(sensor.frozen_at.is_none());
    }

    #[test]
    fn bulk_unfreeze_touches_only_stamped_rows() {
        let (_dir, store) = open_store();
        store
            .upsert_sensor_heartbeat("sensor-a", 1, 1, None, t0())
            .unwrap();
        store
            .upsert_sensor_heartbeat("sensor-b", 1, 2, None, t0())
            .unwrap();
        store.deactivate_sensor("sensor-a").unwrap();

        // Manual freeze on the retired sensor with its own stamp.
        let manual_stamp = t0() - Duration::hours(1);
        store
            .freeze_sensor("sensor-a", t0() + Duration::hours(2), true, manual_stamp)
            .unwrap();

        // Deploy freeze stamps only the active working set.
        let deploy_stamp = t0();
        let frozen = store
            .freeze_all_active(t0() + Duration::minutes(20), true, deploy_stamp)
            .unwrap();
        assert_eq!(frozen, 1);

        let thawed = store.unfreeze_by_freeze_at(deploy_stamp).unwrap();
        assert_eq!(thawed, 1);

        let b = store.get_sensor("sensor-b").unwrap().unwrap();
        assert!(b.frozen_until.is_none());

        // The manual freeze survives the deploy's unfreeze.
        let a = store.get_sensor("sensor-a").unwrap().unwrap();
        assert!(a.frozen_until.is_some());
        assert_eq!(a.frozen_at, Some(manual_stamp));

        assert_eq!(store.unfreeze_all_sensors().unwrap(), 1);
    }

    #[test]
    fn deactivated_sensor_leaves_the_working_set() {
        let (_dir, store) = open_store();
        store
            .upsert_sensor_heartbeat("sensor-a", 1, 1, None, t0())
            .unwrap();

        store.deactivate_sensor("sensor-a").unwrap();
        assert!(store.all_active_sensors().unwrap().is_empty());

        // A new heartbeat re-activates the row.
        store
            .upsert_sensor_heartbeat("sensor-a", 1, 1, None, t0())
            .unwrap();
        assert_eq!(store.all_active_sensors().unwrap().len(), 1);
    }
}
