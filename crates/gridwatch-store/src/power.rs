//! Derived section power state and the append-only transition log.
//!
//! `apply_transition` is the single write path: state row and event row are
//! committed in one transaction, and the event append is alternation-checked
//! so duplicate transitions are dropped at write no matter what the caller
//! computed.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::database::Store;
use crate::error::Result;
use crate::models::{ts_from_col, EventType, PowerEvent, SectionPowerState};

impl Store {
    pub fn section_state(&self, building_id: i64, section_id: i64) -> Result<Option<SectionPowerState>> {
        self.read(|conn| {
            conn.query_row(
                "SELECT building_id, section_id, is_up, last_change, updated_at
                 FROM section_power_state
                 WHERE building_id = ?1 AND section_id = ?2",
                params![building_id, section_id],
                row_to_state,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    pub fn all_section_states(&self) -> Result<Vec<SectionPowerState>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT building_id, section_id, is_up, last_change, updated_at
                 FROM section_power_state
                 ORDER BY building_id ASC, section_id ASC",
            )?;
            let rows = stmt.query_map([], row_to_state)?;

            let mut states = Vec::new();
            for row in rows {
                states.push(row?);
            }
            Ok(states)
        })
    }

    /// Persist a section state change and append the matching event.
    ///
    /// Returns the new event id, or `None` when nothing changed (the state
    /// already matched, or the event would have broken alternation). The
    /// state row is lazily created on first write for the section.
    pub fn apply_transition(
        &self,
        building_id: i64,
        section_id: i64,
        is_up: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        let now_str = now.to_rfc3339();
        self.with_tx(|tx| {
            let prev: Option<bool> = tx
                .query_row(
                    "SELECT is_up FROM section_power_state
                     WHERE building_id = ?1 AND section_id = ?2",
                    params![building_id, section_id],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?
                .map(|v| v != 0);

            if prev == Some(is_up) {
                return Ok(None);
            }

            if prev.is_none() {
                tx.execute(
                    "INSERT INTO section_power_state
                         (building_id, section_id, is_up, last_change, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)",
                    params![building_id, section_id, is_up as i64, now_str],
                )?;
            } else {
                tx.execute(
                    "UPDATE section_power_state
                     SET is_up = ?3, last_change = ?4, updated_at = ?4
                     WHERE building_id = ?1 AND section_id = ?2",
                    params![building_id, section_id, is_up as i64, now_str],
                )?;
            }

            let event_type = EventType::from_is_up(is_up);
            let last: Option<String> = tx
                .query_row(
                    "SELECT event_type FROM events
                     WHERE building_id = ?1 AND section_id = ?2
                     ORDER BY id DESC LIMIT 1",
                    params![building_id, section_id],
                    |row| row.get(0),
                )
                .optional()?;
            if last.as_deref() == Some(event_type.as_str()) {
                // Duplicate transition: keep the log alternating.
                return Ok(None);
            }

            tx.execute(
                "INSERT INTO events (event_type, building_id, section_id, timestamp)
                 VALUES (?1, ?2, ?3, ?4)",
                params![event_type.as_str(), building_id, section_id, now_str],
            )?;
            Ok(Some(tx.last_insert_rowid()))
        })
    }

    /// Latest event for a section, if any.
    pub fn last_event(&self, building_id: i64, section_id: i64) -> Result<Option<PowerEvent>> {
        self.read(|conn| {
            conn.query_row(
                "SELECT id, event_type, building_id, section_id, timestamp
                 FROM events
                 WHERE building_id = ?1 AND section_id = ?2
                 ORDER BY id DESC LIMIT 1",
                params![building_id, section_id],
                row_to_event,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    /// Event-log tail after `id`, in append order. Drives the transition
    /// emitter's cursor.
    pub fn events_after(&self, id: i64) -> Result<Vec<PowerEvent>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, event_type, building_id, section_id, timestamp
                 FROM events WHERE id > ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![id], row_to_event)?;

            let mut events = Vec::new();
            for row in rows {
                events.push(row?);
            }
            Ok(events)
        })
    }

    /// Full history for one section, oldest first.
    pub fn list_events(&self, building_id: i64, section_id: i64) -> Result<Vec<PowerEvent>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, event_type, building_id, section_id, timestamp
                 FROM events
                 WHERE building_id = ?1 AND section_id = ?2
                 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![building_id, section_id], row_to_event)?;

            let mut events = Vec::new();
            for row in rows {
                events.push(row?);
            }
            Ok(events)
        })
    }
}

fn row_to_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<SectionPowerState> {
    let last_change: String = row.get(3)?;
    let updated_at: String = row.get(4)?;
    Ok(SectionPowerState {
        building_id: row.get(0)?,
        section_id: row.get(1)?,
        is_up: row.get::<_, i64>(2)? != 0,
        last_change: ts_from_col(3, &last_change)?,
        updated_at: ts_from_col(4, &updated_at)?,
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<PowerEvent> {
    let kind: String = row.get(1)?;
    let event_type = EventType::parse(&kind).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown event type: {kind}").into(),
        )
    })?;
    let timestamp: String = row.get(4)?;

    Ok(PowerEvent {
        id: row.get(0)?,
        event_type,
        building_id: row.get(2)?,
        section_id: row.get(3)?,
        timestamp: ts_from_col(4, &timestamp)?,
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
    fn first_write_creates_state_and_event() {
        let (_dir, store) = open_store();

        let event_id = store.apply_transition(1, 2, true, t0()).unwrap();
        assert!(event_id.is_some());

        let state = store.section_state(1, 2).unwrap().unwrap();
        assert!(state.is_up);
        assert_eq!(state.last_change, t0());

        let events = store.list_events(1, 2).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Up);
    }

    #[test]
    fn unchanged_state_is_a_no_op() {
        let (_dir, store) = open_store();
        store.apply_transition(1, 2, true, t0()).unwrap();

        let again = store
            .apply_transition(1, 2, true, t0() + Duration::seconds(15))
            .unwrap();
        assert_eq!(again, None);
        assert_eq!(store.list_events(1, 2).unwrap().len(), 1);

        // last_change must not move on a no-op.
        let state = store.section_state(1, 2).unwrap().unwrap();
        assert_eq!(state.last_change, t0());
    }

    #[test]
    fn events_alternate_per_section() {
        let (_dir, store) = open_store();
        let mut at = t0();
        for is_up in [true, false, true, false] {
            store.apply_transition(1, 2, is_up, at).unwrap();
            at += Duration::minutes(10);
        }

        let events = store.list_events(1, 2).unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            kinds,
            vec![EventType::Up, EventType::Down, EventType::Up, EventType::Down]
        );

        // Sections are independent.
        assert!(store.list_events(1, 1).unwrap().is_empty());
    }

    #[test]
    fn events_after_returns_the_tail() {
        let (_dir, store) = open_store();
        let first = store.apply_transition(1, 2, true, t0()).unwrap().unwrap();
        let second = store
            .apply_transition(1, 2, false, t0() + Duration::minutes(5))
            .unwrap()
            .unwrap();

        let tail = store.events_after(first).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].id, second);
        assert!(store.events_after(second).unwrap().is_empty());
    }
}
