//! Subscriber records and notification-setting accessors.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::database::Store;
use crate::error::Result;
use crate::models::{opt_ts_from_col, NotifyRecipient, Subscriber};

impl Store {
    /// Create the subscriber row if missing, refreshing profile fields.
    /// The original `subscribed_at` is preserved across updates.
    pub fn ensure_subscriber(
        &self,
        chat_id: i64,
        username: Option<&str>,
        first_name: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.write(|conn| {
            conn.execute(
                "INSERT INTO subscribers (chat_id, username, first_name, subscribed_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(chat_id) DO UPDATE SET
                     username = excluded.username,
                     first_name = excluded.first_name,
                     is_active = 1,
                     subscribed_at = COALESCE(subscribers.subscribed_at, excluded.subscribed_at)",
                params![chat_id, username, first_name, now.to_rfc3339()],
            )?;
            Ok(())
        })
    }

    pub fn get_subscriber(&self, chat_id: i64) -> Result<Option<Subscriber>> {
        self.read(|conn| {
            conn.query_row(
                "SELECT chat_id, username, first_name, subscribed_at, building_id, section_id,
                        light_notifications, alert_notifications, schedule_notifications,
                        quiet_start, quiet_end, is_active
                 FROM subscribers WHERE chat_id = ?1",
                params![chat_id],
                row_to_subscriber,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    /// Point the subscriber at a building section.
    pub fn set_subscriber_section(
        &self,
        chat_id: i64,
        building_id: i64,
        section_id: i64,
    ) -> Result<bool> {
        self.write(|conn| {
            let affected = conn.execute(
                "UPDATE subscribers SET building_id = ?2, section_id = ?3 WHERE chat_id = ?1",
                params![chat_id, building_id, section_id],
            )?;
            Ok(affected > 0)
        })
    }

    pub fn set_light_notifications(&self, chat_id: i64, enabled: bool) -> Result<bool> {
        self.set_toggle(chat_id, "light_notifications", enabled)
    }

    pub fn set_alert_notifications(&self, chat_id: i64, enabled: bool) -> Result<bool> {
        self.set_toggle(chat_id, "alert_notifications", enabled)
    }

    pub fn set_schedule_notifications(&self, chat_id: i64, enabled: bool) -> Result<bool> {
        self.set_toggle(chat_id, "schedule_notifications", enabled)
    }

    fn set_toggle(&self, chat_id: i64, column: &str, enabled: bool) -> Result<bool> {
        self.write(|conn| {
            let affected = conn.execute(
                &format!("UPDATE subscribers SET {column} = ?2 WHERE chat_id = ?1"),
                params![chat_id, enabled as i64],
            )?;
            Ok(affected > 0)
        })
    }

    /// Set or clear ([`None`], [`None`]) the quiet-hours window.
    pub fn set_quiet_hours(
        &self,
        chat_id: i64,
        start_hour: Option<i64>,
        end_hour: Option<i64>,
    ) -> Result<bool> {
        self.write(|conn| {
            let affected = conn.execute(
                "UPDATE subscribers SET quiet_start = ?2, quiet_end = ?3 WHERE chat_id = ?1",
                params![chat_id, start_hour, end_hour],
            )?;
            Ok(affected > 0)
        })
    }

    /// Permanent messenger failures land here; the subscriber stops
    /// receiving anything until they come back.
    pub fn mark_subscriber_inactive(&self, chat_id: i64) -> Result<bool> {
        self.write(|conn| {
            let affected = conn.execute(
                "UPDATE subscribers SET is_active = 0 WHERE chat_id = ?1",
                params![chat_id],
            )?;
            Ok(affected > 0)
        })
    }

    /// Candidates for a light-notification fan-out: active, toggle on,
    /// subscribed to the building, and either section-agnostic or on the
    /// affected section. Quiet hours are evaluated by the notifier.
    pub fn light_notify_recipients(
        &self,
        building_id: i64,
        section_id: i64,
    ) -> Result<Vec<NotifyRecipient>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT chat_id, quiet_start, quiet_end
                 FROM subscribers
                 WHERE is_active = 1
                   AND light_notifications = 1
                   AND building_id = ?1
                   AND (section_id IS NULL OR section_id = ?2)
                 ORDER BY chat_id ASC",
            )?;
            let rows = stmt.query_map(params![building_id, section_id], row_to_recipient)?;

            let mut recipients = Vec::new();
            for row in rows {
                recipients.push(row?);
            }
            Ok(recipients)
        })
    }

    /// Everyone still active, for admin broadcasts.
    pub fn active_recipients(&self) -> Result<Vec<NotifyRecipient>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT chat_id, quiet_start, quiet_end
                 FROM subscribers WHERE is_active = 1 ORDER BY chat_id ASC",
            )?;
            let rows = stmt.query_map([], row_to_recipient)?;

            let mut recipients = Vec::new();
            for row in rows {
                recipients.push(row?);
            }
            Ok(recipients)
        })
    }
}

fn row_to_recipient(row: &rusqlite::Row<'_>) -> rusqlite::Result<NotifyRecipient> {
    Ok(NotifyRecipient {
        chat_id: row.get(0)?,
        quiet_start: row.get(1)?,
        quiet_end: row.get(2)?,
    })
}

fn row_to_subscriber(row: &rusqlite::Row<'_>) -> rusqlite::Result<Subscriber> {
    let subscribed_at: Option<String> = row.get(3)?;
    Ok(Subscriber {
        chat_id: row.get(0)?,
        username: row.get(1)?,
        first_name: row.get(2)?,
        subscribed_at: opt_ts_from_col(3, subscribed_at)?,
        building_id: row.get(4)?,
        section_id: row.get(5)?,
        light_notifications: row.get::<_, i64>(6)? != 0,
        alert_notifications: row.get::<_, i64>(7)? != 0,
        schedule_notifications: row.get::<_, i64>(8)? != 0,
        quiet_start: row.get(9)?,
        quiet_end: row.get(10)?,
        is_active: row.get::<_, i64>(11)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        (dir, store)
    }

    fn now() -> DateTime<Utc> {
        "2026-01-22T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn defaults_are_all_toggles_on() {
        let (_dir, store) = open_store();
        store.ensure_subscriber(42, Some("resident"), None, now()).unwrap();

        let sub = store.get_subscriber(42).unwrap().unwrap();
        assert!(sub.light_notifications);
        assert!(sub.alert_notifications);
        assert!(sub.schedule_notifications);
        assert_eq!(sub.quiet_start, None);
        assert_eq!(sub.quiet_end, None);
        assert!(sub.is_active);
    }

    #[test]
    fn ensure_keeps_original_subscribed_at() {
        let (_dir, store) = open_store();
        store.ensure_subscriber(42, None, None, now()).unwrap();
        store
            .ensure_subscriber(42, Some("late-name"), None, now() + chrono::Duration::days(1))
            .unwrap();

        let sub = store.get_subscriber(42).unwrap().unwrap();
        assert_eq!(sub.subscribed_at, Some(now()));
        assert_eq!(sub.username.as_deref(), Some("late-name"));
    }

    #[test]
    fn recipient_selection_filters_building_section_and_toggles() {
        let (_dir, store) = open_store();

        // On the affected section.
        store.ensure_subscriber(1, None, None, now()).unwrap();
        store.set_subscriber_section(1, 1, 2).unwrap();

        // Same building, no section preference: included.
        store.ensure_subscriber(2, None, None, now()).unwrap();
        store
            .write(|conn| {
                conn.execute(
                    "UPDATE subscribers SET building_id = 1 WHERE chat_id = 2",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        // Different section: excluded.
        store.ensure_subscriber(3, None, None, now()).unwrap();
        store.set_subscriber_section(3, 1, 1).unwrap();

        // Toggle off: excluded.
        store.ensure_subscriber(4, None, None, now()).unwrap();
        store.set_subscriber_section(4, 1, 2).unwrap();
        store.set_light_notifications(4, false).unwrap();

        // Inactive: excluded.
        store.ensure_subscriber(5, None, None, now()).unwrap();
        store.set_subscriber_section(5, 1, 2).unwrap();
        store.mark_subscriber_inactive(5).unwrap();

        let ids: Vec<i64> = store
            .light_notify_recipients(1, 2)
            .unwrap()
            .into_iter()
            .map(|r| r.chat_id)
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn quiet_hours_round_trip() {
        let (_dir, store) = open_store();
        store.ensure_subscriber(42, None, None, now()).unwrap();

        store.set_quiet_hours(42, Some(23), Some(7)).unwrap();
        let sub = store.get_subscriber(42).unwrap().unwrap();
        assert_eq!((sub.quiet_start, sub.quiet_end), (Some(23), Some(7)));

        store.set_quiet_hours(42, None, None).unwrap();
        let sub = store.get_subscriber(42).unwrap().unwrap();
        assert_eq!((sub.quiet_start, sub.quiet_end), (None, None));
    }
}
