//! Process-wide key/value switches and markers.

use rusqlite::{params, OptionalExtension};

use crate::database::Store;
use crate::error::Result;

impl Store {
    pub fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        self.write(|conn| {
            conn.execute(
                "INSERT INTO kv (k, v) VALUES (?1, ?2)
                 ON CONFLICT(k) DO UPDATE SET v = excluded.v",
                params![key, value],
            )?;
            Ok(())
        })
    }

    pub fn kv_get(&self, key: &str) -> Result<Option<String>> {
        self.read(|conn| {
            conn.query_row("SELECT v FROM kv WHERE k = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(Into::into)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();

        assert_eq!(store.kv_get("light_notifications_global").unwrap(), None);

        store.kv_set("light_notifications_global", "off").unwrap();
        assert_eq!(
            store.kv_get("light_notifications_global").unwrap().as_deref(),
            Some("off")
        );

        store.kv_set("light_notifications_global", "on").unwrap();
        assert_eq!(
            store.kv_get("light_notifications_global").unwrap().as_deref(),
            Some("on")
        );
    }
}
