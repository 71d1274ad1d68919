//! Database connection management.
//!
//! The [`Store`] struct owns a [`rusqlite::Connection`] and guarantees that
//! migrations have run and the building catalog is seeded before any other
//! operation. All access goes through the store: reads share the connection,
//! mutations additionally pass the process-wide writer gate with a bounded
//! busy-retry loop.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Connection;

use crate::buildings;
use crate::error::{Result, StoreError};
use crate::migrations;

/// Backoff schedule for transient `SQLITE_BUSY`/`SQLITE_LOCKED` errors.
/// Truncated exponential: gives up after the last step (~640 ms total).
const BUSY_BACKOFF_MS: &[u64] = &[10, 20, 40, 80, 160, 320];

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path`, run migrations and seed the
    /// building catalog.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run_migrations(&conn)?;
        buildings::seed_catalog(&conn)?;

        tracing::info!(path = %path.display(), "database ready");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Cheap connectivity probe for the health endpoint.
    pub fn ping(&self) -> bool {
        self.read(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(StoreError::from)
        })
        .is_ok()
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock();
        f(&conn)
    }

    /// Run a mutating statement through the writer gate.
    pub(crate) fn write<T>(&self, f: impl Fn(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock();
        run_with_busy_retry(|| f(&conn))
    }

    /// Run `f` inside a single transaction, retrying the whole transaction on
    /// transient busy errors.
    pub(crate) fn with_tx<T>(
        &self,
        f: impl Fn(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.lock();
        run_with_busy_retry(|| {
            let tx = conn.transaction()?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
    }
}

fn run_with_busy_retry<T>(mut attempt: impl FnMut() -> Result<T>) -> Result<T> {
    let mut backoff = BUSY_BACKOFF_MS.iter();
    loop {
        match attempt() {
            Err(err) if is_transient_busy(&err) => match backoff.next() {
                Some(ms) => {
                    tracing::debug!(delay_ms = ms, "database busy, retrying");
                    std::thread::sleep(Duration::from_millis(*ms));
                }
                None => return Err(StoreError::Busy),
            },
            other => return other,
        }
    }
}

fn is_transient_busy(err: &StoreError) -> bool {
    match err {
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
            e.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}
