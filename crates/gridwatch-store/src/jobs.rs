//! Persisted admin job queue with lease semantics.
//!
//! Producers enqueue `pending` rows; workers claim the oldest pending row in
//! a single transaction, heartbeat `updated_at` while running, and move the
//! row into a terminal state. Rows whose lease lapses are reclaimed by a
//! periodic sweep. Terminal rows are never deleted.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};

use crate::database::Store;
use crate::error::Result;
use crate::models::{opt_ts_from_col, ts_from_col, AdminJob, JobOutcome, JobStatus};

const JOB_COLUMNS: &str = "id, kind, payload, status, created_by, created_at, started_at, \
                           finished_at, updated_at, attempts, progress_current, \
                           progress_total, last_error";

impl Store {
    /// Insert a new job. Returns its id.
    pub fn enqueue_job(
        &self,
        kind: &str,
        payload: &serde_json::Value,
        created_by: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        self.write(|conn| {
            conn.execute(
                "INSERT INTO admin_jobs (kind, payload, status, created_by, created_at)
                 VALUES (?1, ?2, 'pending', ?3, ?4)",
                params![kind, payload.to_string(), created_by, now.to_rfc3339()],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Claim the oldest pending job, if any.
    ///
    /// The pending -> running flip, `started_at`, the attempt counter and the
    /// lease heartbeat all move in one transaction, so two workers can never
    /// observe the same job as claimable.
    pub fn claim_next_job(&self, now: DateTime<Utc>) -> Result<Option<AdminJob>> {
        let now_str = now.to_rfc3339();
        self.with_tx(|tx| {
            let job = tx
                .query_row(
                    &format!(
                        "SELECT {JOB_COLUMNS} FROM admin_jobs
                         WHERE status = 'pending'
                         ORDER BY created_at ASC, id ASC
                         LIMIT 1"
                    ),
                    [],
                    row_to_job,
                )
                .optional()?;

            let Some(mut job) = job else {
                return Ok(None);
            };

            tx.execute(
                "UPDATE admin_jobs
                 SET status = 'running', started_at = ?2, updated_at = ?2,
                     attempts = attempts + 1
                 WHERE id = ?1",
                params![job.id, now_str],
            )?;

            job.status = JobStatus::Running;
            job.started_at = Some(now);
            job.updated_at = Some(now);
            job.attempts += 1;
            Ok(Some(job))
        })
    }

    /// Lease heartbeat + progress counters. Call at least every lease TTL.
    pub fn touch_job_progress(
        &self,
        id: i64,
        current: i64,
        total: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.write(|conn| {
            conn.execute(
                "UPDATE admin_jobs
                 SET progress_current = ?2, progress_total = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![id, current, total, now.to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// Move a running job into a terminal state. Returns `false` (a no-op)
    /// when the job is not currently running, so repeated finishes are safe.
    pub fn finish_job(
        &self,
        id: i64,
        outcome: JobOutcome,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.write(|conn| {
            let affected = conn.execute(
                "UPDATE admin_jobs
                 SET status = ?2, finished_at = ?3, updated_at = ?3, last_error = ?4
                 WHERE id = ?1 AND status = 'running'",
                params![id, outcome.status().as_str(), now.to_rfc3339(), error],
            )?;
            Ok(affected > 0)
        })
    }

    /// Sweep running jobs whose lease (`updated_at`) lapsed: rows with
    /// attempts left go back to pending, exhausted rows fail with
    /// `last_error = "lease expired"`. Returns `(requeued, failed)`.
    pub fn reclaim_expired_jobs(
        &self,
        lease_ttl: Duration,
        max_attempts: i64,
        now: DateTime<Utc>,
    ) -> Result<(usize, usize)> {
        let cutoff = (now - lease_ttl).to_rfc3339();
        let now_str = now.to_rfc3339();
        self.with_tx(|tx| {
            let failed = tx.execute(
                "UPDATE admin_jobs
                 SET status = 'failed', last_error = 'lease expired',
                     finished_at = ?1, updated_at = ?1
                 WHERE status = 'running' AND updated_at < ?2 AND attempts >= ?3",
                params![now_str, cutoff, max_attempts],
            )?;
            let requeued = tx.execute(
                "UPDATE admin_jobs
                 SET status = 'pending', updated_at = ?1
                 WHERE status = 'running' AND updated_at < ?2",
                params![now_str, cutoff],
            )?;
            Ok((requeued, failed))
        })
    }

    pub fn get_job(&self, id: i64) -> Result<Option<AdminJob>> {
        self.read(|conn| {
            conn.query_row(
                &format!("SELECT {JOB_COLUMNS} FROM admin_jobs WHERE id = ?1"),
                params![id],
                row_to_job,
            )
            .optional()
            .map_err(Into::into)
        })
    }
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<AdminJob> {
    let payload_str: String = row.get(2)?;
    let payload = serde_json::from_str(&payload_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let status_str: String = row.get(3)?;
    let status = JobStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown job status: {status_str}").into(),
        )
    })?;

    let created_at: String = row.get(5)?;
    let started_at: Option<String> = row.get(6)?;
    let finished_at: Option<String> = row.get(7)?;
    let updated_at: Option<String> = row.get(8)?;

    Ok(AdminJob {
        id: row.get(0)?,
        kind: row.get(1)?,
        payload,
        status,
        created_by: row.get(4)?,
        created_at: ts_from_col(5, &created_at)?,
        started_at: opt_ts_from_col(6, started_at)?,
        finished_at: opt_ts_from_col(7, finished_at)?,
        updated_at: opt_ts_from_col(8, updated_at)?,
        attempts: row.get(9)?,
        progress_current: row.get(10)?,
        progress_total: row.get(11)?,
        last_error: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        (dir, store)
    }

    fn t0() -> DateTime<Utc> {
        "2026-01-22T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn claim_is_fifo_by_created_at_then_id() {
        let (_dir, store) = open_store();
        let first = store
            .enqueue_job("broadcast", &json!({"text": "a"}), None, t0())
            .unwrap();
        let second = store
            .enqueue_job("broadcast", &json!({"text": "b"}), None, t0())
            .unwrap();
        let third = store
            .enqueue_job(
                "broadcast",
                &json!({"text": "c"}),
                None,
                t0() + Duration::seconds(1),
            )
            .unwrap();

        let order: Vec<i64> = std::iter::from_fn(|| {
            store
                .claim_next_job(t0() + Duration::seconds(5))
                .unwrap()
                .map(|j| j.id)
        })
        .collect();
        assert_eq!(order, vec![first, second, third]);
        assert!(store
            .claim_next_job(t0() + Duration::seconds(5))
            .unwrap()
            .is_none());
    }

    #[test]
    fn claim_flips_to_running_atomically() {
        let (_dir, store) = open_store();
        let id = store
            .enqueue_job("broadcast", &json!({"text": "hi"}), Some(7), t0())
            .unwrap();

        let job = store.claim_next_job(t0()).unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.started_at, Some(t0()));
        assert_eq!(job.created_by, Some(7));

        let persisted = store.get_job(id).unwrap().unwrap();
        assert_eq!(persisted.status, JobStatus::Running);
        assert_eq!(persisted.attempts, 1);
    }

    #[test]
    fn finish_is_idempotent() {
        let (_dir, store) = open_store();
        let id = store
            .enqueue_job("broadcast", &json!({"text": "hi"}), None, t0())
            .unwrap();
        store.claim_next_job(t0()).unwrap().unwrap();

        assert!(store.finish_job(id, JobOutcome::Done, None, t0()).unwrap());
        assert!(!store.finish_job(id, JobOutcome::Done, None, t0()).unwrap());
        assert!(!store
            .finish_job(id, JobOutcome::Failed, Some("late"), t0())
            .unwrap());

        let job = store.get_job(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.last_error, None);
    }

    #[test]
    fn lease_expiry_requeues_then_fails() {
        let (_dir, store) = open_store();
        let id = store
            .enqueue_job("broadcast", &json!({"text": "hi"}), None, t0())
            .unwrap();
        let lease = Duration::seconds(60);
        let max_attempts = 3;

        let mut at = t0();
        for expected_attempts in 1..=max_attempts {
            let job = store.claim_next_job(at).unwrap().unwrap();
            assert_eq!(job.attempts, expected_attempts);

            // Worker dies: no heartbeat for lease_ttl + 1s.
            at += lease + Duration::seconds(1);
            let (requeued, failed) = store
                .reclaim_expired_jobs(lease, max_attempts, at)
                .unwrap();
            if expected_attempts < max_attempts {
                assert_eq!((requeued, failed), (1, 0));
                assert_eq!(store.get_job(id).unwrap().unwrap().status, JobStatus::Pending);
            } else {
                assert_eq!((requeued, failed), (0, 1));
            }
        }

        let job = store.get_job(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some("lease expired"));
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn heartbeat_keeps_the_lease_alive() {
        let (_dir, store) = open_store();
        let id = store
            .enqueue_job("broadcast", &json!({"text": "hi"}), None, t0())
            .unwrap();
        store.claim_next_job(t0()).unwrap().unwrap();

        let lease = Duration::seconds(60);
        let mid = t0() + Duration::seconds(45);
        store.touch_job_progress(id, 10, 100, mid).unwrap();

        // 90s after claim but only 45s after the heartbeat: still leased.
        let (requeued, failed) = store
            .reclaim_expired_jobs(lease, 3, t0() + Duration::seconds(90))
            .unwrap();
        assert_eq!((requeued, failed), (0, 0));

        let job = store.get_job(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!((job.progress_current, job.progress_total), (10, 100));
    }
}
