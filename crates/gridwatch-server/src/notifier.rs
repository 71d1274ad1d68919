//! Notification fan-out.
//!
//! A worker loop claims admin jobs and dispatches them. Transition jobs fan
//! out to the affected section's subscribers through a pool of sender tasks
//! sharing one global token-interval rate limiter; per-recipient transient
//! errors retry with jittered backoff, permanent errors retire the
//! subscriber. Progress writes double as the job's lease heartbeat.
//!
//! Messenger I/O never runs inside a database transaction.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use gridwatch_store::{AdminJob, EventType, JobOutcome, Store};

use crate::clock::Clock;
use crate::config::{Config, JOB_POLL_INTERVAL, NOTIFY_DEDUP_WINDOW};
use crate::freeze::FreezeController;
use crate::messenger::{Messenger, MessengerError};
use crate::queue::{
    BroadcastPayload, FreezeAllPayload, LightNotifyPayload, UnfreezeAllPayload, KIND_BROADCAST,
    KIND_LIGHT_NOTIFY, KIND_SENSORS_FREEZE_ALL, KIND_SENSORS_UNFREEZE_ALL,
};

/// Flush progress at least this often while a fan-out is running.
const PROGRESS_FLUSH_INTERVAL: Duration = Duration::from_secs(2);
const PROGRESS_FLUSH_EVERY: i64 = 50;

/// Global token-interval limiter: senders reserve evenly spaced slots, so
/// the measured rate never exceeds the configured one over any window.
pub struct BroadcastLimiter {
    interval: Option<Duration>,
    next_slot: Mutex<Option<tokio::time::Instant>>,
}

impl BroadcastLimiter {
    pub fn new(rate_per_sec: f64) -> Self {
        let interval = (rate_per_sec > 0.0).then(|| Duration::from_secs_f64(1.0 / rate_per_sec));
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    pub async fn acquire(&self) {
        let Some(interval) = self.interval else {
            return;
        };
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = tokio::time::Instant::now();
            let slot = match *next {
                Some(at) if at > now => at,
                _ => now,
            };
            *next = Some(slot + interval);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

/// Suppresses duplicate `{subscriber, event}` deliveries inside a short
/// window (at-least-once upstream, at-most-once per window here).
pub struct DedupWindow {
    ttl: Duration,
    seen: StdMutex<HashMap<(i64, i64), Instant>>,
}

impl DedupWindow {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: StdMutex::new(HashMap::new()),
        }
    }

    /// Returns `false` when this pair was already delivered within the
    /// window; records the pair otherwise.
    pub fn check_and_insert(&self, chat_id: i64, event_id: i64) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        seen.retain(|_, at| now.duration_since(*at) < self.ttl);
        if seen.contains_key(&(chat_id, event_id)) {
            return false;
        }
        seen.insert((chat_id, event_id), now);
        true
    }
}

/// Whether `hour` falls inside the `[start, end)` quiet window. A window
/// with `start > end` wraps midnight: 23-7 covers 23,0,1,2,3,4,5,6.
pub fn in_quiet_hours(hour: u32, start: Option<i64>, end: Option<i64>) -> bool {
    let (Some(start), Some(end)) = (start, end) else {
        return false;
    };
    let hour = hour as i64;
    if start <= end {
        start <= hour && hour < end
    } else {
        hour >= start || hour < end
    }
}

/// Message template for a power transition.
pub fn light_notify_text(
    building_name: &str,
    section_id: i64,
    event_type: EventType,
    at: DateTime<Utc>,
) -> String {
    let time = at.format("%H:%M");
    match event_type {
        EventType::Up => format!(
            "✅ <b>{building_name}</b>, section {section_id}: power is back\n🕐 {time}"
        ),
        EventType::Down => format!(
            "❌ <b>{building_name}</b>, section {section_id}: power is out\n🕐 {time}"
        ),
    }
}

pub struct Notifier {
    store: Arc<Store>,
    config: Arc<Config>,
    clock: Clock,
    messenger: Arc<dyn Messenger>,
    limiter: BroadcastLimiter,
    dedup: DedupWindow,
    freezer: FreezeController,
}

impl Notifier {
    pub fn new(
        store: Arc<Store>,
        config: Arc<Config>,
        clock: Clock,
        messenger: Arc<dyn Messenger>,
    ) -> Self {
        let limiter = BroadcastLimiter::new(config.broadcast_rate_per_sec);
        let freezer = FreezeController::new(
            Arc::clone(&store),
            clock.clone(),
            config.default_freeze_duration(),
        );
        Self {
            store,
            config,
            clock,
            messenger,
            limiter,
            dedup: DedupWindow::new(NOTIFY_DEDUP_WINDOW),
            freezer,
        }
    }

    /// Claim-and-execute loop. In-flight dispatches finish before exit.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.store.claim_next_job(self.clock.now()) {
                Ok(Some(job)) => Arc::clone(&self).execute(job).await,
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(JOB_POLL_INTERVAL) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to claim admin job");
                    tokio::select! {
                        _ = tokio::time::sleep(JOB_POLL_INTERVAL * 2) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
    }

    async fn execute(self: Arc<Self>, job: AdminJob) {
        let job_id = job.id;
        let kind = job.kind.clone();
        info!(job = job_id, kind = %kind, attempt = job.attempts, "admin job started");

        let result = match kind.as_str() {
            KIND_LIGHT_NOTIFY => Arc::clone(&self).run_light_notify(&job).await,
            KIND_BROADCAST => Arc::clone(&self).run_broadcast(&job).await,
            KIND_SENSORS_FREEZE_ALL => self.run_freeze_all(&job),
            KIND_SENSORS_UNFREEZE_ALL => self.run_unfreeze_all(&job),
            other => Err(anyhow!("unknown admin job kind: {other}")),
        };

        let now = self.clock.now();
        match result {
            Ok((current, total)) => {
                let _ = self.store.touch_job_progress(job_id, current, total, now);
                if let Err(e) = self.store.finish_job(job_id, JobOutcome::Done, None, now) {
                    error!(job = job_id, error = %e, "failed to finish admin job");
                } else {
                    info!(job = job_id, kind = %kind, sent = current, total, "admin job done");
                }
            }
            Err(e) => {
                error!(job = job_id, kind = %kind, error = %e, "admin job failed");
                let _ = self
                    .store
                    .finish_job(job_id, JobOutcome::Failed, Some(&e.to_string()), now);
            }
        }
    }

    async fn run_light_notify(self: Arc<Self>, job: &AdminJob) -> anyhow::Result<(i64, i64)> {
        let payload: LightNotifyPayload = serde_json::from_value(job.payload.clone())
            .context("light_notify payload")?;

        let building = self.store.get_building(payload.building_id)?;
        let global_off = self
            .store
            .kv_get("light_notifications_global")?
            .as_deref()
            == Some("off");
        let hour = self.clock.local_hour();

        let recipients = self
            .store
            .light_notify_recipients(payload.building_id, payload.section_id)?;

        let mut targets = Vec::new();
        for recipient in recipients {
            let is_admin = self.config.admin_ids.contains(&recipient.chat_id);
            if global_off && !is_admin {
                continue;
            }
            if !is_admin && in_quiet_hours(hour, recipient.quiet_start, recipient.quiet_end) {
                continue;
            }
            if !self.dedup.check_and_insert(recipient.chat_id, payload.event_id) {
                continue;
            }
            targets.push(recipient.chat_id);
        }

        if global_off {
            info!(
                job = job.id,
                "light notifications globally off, admins only"
            );
        }

        let text = light_notify_text(
            &building.name,
            payload.section_id,
            payload.event_type,
            payload.timestamp,
        );
        let job_id = job.id;
        self.fan_out(job_id, targets, &text, Some("HTML")).await
    }

    async fn run_broadcast(self: Arc<Self>, job: &AdminJob) -> anyhow::Result<(i64, i64)> {
        let payload: BroadcastPayload =
            serde_json::from_value(job.payload.clone()).context("broadcast payload")?;
        let text = payload.text.trim();
        if text.is_empty() {
            return Err(anyhow!("broadcast payload.text is empty"));
        }
        let message = format!("{}{}", payload.prefix, text);

        let targets: Vec<i64> = self
            .store
            .active_recipients()?
            .into_iter()
            .map(|r| r.chat_id)
            .collect();

        let job_id = job.id;
        self.fan_out(job_id, targets, &message, payload.parse_mode.as_deref())
            .await
    }

    fn run_freeze_all(&self, job: &AdminJob) -> anyhow::Result<(i64, i64)> {
        let payload: FreezeAllPayload =
            serde_json::from_value(job.payload.clone()).context("sensors_freeze_all payload")?;
        let window = payload.minutes.map(chrono::Duration::minutes);
        let (count, _stamp) =
            self.freezer
                .freeze_all(window, payload.assumed_is_up, payload.frozen_at)?;
        Ok((count as i64, count as i64))
    }

    fn run_unfreeze_all(&self, job: &AdminJob) -> anyhow::Result<(i64, i64)> {
        let payload: UnfreezeAllPayload =
            serde_json::from_value(job.payload.clone()).context("sensors_unfreeze_all payload")?;
        let count = match payload.frozen_at {
            Some(stamp) => self.freezer.unfreeze_by_stamp(stamp)?,
            None => self.freezer.unfreeze_all()?,
        };
        Ok((count as i64, count as i64))
    }

    /// Deliver `text` to every target through the worker pool. Returns
    /// `(delivered, total)`.
    async fn fan_out(
        self: Arc<Self>,
        job_id: i64,
        targets: Vec<i64>,
        text: &str,
        parse_mode: Option<&str>,
    ) -> anyhow::Result<(i64, i64)> {
        let total = targets.len() as i64;
        self.store
            .touch_job_progress(job_id, 0, total, self.clock.now())?;
        if targets.is_empty() {
            return Ok((0, 0));
        }

        let queue = Arc::new(Mutex::new(VecDeque::from(targets)));
        let delivered = Arc::new(AtomicI64::new(0));
        let attempted = Arc::new(AtomicI64::new(0));
        let last_flush = Arc::new(StdMutex::new(Instant::now()));

        let workers = self.config.broadcast_concurrency.max(1).min(total as usize);
        let mut pool = JoinSet::new();
        for _ in 0..workers {
            let this = Arc::clone(&self);
            let queue = Arc::clone(&queue);
            let delivered = Arc::clone(&delivered);
            let attempted = Arc::clone(&attempted);
            let last_flush = Arc::clone(&last_flush);
            let text = text.to_string();
            let parse_mode = parse_mode.map(str::to_string);

            pool.spawn(async move {
                loop {
                    let chat_id = { queue.lock().await.pop_front() };
                    let Some(chat_id) = chat_id else { break };

                    if this.deliver(chat_id, &text, parse_mode.as_deref()).await {
                        delivered.fetch_add(1, Ordering::SeqCst);
                    }

                    let done = attempted.fetch_add(1, Ordering::SeqCst) + 1;
                    let flush = done % PROGRESS_FLUSH_EVERY == 0 || {
                        let mut last = last_flush.lock().unwrap_or_else(|p| p.into_inner());
                        if last.elapsed() >= PROGRESS_FLUSH_INTERVAL {
                            *last = Instant::now();
                            true
                        } else {
                            false
                        }
                    };
                    if flush {
                        let sent = delivered.load(Ordering::SeqCst);
                        if let Err(e) =
                            this.store
                                .touch_job_progress(job_id, sent, total, this.clock.now())
                        {
                            warn!(job = job_id, error = %e, "progress update failed");
                        }
                    }
                }
            });
        }
        while pool.join_next().await.is_some() {}

        Ok((delivered.load(Ordering::SeqCst), total))
    }

    /// One recipient: rate-limited send with bounded retries. Returns
    /// whether the message was delivered.
    async fn deliver(&self, chat_id: i64, text: &str, parse_mode: Option<&str>) -> bool {
        let mut attempt: u32 = 0;
        loop {
            self.limiter.acquire().await;
            match self.messenger.send_text(chat_id, text, parse_mode).await {
                Ok(()) => return true,
                Err(MessengerError::Transient(reason)) => {
                    attempt += 1;
                    if attempt > self.config.broadcast_max_retries {
                        warn!(chat_id, %reason, "giving up on recipient after retries");
                        return false;
                    }
                    let backoff = Duration::from_millis(
                        500 * 2u64.pow(attempt - 1) + rand::random::<u64>() % 250,
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(MessengerError::Permanent(reason)) => {
                    warn!(chat_id, %reason, "subscriber unreachable, deactivating");
                    if let Err(e) = self.store.mark_subscriber_inactive(chat_id) {
                        error!(chat_id, error = %e, "failed to deactivate subscriber");
                    }
                    return false;
                }
            }
        }
    }
}
