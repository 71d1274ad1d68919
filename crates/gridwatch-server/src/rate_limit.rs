//! Per-sensor heartbeat rate limiting.
//!
//! Healthy firmware beats once a minute; anything arriving faster than the
//! cap is a misbehaving or looping sensor, so there is no burst credit to
//! accumulate. Each sensor uuid gets a fixed one-second window anchored at
//! its first request: up to `max_per_sec` requests land in the window, the
//! rest are rejected until the window rolls over.
//!
//! The check runs inside the heartbeat handler (after auth and uuid
//! validation) rather than as connection middleware, because the key only
//! exists once the body is parsed. Entries for sensors that stopped beating
//! are evicted inline during a periodic sweep, so retirement never leaks
//! map entries and no background task is involved.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Requests counted against one window.
const WINDOW: Duration = Duration::from_secs(1);
/// Entries idle this long are dropped by the sweep.
const IDLE_EVICT: Duration = Duration::from_secs(600);
/// Minimum spacing between eviction sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct SensorWindow {
    window_start: Instant,
    count: u32,
    last_seen: Instant,
}

struct Inner {
    windows: HashMap<String, SensorWindow>,
    last_sweep: Instant,
}

#[derive(Clone)]
pub struct HeartbeatLimiter {
    max_per_sec: u32,
    inner: Arc<Mutex<Inner>>,
}

impl HeartbeatLimiter {
    pub fn new(max_per_sec: u32) -> Self {
        Self {
            max_per_sec,
            inner: Arc::new(Mutex::new(Inner {
                windows: HashMap::new(),
                last_sweep: Instant::now(),
            })),
        }
    }

    /// Whether a heartbeat from `uuid` may proceed right now.
    pub async fn allow(&self, uuid: &str) -> bool {
        self.allow_at(uuid, Instant::now()).await
    }

    async fn allow_at(&self, uuid: &str, now: Instant) -> bool {
        let mut inner = self.inner.lock().await;

        if now.duration_since(inner.last_sweep) >= SWEEP_INTERVAL {
            inner.last_sweep = now;
            inner
                .windows
                .retain(|_, w| now.duration_since(w.last_seen) < IDLE_EVICT);
        }

        let window = inner
            .windows
            .entry(uuid.to_string())
            .or_insert(SensorWindow {
                window_start: now,
                count: 0,
                last_seen: now,
            });
        window.last_seen = now;

        if now.duration_since(window.window_start) >= WINDOW {
            window.window_start = now;
            window.count = 0;
        }

        if window.count < self.max_per_sec {
            window.count += 1;
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    async fn tracked(&self) -> usize {
        self.inner.lock().await.windows.len()
    }
}
