//! Admin job kinds, typed payloads, and the lease reclaimer.
//!
//! Every payload crossing the queue is an explicit serde record; workers
//! deserialize by kind and reject unknown shapes instead of poking at maps.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info};

use gridwatch_store::{EventType, Store};

use crate::clock::Clock;
use crate::config::{JOB_LEASE_TTL_SEC, JOB_MAX_ATTEMPTS, JOB_RECLAIM_INTERVAL};

pub const KIND_LIGHT_NOTIFY: &str = "light_notify";
pub const KIND_BROADCAST: &str = "broadcast";
pub const KIND_SENSORS_FREEZE_ALL: &str = "sensors_freeze_all";
pub const KIND_SENSORS_UNFREEZE_ALL: &str = "sensors_unfreeze_all";

/// Transition fan-out, enqueued by the emitter for every new power event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LightNotifyPayload {
    pub building_id: i64,
    pub section_id: i64,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub event_id: i64,
}

/// Free-form admin message to every active subscriber.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BroadcastPayload {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_mode: Option<String>,
    #[serde(default = "default_broadcast_prefix")]
    pub prefix: String,
}

fn default_broadcast_prefix() -> String {
    "📢 ".to_string()
}

/// Deploy-freeze request. `frozen_at` stamps the rows so the matching
/// unfreeze touches only what this freeze touched; when omitted, the worker
/// stamps with the claim time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FreezeAllPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minutes: Option<i64>,
    pub assumed_is_up: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frozen_at: Option<DateTime<Utc>>,
}

/// Unfreeze request. With a stamp only matching rows thaw; without one,
/// every frozen sensor thaws (operator escape hatch).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnfreezeAllPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frozen_at: Option<DateTime<Utc>>,
}

/// Periodic sweep returning lapsed-lease jobs to the queue (or failing them
/// once attempts are exhausted).
pub async fn reclaimer_loop(
    store: Arc<Store>,
    clock: Clock,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(JOB_RECLAIM_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }

        match store.reclaim_expired_jobs(
            chrono::Duration::seconds(JOB_LEASE_TTL_SEC),
            JOB_MAX_ATTEMPTS,
            clock.now(),
        ) {
            Ok((0, 0)) => {}
            Ok((requeued, failed)) => {
                info!(requeued, failed, "reclaimed expired admin jobs");
            }
            Err(e) => error!(error = %e, "admin job reclaim failed"),
        }
    }
}
