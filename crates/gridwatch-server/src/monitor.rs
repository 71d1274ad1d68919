//! Liveness monitor and section aggregator.
//!
//! A fixed tick (plus an opportunistic poke from the heartbeat handler)
//! drives one `pass` over the sensor fleet: classify each active sensor as
//! alive, stale, or frozen-pinned; fold the per-section counts through the
//! hysteresis policy; persist transitions; and advance the emitter cursor
//! over the event-log tail, enqueueing one notification job per new event.
//!
//! Correctness never depends on the poke: a lost wake-up, or a crash between
//! the transition commit and the job enqueue, is repaired on the next tick.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Notify};
use tracing::{error, info};

use gridwatch_store::{Sensor, Store, StoreError};

use crate::clock::Clock;
use crate::config::{Config, THRESHOLD_DOWN, THRESHOLD_UP};
use crate::queue::{LightNotifyPayload, KIND_LIGHT_NOTIFY};

/// KV key of the transition emitter's position in the event log.
const NOTIFY_CURSOR_KEY: &str = "notify_cursor";
/// KV marker stamped after every aggregator pass.
const UPDATED_AT_KEY: &str = "aggregator_updated_at";

/// Shared liveness marker for the health endpoint.
pub struct TickStatus {
    started_at: Instant,
    last_tick: Mutex<Option<Instant>>,
}

impl TickStatus {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            last_tick: Mutex::new(None),
        }
    }

    pub fn mark_tick(&self) {
        let mut last = self.last_tick.lock().unwrap_or_else(|p| p.into_inner());
        *last = Some(Instant::now());
    }

    pub fn last_tick_ago_sec(&self) -> Option<u64> {
        let last = self.last_tick.lock().unwrap_or_else(|p| p.into_inner());
        last.map(|t| t.elapsed().as_secs())
    }

    pub fn uptime_sec(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

impl Default for TickStatus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Monitor {
    store: Arc<Store>,
    config: Arc<Config>,
    clock: Clock,
    poke: Arc<Notify>,
    status: Arc<TickStatus>,
}

impl Monitor {
    pub fn new(
        store: Arc<Store>,
        config: Arc<Config>,
        clock: Clock,
        poke: Arc<Notify>,
        status: Arc<TickStatus>,
    ) -> Self {
        Self {
            store,
            config,
            clock,
            poke,
            status,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.check_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.poke.notified() => {}
                _ = shutdown.changed() => break,
            }

            if let Err(e) = self.pass() {
                error!(error = %e, "monitor pass failed");
            }
        }
    }

    /// One full sweep: liveness -> aggregation -> emit. Returns the number
    /// of committed transitions.
    pub fn pass(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let transitions = evaluate_sections(&self.store, &self.config, now)?;
        emit_pending(&self.store, now)?;
        self.store.kv_set(UPDATED_AT_KEY, &now.to_rfc3339())?;
        self.status.mark_tick();
        Ok(transitions)
    }
}

/// What a sensor contributes to its section right now.
///
/// Frozen sensors are pinned to their declared state; otherwise liveness is
/// `now - last_heartbeat < stale_after` (half-open, so a sensor whose age
/// equals the timeout is already stale). Never-seen heartbeats count stale.
pub fn sensor_contribution(sensor: &Sensor, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
    if sensor.is_frozen(now) {
        return sensor.frozen_is_up.unwrap_or(false);
    }
    match sensor.last_heartbeat {
        Some(at) => now - at < stale_after,
        None => false,
    }
}

/// Hysteresis policy. The comparisons are strict on both edges, which puts
/// a section exactly at a threshold into the band where the previous state
/// is retained; a section nobody has persisted yet is treated as having
/// been up.
pub fn section_is_up(online: usize, total: usize, prev: Option<bool>) -> bool {
    if online == 0 || total == 0 {
        return false;
    }
    let ratio = online as f64 / total as f64;
    if ratio > THRESHOLD_UP {
        true
    } else if ratio < THRESHOLD_DOWN {
        false
    } else {
        prev.unwrap_or(true)
    }
}

/// Aggregate every section with at least one active sensor and persist the
/// state changes. Sections are visited in ascending `(building, section)`
/// order.
pub fn evaluate_sections(
    store: &Store,
    config: &Config,
    now: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let sensors = store.all_active_sensors()?;
    let stale_after = config.stale_after();

    let mut sections: BTreeMap<(i64, i64), (usize, usize)> = BTreeMap::new();
    for sensor in &sensors {
        let entry = sections
            .entry((sensor.building_id, sensor.section_id))
            .or_default();
        entry.1 += 1;
        if sensor_contribution(sensor, now, stale_after) {
            entry.0 += 1;
        }
    }

    // A persisted state row whose section lost its last active sensor is an
    // invariant violation; report it and leave the row for reconciliation
    // once sensors return.
    for state in store.all_section_states()? {
        if !sections.contains_key(&(state.building_id, state.section_id)) {
            error!(
                building = state.building_id,
                section = state.section_id,
                "section power state has no active sensors"
            );
        }
    }

    let mut transitions = 0;
    for ((building_id, section_id), (online, total)) in sections {
        let prev = store.section_state(building_id, section_id)?.map(|s| s.is_up);
        let is_up = section_is_up(online, total, prev);
        if prev == Some(is_up) {
            continue;
        }

        if let Some(event_id) = store.apply_transition(building_id, section_id, is_up, now)? {
            transitions += 1;
            info!(
                building = building_id,
                section = section_id,
                online,
                total,
                state = if is_up { "up" } else { "down" },
                event = event_id,
                "section power state changed"
            );
        }
    }
    Ok(transitions)
}

/// Transition emitter: walk the event-log tail past the persisted cursor
/// and enqueue one `light_notify` job per event.
pub fn emit_pending(store: &Store, now: DateTime<Utc>) -> Result<usize, StoreError> {
    let cursor = store
        .kv_get(NOTIFY_CURSOR_KEY)?
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0);

    let tail = store.events_after(cursor)?;
    for event in &tail {
        let payload = serde_json::to_value(LightNotifyPayload {
            building_id: event.building_id,
            section_id: event.section_id,
            event_type: event.event_type,
            timestamp: event.timestamp,
            event_id: event.id,
        })?;
        store.enqueue_job(KIND_LIGHT_NOTIFY, &payload, None, now)?;
        store.kv_set(NOTIFY_CURSOR_KEY, &event.id.to_string())?;
    }
    Ok(tail.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use gridwatch_store::{EventType, JobStatus};

    fn setup() -> (tempfile::TempDir, Arc<Store>, Arc<Config>, Clock) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = Arc::new(Store::open(&path).unwrap());
        let config = Arc::new(Config::for_tests(path));
        let clock = Clock::fixed("2026-01-22T12:00:00Z".parse().unwrap());
        (dir, store, config, clock)
    }

    fn monitor_pass(store: &Store, config: &Config, clock: &Clock) -> usize {
        let transitions = evaluate_sections(store, config, clock.now()).unwrap();
        emit_pending(store, clock.now()).unwrap();
        transitions
    }

    #[test]
    fn stale_boundary_is_half_open() {
        let stale_after = Duration::seconds(150);
        let now: DateTime<Utc> = "2026-01-22T12:00:00Z".parse().unwrap();
        let sensor = |age_sec: i64| Sensor {
            uuid: "s".into(),
            building_id: 1,
            section_id: 1,
            comment: None,
            last_heartbeat: Some(now - Duration::seconds(age_sec)),
            created_at: now,
            is_active: true,
            frozen_until: None,
            frozen_is_up: None,
            frozen_at: None,
        };

        assert!(sensor_contribution(&sensor(149), now, stale_after));
        assert!(!sensor_contribution(&sensor(150), now, stale_after));
        assert!(!sensor_contribution(&sensor(151), now, stale_after));
    }

    #[test]
    fn frozen_sensor_is_pinned_regardless_of_heartbeat() {
        let now: DateTime<Utc> = "2026-01-22T12:00:00Z".parse().unwrap();
        let mut sensor = Sensor {
            uuid: "s".into(),
            building_id: 1,
            section_id: 1,
            comment: None,
            last_heartbeat: None, // would be stale
            created_at: now,
            is_active: true,
            frozen_until: Some(now + Duration::minutes(20)),
            frozen_is_up: Some(true),
            frozen_at: Some(now),
        };
        assert!(sensor_contribution(&sensor, now, Duration::seconds(150)));

        // Pinned down wins over a fresh heartbeat too.
        sensor.frozen_is_up = Some(false);
        sensor.last_heartbeat = Some(now);
        assert!(!sensor_contribution(&sensor, now, Duration::seconds(150)));

        // Expired freeze falls back to liveness.
        sensor.frozen_until = Some(now - Duration::seconds(1));
        assert!(sensor_contribution(&sensor, now, Duration::seconds(150)));
    }

    #[test]
    fn policy_boundaries_match_the_hysteresis_band() {
        // 2/2 up, 1/2 in band, 0/2 down.
        assert!(section_is_up(2, 2, Some(false)));
        assert!(section_is_up(1, 2, Some(true)));
        assert!(!section_is_up(1, 2, Some(false)));
        assert!(!section_is_up(0, 2, Some(true)));
        // 2/5 = 0.4 sits in the band.
        assert!(section_is_up(2, 5, Some(true)));
        assert!(!section_is_up(2, 5, Some(false)));
        // 1/5 = 0.2 is below the band.
        assert!(!section_is_up(1, 5, Some(true)));
        // No prior state defaults to up inside the band.
        assert!(section_is_up(1, 2, None));
    }

    #[test]
    fn cold_start_single_sensor_comes_up() {
        let (_dir, store, config, clock) = setup();
        store
            .upsert_sensor_heartbeat("esp32-newcastle-001", 1, 2, None, clock.now())
            .unwrap();

        let transitions = monitor_pass(&store, &config, &clock);
        assert_eq!(transitions, 1);

        let state = store.section_state(1, 2).unwrap().unwrap();
        assert!(state.is_up);

        let events = store.list_events(1, 2).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Up);

        // One notification job, with the event's payload.
        let job = store.claim_next_job(clock.now()).unwrap().unwrap();
        assert_eq!(job.kind, KIND_LIGHT_NOTIFY);
        let payload: LightNotifyPayload = serde_json::from_value(job.payload).unwrap();
        assert_eq!(
            (payload.building_id, payload.section_id, payload.event_type),
            (1, 2, EventType::Up)
        );
        assert_eq!(payload.event_id, events[0].id);
    }

    #[test]
    fn silence_past_the_timeout_goes_down_once() {
        let (_dir, store, config, clock) = setup();
        store
            .upsert_sensor_heartbeat("esp32-newcastle-001", 1, 2, None, clock.now())
            .unwrap();
        monitor_pass(&store, &config, &clock);

        // Quiet for T_stale + one tick + 1s.
        clock.advance(Duration::seconds(config.sensor_timeout_sec + 16));
        let transitions = monitor_pass(&store, &config, &clock);
        assert_eq!(transitions, 1);

        let state = store.section_state(1, 2).unwrap().unwrap();
        assert!(!state.is_up);
        let events = store.list_events(1, 2).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_type, EventType::Down);

        // Staying silent produces no further transitions or events.
        clock.advance(Duration::seconds(60));
        assert_eq!(monitor_pass(&store, &config, &clock), 0);
        assert_eq!(store.list_events(1, 2).unwrap().len(), 2);

        // Exactly two jobs were emitted in total.
        assert!(store.claim_next_job(clock.now()).unwrap().is_some());
        assert!(store.claim_next_job(clock.now()).unwrap().is_some());
        assert!(store.claim_next_job(clock.now()).unwrap().is_none());
    }

    #[test]
    fn deploy_freeze_pins_the_section_until_expiry() {
        let (_dir, store, config, clock) = setup();
        store
            .upsert_sensor_heartbeat("esp32-newcastle-001", 1, 2, None, clock.now())
            .unwrap();
        monitor_pass(&store, &config, &clock);

        // Freeze for 20 minutes assuming up, then stop heartbeats.
        store
            .freeze_sensor(
                "esp32-newcastle-001",
                clock.now() + Duration::minutes(20),
                true,
                clock.now(),
            )
            .unwrap();

        clock.advance(Duration::minutes(19));
        monitor_pass(&store, &config, &clock);
        assert!(store.section_state(1, 2).unwrap().unwrap().is_up);

        // Past expiry with no heartbeats: down.
        clock.advance(Duration::minutes(6));
        monitor_pass(&store, &config, &clock);
        assert!(!store.section_state(1, 2).unwrap().unwrap().is_up);

        let events = store.list_events(1, 2).unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(kinds, vec![EventType::Up, EventType::Down]);
    }

    #[test]
    fn hysteresis_trajectory_emits_two_events() {
        let (_dir, store, config, clock) = setup();
        let uuids: Vec<String> = (0..5).map(|i| format!("sensor-{i}")).collect();

        // Establish the section with all five alive.
        for uuid in &uuids {
            store
                .upsert_sensor_heartbeat(uuid, 1, 1, None, clock.now())
                .unwrap();
        }
        monitor_pass(&store, &config, &clock);
        let baseline = store.list_events(1, 1).unwrap().len();

        let stale = Duration::seconds(config.sensor_timeout_sec + 10);
        let set_alive = |alive: usize| {
            let now = clock.now();
            for (i, uuid) in uuids.iter().enumerate() {
                let beat = if i < alive { now } else { now - stale };
                store.upsert_sensor_heartbeat(uuid, 1, 1, None, beat).unwrap();
            }
            monitor_pass(&store, &config, &clock);
            store.section_state(1, 1).unwrap().unwrap().is_up
        };

        assert!(set_alive(3)); // 0.6 -> up
        assert!(set_alive(2)); // 0.4, in band -> stays up
        assert!(!set_alive(1)); // 0.2 -> down
        assert!(!set_alive(2)); // 0.4, in band -> stays down
        assert!(set_alive(3)); // 0.6 -> up

        let events = store.list_events(1, 1).unwrap();
        assert_eq!(events.len() - baseline, 2);
    }

    #[test]
    fn emitter_cursor_survives_a_missed_enqueue() {
        let (_dir, store, config, clock) = setup();
        store
            .upsert_sensor_heartbeat("esp32-newcastle-001", 1, 2, None, clock.now())
            .unwrap();

        // Transition committed but emit never ran (crash window).
        evaluate_sections(&store, &config, clock.now()).unwrap();
        assert!(store.claim_next_job(clock.now()).unwrap().is_none());

        // The next pass repairs it, exactly once.
        assert_eq!(emit_pending(&store, clock.now()).unwrap(), 1);
        assert_eq!(emit_pending(&store, clock.now()).unwrap(), 0);

        let job = store.claim_next_job(clock.now()).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
    }
}
