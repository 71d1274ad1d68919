//! Operator maintenance freezes.
//!
//! While frozen a sensor contributes its declared state regardless of
//! heartbeats; the aggregator never learns "a deploy is running", it only
//! sees pinned sensors. Bulk operations stamp `frozen_at` so a deploy can
//! unfreeze exactly the rows it froze and nothing else.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use gridwatch_store::{Store, StoreError};

use crate::clock::Clock;

pub struct FreezeController {
    store: Arc<Store>,
    clock: Clock,
    default_window: Duration,
}

impl FreezeController {
    pub fn new(store: Arc<Store>, clock: Clock, default_window: Duration) -> Self {
        Self {
            store,
            clock,
            default_window,
        }
    }

    /// Pin one sensor. `until = None` uses the default deploy window.
    pub fn freeze(
        &self,
        uuid: &str,
        until: Option<DateTime<Utc>>,
        assumed_is_up: bool,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let until = until.unwrap_or(now + self.default_window);
        let updated = self.store.freeze_sensor(uuid, until, assumed_is_up, now)?;
        if updated {
            info!(uuid, %until, assumed_is_up, "sensor frozen");
        }
        Ok(updated)
    }

    pub fn unfreeze(&self, uuid: &str) -> Result<bool, StoreError> {
        let updated = self.store.unfreeze_sensor(uuid)?;
        if updated {
            info!(uuid, "sensor unfrozen");
        }
        Ok(updated)
    }

    /// Freeze the whole active fleet, returning the stamp to unfreeze with.
    pub fn freeze_all(
        &self,
        window: Option<Duration>,
        assumed_is_up: bool,
        stamp: Option<DateTime<Utc>>,
    ) -> Result<(usize, DateTime<Utc>), StoreError> {
        let now = self.clock.now();
        let stamp = stamp.unwrap_or(now);
        let until = now + window.unwrap_or(self.default_window);
        let count = self.store.freeze_all_active(until, assumed_is_up, stamp)?;
        info!(count, %until, %stamp, "froze active sensors");
        Ok((count, stamp))
    }

    /// Unfreeze only the rows a specific bulk freeze stamped.
    pub fn unfreeze_by_stamp(&self, stamp: DateTime<Utc>) -> Result<usize, StoreError> {
        let count = self.store.unfreeze_by_freeze_at(stamp)?;
        info!(count, %stamp, "unfroze deploy-stamped sensors");
        Ok(count)
    }

    /// Unfreeze everything, regardless of stamp.
    pub fn unfreeze_all(&self) -> Result<usize, StoreError> {
        let count = self.store.unfreeze_all_sensors()?;
        info!(count, "unfroze all sensors");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, Arc<Store>, Clock, FreezeController) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("test.db")).unwrap());
        let clock = Clock::fixed("2026-01-22T12:00:00Z".parse().unwrap());
        let controller =
            FreezeController::new(Arc::clone(&store), clock.clone(), Duration::minutes(20));
        (dir, store, clock, controller)
    }

    #[test]
    fn freeze_defaults_to_the_deploy_window() {
        let (_dir, store, clock, controller) = setup();
        store
            .upsert_sensor_heartbeat("esp32-newcastle-001", 1, 2, None, clock.now())
            .unwrap();

        assert!(controller.freeze("esp32-newcastle-001", None, true).unwrap());

        let sensor = store.get_sensor("esp32-newcastle-001").unwrap().unwrap();
        assert_eq!(sensor.frozen_until, Some(clock.now() + Duration::minutes(20)));
        assert_eq!(sensor.frozen_is_up, Some(true));
        assert_eq!(sensor.frozen_at, Some(clock.now()));
    }

    #[test]
    fn freeze_unknown_sensor_reports_false() {
        let (_dir, _store, _clock, controller) = setup();
        assert!(!controller.freeze("no-such-sensor", None, true).unwrap());
        assert!(!controller.unfreeze("no-such-sensor").unwrap());
    }

    #[test]
    fn bulk_round_trip_uses_the_stamp() {
        let (_dir, store, clock, controller) = setup();
        store
            .upsert_sensor_heartbeat("sensor-a", 1, 1, None, clock.now())
            .unwrap();
        store
            .upsert_sensor_heartbeat("sensor-b", 1, 2, None, clock.now())
            .unwrap();

        let (count, stamp) = controller.freeze_all(None, true, None).unwrap();
        assert_eq!(count, 2);
        assert_eq!(stamp, clock.now());

        clock.advance(Duration::minutes(5));
        assert_eq!(controller.unfreeze_by_stamp(stamp).unwrap(), 2);
        assert_eq!(controller.unfreeze_all().unwrap(), 0);
    }
}
