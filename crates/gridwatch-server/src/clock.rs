//! Injectable wall-clock source.
//!
//! Business code never calls `Utc::now()` directly; it takes time from a
//! [`Clock`] so the monitor, freeze and quiet-hours logic can be driven
//! deterministically in tests.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Local, Timelike, Utc};

#[derive(Clone)]
pub struct Clock {
    fixed: Option<Arc<Mutex<DateTime<Utc>>>>,
}

impl Clock {
    /// The real wall clock.
    pub fn system() -> Self {
        Self { fixed: None }
    }

    /// A clock pinned to `start`, advanced manually with [`Clock::advance`].
    pub fn fixed(start: DateTime<Utc>) -> Self {
        Self {
            fixed: Some(Arc::new(Mutex::new(start))),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        match &self.fixed {
            None => Utc::now(),
            Some(t) => *t.lock().unwrap_or_else(|p| p.into_inner()),
        }
    }

    /// Local wall-clock hour, the input to quiet-hours checks.
    pub fn local_hour(&self) -> u32 {
        match &self.fixed {
            None => Local::now().hour(),
            Some(t) => t.lock().unwrap_or_else(|p| p.into_inner()).hour(),
        }
    }

    /// Advance a fixed clock. No-op on the system clock.
    pub fn advance(&self, delta: Duration) {
        if let Some(t) = &self.fixed {
            let mut t = t.lock().unwrap_or_else(|p| p.into_inner());
            *t += delta;
        }
    }
}
