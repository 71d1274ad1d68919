use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Building {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub sections_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sensor {
    pub uuid: String,
    pub building_id: i64,
    pub section_id: i64,
    pub comment: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
    pub frozen_until: Option<DateTime<Utc>>,
    pub frozen_is_up: Option<bool>,
    pub frozen_at: Option<DateTime<Utc>>,
}

impl Sensor {
    /// Whether the sensor is currently pinned by a maintenance freeze.
    pub fn is_frozen(&self, now: DateTime<Utc>) -> bool {
        self.frozen_until.is_some_and(|until| until > now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SectionPowerState {
    pub building_id: i64,
    pub section_id: i64,
    pub is_up: bool,
    pub last_change: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Up,
    Down,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Up => "up",
            EventType::Down => "down",
        }
    }

    pub fn from_is_up(is_up: bool) -> Self {
        if is_up {
            EventType::Up
        } else {
            EventType::Down
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "up" => Some(EventType::Up),
            "down" => Some(EventType::Down),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PowerEvent {
    pub id: i64,
    pub event_type: EventType,
    pub building_id: i64,
    pub section_id: i64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subscriber {
    pub chat_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub subscribed_at: Option<DateTime<Utc>>,
    pub building_id: Option<i64>,
    pub section_id: Option<i64>,
    pub light_notifications: bool,
    pub alert_notifications: bool,
    pub schedule_notifications: bool,
    pub quiet_start: Option<i64>,
    pub quiet_end: Option<i64>,
    pub is_active: bool,
}

/// Minimal projection used by the notifier fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyRecipient {
    pub chat_id: i64,
    pub quiet_start: Option<i64>,
    pub quiet_end: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "done" => Some(JobStatus::Done),
            "failed" => Some(JobStatus::Failed),
            "canceled" => Some(JobStatus::Canceled),
            _ => None,
        }
    }
}

/// Terminal states a worker may move a claimed job into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Done,
    Failed,
    Canceled,
}

impl JobOutcome {
    pub fn status(self) -> JobStatus {
        match self {
            JobOutcome::Done => JobStatus::Done,
            JobOutcome::Failed => JobStatus::Failed,
            JobOutcome::Canceled => JobStatus::Canceled,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdminJob {
    pub id: i64,
    pub kind: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub created_by: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub attempts: i64,
    pub progress_current: i64,
    pub progress_total: i64,
    pub last_error: Option<String>,
}

/// Parse an RFC-3339 TEXT column into a UTC timestamp.
pub(crate) fn ts_from_col(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// Same as [`ts_from_col`] for nullable columns.
pub(crate) fn opt_ts_from_col(
    idx: usize,
    value: Option<String>,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| ts_from_col(idx, &v)).transpose()
}
