use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;

/// Section is UP when the alive ratio is strictly above this.
pub const THRESHOLD_UP: f64 = 0.5;
/// Section is DOWN when the alive ratio is strictly below this (or no
/// sensor is alive). Between the thresholds the previous state is kept.
pub const THRESHOLD_DOWN: f64 = 0.4;

/// Per-sensor heartbeat rate cap (requests per second).
pub const HEARTBEAT_RATE_PER_SEC: u32 = 10;

pub const JOB_LEASE_TTL_SEC: i64 = 60;
pub const JOB_MAX_ATTEMPTS: i64 = 3;
pub const JOB_RECLAIM_INTERVAL: Duration = Duration::from_secs(30);
pub const JOB_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Suppression window for duplicate `{subscriber, event}` deliveries.
pub const NOTIFY_DEDUP_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Config {
    pub sensor_api_key: String,
    pub db_path: PathBuf,
    pub api_port: u16,
    pub sensor_timeout_sec: i64,
    pub check_interval: Duration,
    pub broadcast_rate_per_sec: f64,
    pub broadcast_concurrency: usize,
    pub broadcast_max_retries: u32,
    pub admin_ids: HashSet<i64>,
    pub deploy_freeze_minutes: i64,
    /// Canonical rollout map: sensor uuid -> (building_id, section_id).
    /// When a uuid is present here, heartbeat payload placement is ignored.
    pub sensor_uuid_map: HashMap<String, (i64, i64)>,
    pub bot_token: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let sensor_api_key = require_env("SENSOR_API_KEY")?;
        let db_path = PathBuf::from(require_env("DB_PATH")?);

        Ok(Self {
            sensor_api_key,
            db_path,
            api_port: env_parse("API_PORT", 8081),
            sensor_timeout_sec: env_parse("SENSOR_TIMEOUT_SEC", 150),
            check_interval: Duration::from_secs(env_parse("CHECK_INTERVAL_SEC", 15)),
            broadcast_rate_per_sec: env_parse("BROADCAST_RATE_PER_SEC", 20.0),
            broadcast_concurrency: env_parse("BROADCAST_CONCURRENCY", 8),
            broadcast_max_retries: env_parse("BROADCAST_MAX_RETRIES", 1),
            admin_ids: parse_admin_ids(&env_string("ADMIN_IDS")),
            deploy_freeze_minutes: env_parse("DEPLOY_FREEZE_MINUTES", 20),
            sensor_uuid_map: parse_sensor_uuid_map(&env_string("SENSOR_UUID_MAP")),
            bot_token: {
                let token = env_string("BOT_TOKEN");
                (!token.is_empty()).then_some(token)
            },
        })
    }
}

fn require_env(key: &str) -> anyhow::Result<String> {
    let value = std::env::var(key)
        .map(|v| v.trim().to_string())
        .unwrap_or_default();
    if value.is_empty() {
        bail!("{key} is required");
    }
    Ok(value)
}

fn env_string(key: &str) -> String {
    std::env::var(key)
        .map(|v| strip_quotes(v.trim()).to_string())
        .unwrap_or_default()
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match strip_quotes(raw.trim()).parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "invalid value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn strip_quotes(value: &str) -> &str {
    value
        .trim_matches('"')
        .trim_matches('\'')
        .trim()
}

/// Comma/space separated chat ids; anything non-numeric is ignored.
pub fn parse_admin_ids(raw: &str) -> HashSet<i64> {
    raw.replace(',', " ")
        .split_whitespace()
        .filter_map(|token| strip_quotes(token).parse().ok())
        .collect()
}

/// Parse `SENSOR_UUID_MAP` entries of the form `uuid=building:section`,
/// separated by commas, semicolons or whitespace.
///
/// The parser is deliberately tolerant: malformed entries are skipped with a
/// warning, uuids are lowercased, sections outside 1..=3 are rejected, and
/// the last entry wins on duplicates.
pub fn parse_sensor_uuid_map(raw: &str) -> HashMap<String, (i64, i64)> {
    let mut map = HashMap::new();
    for token in raw.split([',', ';', ' ', '\t', '\n']) {
        let token = strip_quotes(token.trim());
        if token.is_empty() {
            continue;
        }
        let Some((uuid, target)) = token.split_once('=') else {
            tracing::warn!(entry = token, "skipping malformed sensor map entry");
            continue;
        };
        let Some((building, section)) = target.split_once(':') else {
            tracing::warn!(entry = token, "skipping malformed sensor map entry");
            continue;
        };
        let (Ok(building_id), Ok(section_id)) =
            (building.trim().parse::<i64>(), section.trim().parse::<i64>())
        else {
            tracing::warn!(entry = token, "skipping malformed sensor map entry");
            continue;
        };
        if building_id <= 0 || !(1..=3).contains(&section_id) {
            tracing::warn!(entry = token, "skipping out-of-range sensor map entry");
            continue;
        }
        map.insert(uuid.trim().to_lowercase(), (building_id, section_id));
    }
    map
}

impl Config {
    /// Age at which a sensor stops counting as alive.
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.sensor_timeout_sec)
    }

    /// Freeze window used when a freeze request carries no explicit duration.
    pub fn default_freeze_duration(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.deploy_freeze_minutes)
    }

    /// Fixed config for tests: tiny intervals, no external services.
    #[cfg(test)]
    pub fn for_tests(db_path: PathBuf) -> Self {
        Self {
            sensor_api_key: "test-key".into(),
            db_path,
            api_port: 0,
            sensor_timeout_sec: 150,
            check_interval: Duration::from_secs(15),
            broadcast_rate_per_sec: 0.0,
            broadcast_concurrency: 2,
            broadcast_max_retries: 1,
            admin_ids: HashSet::new(),
            deploy_freeze_minutes: 20,
            sensor_uuid_map: HashMap::new(),
            bot_token: None,
        }
    }
}
