//! Public HTTP API: sensor heartbeats, health, and the sensor listing.

use std::sync::Arc;

use axum::{
    extract::rejection::JsonRejection,
    extract::State,
    http::{HeaderMap, Method},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use gridwatch_store::Store;

use crate::clock::Clock;
use crate::config::Config;
use crate::error::ApiError;
use crate::monitor::TickStatus;
use crate::rate_limit::HeartbeatLimiter;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub config: Arc<Config>,
    pub clock: Clock,
    pub heartbeat_limiter: HeartbeatLimiter,
    pub poke: Arc<Notify>,
    pub status: Arc<TickStatus>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/heartbeat", post(heartbeat))
        .route("/api/v1/health", get(health))
        .route("/api/v1/sensors", get(sensors_info))
        .route("/", get(health))
        .layer(TimeoutLayer::new(std::time::Duration::from_secs(15)))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Deserialize)]
struct HeartbeatRequest {
    api_key: String,
    building_id: i64,
    sensor_uuid: String,
    section_id: Option<i64>,
    comment: Option<String>,
}

#[derive(Serialize)]
struct HeartbeatResponse {
    status: &'static str,
    timestamp: DateTime<Utc>,
    building: String,
    section_id: i64,
    sensor_uuid: String,
}

async fn heartbeat(
    State(state): State<AppState>,
    body: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> Result<Json<HeartbeatResponse>, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    if !constant_time_eq(&req.api_key, &state.config.sensor_api_key) {
        debug!("heartbeat with invalid api key");
        return Err(ApiError::Unauthorized);
    }

    let sensor_uuid = req.sensor_uuid.trim().to_lowercase();
    if !valid_sensor_uuid(&sensor_uuid) {
        return Err(ApiError::BadRequest(
            "sensor_uuid must be 1..64 chars of [a-z0-9_-]".into(),
        ));
    }

    if !state.heartbeat_limiter.allow(&sensor_uuid).await {
        return Err(ApiError::RateLimited);
    }

    // Canonical rollout map wins over whatever the firmware reports.
    let (building_id, mut section_id) = match state.config.sensor_uuid_map.get(&sensor_uuid) {
        Some(&(canonical_building, canonical_section)) => {
            if canonical_building != req.building_id {
                warn!(
                    uuid = %sensor_uuid,
                    reported = req.building_id,
                    canonical = canonical_building,
                    "canonical mapping overrides reported building"
                );
            }
            (canonical_building, Some(canonical_section))
        }
        None => (req.building_id, req.section_id),
    };

    let sections_count = state
        .store
        .building_sections_count(building_id)?
        .ok_or(ApiError::UnknownBuilding(building_id))?;

    let section_id = match section_id.take() {
        Some(section) => {
            if !(1..=sections_count).contains(&section) {
                return Err(ApiError::BadRequest(format!(
                    "section_id must be integer 1..{sections_count}"
                )));
            }
            section
        }
        None => {
            warn!(uuid = %sensor_uuid, building_id, "heartbeat missing section_id, defaulting to 1");
            1
        }
    };

    let comment = req.comment.as_deref().map(str::trim).filter(|c| !c.is_empty());
    let comment = comment.map(|c| truncate_chars(c, 160));

    let now = state.clock.now();
    let is_new = state.store.upsert_sensor_heartbeat(
        &sensor_uuid,
        building_id,
        section_id,
        comment.as_deref(),
        now,
    )?;

    let building = state.store.get_building(building_id)?;
    if is_new {
        info!(
            uuid = %sensor_uuid,
            building = %building.name,
            section = section_id,
            "new sensor registered"
        );
    }

    // Opportunistic re-evaluation; the periodic tick covers a lost poke.
    state.poke.notify_one();

    Ok(Json(HeartbeatResponse {
        status: "ok",
        timestamp: now,
        building: building.name,
        section_id,
        sensor_uuid,
    }))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_sec: u64,
    db_ok: bool,
    last_tick_ago_sec: Option<u64>,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_sec: state.status.uptime_sec(),
        db_ok: state.store.ping(),
        last_tick_ago_sec: state.status.last_tick_ago_sec(),
    })
}

#[derive(Serialize)]
struct SensorInfo {
    uuid: String,
    building_id: i64,
    section_id: i64,
    comment: Option<String>,
    last_heartbeat: Option<DateTime<Utc>>,
    is_active: bool,
    frozen_until: Option<DateTime<Utc>>,
    frozen_is_up: Option<bool>,
}

#[derive(Serialize)]
struct SensorsResponse {
    status: &'static str,
    sensors: Vec<SensorInfo>,
    total: usize,
}

async fn sensors_info(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<SensorsResponse>, ApiError> {
    let provided = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !constant_time_eq(provided, &state.config.sensor_api_key) {
        return Err(ApiError::Unauthorized);
    }

    let sensors: Vec<SensorInfo> = state
        .store
        .all_active_sensors()?
        .into_iter()
        .map(|s| SensorInfo {
            uuid: s.uuid,
            building_id: s.building_id,
            section_id: s.section_id,
            comment: s.comment,
            last_heartbeat: s.last_heartbeat,
            is_active: s.is_active,
            frozen_until: s.frozen_until,
            frozen_is_up: s.frozen_is_up,
        })
        .collect();

    let total = sensors.len();
    Ok(Json(SensorsResponse {
        status: "ok",
        sensors,
        total,
    }))
}

/// Constant-time comparison to keep the shared key out of timing side
/// channels.
fn constant_time_eq(provided: &str, expected: &str) -> bool {
    use subtle::ConstantTimeEq;
    let provided = provided.as_bytes();
    let expected = expected.as_bytes();
    provided.len() == expected.len() && provided.ct_eq(expected).unwrap_u8() == 1
}

fn valid_sensor_uuid(uuid: &str) -> bool {
    !uuid.is_empty()
        && uuid.len() <= 64
        && uuid
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '_' | '-'))
}

fn truncate_chars(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
