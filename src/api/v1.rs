use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::{
    api::error::ApiError,
    auth::AuthBearer,
    controller::{AppState, TaskStatus},
    domain::{ChargingEvent, GridPrice, VehicleState},
    ingest::TelemetryUpdate,
    repo::Store,
};

const DEFAULT_EVENT_LIMIT: usize = 50;
const MAX_EVENT_LIMIT: usize = 500;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(get_status))
        .route("/permanent-error/reset", post(reset_permanent_error))
        .route("/surplus", post(record_surplus))
        .route("/telemetry", post(apply_telemetry))
        .route("/vehicles/:vin/events", get(list_events))
        .route("/vehicles/:vin/prices", post(set_prices))
        .route("/vehicles/:vin/plugged-in", post(plugged_in))
        .route("/vehicles/:vin/unplugged", post(unplugged))
        .with_state(state)
}

pub async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Debug, Serialize)]
pub struct VehicleStatus {
    pub vin: String,
    pub display_name: String,
    pub enabled: bool,
    pub state: Option<VehicleState>,
}

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub permanent_error: bool,
    pub charge_start_failures: u32,
    pub tick: TaskStatus,
    pub refresh: TaskStatus,
    pub vehicles: Vec<VehicleStatus>,
}

pub async fn get_status(State(st): State<AppState>) -> Result<Json<SystemStatus>, ApiError> {
    let mut vehicles = Vec::new();
    for v in st.store.vehicles().await? {
        let state = st.store.vehicle_state(&v.vin).await?;
        vehicles.push(VehicleStatus {
            vin: v.vin,
            display_name: v.display_name,
            enabled: v.enabled,
            state,
        });
    }
    Ok(Json(SystemStatus {
        permanent_error: st.controller.permanent_error().await?,
        charge_start_failures: st.controller.charge_start_failures(),
        tick: st.scheduler.tick_status().await,
        refresh: st.scheduler.refresh_status().await,
        vehicles,
    }))
}

pub async fn reset_permanent_error(
    State(st): State<AppState>,
    _auth: AuthBearer,
) -> Result<StatusCode, ApiError> {
    st.controller.clear_permanent_error().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Either a ready surplus value or the raw meter readings it derives from.
#[derive(Debug, Deserialize)]
pub struct SurplusReport {
    #[serde(default)]
    pub surplus_watts: i32,
    #[serde(default)]
    pub inverter_active_power: i32,
    #[serde(default)]
    pub consumption: i32,
}

impl SurplusReport {
    /// `None` when the meter readings differ by more than an `i32` holds.
    pub fn watts(&self) -> Option<i32> {
        if self.surplus_watts != 0 {
            Some(self.surplus_watts)
        } else {
            self.inverter_active_power.checked_sub(self.consumption)
        }
    }
}

pub async fn record_surplus(
    State(st): State<AppState>,
    _auth: AuthBearer,
    Json(report): Json<SurplusReport>,
) -> Result<StatusCode, ApiError> {
    let watts = report
        .watts()
        .ok_or_else(|| ApiError::BadRequest("surplus out of range".into()))?;
    st.ingest.record_surplus(watts).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn apply_telemetry(
    State(st): State<AppState>,
    _auth: AuthBearer,
    Json(update): Json<TelemetryUpdate>,
) -> Result<StatusCode, ApiError> {
    st.ingest.apply_telemetry(&update).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
}

pub async fn list_events(
    State(st): State<AppState>,
    Path(vin): Path<String>,
    Query(q): Query<EventsQuery>,
) -> Result<Json<Vec<ChargingEvent>>, ApiError> {
    if st.store.vehicle(&vin).await?.is_none() {
        return Err(ApiError::NotFound(format!("vehicle {vin}")));
    }
    let limit = q.limit.unwrap_or(DEFAULT_EVENT_LIMIT).min(MAX_EVENT_LIMIT);
    Ok(Json(st.store.latest_events(&vin, limit).await?))
}

/// Replaces the known hourly prices of a vehicle's grid provider.
pub async fn set_prices(
    State(st): State<AppState>,
    _auth: AuthBearer,
    Path(vin): Path<String>,
    Json(prices): Json<Vec<GridPrice>>,
) -> Result<StatusCode, ApiError> {
    if st.store.vehicle(&vin).await?.is_none() {
        return Err(ApiError::NotFound(format!("vehicle {vin}")));
    }
    if prices.iter().any(|p| !p.total.is_finite()) {
        return Err(ApiError::BadRequest("price totals must be finite".into()));
    }
    st.store.set_grid_prices(&vin, prices);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn plugged_in(
    State(st): State<AppState>,
    _auth: AuthBearer,
    Path(vin): Path<String>,
) -> Result<StatusCode, ApiError> {
    set_plug_state(&st, &vin, true).await
}

pub async fn unplugged(
    State(st): State<AppState>,
    _auth: AuthBearer,
    Path(vin): Path<String>,
) -> Result<StatusCode, ApiError> {
    set_plug_state(&st, &vin, false).await
}

async fn set_plug_state(st: &AppState, vin: &str, plugged_in: bool) -> Result<StatusCode, ApiError> {
    if st.ingest.set_plugged_in(vin, plugged_in).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("vehicle {vin}")))
    }
}
