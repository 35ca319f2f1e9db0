use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::db::Db;
use crate::model::{IrrigationMode, Phase};
use crate::preset::CalibrationOverrides;
use crate::pump::RegistrationView;
use crate::room::RoomContext;
use crate::state::{SharedState, SystemEvent};
use crate::supervisor::{RoomHandle, SupervisorStatus};

/// Irrigation log rows returned per room.
const IRRIGATION_LIMIT: i64 = 50;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RoomView {
    pub ctx: Arc<RoomContext>,
    pub handle: RoomHandle,
}

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub rooms: Arc<Vec<RoomView>>,
    pub db: Db,
}

// ---------------------------------------------------------------------------
// JSON responses
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub rooms: Vec<RoomStatus>,
    pub events: Vec<SystemEvent>,
}

#[derive(Serialize)]
pub struct RoomStatus {
    pub room_id: String,
    pub mode: IrrigationMode,
    pub phase: Phase,
    pub vwc: Option<f64>,
    pub ec: Option<f64>,
    pub light_on: Option<bool>,
    pub start_night_vwc: Option<f64>,
    pub ec_target: Option<f64>,
    pub overrides: CalibrationOverrides,
    pub last_irrigation: Option<i64>,
    /// `None` when the supervisor has stopped.
    pub supervisor: Option<SupervisorStatus>,
    pub pumps: Vec<RegistrationView>,
}

async fn room_status(view: &RoomView) -> RoomStatus {
    let ctx = &view.ctx;
    let snapshot = ctx.snapshot();
    let avg = ctx.sensors();
    RoomStatus {
        room_id: ctx.room_id.clone(),
        mode: snapshot.mode,
        phase: snapshot.phase,
        vwc: avg.vwc,
        ec: avg.ec,
        light_on: ctx.light_on(),
        start_night_vwc: snapshot.start_night_vwc,
        ec_target: snapshot.ec_target,
        overrides: snapshot.overrides,
        last_irrigation: snapshot.last_irrigation,
        supervisor: view.handle.status().await,
        pumps: ctx.arbitrator.snapshot(),
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/status", get(api_status))
        .route("/api/rooms/{room}/irrigations", get(api_irrigations))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let mut rooms = Vec::with_capacity(state.rooms.len());
    for view in state.rooms.iter() {
        rooms.push(room_status(view).await);
    }
    let st = state.shared.read().await;
    Json(StatusResponse {
        uptime_secs: st.uptime_secs(),
        mqtt_connected: st.mqtt_connected,
        rooms,
        events: st.recent_events(),
    })
}

async fn api_irrigations(State(state): State<AppState>, Path(room): Path<String>) -> impl IntoResponse {
    if !state.rooms.iter().any(|r| r.ctx.room_id == room) {
        return (StatusCode::NOT_FOUND, format!("unknown room '{room}'")).into_response();
    }
    match state.db.recent_irrigations(&room, IRRIGATION_LIMIT).await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => {
            error!(room = %room, "irrigation log query failed: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "irrigation log unavailable").into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "status api listening");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
