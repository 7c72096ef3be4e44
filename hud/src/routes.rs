use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use threat_hud_capture::{Camera, CaptureAnalysisLoop, HttpClassifier, LoopStats};
use threat_hud_common::state::{HudView, LoopState};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

pub type Hud = CaptureAnalysisLoop<Camera, HttpClassifier>;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct StateResponse {
    #[serde(flatten)]
    state: LoopState,
    view: HudView,
    stats: LoopStats,
}

impl StateResponse {
    fn new(hud: &Hud, state: LoopState) -> Self {
        Self {
            view: state.view(),
            state,
            stats: hud.stats(),
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /state
async fn get_state(State(hud): State<Arc<Hud>>) -> impl IntoResponse {
    let state = hud.state();
    Json(StateResponse::new(&hud, state))
}

/// POST /capture/start
async fn start_capture(State(hud): State<Arc<Hud>>) -> impl IntoResponse {
    let state = hud.start().await;
    Json(StateResponse::new(&hud, state))
}

/// POST /capture/stop
async fn stop_capture(State(hud): State<Arc<Hud>>) -> impl IntoResponse {
    let state = hud.stop().await;
    Json(StateResponse::new(&hud, state))
}

/// GET /backend/health, proxied to the inference backend's health probe.
async fn backend_health(State(hud): State<Arc<Hud>>) -> impl IntoResponse {
    match hud.classifier().health().await {
        Ok(health) => Json(health).into_response(),
        Err(e) => {
            warn!(error = %e, "backend health probe failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({ "status": "unreachable", "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

pub fn router(hud: Arc<Hud>) -> Router {
    Router::new()
        .route("/state", get(get_state))
        .route("/capture/start", post(start_capture))
        .route("/capture/stop", post(stop_capture))
        .route("/backend/health", get(backend_health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(hud)
}
