use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use scholaris_shared::{HealthCheck, HealthResponse, HealthStatus};

use crate::AppState;

/// Reports store reachability and the live session count.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Response {
    let store = match state.store.ping() {
        Ok(()) => HealthCheck {
            name: "store".to_string(),
            status: HealthStatus::Healthy,
            message: None,
        },
        Err(e) => HealthCheck {
            name: "store".to_string(),
            status: HealthStatus::Unhealthy,
            message: Some(e.to_string()),
        },
    };
    let gateway = HealthCheck {
        name: "gateway".to_string(),
        status: HealthStatus::Healthy,
        message: Some(format!("{} live sessions", state.chat.gateway().session_count())),
    };

    let response = HealthResponse::healthy("scholaris-messaging", env!("CARGO_PKG_VERSION"))
        .with_checks(vec![store, gateway]);

    let status = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status, Json(response)).into_response()
}

/// Returns Prometheus metrics.
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics_handle {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
