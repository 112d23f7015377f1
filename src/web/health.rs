//! Liveness and readiness endpoints (§6). Liveness is unconditional; readiness
//! reflects the one self-diagnosable subsystem this service has: a loaded,
//! non-empty policy tree.

use crate::Broker;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use std::sync::Arc;

pub async fn alive() -> impl IntoResponse {
    StatusCode::OK
}

pub async fn ready(State(broker): State<Arc<Broker>>) -> impl IntoResponse {
    if broker.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
