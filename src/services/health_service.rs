use tracing::debug;

use crate::{
    dto::health::HealthResponse,
    state::{SharedState, lifecycle::LifecyclePhase},
};

/// Report whether the server finished startup and whether a session is loaded.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    let phase = state.lifecycle_phase().await;
    let session_active = state
        .read_session(|session| session.is_some_and(|s| s.is_active()))
        .await;

    if phase == LifecyclePhase::Listening {
        HealthResponse::ok(phase.as_str(), session_active)
    } else {
        debug!(phase = phase.as_str(), "health check during startup");
        HealthResponse::starting(phase.as_str(), session_active)
    }
}
