use serde::Serialize;
use utoipa::ToSchema;

/// Simple health response returned by the `/healthcheck` route.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Health status ("ok" or "starting").
    pub status: String,
    /// Current connection lifecycle phase.
    pub lifecycle: String,
    /// Whether a session is currently loaded.
    pub session_active: bool,
}

impl HealthResponse {
    /// Create a health response indicating the system is serving traffic.
    pub fn ok(lifecycle: &str, session_active: bool) -> Self {
        Self {
            status: "ok".to_string(),
            lifecycle: lifecycle.to_string(),
            session_active,
        }
    }

    /// Create a health response indicating startup has not finished.
    pub fn starting(lifecycle: &str, session_active: bool) -> Self {
        Self {
            status: "starting".to_string(),
            lifecycle: lifecycle.to_string(),
            session_active,
        }
    }
}
