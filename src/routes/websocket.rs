use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tracing::warn;

use crate::{error::AppError, services::websocket_service, state::SharedState};

#[utoipa::path(
    get,
    path = "/ws",
    tag = "devices",
    responses(
        (status = 101, description = "Switching protocols to WebSocket"),
        (status = 503, description = "Connection handlers are not registered yet")
    )
)]
/// Upgrade the HTTP connection into a device WebSocket session.
pub async fn ws_handler(
    State(state): State<SharedState>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, AppError> {
    if let Err(violation) = state.ensure_accepting().await {
        warn!(error = %violation, "refusing websocket before handlers are ready");
        return Err(AppError::ServiceUnavailable(violation.to_string()));
    }

    let shared_state = state.clone();
    Ok(ws.on_upgrade(move |socket| websocket_service::handle_socket(shared_state, socket)))
}

/// Configure the WebSocket endpoint.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new().route("/ws", get(ws_handler))
}
