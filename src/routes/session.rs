use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use axum_valid::Valid;

use crate::{
    dto::session::{
        CreateSessionRequest, ResetSessionRequest, SessionStateResponse, TeamInput,
        TeamScoreSummary,
    },
    error::AppError,
    services::session_service,
    state::SharedState,
};

const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Public session read endpoint.
pub fn router() -> Router<SharedState> {
    Router::new().route("/api/session", get(get_session))
}

/// Session administration endpoints guarded by the configured admin token.
pub fn admin_router(state: SharedState) -> Router<SharedState> {
    Router::new()
        .route("/api/admin/session", post(create_session))
        .route("/api/admin/session/reset", post(reset_session))
        .route("/api/admin/session/end", post(end_session))
        .route("/api/admin/session/teams", post(add_team))
        .route_layer(middleware::from_fn_with_state(state, require_admin_token))
}

/// Current session summary and scoreboard.
#[utoipa::path(
    get,
    path = "/api/session",
    tag = "session",
    responses((status = 200, description = "Current session, if any", body = SessionStateResponse))
)]
pub async fn get_session(State(state): State<SharedState>) -> Json<SessionStateResponse> {
    Json(session_service::current(&state).await)
}

/// Start a new session, replacing any existing one.
#[utoipa::path(
    post,
    path = "/api/admin/session",
    tag = "admin",
    params(("X-Admin-Token" = String, Header, description = "Configured admin token")),
    request_body = CreateSessionRequest,
    responses(
        (status = 200, description = "Session created", body = SessionStateResponse),
        (status = 400, description = "Invalid session definition"),
        (status = 401, description = "Missing or invalid admin token")
    )
)]
pub async fn create_session(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<CreateSessionRequest>>,
) -> Result<Json<SessionStateResponse>, AppError> {
    Ok(Json(session_service::create_session(&state, payload).await?))
}

/// Reset the running session.
#[utoipa::path(
    post,
    path = "/api/admin/session/reset",
    tag = "admin",
    params(("X-Admin-Token" = String, Header, description = "Configured admin token")),
    request_body = ResetSessionRequest,
    responses(
        (status = 200, description = "Session reset", body = SessionStateResponse),
        (status = 409, description = "No active session")
    )
)]
pub async fn reset_session(
    State(state): State<SharedState>,
    Json(payload): Json<ResetSessionRequest>,
) -> Result<Json<SessionStateResponse>, AppError> {
    Ok(Json(session_service::reset_session(&state, payload).await?))
}

/// End the running session.
#[utoipa::path(
    post,
    path = "/api/admin/session/end",
    tag = "admin",
    params(("X-Admin-Token" = String, Header, description = "Configured admin token")),
    responses(
        (status = 200, description = "Session ended", body = SessionStateResponse),
        (status = 409, description = "No session, or already ended")
    )
)]
pub async fn end_session(
    State(state): State<SharedState>,
) -> Result<Json<SessionStateResponse>, AppError> {
    Ok(Json(session_service::end_session(&state).await?))
}

/// Add a team to the running session.
#[utoipa::path(
    post,
    path = "/api/admin/session/teams",
    tag = "admin",
    params(("X-Admin-Token" = String, Header, description = "Configured admin token")),
    request_body = TeamInput,
    responses(
        (status = 200, description = "Team added", body = TeamScoreSummary),
        (status = 409, description = "No session, or team already exists")
    )
)]
pub async fn add_team(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<TeamInput>>,
) -> Result<Json<TeamScoreSummary>, AppError> {
    Ok(Json(session_service::add_team(&state, payload).await?))
}

async fn require_admin_token(
    State(state): State<SharedState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let config = state.config();
    let Some(expected) = config.admin_token() else {
        return Ok(next.run(req).await);
    };

    let provided = req
        .headers()
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            AppError::Unauthorized("missing admin token header `X-Admin-Token`".into())
        })?;

    if provided == expected {
        Ok(next.run(req).await)
    } else {
        Err(AppError::Unauthorized("invalid admin token".into()))
    }
}
