use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for the ALN orchestrator.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::scan::submit_scan,
        crate::routes::scan::submit_batch,
        crate::routes::session::get_session,
        crate::routes::session::create_session,
        crate::routes::session::reset_session,
        crate::routes::session::end_session,
        crate::routes::session::add_team,
        crate::routes::sse::scoreboard_stream,
        crate::routes::websocket::ws_handler,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::scan::ScanRequest,
            crate::dto::scan::BatchRequest,
            crate::dto::scan::ScanResponse,
            crate::dto::scan::BatchSubmissionResponse,
            crate::dto::session::SessionSummary,
            crate::dto::session::TeamScoreSummary,
            crate::dto::session::DeviceSummary,
            crate::dto::session::TransactionSummary,
            crate::dto::session::SessionStateResponse,
            crate::dto::session::TeamInput,
            crate::dto::session::CreateSessionRequest,
            crate::dto::session::ResetSessionRequest,
            crate::dto::sse::ScoreboardHandshake,
            crate::dto::ws::Identification,
            crate::dto::ws::BatchAck,
            crate::dto::ws::SyncPayload,
            crate::dto::ws::HeartbeatAck,
            crate::dto::ws::ErrorPayload,
            crate::dto::ws::DeviceDisconnectedEvent,
            crate::dto::ws::GroupCompletedEvent,
            crate::dto::ws::SessionUpdateEvent,
            crate::state::session::BatchResult,
            crate::state::session::BatchFailure,
            crate::state::session::DeviceType,
            crate::state::session::SessionStatus,
            crate::state::session::TransactionStatus,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "scans", description = "Scan and offline batch submission"),
        (name = "session", description = "Session and scoreboard reads"),
        (name = "admin", description = "Session administration"),
        (name = "sse", description = "Server-sent events streams"),
        (name = "devices", description = "WebSocket operations for scanner devices"),
    )
)]
pub struct ApiDoc;
