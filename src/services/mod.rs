/// Offline batch reconciliation with idempotent replays.
pub mod batch_service;
/// Startup and teardown sequencing for the connection layer.
pub mod bootstrap;
/// Room-scoped fan-out of domain events to connected devices.
pub mod broadcast;
/// Hooks fired for accepted transactions that carry media.
pub mod content;
/// OpenAPI documentation generation.
pub mod documentation;
/// Health check service.
pub mod health_service;
/// Room membership for device connections.
pub mod room_service;
/// Session creation, reset, end and team management.
pub mod session_service;
/// Server-Sent Events streaming for the scoreboard.
pub mod sse_service;
/// Storage persistence coordinator with debouncing.
pub mod storage_supervisor;
/// Full-state snapshots sent to devices on connect and on request.
pub mod sync_service;
/// Scan validation, duplicate detection and scoring.
pub mod transaction_service;
/// WebSocket connection and message handling service.
pub mod websocket_service;
