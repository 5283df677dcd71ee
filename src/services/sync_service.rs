use crate::{
    dto::{
        now_timestamp,
        session::{DeviceSummary, SessionSummary, TeamScoreSummary, TransactionSummary},
        ws::SyncPayload,
    },
    state::{
        SharedState,
        session::{DeviceType, Session},
    },
};

/// Build the full-state snapshot for `device_id`.
///
/// Only the requesting device's own ledger is included, and only for GM devices.
pub fn snapshot(
    session: Option<&Session>,
    device_id: &str,
    device_type: DeviceType,
    reconnection: bool,
    recent_limit: usize,
) -> SyncPayload {
    let Some(session) = session else {
        return SyncPayload {
            device_id: device_id.to_string(),
            reconnection,
            session: None,
            devices: Vec::new(),
            scores: Vec::new(),
            scanned_tokens: Vec::new(),
            recent_transactions: Vec::new(),
            server_time: now_timestamp(),
        };
    };

    let scanned_tokens = match device_type {
        DeviceType::Gm => session.ledger_for(device_id),
        DeviceType::Player | DeviceType::Esp32 => Vec::new(),
    };

    let skip = session.transactions.len().saturating_sub(recent_limit);
    SyncPayload {
        device_id: device_id.to_string(),
        reconnection,
        session: Some(SessionSummary::from(session)),
        devices: session.devices.values().map(DeviceSummary::from).collect(),
        scores: TeamScoreSummary::all(session),
        scanned_tokens,
        recent_transactions: session
            .transactions
            .iter()
            .skip(skip)
            .map(TransactionSummary::from)
            .collect(),
        server_time: now_timestamp(),
    }
}

/// Snapshot the current session for a device.
pub async fn snapshot_for(
    state: &SharedState,
    device_id: &str,
    device_type: DeviceType,
    reconnection: bool,
) -> SyncPayload {
    let limit = state.config().sync_recent_transactions();
    state
        .read_session(|session| snapshot(session, device_id, device_type, reconnection, limit))
        .await
}
