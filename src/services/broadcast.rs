//! Outbound fan-out: every frame written to a device connection goes through here.

use axum::extract::ws::Message;
use serde::Serialize;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

use crate::{
    dto::{sse::ServerEvent, ws::Envelope},
    state::{
        SharedState,
        events::DomainEvent,
        rooms::{DeviceConnection, Room},
        session::DeviceType,
    },
};

pub const EVENT_SYNC_FULL: &str = "sync:full";
pub const EVENT_DEVICE_CONNECTED: &str = "device:connected";
pub const EVENT_DEVICE_DISCONNECTED: &str = "device:disconnected";
pub const EVENT_TRANSACTION_RESULT: &str = "transaction:result";
pub const EVENT_TRANSACTION_NEW: &str = "transaction:new";
pub const EVENT_SCORE_UPDATED: &str = "score:updated";
pub const EVENT_GROUP_COMPLETED: &str = "group:completed";
pub const EVENT_BATCH_ACK: &str = "batch:ack";
pub const EVENT_SESSION_UPDATE: &str = "session:update";
pub const EVENT_HEARTBEAT_ACK: &str = "heartbeat:ack";
pub const EVENT_ERROR: &str = "error";

/// The writer side of a connection has gone away.
#[derive(Debug, Error)]
#[error("connection closed")]
pub struct ConnectionClosed;

fn encode<T: Serialize>(event: &str, payload: &T) -> Option<Message> {
    match serde_json::to_string(&Envelope::new(event, payload)) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(err) => {
            warn!(event, error = %err, "failed to serialize outbound event");
            None
        }
    }
}

/// Send one enveloped event straight to a single connection.
///
/// Serialization failures are logged and swallowed; only a closed writer is reported.
pub fn send_direct<T: Serialize>(
    tx: &mpsc::UnboundedSender<Message>,
    event: &str,
    payload: &T,
) -> Result<(), ConnectionClosed> {
    let Some(message) = encode(event, payload) else {
        return Ok(());
    };
    tx.send(message).map_err(|_| ConnectionClosed)
}

fn deliver(connections: &[DeviceConnection], event: &str, message: Message) -> usize {
    let mut delivered = 0;
    for connection in connections {
        if connection.tx.send(message.clone()).is_ok() {
            delivered += 1;
        } else {
            debug!(
                event,
                device_id = %connection.device_id,
                "dropping event for closed connection"
            );
        }
    }
    delivered
}

/// Wrap `payload` in an envelope and deliver it to every member of `room`.
pub async fn emit<T: Serialize>(state: &SharedState, event: &str, payload: &T, room: &Room) -> usize {
    let Some(message) = encode(event, payload) else {
        return 0;
    };
    let members = state.rooms().members(room).await;
    deliver(&members, event, message)
}

/// Deliver to the union of `rooms`, each connection receiving the event once.
pub async fn emit_many<T: Serialize>(
    state: &SharedState,
    event: &str,
    payload: &T,
    rooms: &[Room],
) -> usize {
    let Some(message) = encode(event, payload) else {
        return 0;
    };
    let members = state.rooms().members_of_any(rooms).await;
    deliver(&members, event, message)
}

fn send_scoreboard_event(state: &SharedState, event: &str, payload: &impl Serialize) {
    match ServerEvent::json(Some(event.to_string()), payload) {
        Ok(event) => state.scoreboard_sse().broadcast(event),
        Err(err) => warn!(event, error = %err, "failed to serialize scoreboard SSE payload"),
    }
}

/// Subscribe to the domain event channel and spawn the fan-out task.
///
/// The subscription is taken before the task is spawned so no event published
/// after this call returns can be missed.
pub fn spawn_dispatcher(state: &SharedState) -> JoinHandle<()> {
    let mut receiver = state.events().subscribe();
    let state = state.clone();
    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            dispatch(&state, event).await;
        }
        debug!("broadcast dispatcher stopped");
    })
}

/// Route one domain event to its rooms.
pub async fn dispatch(state: &SharedState, event: DomainEvent) {
    match event {
        DomainEvent::TransactionRecorded {
            session_id,
            transaction,
        } => {
            emit(state, EVENT_TRANSACTION_NEW, &transaction, &Room::Session(session_id)).await;
        }
        DomainEvent::ScoreUpdated { session_id, score } => {
            let rooms = [Room::Session(session_id), Room::Team(score.team_id.clone())];
            emit_many(state, EVENT_SCORE_UPDATED, &score, &rooms).await;
            send_scoreboard_event(state, EVENT_SCORE_UPDATED, &score);
        }
        DomainEvent::GroupCompleted {
            session_id,
            completed,
        } => {
            let rooms = [
                Room::Session(session_id),
                Room::Team(completed.team_id.clone()),
            ];
            emit_many(state, EVENT_GROUP_COMPLETED, &completed, &rooms).await;
            send_scoreboard_event(state, EVENT_GROUP_COMPLETED, &completed);
        }
        DomainEvent::BatchProcessed { device_id, ack } => {
            let delivered = emit(state, EVENT_BATCH_ACK, &ack, &Room::Device(device_id.clone())).await;
            if delivered == 0 {
                debug!(
                    device_id = %device_id,
                    batch_id = %ack.batch_id,
                    "batch ack had no live connection; client will retry"
                );
            }
        }
        DomainEvent::DeviceConnected { device } => {
            emit(
                state,
                EVENT_DEVICE_CONNECTED,
                &device,
                &Room::DeviceType(DeviceType::Gm),
            )
            .await;
        }
        DomainEvent::DeviceDisconnected(disconnected) => {
            emit(
                state,
                EVENT_DEVICE_DISCONNECTED,
                &disconnected,
                &Room::DeviceType(DeviceType::Gm),
            )
            .await;
        }
        DomainEvent::SessionUpdated(update) => {
            let rooms = DeviceType::all().map(Room::DeviceType);
            emit_many(state, EVENT_SESSION_UPDATE, &update, &rooms).await;
            send_scoreboard_event(state, EVENT_SESSION_UPDATE, &update);
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::{
        catalog::TokenCatalog,
        config::AppConfig,
        dto::{session::TeamScoreSummary, ws::BatchAck},
        state::{AppState, rooms::RoomSet, session::Session},
    };

    async fn connect(
        state: &SharedState,
        device_id: &str,
        device_type: DeviceType,
        session: Option<&Session>,
    ) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = DeviceConnection {
            id: Uuid::new_v4(),
            device_id: device_id.into(),
            device_type,
            tx,
        };
        state
            .rooms()
            .join(connection, RoomSet::resolve(device_id, device_type, session))
            .await;
        rx
    }

    fn frames(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(Message::Text(text)) = rx.try_recv() {
            out.push(serde_json::from_str(text.as_str()).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn batch_ack_reaches_only_the_device_room() {
        let state = AppState::new(AppConfig::default(), TokenCatalog::default());
        let mut g1 = connect(&state, "G1", DeviceType::Gm, None).await;
        let mut g2 = connect(&state, "G2", DeviceType::Gm, None).await;

        dispatch(
            &state,
            DomainEvent::BatchProcessed {
                device_id: "G1".into(),
                ack: BatchAck {
                    batch_id: "b1".into(),
                    processed_count: 3,
                    total_count: 3,
                },
            },
        )
        .await;

        let received = frames(&mut g1);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["event"], EVENT_BATCH_ACK);
        assert_eq!(received[0]["data"]["batchId"], "b1");
        assert!(received[0]["timestamp"].is_string());
        assert!(frames(&mut g2).is_empty());
    }

    #[tokio::test]
    async fn score_update_is_delivered_once_per_connection() {
        let state = AppState::new(AppConfig::default(), TokenCatalog::default());
        let session = Session::new("Test".into(), [("001".to_string(), 1)]);
        let mut gm = connect(&state, "G1", DeviceType::Gm, Some(&session)).await;
        let mut scoreboard = state.scoreboard_sse().subscribe();

        dispatch(
            &state,
            DomainEvent::ScoreUpdated {
                session_id: session.id,
                score: TeamScoreSummary {
                    team_id: "001".into(),
                    score: 100,
                    multiplier: 1,
                    completed_groups: Vec::new(),
                },
            },
        )
        .await;

        assert_eq!(frames(&mut gm).len(), 1);
        let sse = scoreboard.try_recv().unwrap();
        assert_eq!(sse.event.as_deref(), Some(EVENT_SCORE_UPDATED));
    }

    #[tokio::test]
    async fn dispatcher_forwards_published_events_in_order() {
        let state = AppState::new(AppConfig::default(), TokenCatalog::default());
        let mut gm = connect(&state, "G1", DeviceType::Gm, None).await;
        let handle = spawn_dispatcher(&state);

        for batch in ["b1", "b2", "b3"] {
            state.events().publish(DomainEvent::BatchProcessed {
                device_id: "G1".into(),
                ack: BatchAck {
                    batch_id: batch.into(),
                    processed_count: 0,
                    total_count: 0,
                },
            });
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            if let Some(Message::Text(text)) = gm.recv().await {
                let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                seen.push(value["data"]["batchId"].as_str().unwrap().to_string());
            }
        }
        assert_eq!(seen, vec!["b1", "b2", "b3"]);
        handle.abort();
    }

    #[tokio::test]
    async fn large_batch_reaches_devices_without_gaps() {
        use crate::{
            catalog::TokenDefinition,
            dto::scan::{BatchRequest, ScanRequest},
            services::batch_service,
        };

        const ENTRIES: usize = 500;
        let tokens: Vec<String> = (0..ENTRIES).map(|i| format!("tok{i:04}")).collect();
        let catalog = TokenCatalog::from_definitions(tokens.iter().map(|id| TokenDefinition {
            token_id: id.clone(),
            value_rating: Some(1),
            memory_type: None,
            group: None,
            video: None,
        }));
        let state = AppState::new(AppConfig::default(), catalog);
        let session = Session::new("Test".into(), [("001".to_string(), 1)]);
        state.replace_session(Some(session.clone())).await;
        let mut gm = connect(&state, "G1", DeviceType::Gm, Some(&session)).await;
        let handle = spawn_dispatcher(&state);

        let request = BatchRequest {
            batch_id: Some("big".into()),
            device_id: Some("G1".into()),
            entries: tokens
                .iter()
                .map(|token| ScanRequest {
                    token_id: Some(token.clone()),
                    team_id: Some("001".into()),
                    device_id: None,
                    device_type: Some("gm".into()),
                    timestamp: Some("2026-10-16T12:00:00Z".into()),
                })
                .collect(),
            submitted_at: None,
        };
        let response = batch_service::submit_batch(&state, request).await.unwrap();
        assert_eq!(response.result.processed_count, ENTRIES);

        let mut transactions = 0;
        let mut scores = 0;
        loop {
            let frame = tokio::time::timeout(std::time::Duration::from_secs(5), gm.recv())
                .await
                .expect("dispatcher stalled")
                .expect("connection closed");
            let Message::Text(text) = frame else { continue };
            let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
            match value["event"].as_str() {
                Some(EVENT_TRANSACTION_NEW) => transactions += 1,
                Some(EVENT_SCORE_UPDATED) => scores += 1,
                Some(EVENT_BATCH_ACK) => break,
                _ => {}
            }
        }
        assert_eq!(transactions, ENTRIES);
        assert_eq!(scores, ENTRIES);
        handle.abort();
    }
}
