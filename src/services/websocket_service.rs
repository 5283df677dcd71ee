use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    dto::{
        now_timestamp,
        scan::{ScanRequest, ScanResponse},
        session::TransactionSummary,
        validation::validate_device_id,
        ws::{DeviceInboundMessage, ErrorPayload, HeartbeatAck, Identification},
    },
    error::ServiceError,
    services::{
        broadcast::{
            self, ConnectionClosed, EVENT_ERROR, EVENT_HEARTBEAT_ACK, EVENT_SYNC_FULL,
            EVENT_TRANSACTION_RESULT,
        },
        room_service, sync_service, transaction_service,
    },
    state::{
        SharedState,
        rooms::DeviceConnection,
        session::DeviceType,
    },
};

const IDENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Device identity accepted from a `device:identify` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub device_type: DeviceType,
}

/// Handle the full lifecycle for an individual device WebSocket connection.
pub async fn handle_socket(state: SharedState, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Dedicated writer task keeps outbound messages flowing even while we await inbound frames.
    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let initial_message = match tokio::time::timeout(IDENT_TIMEOUT, receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(Message::Close(_)))) => {
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(Some(Ok(_))) => {
            let _ = outbound_tx.send(Message::Close(None));
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(Some(Err(err))) => {
            warn!(error = %err, "websocket receive error");
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(None) | Err(_) => {
            warn!("websocket identification timed out");
            finalize(writer_task, outbound_tx).await;
            return;
        }
    };

    let identification = match DeviceInboundMessage::from_json_str(&initial_message) {
        Ok(DeviceInboundMessage::Identify(identification)) => identification,
        Ok(_) => {
            warn!("first message was not device:identify");
            reject(&outbound_tx, &ServiceError::Unauthorized("identify first".into()));
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Err(err) => {
            warn!(error = %err, "failed to parse identification frame");
            reject(&outbound_tx, &ServiceError::Validation(err.to_string()));
            finalize(writer_task, outbound_tx).await;
            return;
        }
    };

    let identity = match authenticate(&state, identification) {
        Ok(identity) => identity,
        Err(err) => {
            warn!(error = %err, "device identification rejected");
            reject(&outbound_tx, &err);
            finalize(writer_task, outbound_tx).await;
            return;
        }
    };

    // Handlers may have been torn down while the client was identifying.
    if let Err(violation) = state.ensure_accepting().await {
        warn!(error = %violation, "connection arrived before handlers were ready");
        reject(&outbound_tx, &ServiceError::OrderingViolation(violation));
        finalize(writer_task, outbound_tx).await;
        return;
    }

    let connection = DeviceConnection {
        id: Uuid::new_v4(),
        device_id: identity.device_id.clone(),
        device_type: identity.device_type,
        tx: outbound_tx.clone(),
    };

    let joined = room_service::join(&state, &connection).await;
    info!(
        device_id = %connection.device_id,
        device_type = %connection.device_type,
        reconnection = joined.known,
        "device connected"
    );

    let payload = sync_service::snapshot_for(
        &state,
        &connection.device_id,
        connection.device_type,
        joined.known,
    )
    .await;
    if broadcast::send_direct(&outbound_tx, EVENT_SYNC_FULL, &payload).is_ok() {
        while let Some(message) = receiver.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    if handle_frame(&state, &connection, &text).await.is_err() {
                        info!(device_id = %connection.device_id, "writer closed, terminating");
                        break;
                    }
                }
                Ok(Message::Ping(payload)) => {
                    let _ = outbound_tx.send(Message::Pong(payload));
                }
                Ok(Message::Close(frame)) => {
                    info!(device_id = %connection.device_id, "device closed");
                    let _ = outbound_tx.send(Message::Close(frame));
                    break;
                }
                Ok(Message::Binary(_)) => {}
                Ok(Message::Pong(_)) => {}
                Err(err) => {
                    warn!(device_id = %connection.device_id, error = %err, "websocket error");
                    break;
                }
            }
        }
    }

    room_service::leave(&state, &connection).await;
    info!(device_id = %connection.device_id, "device disconnected");

    finalize(writer_task, outbound_tx).await;
}

/// Validate an identification frame against configuration.
pub fn authenticate(
    state: &SharedState,
    identification: Identification,
) -> Result<DeviceIdentity, ServiceError> {
    let device_id = identification.device_id.trim().to_string();
    validate_device_id(&device_id).map_err(|err| {
        ServiceError::Validation(
            err.message
                .map(|message| message.to_string())
                .unwrap_or_else(|| "invalid deviceId".into()),
        )
    })?;
    let device_type = identification
        .device_type
        .parse::<DeviceType>()
        .map_err(|err| ServiceError::Validation(err.to_string()))?;

    if device_type == DeviceType::Gm {
        if let Some(expected) = state.config().gm_token() {
            if identification.token.as_deref() != Some(expected) {
                return Err(ServiceError::Unauthorized("invalid GM token".into()));
            }
        }
    }

    Ok(DeviceIdentity {
        device_id,
        device_type,
    })
}

/// Handle one inbound frame from an identified device.
///
/// Only a closed writer is reported as an error; everything else is answered
/// on the connection.
pub async fn handle_frame(
    state: &SharedState,
    connection: &DeviceConnection,
    text: &str,
) -> Result<(), ConnectionClosed> {
    let message = match DeviceInboundMessage::from_json_str(text) {
        Ok(message) => message,
        Err(err) => {
            warn!(device_id = %connection.device_id, error = %err, "failed to parse device message");
            return send_error(&connection.tx, &ServiceError::Validation(err.to_string()));
        }
    };

    match message {
        DeviceInboundMessage::Identify(_) => {
            warn!(device_id = %connection.device_id, "ignoring duplicate identification message");
            Ok(())
        }
        DeviceInboundMessage::SubmitScan(request) => {
            let result = match bind_to_connection(connection, request) {
                Ok(request) => transaction_service::process_scan(state, request).await,
                Err(err) => Err(err),
            };
            match result {
                Ok(outcome) => broadcast::send_direct(
                    &connection.tx,
                    EVENT_TRANSACTION_RESULT,
                    &ScanResponse {
                        transaction: TransactionSummary::from(&outcome.transaction),
                        team_score: outcome.team_score,
                    },
                ),
                Err(err) => {
                    warn!(device_id = %connection.device_id, error = %err, "scan rejected");
                    send_error(&connection.tx, &err)
                }
            }
        }
        DeviceInboundMessage::SyncRequest(_) => {
            let payload = sync_service::snapshot_for(
                state,
                &connection.device_id,
                connection.device_type,
                true,
            )
            .await;
            broadcast::send_direct(&connection.tx, EVENT_SYNC_FULL, &payload)
        }
        DeviceInboundMessage::Heartbeat(_) => {
            {
                let mut guard = state.lock_session().await;
                if let Some(session) = guard.as_mut() {
                    session.ensure_device(&connection.device_id, connection.device_type);
                    state.mark_dirty();
                }
            }
            broadcast::send_direct(
                &connection.tx,
                EVENT_HEARTBEAT_ACK,
                &HeartbeatAck {
                    server_time: now_timestamp(),
                },
            )
        }
    }
}

/// Scans received over a connection belong to that connection's device.
fn bind_to_connection(
    connection: &DeviceConnection,
    mut request: ScanRequest,
) -> Result<ScanRequest, ServiceError> {
    match request.device_id.as_deref().map(str::trim) {
        None => request.device_id = Some(connection.device_id.clone()),
        Some(id) if id == connection.device_id => {}
        Some(id) => {
            return Err(ServiceError::Validation(format!(
                "deviceId `{id}` does not match the identified device `{}`",
                connection.device_id
            )));
        }
    }
    match request.device_type.as_deref().map(str::trim) {
        None => request.device_type = Some(connection.device_type.as_str().to_string()),
        Some(kind) if kind.parse::<DeviceType>().ok() == Some(connection.device_type) => {}
        Some(kind) => {
            return Err(ServiceError::Validation(format!(
                "deviceType `{kind}` does not match the identified device type `{}`",
                connection.device_type
            )));
        }
    }
    Ok(request)
}

fn send_error(
    tx: &mpsc::UnboundedSender<Message>,
    err: &ServiceError,
) -> Result<(), ConnectionClosed> {
    broadcast::send_direct(
        tx,
        EVENT_ERROR,
        &ErrorPayload {
            code: err.code().to_string(),
            message: err.to_string(),
        },
    )
}

/// Report `err` and ask the writer to close the socket.
fn reject(tx: &mpsc::UnboundedSender<Message>, err: &ServiceError) {
    let _ = send_error(tx, err);
    let _ = tx.send(Message::Close(None));
}

/// Ensure the writer task winds down before we return from the socket handler.
async fn finalize(writer_task: JoinHandle<()>, outbound_tx: mpsc::UnboundedSender<Message>) {
    drop(outbound_tx);
    let _ = writer_task.await;
}
