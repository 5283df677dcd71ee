use tracing::{debug, info};

use crate::{
    dto::{session::DeviceSummary, ws::DeviceDisconnectedEvent},
    services::{
        broadcast::{self, EVENT_SYNC_FULL},
        sync_service,
    },
    state::{
        SharedState,
        events::DomainEvent,
        rooms::{DeviceConnection, RoomSet},
    },
};

/// Outcome of joining a connection to its rooms.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub rooms: RoomSet,
    /// Whether the device was known to the session before this join.
    pub known: bool,
}

/// Compute the room set from the current session and join it.
///
/// Runs under the session lock so a concurrent session reset cannot land
/// between resolving the rooms and registering the device.
pub async fn join(state: &SharedState, connection: &DeviceConnection) -> JoinOutcome {
    let mut guard = state.lock_session().await;
    let rooms = RoomSet::resolve(
        &connection.device_id,
        connection.device_type,
        guard.as_ref(),
    );
    let rooms = state.rooms().join(connection.clone(), rooms).await;

    let known = match guard.as_mut() {
        Some(session) => {
            let known = session.register_device(
                &connection.device_id,
                connection.device_type,
                rooms.names(),
            );
            if let Some(device) = session.devices.get(&connection.device_id) {
                state.events().publish(DomainEvent::DeviceConnected {
                    device: DeviceSummary::from(device),
                });
            }
            state.mark_dirty();
            known
        }
        None => false,
    };

    debug!(
        device_id = %connection.device_id,
        rooms = ?rooms.names(),
        known,
        "connection joined rooms"
    );
    JoinOutcome { rooms, known }
}

/// Drop a connection from its rooms; mark the device disconnected once its
/// last connection is gone.
///
/// Holds the session lock across the registry check so a concurrent `join`
/// for the same device cannot be overwritten with a stale disconnect.
pub async fn leave(state: &SharedState, connection: &DeviceConnection) {
    let mut guard = state.lock_session().await;
    state.rooms().leave(&connection.id).await;
    if state.rooms().is_device_connected(&connection.device_id).await {
        return;
    }

    if let Some(session) = guard.as_mut() {
        session.mark_disconnected(&connection.device_id);
        state.events().publish(DomainEvent::DeviceDisconnected(DeviceDisconnectedEvent {
            device_id: connection.device_id.clone(),
            device_type: connection.device_type,
        }));
        state.mark_dirty();
    }
}

/// Re-join every live connection after the session was replaced or reset and
/// push each a fresh `sync:full`.
pub async fn resync_all(state: &SharedState) {
    let connections = state.rooms().connections().await;
    let count = connections.len();
    for connection in connections {
        let joined = join(state, &connection).await;
        let payload = sync_service::snapshot_for(
            state,
            &connection.device_id,
            connection.device_type,
            joined.known,
        )
        .await;
        if broadcast::send_direct(&connection.tx, EVENT_SYNC_FULL, &payload).is_err() {
            debug!(device_id = %connection.device_id, "resync skipped closed connection");
        }
    }
    info!(connections = count, "resynchronized connected devices");
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::*;
    use crate::{
        catalog::TokenCatalog,
        config::AppConfig,
        state::{
            AppState,
            rooms::Room,
            session::{DeviceType, Session},
        },
    };

    fn connection(device_id: &str, device_type: DeviceType) -> DeviceConnection {
        let (tx, _rx) = mpsc::unbounded_channel();
        DeviceConnection {
            id: Uuid::new_v4(),
            device_id: device_id.into(),
            device_type,
            tx,
        }
    }

    #[tokio::test]
    async fn join_registers_device_and_reports_reconnection() {
        let state = AppState::new(AppConfig::default(), TokenCatalog::default());
        let session = Session::new("Test".into(), [("001".to_string(), 1)]);
        let session_id = session.id;
        state.replace_session(Some(session)).await;

        let first = connection("G1", DeviceType::Gm);
        let joined = join(&state, &first).await;
        assert!(!joined.known);
        assert!(joined.rooms.contains(&Room::Session(session_id)));
        assert!(joined.rooms.contains(&Room::Team("001".into())));

        leave(&state, &first).await;
        let connected = state
            .read_session(|s| s.map(|s| s.devices["G1"].connected))
            .await;
        assert_eq!(connected, Some(false));

        let again = join(&state, &connection("G1", DeviceType::Gm)).await;
        assert!(again.known);
    }

    #[tokio::test]
    async fn device_stays_connected_while_another_connection_is_open() {
        let state = AppState::new(AppConfig::default(), TokenCatalog::default());
        state
            .replace_session(Some(Session::new("Test".into(), Vec::<(String, u32)>::new())))
            .await;

        let a = connection("G1", DeviceType::Gm);
        let b = connection("G1", DeviceType::Gm);
        join(&state, &a).await;
        join(&state, &b).await;
        leave(&state, &a).await;

        let connected = state
            .read_session(|s| s.map(|s| s.devices["G1"].connected))
            .await;
        assert_eq!(connected, Some(true));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reconnect_keeps_device_connected() {
        let state = AppState::new(AppConfig::default(), TokenCatalog::default());
        state
            .replace_session(Some(Session::new("Test".into(), Vec::<(String, u32)>::new())))
            .await;

        for _ in 0..100 {
            let old = connection("G1", DeviceType::Gm);
            join(&state, &old).await;

            let fresh = connection("G1", DeviceType::Gm);
            let leaving = tokio::spawn({
                let state = state.clone();
                async move { leave(&state, &old).await }
            });
            let joining = tokio::spawn({
                let state = state.clone();
                let fresh = fresh.clone();
                async move { join(&state, &fresh).await }
            });
            leaving.await.unwrap();
            joining.await.unwrap();

            let connected = state
                .read_session(|s| s.map(|s| s.devices["G1"].connected))
                .await;
            assert_eq!(connected, Some(true));
            leave(&state, &fresh).await;
        }
    }

    #[tokio::test]
    async fn join_without_session_has_no_session_room() {
        let state = AppState::new(AppConfig::default(), TokenCatalog::default());
        let joined = join(&state, &connection("P1", DeviceType::Player)).await;
        assert_eq!(joined.rooms.len(), 2);
        assert!(!joined.known);
    }
}
