//! Startup and teardown sequencing for the connection layer.

use tracing::{info, warn};

use crate::{
    dao::snapshot_store::SnapshotStore,
    error::ServiceError,
    services::broadcast,
    state::{
        SharedState,
        lifecycle::{LifecycleEvent, LifecyclePhase},
    },
};

/// Restore the persisted session (if any) and mark core services ready.
pub async fn mark_services_ready(
    state: &SharedState,
    store: Option<&dyn SnapshotStore>,
) -> Result<LifecyclePhase, ServiceError> {
    let ((), phase) = state
        .run_lifecycle_step(LifecycleEvent::MarkServicesReady, move || async move {
            let Some(store) = store else {
                return Ok(());
            };
            match store.load().await {
                Ok(Some(session)) => {
                    info!(
                        session_id = %session.id,
                        transactions = session.transactions.len(),
                        "restored session snapshot"
                    );
                    state.replace_session(Some(session)).await;
                }
                Ok(None) => info!("no session snapshot to restore"),
                Err(err) => warn!(error = %err, "failed to restore session snapshot; starting empty"),
            }
            Ok(())
        })
        .await?;
    Ok(phase)
}

/// Register the broadcast dispatcher ahead of any connection handler.
///
/// Re-entrant: a dispatcher that is still running is kept.
pub async fn setup_handlers(state: &SharedState) -> Result<LifecyclePhase, ServiceError> {
    let ((), phase) = state
        .run_lifecycle_step(LifecycleEvent::SetupHandlers, move || async move {
            let mut slot = state.dispatcher_slot().lock().await;
            if slot.as_ref().is_none_or(|handle| handle.is_finished()) {
                *slot = Some(broadcast::spawn_dispatcher(state));
                info!("broadcast dispatcher registered");
            }
            Ok(())
        })
        .await?;
    Ok(phase)
}

/// Record that the HTTP listener is bound.
pub async fn mark_listening(state: &SharedState) -> Result<LifecyclePhase, ServiceError> {
    let ((), phase) = state
        .run_lifecycle_step(LifecycleEvent::MarkListening, || async { Ok(()) })
        .await?;
    info!(phase = phase.as_str(), "connection lifecycle listening");
    Ok(phase)
}

/// Run the startup steps that must precede binding the listener.
pub async fn start(
    state: &SharedState,
    store: Option<&dyn SnapshotStore>,
) -> Result<LifecyclePhase, ServiceError> {
    mark_services_ready(state, store).await?;
    setup_handlers(state).await
}

/// Stop the dispatcher and return the lifecycle to its initial phase.
pub async fn teardown(state: &SharedState) {
    if let Some(handle) = state.dispatcher_slot().lock().await.take() {
        handle.abort();
    }
    state.reset_lifecycle().await;
    info!("connection lifecycle reset");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::TokenCatalog,
        config::AppConfig,
        dao::snapshot_store::FileSnapshotStore,
        state::{AppState, session::Session},
    };

    fn state() -> SharedState {
        AppState::new(AppConfig::default(), TokenCatalog::default())
    }

    #[tokio::test]
    async fn handlers_before_services_is_an_ordering_violation() {
        let state = state();
        let err = setup_handlers(&state).await.unwrap_err();
        assert!(matches!(err, ServiceError::OrderingViolation(v) if v.current == LifecyclePhase::Uninitialized));
        assert!(state.dispatcher_slot().lock().await.is_none());
    }

    #[tokio::test]
    async fn setup_handlers_twice_keeps_one_dispatcher() {
        let state = state();
        mark_services_ready(&state, None).await.unwrap();
        setup_handlers(&state).await.unwrap();
        let receivers = state.events().receiver_count();
        assert_eq!(
            setup_handlers(&state).await.unwrap(),
            LifecyclePhase::HandlersReady
        );
        assert_eq!(state.events().receiver_count(), receivers);
        teardown(&state).await;
    }

    #[tokio::test]
    async fn full_sequence_then_teardown() {
        let state = state();
        start(&state, None).await.unwrap();
        assert!(state.ensure_accepting().await.is_ok());
        assert_eq!(mark_listening(&state).await.unwrap(), LifecyclePhase::Listening);

        teardown(&state).await;
        assert_eq!(state.lifecycle_phase().await, LifecyclePhase::Uninitialized);
        assert!(state.ensure_accepting().await.is_err());
    }

    #[tokio::test]
    async fn services_ready_restores_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path().join("session.json"));
        let session = Session::new("Saved".into(), [("001".to_string(), 1)]);
        store.save(Some(session.clone())).await.unwrap();

        let state = state();
        mark_services_ready(&state, Some(&store as &dyn SnapshotStore))
            .await
            .unwrap();
        let restored = state.read_session(|s| s.map(|s| s.id)).await;
        assert_eq!(restored, Some(session.id));
    }
}
