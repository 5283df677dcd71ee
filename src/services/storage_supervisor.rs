use std::{sync::Arc, time::Duration};

use tokio::{sync::watch, task::JoinHandle, time::sleep};
use tracing::{debug, info, warn};

use crate::{dao::snapshot_store::SnapshotStore, error::ServiceError, state::SharedState};

const DEBOUNCE: Duration = Duration::from_millis(250);
const INITIAL_DELAY: Duration = Duration::from_millis(1_000);
const MAX_DELAY: Duration = Duration::from_secs(10);

/// Subscribe to session revisions and spawn the persistence loop.
pub fn spawn(state: &SharedState, store: Arc<dyn SnapshotStore>) -> JoinHandle<()> {
    let revisions = state.revision_watcher();
    tokio::spawn(run(state.clone(), store, revisions))
}

/// Persist the session whenever it changes, coalescing bursts of mutations.
///
/// Failed writes are retried with backoff until they succeed or a newer
/// revision supersedes them.
async fn run(state: SharedState, store: Arc<dyn SnapshotStore>, mut revisions: watch::Receiver<u64>) {
    let mut delay = INITIAL_DELAY;

    while revisions.changed().await.is_ok() {
        sleep(DEBOUNCE).await;
        let revision = *revisions.borrow_and_update();
        let snapshot = state.read_session(|session| session.cloned()).await;

        loop {
            match store.save(snapshot.clone()).await {
                Ok(()) => {
                    debug!(revision, "session snapshot persisted");
                    delay = INITIAL_DELAY;
                    break;
                }
                Err(err) => {
                    warn!(revision, error = %err, "session snapshot write failed; retrying");
                    sleep(delay).await;
                    delay = (delay * 2).min(MAX_DELAY);
                    if revisions.has_changed().unwrap_or(false) {
                        break;
                    }
                }
            }
        }
    }

    info!("storage supervisor stopped");
}

/// Write the current session once, used on shutdown.
pub async fn flush(state: &SharedState, store: &dyn SnapshotStore) -> Result<(), ServiceError> {
    let snapshot = state.read_session(|session| session.cloned()).await;
    store.save(snapshot).await?;
    info!("session snapshot flushed");
    Ok(())
}
