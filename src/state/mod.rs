pub mod events;
pub mod lifecycle;
pub mod rooms;
pub mod session;
mod sse;

use std::sync::Arc;

use tokio::{
    sync::{Mutex, MutexGuard, RwLock, watch},
    task::JoinHandle,
};

use crate::{
    catalog::TokenCatalog,
    config::AppConfig,
    error::ServiceError,
    services::content::{ContentTrigger, LoggingContentTrigger},
    state::{
        events::EventHub,
        lifecycle::{ConnectionLifecycle, LifecycleEvent, LifecyclePhase, OrderingViolation},
        rooms::RoomRegistry,
        session::Session,
    },
};

pub use self::sse::SseHub;

pub type SharedState = Arc<AppState>;

/// Central application state: the session aggregate, connection lifecycle,
/// room table and event channels.
pub struct AppState {
    config: Arc<AppConfig>,
    catalog: Arc<TokenCatalog>,
    content: Arc<dyn ContentTrigger>,
    session: Mutex<Option<Session>>,
    lifecycle: RwLock<ConnectionLifecycle>,
    rooms: RoomRegistry,
    events: EventHub,
    scoreboard: SseHub,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    revision: watch::Sender<u64>,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    pub fn new(config: AppConfig, catalog: TokenCatalog) -> SharedState {
        Self::with_content_trigger(config, catalog, Arc::new(LoggingContentTrigger))
    }

    /// Same as [`AppState::new`] with a custom content-trigger collaborator.
    pub fn with_content_trigger(
        config: AppConfig,
        catalog: TokenCatalog,
        content: Arc<dyn ContentTrigger>,
    ) -> SharedState {
        let (revision, _rx) = watch::channel(0);
        Arc::new(Self {
            config: Arc::new(config),
            catalog: Arc::new(catalog),
            content,
            session: Mutex::new(None),
            lifecycle: RwLock::new(ConnectionLifecycle::new()),
            rooms: RoomRegistry::new(),
            events: EventHub::new(),
            scoreboard: SseHub::new(32),
            dispatcher: Mutex::new(None),
            revision,
        })
    }

    /// Immutable application configuration.
    pub fn config(&self) -> Arc<AppConfig> {
        self.config.clone()
    }

    /// Token-value table.
    pub fn catalog(&self) -> &TokenCatalog {
        &self.catalog
    }

    /// Content/video collaborator notified on accepted scans.
    pub fn content(&self) -> &Arc<dyn ContentTrigger> {
        &self.content
    }

    /// Room membership table.
    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    /// Ordered domain event channel.
    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Broadcast hub behind `/sse/scoreboard`.
    pub fn scoreboard_sse(&self) -> &SseHub {
        &self.scoreboard
    }

    /// Slot holding the running dispatcher task.
    pub(crate) fn dispatcher_slot(&self) -> &Mutex<Option<JoinHandle<()>>> {
        &self.dispatcher
    }

    /// Lock the session slot for a multi-step critical section.
    ///
    /// Callers that mutate must call [`AppState::mark_dirty`] before releasing the guard.
    pub async fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().await
    }

    /// Read the session under the lock.
    pub async fn read_session<F, T>(&self, f: F) -> T
    where
        F: FnOnce(Option<&Session>) -> T,
    {
        let guard = self.session.lock().await;
        f(guard.as_ref())
    }

    /// Mutate the active session under the lock, failing when none exists.
    pub async fn with_session_mut<F, T>(&self, f: F) -> Result<T, ServiceError>
    where
        F: FnOnce(&mut Session) -> Result<T, ServiceError>,
    {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(ServiceError::NoActiveSession)?;
        let result = f(session)?;
        self.mark_dirty();
        Ok(result)
    }

    /// Replace the whole session slot, returning the previous value.
    pub async fn replace_session(&self, session: Option<Session>) -> Option<Session> {
        let mut guard = self.session.lock().await;
        let previous = std::mem::replace(&mut *guard, session);
        self.mark_dirty();
        previous
    }

    /// Signal that the session changed and should be persisted.
    pub fn mark_dirty(&self) {
        self.revision.send_modify(|revision| *revision = revision.wrapping_add(1));
    }

    /// Subscribe to session revision bumps.
    pub fn revision_watcher(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Current connection lifecycle phase.
    pub async fn lifecycle_phase(&self) -> LifecyclePhase {
        self.lifecycle.read().await.phase()
    }

    /// Fail unless connection handlers may run.
    pub async fn ensure_accepting(&self) -> Result<(), OrderingViolation> {
        self.lifecycle.read().await.ensure_accepting()
    }

    /// Apply a lifecycle step after `work` succeeded.
    ///
    /// The step is validated before `work` runs and the lifecycle lock is held
    /// throughout, so no connection can be accepted between the two.
    pub async fn run_lifecycle_step<F, Fut, T>(
        &self,
        event: LifecycleEvent,
        work: F,
    ) -> Result<(T, LifecyclePhase), ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, ServiceError>>,
    {
        let mut lifecycle = self.lifecycle.write().await;
        lifecycle.check(event)?;
        let value = work().await?;
        let next = lifecycle.apply(event)?;
        Ok((value, next))
    }

    /// Return the lifecycle to its initial phase.
    pub async fn reset_lifecycle(&self) {
        self.lifecycle.write().await.reset();
    }
}
