use thiserror::Error;

/// Startup phases of the connection layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    /// Nothing is wired yet.
    Uninitialized,
    /// Core services (session, catalog, storage) are ready.
    ServicesReady,
    /// Domain-event listeners are registered; connections may be accepted.
    HandlersReady,
    /// The HTTP listener is bound and serving.
    Listening,
}

impl LifecyclePhase {
    /// Upper-case label used in logs and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecyclePhase::Uninitialized => "UNINITIALIZED",
            LifecyclePhase::ServicesReady => "SERVICES_READY",
            LifecyclePhase::HandlersReady => "HANDLERS_READY",
            LifecyclePhase::Listening => "LISTENING",
        }
    }
}

/// Startup steps that can be applied to the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Session store, token catalog and storage are in place.
    MarkServicesReady,
    /// Register domain-event listeners ahead of connection handlers.
    SetupHandlers,
    /// The socket is bound and accepting traffic.
    MarkListening,
    /// A device connection asked to be admitted. Never changes the phase.
    AcceptConnection,
}

/// Raised when a startup step is attempted out of order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("ordering violation: {event:?} cannot be applied while {}", .current.as_str())]
pub struct OrderingViolation {
    /// Phase the lifecycle was in when the step was attempted.
    pub current: LifecyclePhase,
    /// Step that was rejected.
    pub event: LifecycleEvent,
}

/// State machine that orders listener registration before connection handling.
#[derive(Debug, Clone)]
pub struct ConnectionLifecycle {
    phase: LifecyclePhase,
    handler_setups: usize,
}

impl Default for ConnectionLifecycle {
    fn default() -> Self {
        Self {
            phase: LifecyclePhase::Uninitialized,
            handler_setups: 0,
        }
    }
}

impl ConnectionLifecycle {
    /// Create a lifecycle in the uninitialized phase.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspect the current phase.
    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    /// Number of times handler setup completed since the last reset.
    pub fn handler_setups(&self) -> usize {
        self.handler_setups
    }

    /// Whether connection-accept handlers may run.
    pub fn accepts_connections(&self) -> bool {
        matches!(
            self.phase,
            LifecyclePhase::HandlersReady | LifecyclePhase::Listening
        )
    }

    /// Fail with [`OrderingViolation`] unless connections may be accepted.
    pub fn ensure_accepting(&self) -> Result<(), OrderingViolation> {
        if self.accepts_connections() {
            Ok(())
        } else {
            Err(OrderingViolation {
                current: self.phase,
                event: LifecycleEvent::AcceptConnection,
            })
        }
    }

    /// Validate `event` against the current phase without applying it.
    pub fn check(&self, event: LifecycleEvent) -> Result<LifecyclePhase, OrderingViolation> {
        self.compute_transition(event)
    }

    /// Apply `event`, returning the new phase.
    pub fn apply(&mut self, event: LifecycleEvent) -> Result<LifecyclePhase, OrderingViolation> {
        let next = self.compute_transition(event)?;
        if event == LifecycleEvent::SetupHandlers {
            self.handler_setups += 1;
        }
        self.phase = next;
        Ok(next)
    }

    /// Transition out of [`LifecyclePhase::Uninitialized`].
    pub fn mark_services_ready(&mut self) -> Result<LifecyclePhase, OrderingViolation> {
        self.apply(LifecycleEvent::MarkServicesReady)
    }

    /// Record that handlers were wired. Re-entrant once services are ready.
    pub fn setup_handlers(&mut self) -> Result<LifecyclePhase, OrderingViolation> {
        self.apply(LifecycleEvent::SetupHandlers)
    }

    /// Record that the listener is serving traffic.
    pub fn mark_listening(&mut self) -> Result<LifecyclePhase, OrderingViolation> {
        self.apply(LifecycleEvent::MarkListening)
    }

    /// Return unconditionally to [`LifecyclePhase::Uninitialized`].
    pub fn reset(&mut self) {
        self.phase = LifecyclePhase::Uninitialized;
        self.handler_setups = 0;
    }

    fn compute_transition(&self, event: LifecycleEvent) -> Result<LifecyclePhase, OrderingViolation> {
        let next = match (self.phase, event) {
            (LifecyclePhase::Uninitialized, LifecycleEvent::MarkServicesReady) => {
                LifecyclePhase::ServicesReady
            }
            (
                LifecyclePhase::ServicesReady | LifecyclePhase::HandlersReady,
                LifecycleEvent::SetupHandlers,
            ) => LifecyclePhase::HandlersReady,
            (LifecyclePhase::HandlersReady | LifecyclePhase::Listening, LifecycleEvent::MarkListening)
                if self.handler_setups > 0 =>
            {
                LifecyclePhase::Listening
            }
            (current, event) => return Err(OrderingViolation { current, event }),
        };

        Ok(next)
    }
}
