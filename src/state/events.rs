use std::sync::Mutex;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::dto::{
    session::{DeviceSummary, TeamScoreSummary, TransactionSummary},
    ws::{BatchAck, DeviceDisconnectedEvent, GroupCompletedEvent, SessionUpdateEvent},
};

/// Session mutations announced to the broadcast dispatcher.
///
/// Events are published while the session lock is held, so receivers observe
/// them in mutation order.
#[derive(Debug, Clone)]
pub enum DomainEvent {
    /// A scan was appended to the transaction log.
    TransactionRecorded {
        session_id: Uuid,
        transaction: TransactionSummary,
    },
    /// A team score changed.
    ScoreUpdated {
        session_id: Uuid,
        score: TeamScoreSummary,
    },
    /// A team scanned every token of a group.
    GroupCompleted {
        session_id: Uuid,
        completed: GroupCompletedEvent,
    },
    /// An offline batch was applied (or replayed).
    BatchProcessed { device_id: String, ack: BatchAck },
    /// A device identified itself.
    DeviceConnected { device: DeviceSummary },
    /// A device's last connection closed.
    DeviceDisconnected(DeviceDisconnectedEvent),
    /// The session was created, reset or ended.
    SessionUpdated(SessionUpdateEvent),
}

/// Fan-out of [`DomainEvent`]s to every subscriber.
///
/// Each subscriber owns an unbounded queue, so a burst of events (a large
/// batch) is never dropped and every subscriber sees publish order.
#[derive(Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<DomainEvent>>>,
}

impl EventHub {
    /// Create a hub with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a receiver for subsequent events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DomainEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    /// Publish an event to every live subscriber, pruning closed ones.
    pub fn publish(&self, event: DomainEvent) {
        self.lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    /// Number of live receivers.
    pub fn receiver_count(&self) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|subscriber| !subscriber.is_closed());
        subscribers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<DomainEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dto::ws::DeviceDisconnectedEvent;
    use crate::state::session::DeviceType;

    fn disconnected(device_id: &str) -> DomainEvent {
        DomainEvent::DeviceDisconnected(DeviceDisconnectedEvent {
            device_id: device_id.into(),
            device_type: DeviceType::Gm,
        })
    }

    #[test]
    fn bursts_are_delivered_in_order_without_loss() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe();
        for i in 0..2_000 {
            hub.publish(disconnected(&format!("G{i}")));
        }

        let mut received = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                DomainEvent::DeviceDisconnected(d) => assert_eq!(d.device_id, format!("G{received}")),
                other => panic!("unexpected event {other:?}"),
            }
            received += 1;
        }
        assert_eq!(received, 2_000);
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let hub = EventHub::new();
        let kept = hub.subscribe();
        drop(hub.subscribe());
        assert_eq!(hub.receiver_count(), 1);
        hub.publish(disconnected("G1"));
        drop(kept);
        assert_eq!(hub.receiver_count(), 0);
    }
}
