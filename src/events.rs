use crate::error::Result;
use crate::model::Event;
use crate::store::TaskStore;
use std::sync::Arc;
use tracing::{debug, warn};

/// Event log: the persisted view over the `eventos` table plus a push
/// channel for subscribers.
///
/// Delivery to subscribers is best-effort. A slow or dropped subscriber
/// never affects the transaction that produced the event; the store row is
/// the durable record.
#[derive(Clone)]
pub struct EventLog {
    store: Arc<dyn TaskStore>,
    sender: async_broadcast::Sender<Event>,
    // Keeps the channel open while no subscriber is attached.
    _keepalive: async_broadcast::InactiveReceiver<Event>,
}

impl EventLog {
    pub fn new(store: Arc<dyn TaskStore>, capacity: usize) -> Self {
        let (mut sender, receiver) = async_broadcast::broadcast(capacity);
        // Old events are dropped for laggards instead of blocking the engine.
        sender.set_overflow(true);
        Self {
            store,
            sender,
            _keepalive: receiver.deactivate(),
        }
    }

    /// Push one event to the subscribers. Failures are logged and swallowed.
    pub fn publish(&self, event: &Event) {
        match self.sender.try_broadcast(event.clone()) {
            Ok(_) => debug!("evento {} publicado: {}", event.id, event.tipo_evento),
            Err(e) => warn!(
                "no se pudo publicar el evento {} ({}): {}",
                event.id, event.tipo_evento, e
            ),
        }
    }

    pub fn subscribe(&self) -> async_broadcast::Receiver<Event> {
        self.sender.new_receiver()
    }

    /// Most recent events first, straight from the store.
    pub async fn recent(&self, limit: Option<usize>) -> Result<Vec<Event>> {
        self.store.list_events(limit).await
    }

    pub async fn total(&self) -> Result<u64> {
        self.store.event_count().await
    }
}
