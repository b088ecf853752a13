//! Pod lifecycle event bus
//!
//! Controllers subscribe a handler per event kind. `publish` runs each
//! matching handler in subscription order and only returns once the last one
//! has finished, so a slow subscriber delays the publisher.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use super::cache::PodLegacy;
use super::pod::Pod;

/// Kinds of pod lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PodDeletion,
    PodReady,
    PodFail,
    PodSucceed,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::PodDeletion,
        EventKind::PodReady,
        EventKind::PodFail,
        EventKind::PodSucceed,
    ];
}

/// A pod lifecycle event
#[derive(Debug, Clone, PartialEq)]
pub enum PodEvent {
    /// A pod left the cache; carries who owned it
    Deletion {
        pod: Pod,
        legacy: Option<PodLegacy>,
    },
    Ready {
        pod: Pod,
    },
    Failed {
        pod: Pod,
    },
    Succeeded {
        pod: Pod,
    },
}

impl PodEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PodEvent::Deletion { .. } => EventKind::PodDeletion,
            PodEvent::Ready { .. } => EventKind::PodReady,
            PodEvent::Failed { .. } => EventKind::PodFail,
            PodEvent::Succeeded { .. } => EventKind::PodSucceed,
        }
    }

    pub fn pod(&self) -> &Pod {
        match self {
            PodEvent::Deletion { pod, .. }
            | PodEvent::Ready { pod }
            | PodEvent::Failed { pod }
            | PodEvent::Succeeded { pod } => pod,
        }
    }
}

/// Receives the events it subscribed to
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &PodEvent);
}

type Subscription = (EventKind, Arc<dyn EventHandler>);

/// In-process publish/subscribe bus
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscription>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind. There is no unsubscribe.
    pub fn subscribe(&self, handler: Arc<dyn EventHandler>, kind: EventKind) {
        self.subscribers.write().push((kind, handler));
    }

    /// Deliver an event to every subscriber of its kind.
    ///
    /// Returns the number of handlers that ran.
    pub async fn publish(&self, event: PodEvent) -> usize {
        let kind = event.kind();
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .subscribers
            .read()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, h)| Arc::clone(h))
            .collect();

        debug!(
            "Publishing {:?} for pod '{}' to {} handler(s)",
            kind,
            event.pod().metadata.name,
            handlers.len()
        );

        for handler in &handlers {
            handler.handle(&event).await;
        }
        handlers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
