//! In-process event bus.
//!
//! The [`EventBus`] is the single router every component publishes through.
//! A published [`Envelope`] fans out in order over three delivery paths:
//!
//! 1. **Direct**: if `target` names a registered actor, the message is pushed
//!    onto that actor's inbox.
//! 2. **Topic**: every subscriber of the payload's [`kind`](crate::message::Payload::kind)
//!    is invoked.
//! 3. **Global**: every global subscriber is invoked.
//!
//! Per-target delivery order equals the serialized publish order observed by
//! the bus; no ordering is promised across different targets. A subscriber
//! returning an error never fails the publisher — the error is logged and
//! dropped.
//!
//! # Example
//!
//! ```rust,no_run
//! use crewllm::bus::{EventBus, Subscriber};
//! use crewllm::message::{Envelope, Payload};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl Subscriber for Printer {
//!     async fn on_event(&self, event: &Envelope) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!         println!("saw {}", event.payload.kind());
//!         Ok(())
//!     }
//! }
//!
//! # async {
//! let bus = EventBus::new();
//! bus.subscribe("tool_use", Arc::new(Printer)).await;
//! bus.publish(Envelope::new(Payload::Poison)).await;
//! # };
//! ```

use crate::crewllm::message::Envelope;
use async_trait::async_trait;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;

/// Callback seam for topic and global subscriptions.
///
/// Implementations must be thread-safe; the bus invokes them sequentially in
/// registration order while fanning out a publish.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Handle one published event. Errors are logged by the bus, never
    /// surfaced to the publisher.
    async fn on_event(&self, event: &Envelope) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Token returned by `subscribe`/`subscribe_global`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Errors raised by bus registration.
#[derive(Debug, Clone)]
pub enum BusError {
    /// An inbox is already registered under this actor name.
    NameTaken(String),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::NameTaken(name) => write!(f, "actor '{}' is already registered", name),
        }
    }
}

impl Error for BusError {}

/// The process-wide message router.
pub struct EventBus {
    inboxes: RwLock<HashMap<String, UnboundedSender<Envelope>>>,
    topic_subs: RwLock<HashMap<String, Vec<(SubscriptionId, Arc<dyn Subscriber>)>>>,
    global_subs: RwLock<Vec<(SubscriptionId, Arc<dyn Subscriber>)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inboxes: RwLock::new(HashMap::new()),
            topic_subs: RwLock::new(HashMap::new()),
            global_subs: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Associate an actor name with an inbox sender.
    ///
    /// Subsequent publishes whose `target` equals `name` are delivered there.
    /// Registering a name that is already taken fails.
    pub async fn register(
        &self,
        name: impl Into<String>,
        inbox: UnboundedSender<Envelope>,
    ) -> Result<(), BusError> {
        let name = name.into();
        let mut inboxes = self.inboxes.write().await;
        if inboxes.contains_key(&name) {
            return Err(BusError::NameTaken(name));
        }
        log::info!("EventBus: actor '{}' registered", name);
        inboxes.insert(name, inbox);
        Ok(())
    }

    /// Remove an actor's inbox. Later publishes targeting the name are dropped.
    pub async fn deregister(&self, name: &str) {
        self.inboxes.write().await.remove(name);
    }

    /// Whether an inbox is currently registered under `name`.
    pub async fn is_registered(&self, name: &str) -> bool {
        self.inboxes.read().await.contains_key(name)
    }

    /// Names of all currently registered actors.
    pub async fn registered_names(&self) -> Vec<String> {
        self.inboxes.read().await.keys().cloned().collect()
    }

    /// Subscribe a handler to one topic (a payload kind, e.g. `"tool_use"`).
    pub async fn subscribe(
        &self,
        topic: impl Into<String>,
        handler: Arc<dyn Subscriber>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.topic_subs
            .write()
            .await
            .entry(topic.into())
            .or_insert_with(Vec::new)
            .push((id, handler));
        id
    }

    /// Remove a topic subscription. Unknown ids are ignored.
    pub async fn unsubscribe(&self, topic: &str, id: SubscriptionId) {
        if let Some(handlers) = self.topic_subs.write().await.get_mut(topic) {
            handlers.retain(|(hid, _)| *hid != id);
        }
    }

    /// Subscribe a handler to every published message.
    pub async fn subscribe_global(&self, handler: Arc<dyn Subscriber>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.global_subs.write().await.push((id, handler));
        id
    }

    /// Remove a global subscription. Unknown ids are ignored.
    pub async fn unsubscribe_global(&self, id: SubscriptionId) {
        self.global_subs.write().await.retain(|(hid, _)| *hid != id);
    }

    /// Publish a message: direct delivery, then topic fan-out, then global
    /// fan-out.
    ///
    /// A `target` naming an unregistered actor is logged and treated as a
    /// drop; the publisher never sees an error for it.
    pub async fn publish(&self, event: Envelope) {
        let topic = event.payload.kind();

        if let Some(target) = event.target.as_deref() {
            let delivered = {
                let inboxes = self.inboxes.read().await;
                match inboxes.get(target) {
                    Some(sender) => sender.send(event.clone()).is_ok(),
                    None => false,
                }
            };
            if !delivered {
                log::warn!(
                    "EventBus: target actor '{}' not found for event {}",
                    target,
                    topic
                );
            }
        }

        // Snapshot the handler lists so a handler can re-enter the bus
        // (publish, subscribe) without deadlocking.
        let topic_handlers: Vec<Arc<dyn Subscriber>> = {
            let subs = self.topic_subs.read().await;
            subs.get(topic)
                .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };
        for handler in topic_handlers {
            if let Err(e) = handler.on_event(&event).await {
                log::error!("EventBus: subscriber error on topic {}: {}", topic, e);
            }
        }

        let global_handlers: Vec<Arc<dyn Subscriber>> = {
            let subs = self.global_subs.read().await;
            subs.iter().map(|(_, h)| Arc::clone(h)).collect()
        };
        for handler in global_handlers {
            if let Err(e) = handler.on_event(&event).await {
                log::error!("EventBus: global subscriber error: {}", e);
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crewllm::message::Payload;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    struct Counter(AtomicUsize);

    #[async_trait]
    impl Subscriber for Counter {
        async fn on_event(&self, _event: &Envelope) -> Result<(), Box<dyn Error + Send + Sync>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Subscriber for Failing {
        async fn on_event(&self, _event: &Envelope) -> Result<(), Box<dyn Error + Send + Sync>> {
            Err("boom".into())
        }
    }

    #[tokio::test]
    async fn delivers_targeted_messages_in_publish_order() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.register("a", tx).await.unwrap();

        for i in 0..5 {
            bus.publish(
                Envelope::new(Payload::WorkSubmitted {
                    content: format!("m{}", i),
                })
                .target("a"),
            )
            .await;
        }

        for i in 0..5 {
            let got = rx.recv().await.unwrap();
            match got.payload {
                Payload::WorkSubmitted { content } => assert_eq!(content, format!("m{}", i)),
                other => panic!("unexpected payload: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn duplicate_registration_fails() {
        let bus = EventBus::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        bus.register("a", tx1).await.unwrap();
        assert!(bus.register("a", tx2).await.is_err());
    }

    #[tokio::test]
    async fn missing_target_is_a_silent_drop() {
        let bus = EventBus::new();
        // Must not panic or error.
        bus.publish(Envelope::new(Payload::Poison).target("ghost")).await;
    }

    #[tokio::test]
    async fn unsubscribe_stops_topic_delivery() {
        let bus = EventBus::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let id = bus.subscribe("poison", counter.clone()).await;

        bus.publish(Envelope::new(Payload::Poison)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        bus.unsubscribe("poison", id).await;
        bus.publish(Envelope::new(Payload::Poison)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_subscriber_does_not_break_fanout() {
        let bus = EventBus::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        bus.subscribe("poison", Arc::new(Failing)).await;
        bus.subscribe("poison", counter.clone()).await;

        bus.publish(Envelope::new(Payload::Poison)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn global_subscribers_see_everything() {
        let bus = EventBus::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let id = bus.subscribe_global(counter.clone()).await;

        bus.publish(Envelope::new(Payload::Poison)).await;
        bus.publish(Envelope::new(Payload::BudgetUpdate { amount: 1 }).target("nobody"))
            .await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);

        bus.unsubscribe_global(id).await;
        bus.publish(Envelope::new(Payload::Poison)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }
}
