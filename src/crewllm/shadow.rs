//! Shadow observers.
//!
//! A shadow observer watches the bus without participating in the main
//! conversation flow. The [`CriticObserver`] reviews every completed piece of
//! work and publishes a `shadow_critique` message; with no chat client
//! attached it emits a canned acknowledgement, which is enough for tests and
//! for wiring custom critics.

use crate::crewllm::bus::{EventBus, Subscriber};
use crate::crewllm::client::{ChatClient, ChatRecord, ChatRequest};
use crate::crewllm::message::{Envelope, Payload};
use async_trait::async_trait;
use std::error::Error;
use std::sync::Arc;

/// Bus observer that critiques `work_completed` events.
pub struct CriticObserver {
    name: String,
    bus: Arc<EventBus>,
    client: Option<Arc<dyn ChatClient>>,
}

impl CriticObserver {
    pub fn new(name: impl Into<String>, bus: Arc<EventBus>) -> Self {
        Self {
            name: name.into(),
            bus,
            client: None,
        }
    }

    /// Attach a chat client so critiques are generated rather than canned
    /// (builder pattern).
    pub fn with_client(mut self, client: Arc<dyn ChatClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Subscribe this critic to the `work_completed` topic.
    pub async fn attach(self) -> Arc<CriticObserver> {
        let observer = Arc::new(self);
        observer
            .bus
            .subscribe("work_completed", Arc::clone(&observer) as Arc<dyn Subscriber>)
            .await;
        observer
    }

    async fn critique(&self, sender: &str, content: &str) -> String {
        if let Some(client) = &self.client {
            let messages = vec![
                ChatRecord::system(
                    "You are a terse quality critic. One or two sentences, concrete.",
                ),
                ChatRecord::user(format!(
                    "Critique this deliverable from {}:\n{}",
                    sender, content
                )),
            ];
            match client.complete(ChatRequest::new(&messages, 0.2)).await {
                Ok(reply) => {
                    if let Some(text) = reply.content {
                        return text;
                    }
                }
                Err(e) => log::warn!("[{}] critique generation failed: {}", self.name, e),
            }
        }
        format!("Critique of {}: Valid response.", sender)
    }
}

#[async_trait]
impl Subscriber for CriticObserver {
    async fn on_event(&self, event: &Envelope) -> Result<(), Box<dyn Error + Send + Sync>> {
        if let Payload::WorkCompleted { content } = &event.payload {
            let sender = event.from.as_deref().unwrap_or("unknown");
            if sender == self.name || content.is_empty() {
                return Ok(());
            }
            let critique = self.critique(sender, content).await;
            log::info!("[{}] critique for {}: {}", self.name, sender, critique);
            self.bus
                .publish(
                    Envelope::new(Payload::ShadowCritique { content: critique })
                        .from(self.name.clone())
                        .correlation_opt(event.correlation_id.clone()),
                )
                .await;
        }
        Ok(())
    }
}
