use async_trait::async_trait;
use crewllm::bus::{EventBus, Subscriber};
use crewllm::message::{Envelope, Payload};
use crewllm::shadow::CriticObserver;
use std::error::Error;
use std::sync::Arc;
use tokio::sync::Mutex;

struct CritiqueCollector(Mutex<Vec<Envelope>>);

#[async_trait]
impl Subscriber for CritiqueCollector {
    async fn on_event(&self, event: &Envelope) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.0.lock().await.push(event.clone());
        Ok(())
    }
}

#[tokio::test]
async fn completed_work_draws_a_critique() {
    let bus = Arc::new(EventBus::new());
    let collector = Arc::new(CritiqueCollector(Mutex::new(Vec::new())));
    bus.subscribe("shadow_critique", collector.clone()).await;

    CriticObserver::new("Shadow", Arc::clone(&bus)).attach().await;

    bus.publish(
        Envelope::new(Payload::WorkCompleted {
            content: "the answer is 42".into(),
        })
        .from("Harper")
        .correlation("c-7"),
    )
    .await;

    let critiques = collector.0.lock().await;
    assert_eq!(critiques.len(), 1);
    match &critiques[0].payload {
        Payload::ShadowCritique { content } => {
            assert!(content.contains("Critique of Harper"));
        }
        other => panic!("unexpected payload: {:?}", other),
    }
    assert_eq!(critiques[0].from.as_deref(), Some("Shadow"));
    assert_eq!(critiques[0].correlation_id.as_deref(), Some("c-7"));
}

#[tokio::test]
async fn critic_ignores_its_own_output_and_empty_work() {
    let bus = Arc::new(EventBus::new());
    let collector = Arc::new(CritiqueCollector(Mutex::new(Vec::new())));
    bus.subscribe("shadow_critique", collector.clone()).await;

    CriticObserver::new("Shadow", Arc::clone(&bus)).attach().await;

    bus.publish(
        Envelope::new(Payload::WorkCompleted {
            content: "self congratulation".into(),
        })
        .from("Shadow"),
    )
    .await;
    bus.publish(
        Envelope::new(Payload::WorkCompleted {
            content: String::new(),
        })
        .from("Harper"),
    )
    .await;

    assert!(collector.0.lock().await.is_empty());
}
