mod common;

use async_trait::async_trait;
use common::ScriptedClient;
use crewllm::agent::AgentMind;
use crewllm::artifact_store::ArtifactStore;
use crewllm::bus::{EventBus, Subscriber};
use crewllm::client::{AssistantReply, ChatRole};
use crewllm::message::{Envelope, Payload};
use crewllm::tools::ToolRole;
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct ArtifactEventCounter(AtomicUsize);

#[async_trait]
impl Subscriber for ArtifactEventCounter {
    async fn on_event(&self, _event: &Envelope) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn mind_with(client: Arc<ScriptedClient>, artifacts: Arc<ArtifactStore>, bus: Option<Arc<EventBus>>) -> AgentMind {
    AgentMind::new(
        "Archivist",
        "You archive.",
        0.5,
        ToolRole::Collaborator,
        client,
        artifacts,
        bus,
    )
}

#[tokio::test]
async fn oversized_tool_results_are_archived() {
    let bus = Arc::new(EventBus::new());
    let counter = Arc::new(ArtifactEventCounter(AtomicUsize::new(0)));
    bus.subscribe("artifact_created", counter.clone()).await;

    let artifacts = Arc::new(ArtifactStore::new());
    let mut mind = mind_with(ScriptedClient::empty(), Arc::clone(&artifacts), Some(bus));

    let large = "A".repeat(5000);
    mind.add_tool_result("call_1", "dummy_tool", large.clone()).await;

    let record = mind.history().last().unwrap();
    let content = record.content.as_deref().unwrap();
    assert!(content.contains("[Large Output Stored"));
    assert!(content.len() < 1000, "archived record must stay small");
    assert_eq!(record.tool_call_id.as_deref(), Some("call_1"));

    // The artifact id embedded in the record resolves to the full content.
    let artifact_id = content
        .split("Artifact ID: ")
        .nth(1)
        .and_then(|rest| rest.split('.').next())
        .unwrap();
    let stored = artifacts.retrieve(artifact_id, 0, 5000).await.unwrap();
    assert_eq!(stored, large);

    assert_eq!(counter.0.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn small_tool_results_are_kept_verbatim() {
    let artifacts = Arc::new(ArtifactStore::new());
    let mut mind = mind_with(ScriptedClient::empty(), artifacts, None);

    mind.add_tool_result("call_1", "dummy_tool", "short output").await;
    let record = mind.history().last().unwrap();
    assert_eq!(record.content.as_deref(), Some("short output"));
}

#[tokio::test]
async fn long_histories_are_compacted_before_thinking() {
    // First completion answers the compaction request, second the step.
    let client = ScriptedClient::new(vec![
        AssistantReply::text("{\"summary\": \"key facts\", \"reflection\": \"the plan\"}"),
        AssistantReply::text("onward"),
    ]);
    let mut mind = mind_with(client.clone(), Arc::new(ArtifactStore::new()), None);
    for i in 0..25 {
        mind.add_user(format!("Msg {}", i));
    }

    let reply = mind.step(None, None).await.unwrap();
    assert_eq!(reply.content.as_deref(), Some("onward"));
    assert_eq!(client.call_count(), 2);

    let history = mind.history();
    // System prompt survives in place.
    assert_eq!(history[0].role, ChatRole::System);
    assert_eq!(history[0].content.as_deref(), Some("You archive."));
    assert!(history[1]
        .content
        .as_deref()
        .unwrap()
        .contains("PREVIOUS CONTEXT"));
    assert!(history[2]
        .content
        .as_deref()
        .unwrap()
        .contains("REFLECTION"));
    // 3 synthetic heads + 5-record tail + the fresh assistant reply.
    assert_eq!(history.len(), 9);
}

#[tokio::test]
async fn failed_compaction_leaves_history_untouched() {
    let client = ScriptedClient::new(vec![
        AssistantReply::text("this is not json"),
        AssistantReply::text("still fine"),
    ]);
    let mut mind = mind_with(client, Arc::new(ArtifactStore::new()), None);
    for i in 0..25 {
        mind.add_user(format!("Msg {}", i));
    }

    let reply = mind.step(None, None).await.unwrap();
    assert_eq!(reply.content.as_deref(), Some("still fine"));

    // 1 system + 25 user + 1 assistant: nothing was dropped.
    assert_eq!(mind.history().len(), 27);
    assert_eq!(mind.history()[0].role, ChatRole::System);
}

#[tokio::test]
async fn short_histories_are_not_compacted() {
    let client = ScriptedClient::new(vec![AssistantReply::text("quick")]);
    let mut mind = mind_with(client.clone(), Arc::new(ArtifactStore::new()), None);
    mind.add_user("hello");

    mind.step(None, None).await.unwrap();
    // Only the step itself reached the service.
    assert_eq!(client.call_count(), 1);
    assert_eq!(mind.history().len(), 3);
}
