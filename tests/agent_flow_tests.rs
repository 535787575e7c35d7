mod common;

use async_trait::async_trait;
use common::{call, make_deps, reply, ScriptedClient};
use crewllm::bus::{EventBus, Subscriber};
use crewllm::client::AssistantReply;
use crewllm::event_logger::EventLogger;
use crewllm::kernel::Kernel;
use crewllm::message::{Envelope, Payload};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

struct BusRecorder(Mutex<Vec<Envelope>>);

#[async_trait]
impl Subscriber for BusRecorder {
    async fn on_event(&self, event: &Envelope) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.0.lock().await.push(event.clone());
        Ok(())
    }
}

impl BusRecorder {
    async fn find(&self, kind: &str) -> Vec<Envelope> {
        self.0
            .lock()
            .await
            .iter()
            .filter(|event| event.payload.kind() == kind)
            .cloned()
            .collect()
    }
}

async fn wait_for_kind(recorder: &Arc<BusRecorder>, kind: &str) -> Envelope {
    for _ in 0..200 {
        let hits = recorder.find(kind).await;
        if let Some(hit) = hits.into_iter().next() {
            return hit;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("never saw a {} event", kind);
}

#[tokio::test]
async fn chatroom_send_routes_work_between_kernel_agents() {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(EventBus::new());
    // One shared script drives both agents, in deterministic order:
    // Alice thinks (sends to Bob), Bob thinks (replies with text),
    // Alice reacts to the result (final text).
    let client = ScriptedClient::new(vec![
        reply(
            None,
            vec![call(
                "call_1",
                "chatroom_send",
                serde_json::json!({"to": "Bob", "message": "what do you see?"}),
            )],
        ),
        AssistantReply::text("all clear on my side"),
        AssistantReply::text("noted"),
    ]);
    let kernel = Kernel::new(
        Arc::clone(&bus),
        make_deps(client),
        Arc::new(EventLogger::new(dir.path().join("session.jsonl"))),
        "Grok",
    );
    kernel.start().await;

    let recorder = Arc::new(BusRecorder(Mutex::new(Vec::new())));
    bus.subscribe_global(recorder.clone()).await;

    kernel.spawn_agent("Alice", "You lead.", 0.6, None).await.unwrap();
    kernel.spawn_agent("Bob", "You scout.", 0.7, None).await.unwrap();

    bus.publish(
        Envelope::new(Payload::WorkSubmitted {
            content: "check the perimeter".into(),
        })
        .from("Grok")
        .target("Alice")
        .correlation("req-1"),
    )
    .await;

    // Alice's tool call is announced to kernel monitors.
    let tool_use = wait_for_kind(&recorder, "tool_use").await;
    assert_eq!(tool_use.from.as_deref(), Some("Alice"));
    assert_eq!(tool_use.correlation_id.as_deref(), Some("req-1"));

    // Bob answers Alice, correlation intact.
    let completed = wait_for_kind(&recorder, "work_completed").await;
    assert_eq!(completed.from.as_deref(), Some("Bob"));
    assert_eq!(completed.target.as_deref(), Some("Alice"));
    assert_eq!(completed.correlation_id.as_deref(), Some("req-1"));

    // Bob's inbox saw exactly one delegated submission.
    let submissions = recorder.find("work_submitted").await;
    let to_bob: Vec<&Envelope> = submissions
        .iter()
        .filter(|event| event.target.as_deref() == Some("Bob"))
        .collect();
    assert_eq!(to_bob.len(), 1);
    match &to_bob[0].payload {
        Payload::WorkSubmitted { content } => assert_eq!(content, "what do you see?"),
        other => panic!("unexpected payload: {:?}", other),
    }
}

#[tokio::test]
async fn agents_spawn_teammates_through_system_calls() {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(EventBus::new());
    let client = ScriptedClient::new(vec![
        reply(
            None,
            vec![call(
                "call_1",
                "spawn_agent",
                serde_json::json!({
                    "name": "Helper",
                    "system_prompt": "You help.",
                    "temperature": 0.4
                }),
            )],
        ),
        // Resumed after the system-call result arrives.
        AssistantReply::text("helper is up"),
    ]);
    let kernel = Kernel::new(
        Arc::clone(&bus),
        make_deps(client),
        Arc::new(EventLogger::new(dir.path().join("session.jsonl"))),
        "Grok",
    );
    kernel.start().await;

    let recorder = Arc::new(BusRecorder(Mutex::new(Vec::new())));
    bus.subscribe_global(recorder.clone()).await;

    kernel.spawn_agent("Grok", "You lead.", 0.6, None).await.unwrap();

    bus.publish(
        Envelope::new(Payload::WorkSubmitted {
            content: "spin up a helper".into(),
        })
        .target("Grok"),
    )
    .await;

    let result = wait_for_kind(&recorder, "system_call_result").await;
    assert_eq!(result.target.as_deref(), Some("Grok"));
    match &result.payload {
        Payload::SystemCallResult {
            content,
            tool_call_id,
        } => {
            assert_eq!(content, "Spawned");
            assert_eq!(tool_call_id, "call_1");
        }
        other => panic!("unexpected payload: {:?}", other),
    }

    for _ in 0..100 {
        if kernel.list_agents().await.contains(&"Helper".to_string()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Helper never joined the actor table");
}
