mod common;

use common::{make_deps, ScriptedClient};
use crewllm::bus::EventBus;
use crewllm::event_logger::EventLogger;
use crewllm::kernel::Kernel;
use crewllm::message::{Envelope, Payload};
use std::sync::Arc;

#[tokio::test]
async fn agents_respawn_from_logged_spawn_calls() {
    let dir = tempfile::tempdir().unwrap();
    let logger = Arc::new(EventLogger::new(dir.path().join("session.jsonl")));

    // A previous session's spawn call sits in the archive.
    logger
        .log_event(
            &Envelope::new(Payload::SystemCall {
                command: "spawn_agent".into(),
                args: serde_json::json!({
                    "name": "Phoenix",
                    "system_prompt": "Rise",
                    "temperature": 0.8
                }),
                tool_call_id: "call_0".into(),
                sender: "Grok".into(),
            })
            .from("Grok"),
        )
        .await
        .unwrap();
    // Reasoning traffic in the log must not affect recovery.
    logger
        .log_event(&Envelope::new(Payload::WorkSubmitted {
            content: "irrelevant".into(),
        }))
        .await
        .unwrap();

    let bus = Arc::new(EventBus::new());
    let kernel = Kernel::new(
        Arc::clone(&bus),
        make_deps(ScriptedClient::empty()),
        Arc::clone(&logger),
        "Grok",
    );
    kernel.start().await;

    let respawned = kernel.recover_session().await.unwrap();
    assert_eq!(respawned, 1);
    assert_eq!(kernel.list_agents().await, vec!["Phoenix"]);
    // Respawn goes through the normal spawn path, defaults included.
    assert_eq!(kernel.agent_budget("Phoenix").await, Some(10));

    // Replaying again is a no-op: the agent already exists.
    let respawned_again = kernel.recover_session().await.unwrap();
    assert_eq!(respawned_again, 0);
}

#[tokio::test]
async fn recovery_with_an_empty_log_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let logger = Arc::new(EventLogger::new(dir.path().join("missing.jsonl")));
    let bus = Arc::new(EventBus::new());
    let kernel = Kernel::new(
        Arc::clone(&bus),
        make_deps(ScriptedClient::empty()),
        logger,
        "Grok",
    );
    kernel.start().await;

    assert_eq!(kernel.recover_session().await.unwrap(), 0);
    assert!(kernel.list_agents().await.is_empty());
}
