mod common;

use async_trait::async_trait;
use common::{make_deps, ScriptedClient};
use crewllm::actor::{Actor, ActorContext, WorkError, WorkHandler};
use crewllm::bus::EventBus;
use crewllm::event_logger::EventLogger;
use crewllm::kernel::Kernel;
use crewllm::message::{Envelope, Payload};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct InterruptCounter {
    loop_interrupts: Arc<AtomicUsize>,
}

#[async_trait]
impl WorkHandler for InterruptCounter {
    async fn on_work(&mut self, _ctx: &ActorContext, _msg: Envelope) -> Result<(), WorkError> {
        Ok(())
    }

    async fn on_interrupt(&mut self, _ctx: &ActorContext, reason: Option<&str>) {
        if reason.map(|r| r.contains("Loop Detected")).unwrap_or(false) {
            self.loop_interrupts.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn tool_use(actor: &str) -> Envelope {
    Envelope::new(Payload::ToolUse {
        tool: "web_search".into(),
        args: serde_json::json!({"query": "foo"}),
        tool_call_id: "1".into(),
    })
    .from(actor)
}

async fn wait_for_count(counter: &Arc<AtomicUsize>, expected: usize) {
    for _ in 0..100 {
        if counter.load(Ordering::SeqCst) == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "interrupt count stuck at {}, expected {}",
        counter.load(Ordering::SeqCst),
        expected
    );
}

#[tokio::test]
async fn three_identical_signatures_interrupt_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(EventBus::new());
    let kernel = Kernel::new(
        Arc::clone(&bus),
        make_deps(ScriptedClient::empty()),
        Arc::new(EventLogger::new(dir.path().join("session.jsonl"))),
        "Grok",
    );
    kernel.start().await;

    let loop_interrupts = Arc::new(AtomicUsize::new(0));
    let (actor, _handle) = Actor::new(
        "Looper",
        Arc::clone(&bus),
        "Grok",
        10,
        InterruptCounter {
            loop_interrupts: Arc::clone(&loop_interrupts),
        },
    )
    .await
    .unwrap();
    tokio::spawn(actor.run());

    bus.publish(tool_use("Looper")).await;
    bus.publish(tool_use("Looper")).await;
    assert_eq!(loop_interrupts.load(Ordering::SeqCst), 0);

    bus.publish(tool_use("Looper")).await;
    wait_for_count(&loop_interrupts, 1).await;

    // The signature window was cleared, so the loop has to fully reform.
    assert_eq!(kernel.tool_history_len("Looper").await, 0);
    bus.publish(tool_use("Looper")).await;
    bus.publish(tool_use("Looper")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(loop_interrupts.load(Ordering::SeqCst), 1);

    bus.publish(tool_use("Looper")).await;
    wait_for_count(&loop_interrupts, 2).await;
}

#[tokio::test]
async fn different_arguments_do_not_trip_the_detector() {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(EventBus::new());
    let kernel = Kernel::new(
        Arc::clone(&bus),
        make_deps(ScriptedClient::empty()),
        Arc::new(EventLogger::new(dir.path().join("session.jsonl"))),
        "Grok",
    );
    kernel.start().await;

    let loop_interrupts = Arc::new(AtomicUsize::new(0));
    let (actor, _handle) = Actor::new(
        "Curious",
        Arc::clone(&bus),
        "Grok",
        10,
        InterruptCounter {
            loop_interrupts: Arc::clone(&loop_interrupts),
        },
    )
    .await
    .unwrap();
    tokio::spawn(actor.run());

    for i in 0..5 {
        bus.publish(
            Envelope::new(Payload::ToolUse {
                tool: "web_search".into(),
                args: serde_json::json!({"query": format!("topic {}", i)}),
                tool_call_id: format!("call_{}", i),
            })
            .from("Curious"),
        )
        .await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(loop_interrupts.load(Ordering::SeqCst), 0);
    assert_eq!(kernel.tool_history_len("Curious").await, 5);
}

#[tokio::test]
async fn argument_key_order_does_not_defeat_the_signature() {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(EventBus::new());
    let kernel = Kernel::new(
        Arc::clone(&bus),
        make_deps(ScriptedClient::empty()),
        Arc::new(EventLogger::new(dir.path().join("session.jsonl"))),
        "Grok",
    );
    kernel.start().await;

    let loop_interrupts = Arc::new(AtomicUsize::new(0));
    let (actor, _handle) = Actor::new(
        "Shuffler",
        Arc::clone(&bus),
        "Grok",
        10,
        InterruptCounter {
            loop_interrupts: Arc::clone(&loop_interrupts),
        },
    )
    .await
    .unwrap();
    tokio::spawn(actor.run());

    let variants = [
        serde_json::json!({"query": "foo", "num_results": 10}),
        serde_json::json!({"num_results": 10, "query": "foo"}),
        serde_json::json!({"query": "foo", "num_results": 10}),
    ];
    for (i, args) in variants.iter().enumerate() {
        bus.publish(
            Envelope::new(Payload::ToolUse {
                tool: "web_search".into(),
                args: args.clone(),
                tool_call_id: format!("call_{}", i),
            })
            .from("Shuffler"),
        )
        .await;
    }
    wait_for_count(&loop_interrupts, 1).await;
    assert_eq!(kernel.tool_history_len("Shuffler").await, 0);
}
