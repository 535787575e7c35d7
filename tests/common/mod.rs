//! Shared scripted fakes for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use crewllm::agent::{AgentDeps, AgentMind};
use crewllm::artifact_store::ArtifactStore;
use crewllm::client::{AssistantReply, ChatClient, ChatRequest, ToolCallRequest};
use crewllm::config::Settings;
use crewllm::orchestrator::StepRunner;
use crewllm::process_registry::ProcessRegistry;
use crewllm::tools::SearchClient;
use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Chat client that replays a fixed list of replies, then falls back to a
/// plain "ok" text reply. Counts completions so tests can assert the service
/// was (or was not) consulted.
pub struct ScriptedClient {
    replies: Mutex<VecDeque<AssistantReply>>,
    pub calls: AtomicUsize,
}

impl ScriptedClient {
    pub fn new(replies: Vec<AssistantReply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn empty() -> Arc<Self> {
        Self::new(Vec::new())
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatClient for ScriptedClient {
    async fn complete(
        &self,
        _request: ChatRequest<'_>,
    ) -> Result<AssistantReply, Box<dyn Error + Send + Sync>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut replies = self.replies.lock().await;
        Ok(replies.pop_front().unwrap_or_else(|| AssistantReply::text("ok")))
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// Backend bundle over a scripted client; the search endpoint points at a
/// closed port so an accidental search fails fast.
pub fn make_deps(client: Arc<dyn ChatClient>) -> AgentDeps {
    AgentDeps {
        client,
        artifacts: Arc::new(ArtifactStore::new()),
        processes: Arc::new(ProcessRegistry::new()),
        search: Arc::new(SearchClient::new("http://127.0.0.1:1")),
    }
}

/// The default test roster: Grok leading Harper, Benjamin, and Lucas.
pub fn test_settings() -> Settings {
    Settings {
        api_key: String::new(),
        base_url: "http://127.0.0.1:1".into(),
        model: "scripted".into(),
        search_url: "http://127.0.0.1:1".into(),
        leader_name: "Grok".into(),
        collaborator_names: vec!["Harper".into(), "Benjamin".into(), "Lucas".into()],
    }
}

/// Step runner with an independent reply script per agent name.
///
/// Unscripted steps fall back to a "noop" text reply for collaborators and
/// "no scripted response" for anyone whose script ran dry, mirroring how a
/// quiet teammate behaves.
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<String, VecDeque<AssistantReply>>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
        }
    }

    pub fn script(self, agent: &str, replies: Vec<AssistantReply>) -> Self {
        {
            let mut scripts = self.scripts.try_lock().expect("builder is single-threaded");
            scripts.insert(agent.to_string(), replies.into());
        }
        self
    }
}

#[async_trait]
impl StepRunner for ScriptedRunner {
    async fn run_step(
        &self,
        mind: &mut AgentMind,
        _extra_system_context: Option<&str>,
        _allowed_tools: Option<&[&str]>,
    ) -> Result<AssistantReply, Box<dyn Error + Send + Sync>> {
        let reply = {
            let mut scripts = self.scripts.lock().await;
            scripts
                .get_mut(mind.name())
                .and_then(|queue| queue.pop_front())
        };
        let reply = reply.unwrap_or_else(|| AssistantReply::text("noop"));
        mind.push_assistant(&reply);
        Ok(reply)
    }
}

/// Build a tool-call descriptor with JSON arguments.
pub fn call(id: &str, name: &str, args: serde_json::Value) -> ToolCallRequest {
    ToolCallRequest {
        id: id.to_string(),
        name: name.to_string(),
        arguments: args.to_string(),
    }
}

/// Assemble a reply with optional text plus tool calls.
pub fn reply(content: Option<&str>, calls: Vec<ToolCallRequest>) -> AssistantReply {
    AssistantReply {
        content: content.map(String::from),
        tool_calls: calls,
    }
}
