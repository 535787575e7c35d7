//! Agents: reasoning state plus the actor work loop.
//!
//! The module splits agent behavior into two layers:
//!
//! - [`AgentMind`] owns what an agent *knows*: system prompt, temperature,
//!   conversation history, and the think step against the chat service. It is
//!   used both by kernel-hosted actors and by the
//!   [`Orchestrator`](crate::crewllm::orchestrator::Orchestrator)'s session
//!   agents, so the history rules (tool-call pairing, archival, compaction)
//!   live in exactly one place.
//! - [`AgentBehavior`] is the [`WorkHandler`](crate::crewllm::actor::WorkHandler)
//!   that reacts to inbox messages and drives the think → act → observe loop,
//!   dispatching tool calls to the bus (chatroom sends), the kernel (system
//!   calls), or the self-contained backends.

use crate::crewllm::actor::{ActorContext, WorkError, WorkHandler};
use crate::crewllm::artifact_store::ArtifactStore;
use crate::crewllm::bus::EventBus;
use crate::crewllm::client::{AssistantReply, ChatClient, ChatRecord, ChatRequest};
use crate::crewllm::message::{Envelope, Payload};
use crate::crewllm::process_registry::ProcessRegistry;
use crate::crewllm::tools::{
    catalog_json, execute_python_run, format_search_results, is_system_tool, SearchClient,
    ToolRole,
};
use async_trait::async_trait;
use std::error::Error;
use std::sync::Arc;

/// History length beyond which a step triggers compaction first.
pub(crate) const HISTORY_SOFT_LIMIT: usize = 20;

/// Tool results longer than this (in characters) are archived.
const ARCHIVE_THRESHOLD: usize = 4000;

/// Preview length carried in an archived record.
const ARCHIVE_PREVIEW: usize = 200;

/// Shared backend bundle handed to every agent.
#[derive(Clone)]
pub struct AgentDeps {
    pub client: Arc<dyn ChatClient>,
    pub artifacts: Arc<ArtifactStore>,
    pub processes: Arc<ProcessRegistry>,
    pub search: Arc<SearchClient>,
}

/// An agent's reasoning state: prompt, temperature, and history.
pub struct AgentMind {
    name: String,
    temperature: f32,
    role: ToolRole,
    history: Vec<ChatRecord>,
    pub(crate) client: Arc<dyn ChatClient>,
    artifacts: Arc<ArtifactStore>,
    pub(crate) bus: Option<Arc<EventBus>>,
}

impl AgentMind {
    /// Create a mind seeded with its system prompt at history index 0.
    pub fn new(
        name: impl Into<String>,
        system_prompt: impl Into<String>,
        temperature: f32,
        role: ToolRole,
        client: Arc<dyn ChatClient>,
        artifacts: Arc<ArtifactStore>,
        bus: Option<Arc<EventBus>>,
    ) -> Self {
        Self {
            name: name.into(),
            temperature,
            role,
            history: vec![ChatRecord::system(system_prompt)],
            client,
            artifacts,
            bus,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn set_temperature(&mut self, temperature: f32) {
        self.temperature = temperature;
    }

    pub fn role(&self) -> ToolRole {
        self.role
    }

    /// The full conversation history. Index 0 is always the system prompt.
    pub fn history(&self) -> &[ChatRecord] {
        &self.history
    }

    pub(crate) fn history_mut(&mut self) -> &mut Vec<ChatRecord> {
        &mut self.history
    }

    /// Append a user-role record.
    pub fn add_user(&mut self, content: impl Into<String>) {
        self.history.push(ChatRecord::user(content));
    }

    /// Append a system-role record (mailbox framing, policy notices).
    pub fn add_system(&mut self, content: impl Into<String>) {
        self.history.push(ChatRecord::system(content));
    }

    /// Append the assistant record for a reply exactly as returned.
    ///
    /// Public so scripted step runners can maintain the history invariant
    /// the same way [`step`](AgentMind::step) does.
    pub fn push_assistant(&mut self, reply: &AssistantReply) {
        self.history.push(ChatRecord::assistant(reply));
    }

    /// Restore persisted user/assistant turns (multi-turn continuity).
    pub fn restore_turn(&mut self, role_is_user: bool, content: impl Into<String>) {
        let content = content.into();
        if content.trim().is_empty() {
            return;
        }
        if role_is_user {
            self.history.push(ChatRecord::user(content));
        } else {
            self.history.push(ChatRecord::assistant(&AssistantReply::text(content)));
        }
    }

    /// Append a tool record answering `tool_call_id`, archiving oversized
    /// content in the artifact store first.
    pub async fn add_tool_result(
        &mut self,
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) {
        let mut content = content.into();
        if content.chars().count() > ARCHIVE_THRESHOLD {
            let preview: String = content.chars().take(ARCHIVE_PREVIEW).collect();
            let artifact_id = self.artifacts.store(content).await;
            log::info!(
                "[{}] stored large tool output as artifact {}",
                self.name,
                artifact_id
            );
            if let Some(bus) = &self.bus {
                bus.publish(
                    Envelope::new(Payload::ArtifactCreated {
                        artifact_id: artifact_id.clone(),
                        preview: preview.clone(),
                    })
                    .from(self.name.clone()),
                )
                .await;
            }
            content = format!(
                "[Large Output Stored. Artifact ID: {}. Use `read_artifact` to view.]\nPreview:\n{}...",
                artifact_id, preview
            );
        }
        self.history
            .push(ChatRecord::tool(tool_call_id, tool_name, content));
    }

    /// One reasoning step: compact if the history is long, call the chat
    /// service with the full history (plus optional ephemeral system
    /// context), store the assistant record, and return the reply.
    pub async fn step(
        &mut self,
        extra_system_context: Option<&str>,
        allowed_tools: Option<&[&str]>,
    ) -> Result<AssistantReply, Box<dyn Error + Send + Sync>> {
        if self.history.len() > HISTORY_SOFT_LIMIT {
            self.compact_memory().await;
        }

        let mut request_messages = self.history.clone();
        if let Some(context) = extra_system_context {
            request_messages.push(ChatRecord::system(context));
        }
        let tools = catalog_json(self.role, allowed_tools);

        let reply = self
            .client
            .complete(
                ChatRequest::new(&request_messages, self.temperature).with_tools(&tools),
            )
            .await?;

        self.history.push(ChatRecord::assistant(&reply));
        if let Some(text) = &reply.content {
            let preview: String = text.chars().take(100).collect();
            log::info!("[{}] says: {}...", self.name, preview);
        }
        Ok(reply)
    }
}

/// What the step loop should do after one tool dispatch.
enum ToolFlow {
    /// Result recorded; keep executing the current reply's remaining tools
    /// and loop again.
    Continue,
    /// Progress now depends on an inbound message (teammate reply or system
    /// call result); leave the loop.
    Stop,
}

/// The actor work handler wrapping an [`AgentMind`].
pub struct AgentBehavior {
    mind: AgentMind,
    deps: AgentDeps,
}

impl AgentBehavior {
    pub fn new(
        name: impl Into<String>,
        system_prompt: impl Into<String>,
        temperature: f32,
        role: ToolRole,
        deps: AgentDeps,
        bus: Arc<EventBus>,
    ) -> Self {
        let mind = AgentMind::new(
            name,
            system_prompt,
            temperature,
            role,
            Arc::clone(&deps.client),
            Arc::clone(&deps.artifacts),
            Some(bus),
        );
        Self { mind, deps }
    }

    pub fn mind(&self) -> &AgentMind {
        &self.mind
    }

    /// Think → act → observe until the reply has no tool calls, or a tool
    /// hands control to another actor.
    async fn run_step_loop(
        &mut self,
        ctx: &ActorContext,
        initial_sender: Option<String>,
        correlation_id: Option<String>,
    ) {
        loop {
            if ctx.budget() <= 0 {
                log::warn!("[{}] stopping step loop: budget exhausted", ctx.name);
                let supervisor = ctx.supervisor.clone();
                ctx.send(
                    &supervisor,
                    Payload::BudgetExhausted {
                        content: "I have run out of budget. Please allocate more.".into(),
                    },
                    correlation_id.clone(),
                )
                .await;
                if let Some(sender) = &initial_sender {
                    ctx.send(
                        sender,
                        Payload::WorkFailed {
                            error: "BudgetExhausted".into(),
                        },
                        correlation_id.clone(),
                    )
                    .await;
                }
                return;
            }

            ctx.consume_budget();
            log::info!("[{}] thinking (budget remaining: {})", ctx.name, ctx.budget());

            let reply = match self.mind.step(None, None).await {
                Ok(reply) => reply,
                Err(e) => {
                    log::error!("[{}] step failed: {}", ctx.name, e);
                    if let Some(sender) = &initial_sender {
                        ctx.send(
                            sender,
                            Payload::WorkFailed {
                                error: e.to_string(),
                            },
                            correlation_id.clone(),
                        )
                        .await;
                    }
                    return;
                }
            };

            if let (Some(text), Some(sender)) = (&reply.content, &initial_sender) {
                ctx.send(
                    sender,
                    Payload::WorkCompleted {
                        content: text.clone(),
                    },
                    correlation_id.clone(),
                )
                .await;
            }

            if reply.tool_calls.is_empty() {
                return;
            }

            log::info!("[{}] executing {} tool(s)", ctx.name, reply.tool_calls.len());
            for tool_call in &reply.tool_calls {
                let flow = self
                    .dispatch_tool(
                        ctx,
                        &tool_call.id,
                        &tool_call.name,
                        &tool_call.arguments,
                        correlation_id.clone(),
                    )
                    .await;
                if let ToolFlow::Stop = flow {
                    return;
                }
            }
        }
    }

    async fn dispatch_tool(
        &mut self,
        ctx: &ActorContext,
        tool_call_id: &str,
        tool_name: &str,
        raw_arguments: &str,
        correlation_id: Option<String>,
    ) -> ToolFlow {
        let args: serde_json::Value = match serde_json::from_str(raw_arguments) {
            Ok(value) => value,
            Err(_) => {
                self.mind
                    .add_tool_result(tool_call_id, tool_name, "Error: Invalid JSON.")
                    .await;
                return ToolFlow::Continue;
            }
        };

        // Let kernel monitors (loop detector) see the call before it runs.
        ctx.bus
            .publish(
                Envelope::new(Payload::ToolUse {
                    tool: tool_name.to_string(),
                    args: args.clone(),
                    tool_call_id: tool_call_id.to_string(),
                })
                .from(ctx.name.clone())
                .correlation_opt(correlation_id.clone()),
            )
            .await;

        if tool_name == "chatroom_send" {
            let message = args["message"].as_str().unwrap_or_default().to_string();
            let recipients: Vec<String> = match &args["to"] {
                serde_json::Value::String(one) => vec![one.clone()],
                serde_json::Value::Array(many) => many
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect(),
                _ => Vec::new(),
            };
            let mut seen = Vec::new();
            for recipient in recipients {
                if seen.contains(&recipient) {
                    continue;
                }
                ctx.send(
                    &recipient,
                    Payload::WorkSubmitted {
                        content: message.clone(),
                    },
                    correlation_id.clone(),
                )
                .await;
                seen.push(recipient);
            }
            self.mind
                .add_tool_result(
                    tool_call_id,
                    tool_name,
                    format!("Message sent to {}. Waiting for reply...", seen.join(", ")),
                )
                .await;
            return ToolFlow::Stop;
        }

        if is_system_tool(tool_name) {
            ctx.bus
                .publish(
                    Envelope::new(Payload::SystemCall {
                        command: tool_name.to_string(),
                        args,
                        tool_call_id: tool_call_id.to_string(),
                        sender: ctx.name.clone(),
                    })
                    .from(ctx.name.clone())
                    .correlation_opt(correlation_id),
                )
                .await;
            // Resumes when the matching system_call_result arrives.
            return ToolFlow::Stop;
        }

        let result = match tool_name {
            "web_search" => {
                let query = args["query"].as_str().unwrap_or_default();
                let num_results = args["num_results"].as_u64().unwrap_or(10) as usize;
                match self.deps.search.search(query, num_results).await {
                    Ok(results) => format_search_results(&results),
                    Err(e) => format!("Error performing search: {}", e),
                }
            }
            "python_run" => {
                let code = args["code"].as_str().unwrap_or_default();
                if code.trim().is_empty() {
                    "Error: code must be a non-empty string.".to_string()
                } else {
                    execute_python_run(code).await
                }
            }
            "read_artifact" => {
                let artifact_id = args["artifact_id"].as_str().unwrap_or_default();
                let start = args["start"].as_u64().unwrap_or(0) as usize;
                let length = args["length"].as_u64().unwrap_or(4000) as usize;
                match self.deps.artifacts.retrieve(artifact_id, start, length).await {
                    Some(slice) => slice,
                    None => format!("Error: Unknown artifact id {}", artifact_id),
                }
            }
            "start_process" => {
                let command = args["command"].as_str().unwrap_or_default();
                match self.deps.processes.start(command).await {
                    Ok(pid) => format!("Started process with pid {}", pid),
                    Err(e) => format!("Error: {}", e),
                }
            }
            "read_process_logs" => {
                let pid = args["pid"].as_u64().unwrap_or(0) as u32;
                let lines = args["lines"].as_u64().unwrap_or(20) as usize;
                match self.deps.processes.read_logs(pid, lines).await {
                    Ok(logs) => logs,
                    Err(e) => format!("Error: {}", e),
                }
            }
            "stop_process" => {
                let pid = args["pid"].as_u64().unwrap_or(0) as u32;
                match self.deps.processes.stop(pid).await {
                    Ok(message) => message,
                    Err(e) => format!("Error: {}", e),
                }
            }
            // Titles belong to the session layer; acknowledge so the loop
            // can proceed.
            "set_conversation_title" => "Title noted.".to_string(),
            other => format!("Error: Unknown tool {}", other),
        };

        self.mind
            .add_tool_result(tool_call_id, tool_name, result)
            .await;
        ToolFlow::Continue
    }
}

#[async_trait]
impl WorkHandler for AgentBehavior {
    async fn on_work(&mut self, ctx: &ActorContext, msg: Envelope) -> Result<(), WorkError> {
        let correlation_id = msg.correlation_id.clone();
        match msg.payload {
            Payload::WorkSubmitted { content } => {
                let sender = msg.from.clone();
                match &sender {
                    Some(from) => self
                        .mind
                        .add_user(format!("[Message from {}]: {}", from, content)),
                    None => self.mind.add_user(content),
                }
                self.run_step_loop(ctx, sender, correlation_id).await;
            }
            Payload::WorkCompleted { content } => {
                let from = msg.from.as_deref().unwrap_or("unknown");
                self.mind
                    .add_user(format!("[Result from {}]: {}", from, content));
                self.run_step_loop(ctx, None, correlation_id).await;
            }
            Payload::SystemCallResult {
                content,
                tool_call_id,
            } => {
                self.mind
                    .add_tool_result(tool_call_id, "system", content)
                    .await;
                self.run_step_loop(ctx, None, correlation_id).await;
            }
            other => {
                log::debug!("[{}] ignoring {}", ctx.name, other.kind());
            }
        }
        Ok(())
    }

    async fn on_interrupt(&mut self, ctx: &ActorContext, reason: Option<&str>) {
        log::info!(
            "Actor '{}' interrupted{}",
            ctx.name,
            reason.map(|r| format!(": {}", r)).unwrap_or_default()
        );
        if let Some(reason) = reason {
            // Make the interruption visible to the next think step.
            self.mind.add_system(format!("[Interrupted]: {}", reason));
        }
    }
}
