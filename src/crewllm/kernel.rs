//! The kernel: actor table, supervision, and system concerns.
//!
//! The [`Kernel`] owns the bus and the table of running actors. It:
//!
//! - spawns one cooperative task per actor and watches each task's exit
//!   (zombie reaping — an uncaught failure becomes an `actor_crashed`
//!   publication routed to the supervisor);
//! - answers `system_call` messages (spawn/kill/list/allocate), replying with
//!   one `system_call_result` keyed by the caller's tool-call id;
//! - watches `tool_use` events for loops (three identical tool signatures in
//!   a row earns the offender an interrupt);
//! - mirrors every bus message into the append-only event log, and can
//!   replay the log's `spawn_agent` calls to re-create the actor table
//!   (structural recovery — reasoning history is not replayed).

use crate::crewllm::actor::{Actor, ActorHandle, WorkError};
use crate::crewllm::agent::{AgentBehavior, AgentDeps};
use crate::crewllm::bus::{BusError, EventBus, Subscriber};
use crate::crewllm::event_logger::EventLogger;
use crate::crewllm::message::{Envelope, Payload};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Work credits granted to a spawned agent unless the caller overrides.
const DEFAULT_START_BUDGET: i64 = 10;

/// Tool signatures remembered per actor for loop detection.
const TOOL_HISTORY_WINDOW: usize = 10;

/// Identical consecutive signatures that trigger an interrupt.
const LOOP_THRESHOLD: usize = 3;

/// Errors raised by kernel operations.
#[derive(Debug)]
pub enum KernelError {
    NameCollision(String),
    UnknownAgent(String),
    Bus(BusError),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::NameCollision(name) => write!(f, "agent '{}' already exists", name),
            KernelError::UnknownAgent(name) => write!(f, "agent '{}' not found", name),
            KernelError::Bus(e) => write!(f, "{}", e),
        }
    }
}

impl Error for KernelError {}

impl From<BusError> for KernelError {
    fn from(e: BusError) -> Self {
        KernelError::Bus(e)
    }
}

struct ActorEntry {
    handle: ActorHandle,
    abort: tokio::task::AbortHandle,
}

#[derive(Default)]
struct KernelState {
    actors: HashMap<String, ActorEntry>,
    tool_history: HashMap<String, VecDeque<(String, String)>>,
}

/// The process-wide actor supervisor.
pub struct Kernel {
    bus: Arc<EventBus>,
    deps: AgentDeps,
    event_logger: Arc<EventLogger>,
    /// Actor that receives crash and budget-exhaustion notifications.
    supervisor: String,
    state: Mutex<KernelState>,
    /// Handed to bus subscribers and reaper tasks so they never keep a dead
    /// kernel alive.
    weak_self: Weak<Kernel>,
}

impl Kernel {
    pub fn new(
        bus: Arc<EventBus>,
        deps: AgentDeps,
        event_logger: Arc<EventLogger>,
        supervisor: impl Into<String>,
    ) -> Arc<Self> {
        let supervisor = supervisor.into();
        Arc::new_cyclic(|weak| Self {
            bus,
            deps,
            event_logger,
            supervisor,
            state: Mutex::new(KernelState::default()),
            weak_self: weak.clone(),
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Subscribe the kernel's system concerns to the bus.
    ///
    /// Call once before spawning agents.
    pub async fn start(&self) {
        log::info!("Kernel starting");
        self.bus
            .subscribe(
                "system_call",
                Arc::new(SystemCallHandler(self.weak_self.clone())),
            )
            .await;
        self.bus
            .subscribe("tool_use", Arc::new(LoopDetector(self.weak_self.clone())))
            .await;
        self.bus
            .subscribe_global(Arc::new(GlobalLogHandler(self.weak_self.clone())))
            .await;
    }

    /// Create, register, and start an agent actor.
    pub async fn spawn_agent(
        &self,
        name: &str,
        system_prompt: &str,
        temperature: f32,
        start_budget: Option<i64>,
    ) -> Result<(), KernelError> {
        {
            let state = self.state.lock().await;
            if state.actors.contains_key(name) {
                return Err(KernelError::NameCollision(name.to_string()));
            }
        }

        let role = if name == self.supervisor {
            crate::crewllm::tools::ToolRole::Leader
        } else {
            crate::crewllm::tools::ToolRole::Collaborator
        };
        let behavior = AgentBehavior::new(
            name,
            system_prompt,
            temperature,
            role,
            self.deps.clone(),
            Arc::clone(&self.bus),
        );
        let (actor, handle) = Actor::new(
            name,
            Arc::clone(&self.bus),
            self.supervisor.clone(),
            start_budget.unwrap_or(DEFAULT_START_BUDGET),
            behavior,
        )
        .await?;

        let task = tokio::spawn(actor.run());
        let abort = task.abort_handle();
        // Table entry first, then the reaper: a task that dies instantly must
        // still find its own entry to remove.
        self.state
            .lock()
            .await
            .actors
            .insert(name.to_string(), ActorEntry { handle, abort });
        self.spawn_reaper(name.to_string(), task);

        self.bus
            .publish(
                Envelope::new(Payload::AgentSpawned {
                    system_prompt: system_prompt.to_string(),
                })
                .from("Kernel"),
            )
            .await;
        log::info!("Kernel spawned actor '{}'", name);
        Ok(())
    }

    fn spawn_reaper(&self, name: String, task: JoinHandle<Result<(), WorkError>>) {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            let result = task.await;
            let kernel = match weak.upgrade() {
                Some(kernel) => kernel,
                None => return,
            };
            kernel.reap(&name, result).await;
        });
    }

    /// Zombie reaper: observe one actor's task completion.
    async fn reap(
        &self,
        name: &str,
        result: Result<Result<(), WorkError>, tokio::task::JoinError>,
    ) {
        match result {
            Ok(Ok(())) => log::info!("Actor '{}' exited normally", name),
            Ok(Err(e)) => {
                log::error!("Reaper: actor '{}' crashed: {}", name, e);
                self.bus
                    .publish(
                        Envelope::new(Payload::ActorCrashed {
                            error: e.to_string(),
                        })
                        .from(name)
                        .target(self.supervisor.clone()),
                    )
                    .await;
            }
            Err(join_error) => {
                if join_error.is_cancelled() {
                    log::info!("Actor '{}' was cancelled", name);
                } else {
                    log::error!("Reaper: actor '{}' panicked: {}", name, join_error);
                    self.bus
                        .publish(
                            Envelope::new(Payload::ActorCrashed {
                                error: join_error.to_string(),
                            })
                            .from(name)
                            .target(self.supervisor.clone()),
                        )
                        .await;
                }
            }
        }
        self.state.lock().await.actors.remove(name);
        self.bus.deregister(name).await;
    }

    /// Cancel an agent's task and publish `agent_stopped`.
    pub async fn kill_agent(&self, name: &str) -> Result<(), KernelError> {
        let entry = self
            .state
            .lock()
            .await
            .actors
            .remove(name)
            .ok_or_else(|| KernelError::UnknownAgent(name.to_string()))?;
        entry.abort.abort();
        self.bus.deregister(name).await;
        self.bus
            .publish(
                Envelope::new(Payload::AgentStopped {
                    reason: "Killed by user/system".into(),
                })
                .from("Kernel")
                .target(self.supervisor.clone()),
            )
            .await;
        Ok(())
    }

    /// Deliver an interrupt signal straight to an actor's inbox.
    pub async fn interrupt_agent(&self, name: &str, reason: &str) -> Result<(), KernelError> {
        let state = self.state.lock().await;
        let entry = state
            .actors
            .get(name)
            .ok_or_else(|| KernelError::UnknownAgent(name.to_string()))?;
        entry.handle.push(Envelope::new(Payload::Interrupt {
            reason: Some(reason.to_string()),
        }));
        Ok(())
    }

    /// Names of all live actors.
    pub async fn list_agents(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state.actors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Current budget of a live actor, if any.
    pub async fn agent_budget(&self, name: &str) -> Option<i64> {
        let state = self.state.lock().await;
        state.actors.get(name).map(|entry| entry.handle.budget())
    }

    /// Queue a budget update onto an actor's inbox.
    pub async fn allocate_budget(&self, name: &str, amount: i64) -> Result<(), KernelError> {
        let state = self.state.lock().await;
        let entry = state
            .actors
            .get(name)
            .ok_or_else(|| KernelError::UnknownAgent(name.to_string()))?;
        entry
            .handle
            .push(Envelope::new(Payload::BudgetUpdate { amount }));
        Ok(())
    }

    /// Poison every actor and clear the table.
    pub async fn stop(&self) {
        log::info!("Kernel stopping");
        let mut state = self.state.lock().await;
        for entry in state.actors.values() {
            entry.handle.push(Envelope::new(Payload::Poison));
        }
        state.actors.clear();
    }

    /// The window of remembered tool signatures for one actor (test hook).
    pub async fn tool_history_len(&self, name: &str) -> usize {
        let state = self.state.lock().await;
        state.tool_history.get(name).map(|h| h.len()).unwrap_or(0)
    }

    async fn handle_system_call(
        &self,
        command: &str,
        args: &serde_json::Value,
        tool_call_id: &str,
        sender: &str,
        correlation_id: Option<String>,
    ) {
        log::info!("Kernel handling system call '{}' from {}", command, sender);
        let result = match command {
            "spawn_agent" => {
                let name = args["name"].as_str().unwrap_or_default();
                let prompt = args["system_prompt"].as_str().unwrap_or_default();
                let temperature = args["temperature"].as_f64().unwrap_or(0.7) as f32;
                let budget = args["budget"].as_i64();
                if name.is_empty() {
                    "Error: spawn_agent requires a name".to_string()
                } else {
                    match self.spawn_agent(name, prompt, temperature, budget).await {
                        Ok(()) => "Spawned".to_string(),
                        Err(e) => format!("Error: {}", e),
                    }
                }
            }
            "kill_agent" => {
                let name = args["name"].as_str().unwrap_or_default();
                match self.kill_agent(name).await {
                    Ok(()) => "Killed".to_string(),
                    Err(e) => format!("Error: {}", e),
                }
            }
            "list_agents" => {
                serde_json::to_string(&self.list_agents().await).unwrap_or_else(|_| "[]".into())
            }
            "allocate_budget" => {
                let name = args["agent_name"].as_str().unwrap_or_default();
                let amount = args["amount"].as_i64().unwrap_or(0);
                match self.allocate_budget(name, amount).await {
                    Ok(()) => format!("Allocated {} budget to {}", amount, name),
                    Err(e) => format!("Error: {}", e),
                }
            }
            other => format!("Unknown command: {}", other),
        };

        self.bus
            .publish(
                Envelope::new(Payload::SystemCallResult {
                    content: result,
                    tool_call_id: tool_call_id.to_string(),
                })
                .from("Kernel")
                .target(sender)
                .correlation_opt(correlation_id),
            )
            .await;
    }

    async fn observe_tool_use(&self, actor: &str, tool: &str, args: &serde_json::Value) {
        let signature = (tool.to_string(), canonical_json(args));
        let looping = {
            let mut state = self.state.lock().await;
            let history = state
                .tool_history
                .entry(actor.to_string())
                .or_insert_with(VecDeque::new);
            history.push_back(signature);
            if history.len() > TOOL_HISTORY_WINDOW {
                history.pop_front();
            }
            let len = history.len();
            let looping = len >= LOOP_THRESHOLD
                && history
                    .iter()
                    .skip(len - LOOP_THRESHOLD)
                    .all(|sig| *sig == history[len - 1]);
            if looping {
                // A loop must fully reform before the detector fires again.
                history.clear();
            }
            looping
        };

        if looping {
            log::warn!(
                "Loop detected for {}: {} called {} times with identical arguments",
                actor,
                tool,
                LOOP_THRESHOLD
            );
            let reason = format!(
                "Loop Detected: You are repeating {} with the same arguments. Stop.",
                tool
            );
            // Routed through the bus so any registered actor can be
            // interrupted, not only kernel-spawned ones.
            self.bus
                .publish(
                    Envelope::new(Payload::Interrupt {
                        reason: Some(reason),
                    })
                    .from("Kernel")
                    .target(actor),
                )
                .await;
        }
    }

    /// Re-create the actor table by replaying `spawn_agent` system calls
    /// from the event log. Returns the number of agents respawned.
    pub async fn recover_session(&self) -> Result<usize, KernelError> {
        log::info!("Recovering session from event log");
        let events = match self.event_logger.read_all() {
            Ok(events) => events,
            Err(e) => {
                log::error!("recovery: could not read event log: {}", e);
                return Ok(0);
            }
        };

        let mut spawned = 0;
        for event in events {
            if let Payload::SystemCall { command, args, .. } = &event.payload {
                if command != "spawn_agent" {
                    continue;
                }
                let name = args["name"].as_str().unwrap_or_default();
                if name.is_empty() || self.state.lock().await.actors.contains_key(name) {
                    continue;
                }
                let prompt = args["system_prompt"].as_str().unwrap_or_default();
                let temperature = args["temperature"].as_f64().unwrap_or(0.7) as f32;
                if self
                    .spawn_agent(name, prompt, temperature, args["budget"].as_i64())
                    .await
                    .is_ok()
                {
                    spawned += 1;
                }
            }
        }
        log::info!("Session recovery respawned {} agent(s)", spawned);
        Ok(spawned)
    }
}

/// Canonical JSON rendering with recursively sorted object keys, so argument
/// order never affects a tool signature.
fn canonical_json(value: &serde_json::Value) -> String {
    fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut out = serde_json::Map::new();
                for key in keys {
                    out.insert(key.clone(), canonicalize(&map[key]));
                }
                serde_json::Value::Object(out)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(canonicalize).collect())
            }
            other => other.clone(),
        }
    }
    canonicalize(value).to_string()
}

struct SystemCallHandler(Weak<Kernel>);

#[async_trait]
impl Subscriber for SystemCallHandler {
    async fn on_event(&self, event: &Envelope) -> Result<(), Box<dyn Error + Send + Sync>> {
        if let Payload::SystemCall {
            command,
            args,
            tool_call_id,
            sender,
        } = &event.payload
        {
            if let Some(kernel) = self.0.upgrade() {
                kernel
                    .handle_system_call(
                        command,
                        args,
                        tool_call_id,
                        sender,
                        event.correlation_id.clone(),
                    )
                    .await;
            }
        }
        Ok(())
    }
}

struct LoopDetector(Weak<Kernel>);

#[async_trait]
impl Subscriber for LoopDetector {
    async fn on_event(&self, event: &Envelope) -> Result<(), Box<dyn Error + Send + Sync>> {
        if let Payload::ToolUse { tool, args, .. } = &event.payload {
            if let (Some(kernel), Some(actor)) = (self.0.upgrade(), event.from.as_deref()) {
                kernel.observe_tool_use(actor, tool, args).await;
            }
        }
        Ok(())
    }
}

struct GlobalLogHandler(Weak<Kernel>);

#[async_trait]
impl Subscriber for GlobalLogHandler {
    async fn on_event(&self, event: &Envelope) -> Result<(), Box<dyn Error + Send + Sync>> {
        if let Some(kernel) = self.0.upgrade() {
            kernel.event_logger.log_event(event).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let a = serde_json::json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = serde_json::json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }
}
