//! Bus message envelope.
//!
//! Every message that crosses the [`EventBus`](crate::crewllm::bus::EventBus)
//! is an [`Envelope`]: a discriminated [`Payload`] plus the routing fields
//! shared by all message kinds (origin, optional target, correlation id,
//! timestamp). Envelopes are immutable once published; the event logger
//! serializes them verbatim as JSON lines, so the serde shape *is* the wire
//! shape.
//!
//! # Example
//!
//! ```rust
//! use crewllm::message::{Envelope, Payload};
//!
//! let msg = Envelope::new(Payload::WorkSubmitted {
//!     content: "Summarize the report".into(),
//! })
//! .from("Grok")
//! .target("Harper")
//! .correlation("req-42");
//!
//! assert_eq!(msg.payload.kind(), "work_submitted");
//! assert_eq!(msg.target.as_deref(), Some("Harper"));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The per-kind body of a bus message.
///
/// One variant per message type; the serde tag (`"type"`) doubles as the
/// topic name used for [`EventBus::subscribe`](crate::crewllm::bus::EventBus::subscribe).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// A unit of work (a user utterance or a teammate request) for the target.
    WorkSubmitted { content: String },
    /// A result produced for an earlier `WorkSubmitted`.
    WorkCompleted { content: String },
    /// The target could not perform the requested work.
    WorkFailed { error: String },
    /// Control signal: invoke the interrupt hook, then keep processing.
    Interrupt {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Control signal: stop the actor loop cleanly.
    Poison,
    /// Control signal: adjust the target's budget by `amount` (signed).
    BudgetUpdate { amount: i64 },
    /// An actor hit zero budget while work was pending; routed to the supervisor.
    BudgetExhausted { content: String },
    /// An agent is about to execute a tool; consumed by kernel monitors.
    ToolUse {
        tool: String,
        args: serde_json::Value,
        tool_call_id: String,
    },
    /// A privileged operation delegated to the kernel.
    SystemCall {
        command: String,
        args: serde_json::Value,
        tool_call_id: String,
        sender: String,
    },
    /// The kernel's answer to a `SystemCall`, keyed by the same tool-call id.
    SystemCallResult {
        content: String,
        tool_call_id: String,
    },
    /// A large tool output was archived in the artifact store.
    ArtifactCreated {
        artifact_id: String,
        preview: String,
    },
    /// An agent compacted its history.
    MemoryCompacted { summary: String },
    /// The kernel created and started a new agent.
    AgentSpawned { system_prompt: String },
    /// The kernel stopped an agent.
    AgentStopped { reason: String },
    /// An actor task ended with an uncaught failure.
    ActorCrashed { error: String },
    /// A shadow observer's commentary on a completed piece of work.
    ShadowCritique { content: String },
}

impl Payload {
    /// The wire discriminator for this payload, identical to the serde tag.
    ///
    /// Used as the topic name for pub/sub routing.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::WorkSubmitted { .. } => "work_submitted",
            Payload::WorkCompleted { .. } => "work_completed",
            Payload::WorkFailed { .. } => "work_failed",
            Payload::Interrupt { .. } => "interrupt",
            Payload::Poison => "poison",
            Payload::BudgetUpdate { .. } => "budget_update",
            Payload::BudgetExhausted { .. } => "budget_exhausted",
            Payload::ToolUse { .. } => "tool_use",
            Payload::SystemCall { .. } => "system_call",
            Payload::SystemCallResult { .. } => "system_call_result",
            Payload::ArtifactCreated { .. } => "artifact_created",
            Payload::MemoryCompacted { .. } => "memory_compacted",
            Payload::AgentSpawned { .. } => "agent_spawned",
            Payload::AgentStopped { .. } => "agent_stopped",
            Payload::ActorCrashed { .. } => "actor_crashed",
            Payload::ShadowCritique { .. } => "shadow_critique",
        }
    }
}

/// A routed bus message: payload plus the fields every kind shares.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub payload: Payload,

    /// Name of the actor (or subsystem) that published the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    /// Destination actor for direct inbox delivery. `None` for pure
    /// broadcast messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Request/cause chain id, propagated from the original caller submission
    /// across every descendant message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// UTC timestamp. Injected by the event logger if the publisher left it
    /// unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Envelope {
    /// Wrap a payload with no routing information.
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            from: None,
            target: None,
            correlation_id: None,
            timestamp: None,
        }
    }

    /// Set the origin actor name (builder pattern).
    pub fn from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Set the destination actor name (builder pattern).
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Set the correlation id (builder pattern).
    pub fn correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Carry over an optional correlation id from an inbound message.
    pub fn correlation_opt(mut self, id: Option<String>) -> Self {
        self.correlation_id = id;
        self
    }
}
