// src/lib.rs

// Import the top-level `crewllm` module.
pub mod crewllm;

// Re-export the module tree at the crate root so paths like
// `crewllm::bus::EventBus` work without the extra hierarchy level.
pub use crate::crewllm::{
    actor, agent, artifact_store, bus, client, config, event_logger, history, kernel, memory,
    message, orchestrator, process_registry, prompts, shadow, tools,
};
#[cfg(feature = "server")]
pub use crate::crewllm::server;

// Direct access to the workhorse types.
pub use crate::crewllm::agent::{AgentDeps, AgentMind};
pub use crate::crewllm::bus::EventBus;
pub use crate::crewllm::kernel::Kernel;
pub use crate::crewllm::message::{Envelope, Payload};
pub use crate::crewllm::orchestrator::Orchestrator;
