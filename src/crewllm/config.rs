//! Process-wide configuration.
//!
//! Settings are read once from the environment into the [`SETTINGS`] global.
//! Everything has a usable default so tests and local runs work without any
//! environment at all; no config-file parsing dependencies are introduced.

use lazy_static::lazy_static;
use std::env;

/// Default leader name.
pub const LEADER_NAME: &str = "Grok";

/// Default collaborator roster.
pub const COLLABORATOR_NAMES: [&str; 3] = ["Harper", "Benjamin", "Lucas"];

/// Runtime settings, sourced from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// API key for the chat-completion service (`CREWLLM_API_KEY`).
    pub api_key: String,
    /// Base URL of the chat-completion service (`CREWLLM_BASE_URL`).
    pub base_url: String,
    /// Model identifier (`CREWLLM_MODEL`).
    pub model: String,
    /// Base URL of the SearXNG-style search endpoint (`CREWLLM_SEARCH_URL`).
    pub search_url: String,
    /// Leader agent name (`CREWLLM_LEADER`).
    pub leader_name: String,
    /// Collaborator names (`CREWLLM_COLLABORATORS`, comma separated).
    pub collaborator_names: Vec<String>,
}

impl Settings {
    /// Read settings from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let api_key = env::var("CREWLLM_API_KEY").unwrap_or_default();
        if api_key.is_empty() {
            log::warn!("CREWLLM_API_KEY is not set; chat-service calls will be rejected upstream");
        }
        let collaborator_names = env::var("CREWLLM_COLLABORATORS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .ok()
            .filter(|names| !names.is_empty())
            .unwrap_or_else(|| COLLABORATOR_NAMES.iter().map(|s| s.to_string()).collect());

        Self {
            api_key,
            base_url: env::var("CREWLLM_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            model: env::var("CREWLLM_MODEL").unwrap_or_else(|_| "gpt-4o".to_string()),
            search_url: env::var("CREWLLM_SEARCH_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
            leader_name: env::var("CREWLLM_LEADER").unwrap_or_else(|_| LEADER_NAME.to_string()),
            collaborator_names,
        }
    }

    /// The full roster, leader first.
    pub fn all_agent_names(&self) -> Vec<String> {
        let mut names = vec![self.leader_name.clone()];
        names.extend(self.collaborator_names.iter().cloned());
        names
    }
}

lazy_static! {
    /// Settings snapshot taken at first access.
    pub static ref SETTINGS: Settings = Settings::from_env();
}

/// Install the process-wide logger from `RUST_LOG`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env().try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roster_has_leader_first() {
        let settings = Settings {
            api_key: String::new(),
            base_url: "http://x".into(),
            model: "m".into(),
            search_url: "http://s".into(),
            leader_name: "Grok".into(),
            collaborator_names: vec!["Harper".into(), "Benjamin".into()],
        };
        assert_eq!(settings.all_agent_names(), vec!["Grok", "Harper", "Benjamin"]);
    }
}
