//! Memory compaction.
//!
//! When an agent's history grows long, everything between the system prompt
//! and a "safe tail" of recent records is summarized into two synthetic
//! system records — a factual summary and a plan/reflection — produced by a
//! JSON-mode call to the chat service. The split point is chosen so that no
//! assistant tool-call descriptor is ever separated from its tool records.
//! The swap is atomic: a failed summarization leaves the history untouched.

use crate::crewllm::agent::AgentMind;
use crate::crewllm::client::{ChatRecord, ChatRequest, ChatRole};
use crate::crewllm::message::{Envelope, Payload};

/// Below this many records, compaction is skipped entirely.
const COMPACT_MIN_HISTORY: usize = 15;

/// Minimum number of trailing records preserved verbatim.
const COMPACT_MIN_TAIL: usize = 5;

/// Find a split index that keeps at least the `min_tail` most recent records
/// while never separating an assistant descriptor from its tool records.
///
/// Index 0 (the system prompt) is always part of the preserved head, so the
/// returned index is at least 1.
pub fn safe_tail_index(history: &[ChatRecord], min_tail: usize) -> usize {
    if history.len() <= min_tail + 1 {
        return 1;
    }

    let mut split = history.len().saturating_sub(min_tail).max(1);
    while split < history.len() {
        let record = &history[split];
        if record.role == ChatRole::Tool {
            split += 1;
            continue;
        }
        let prev = &history[split - 1];
        if prev.role == ChatRole::Assistant && !prev.tool_calls.is_empty() {
            split += 1;
            continue;
        }
        break;
    }
    split.min(history.len())
}

#[derive(serde::Deserialize)]
struct CompactionResult {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    reflection: String,
}

impl AgentMind {
    /// Compress the history prefix into summary + reflection records.
    ///
    /// Failures are logged and swallowed — a missed compaction only costs
    /// context length, while a corrupted history would break the session.
    pub async fn compact_memory(&mut self) {
        if self.history().len() < COMPACT_MIN_HISTORY {
            return;
        }

        log::info!("[{}] compacting memory...", self.name());
        let split = safe_tail_index(self.history(), COMPACT_MIN_TAIL);
        let to_compress = &self.history()[1..split];
        if to_compress.is_empty() {
            return;
        }

        let text_to_compress = match serde_json::to_string_pretty(to_compress) {
            Ok(text) => text,
            Err(e) => {
                log::error!("[{}] compaction serialization failed: {}", self.name(), e);
                return;
            }
        };

        let request_messages = vec![
            ChatRecord::system("You are a memory manager."),
            ChatRecord::user(format!(
                "History:\n{}\n\nAnalyze the above conversation history.\n\
                 1. Summarize the key facts and decisions derived so far.\n\
                 2. REFLECTION: What is the current plan? What is finished? What is next?\n\
                 Output JSON: {{\"summary\": \"...\", \"reflection\": \"...\"}}",
                text_to_compress
            )),
        ];

        let client = std::sync::Arc::clone(&self.client);
        let reply = match client
            .complete(
                ChatRequest::new(&request_messages, 0.0)
                    .with_response_format(serde_json::json!({"type": "json_object"})),
            )
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                log::error!("[{}] memory compaction failed: {}", self.name(), e);
                return;
            }
        };

        let parsed: CompactionResult = match reply.content.as_deref() {
            Some(text) => match serde_json::from_str(text) {
                Ok(parsed) => parsed,
                Err(e) => {
                    log::error!(
                        "[{}] compaction result was not valid JSON: {}",
                        self.name(),
                        e
                    );
                    return;
                }
            },
            None => {
                log::error!("[{}] compaction produced no content", self.name());
                return;
            }
        };

        // Build the replacement fully before swapping.
        let mut new_history = Vec::with_capacity(self.history().len() - split + 3);
        new_history.push(self.history()[0].clone());
        new_history.push(ChatRecord::system(format!(
            "PREVIOUS CONTEXT (Summarized):\n{}",
            parsed.summary
        )));
        new_history.push(ChatRecord::system(format!(
            "REFLECTION (Current Plan):\n{}",
            parsed.reflection
        )));
        new_history.extend_from_slice(&self.history()[split..]);
        *self.history_mut() = new_history;

        log::info!(
            "[{}] memory compacted, history size now {}",
            self.name(),
            self.history().len()
        );

        let summary_preview: String = parsed.summary.chars().take(100).collect();
        if let Some(bus) = &self.bus {
            bus.publish(
                Envelope::new(Payload::MemoryCompacted {
                    summary: summary_preview,
                })
                .from(self.name().to_string()),
            )
            .await;
        }
    }
}
