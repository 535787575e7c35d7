//! Content-addressed cache for oversized tool outputs.
//!
//! When a tool result is too large to keep verbatim in an agent's history,
//! the full content is parked here and the history record carries only the
//! artifact id plus a short preview. Agents read artifacts back in slices via
//! the `read_artifact` tool. Artifacts are immutable and live for the
//! duration of the process; there is no eviction.

use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Size and identity of a stored artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactMetadata {
    pub id: String,
    /// Content length in characters.
    pub size: usize,
}

/// Process-wide artifact map.
pub struct ArtifactStore {
    store: RwLock<HashMap<String, String>>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self {
            store: RwLock::new(HashMap::new()),
        }
    }

    /// Park content and return a fresh opaque id.
    pub async fn store(&self, content: impl Into<String>) -> String {
        let id = Uuid::new_v4().to_string();
        self.store.write().await.insert(id.clone(), content.into());
        id
    }

    /// Read a slice of `length` characters starting at character `start`.
    ///
    /// Returns `None` for unknown ids and `Some("")` when `start` is at or
    /// past the end of the content. Slicing is done on character boundaries
    /// so multi-byte content can never split a code point.
    pub async fn retrieve(&self, artifact_id: &str, start: usize, length: usize) -> Option<String> {
        let store = self.store.read().await;
        let content = store.get(artifact_id)?;
        Some(content.chars().skip(start).take(length).collect())
    }

    /// Size metadata for an artifact, or `None` if the id is unknown.
    pub async fn metadata(&self, artifact_id: &str) -> Option<ArtifactMetadata> {
        let store = self.store.read().await;
        store.get(artifact_id).map(|content| ArtifactMetadata {
            id: artifact_id.to_string(),
            size: content.chars().count(),
        })
    }
}

impl Default for ArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}
