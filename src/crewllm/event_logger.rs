//! Append-only JSON-lines event archive.
//!
//! A global bus subscriber writes every published [`Envelope`] here, one JSON
//! object per line, injecting a UTC timestamp when the publisher left it
//! unset. The kernel replays the archive to re-create the actor table after a
//! restart (structural recovery); reasoning history is never replayed.

use crate::crewllm::message::Envelope;
use chrono::Utc;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// JSON-lines archive of every bus message.
pub struct EventLogger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl EventLogger {
    /// Create a logger writing to `path`. Parent directories are created on
    /// the first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event, stamping it with the current UTC time if it carries
    /// none.
    pub async fn log_event(&self, event: &Envelope) -> io::Result<()> {
        let mut stamped = event.clone();
        if stamped.timestamp.is_none() {
            stamped.timestamp = Some(Utc::now());
        }
        let line = serde_json::to_string(&stamped)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }

    /// Read every archived event in append order.
    ///
    /// Undecodable lines are logged and skipped so one corrupt line cannot
    /// poison recovery.
    pub fn read_all(&self) -> io::Result<Vec<Envelope>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let mut events = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Envelope>(line) {
                Ok(event) => events.push(event),
                Err(e) => log::error!("EventLogger: failed to decode event line: {}", e),
            }
        }
        Ok(events)
    }

    /// Delete the archive (used for tests and new sessions).
    pub fn clear(&self) -> io::Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}
