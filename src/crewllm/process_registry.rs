//! Long-running child-process table.
//!
//! Agents can start background processes (`start_process`), tail their output
//! (`read_process_logs`), and terminate them (`stop_process`). Each entry
//! captures stdout and stderr line by line into a bounded ring buffer via
//! detached reader tasks, so a chatty child cannot grow memory without bound.

use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// Maximum buffered lines per process.
const LOG_RING_CAPACITY: usize = 200;

/// Errors raised by registry operations.
#[derive(Debug)]
pub enum ProcessError {
    UnknownPid(u32),
    Spawn(String),
    Io(String),
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessError::UnknownPid(pid) => write!(f, "no process with pid {}", pid),
            ProcessError::Spawn(e) => write!(f, "failed to spawn process: {}", e),
            ProcessError::Io(e) => write!(f, "process io error: {}", e),
        }
    }
}

impl Error for ProcessError {}

struct ProcessEntry {
    command: String,
    child: Child,
    logs: Arc<Mutex<VecDeque<String>>>,
    exit_code: Option<i32>,
}

/// Table of child processes keyed by pid.
pub struct ProcessRegistry {
    entries: Mutex<HashMap<u32, ProcessEntry>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Start `command` under `sh -c`, wiring stdout and stderr into the log
    /// ring. Returns the child's pid.
    pub async fn start(&self, command: &str) -> Result<u32, ProcessError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ProcessError::Spawn(e.to_string()))?;

        let pid = child
            .id()
            .ok_or_else(|| ProcessError::Spawn("child exited before pid was read".into()))?;

        let logs = Arc::new(Mutex::new(VecDeque::new()));
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_lines(stdout, Arc::clone(&logs)));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_lines(stderr, Arc::clone(&logs)));
        }

        log::info!("ProcessRegistry: started pid {} ({})", pid, command);
        self.entries.lock().await.insert(
            pid,
            ProcessEntry {
                command: command.to_string(),
                child,
                logs,
                exit_code: None,
            },
        );
        Ok(pid)
    }

    /// Return the last `lines` buffered output lines for `pid`.
    ///
    /// Also records the exit code if the child has terminated in the
    /// meantime.
    pub async fn read_logs(&self, pid: u32, lines: usize) -> Result<String, ProcessError> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(&pid).ok_or(ProcessError::UnknownPid(pid))?;

        if entry.exit_code.is_none() {
            if let Ok(Some(status)) = entry.child.try_wait() {
                entry.exit_code = status.code();
            }
        }

        let logs = entry.logs.lock().await;
        let tail: Vec<String> = logs
            .iter()
            .rev()
            .take(lines)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();

        let mut output = format!("[pid {}] {}\n", pid, entry.command);
        if let Some(code) = entry.exit_code {
            output.push_str(&format!("[exited with code {}]\n", code));
        }
        if tail.is_empty() {
            output.push_str("<no output yet>");
        } else {
            output.push_str(&tail.join("\n"));
        }
        Ok(output)
    }

    /// Kill the child, await its exit, and drop the table entry.
    pub async fn stop(&self, pid: u32) -> Result<String, ProcessError> {
        let mut entry = self
            .entries
            .lock()
            .await
            .remove(&pid)
            .ok_or(ProcessError::UnknownPid(pid))?;

        entry
            .child
            .kill()
            .await
            .map_err(|e| ProcessError::Io(e.to_string()))?;
        let status = entry
            .child
            .wait()
            .await
            .map_err(|e| ProcessError::Io(e.to_string()))?;
        log::info!("ProcessRegistry: stopped pid {} ({:?})", pid, status.code());
        Ok(format!("Process {} stopped", pid))
    }

    /// Pids currently tracked.
    pub async fn pids(&self) -> Vec<u32> {
        self.entries.lock().await.keys().copied().collect()
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_lines<R>(reader: R, logs: Arc<Mutex<VecDeque<String>>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut logs = logs.lock().await;
        if logs.len() >= LOG_RING_CAPACITY {
            logs.pop_front();
        }
        logs.push_back(line);
    }
}
