//! Sandbox capability.
//!
//! A sandbox is an ephemeral, isolated environment that hosts the agent
//! process and the session's working directory. The session actor only needs
//! a few capabilities from it: provision by session id, set environment, run
//! shell commands, start a long-running process and wait for it to become
//! healthy, and open a bidirectional message channel to that process.

mod error;
mod local;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use skiff_protocol::AgentCommand;

pub use error::{SandboxError, SandboxResult};
pub use local::{LocalSandbox, LocalSandboxConfig, LocalSandboxProvider};

/// Result of a shell command run inside the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    /// Exit code, if the command exited normally.
    pub exit_code: Option<i32>,
}

impl ExecOutput {
    /// Short description of a failed command for logs and ledgers.
    pub fn failure_summary(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// A long-running process to start inside the sandbox.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub command: String,
    pub args: Vec<String>,
    /// Maximum time to wait for the process to report readiness.
    pub ready_timeout: Duration,
}

/// Write half of an agent channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AgentSender {
    tx: mpsc::Sender<String>,
}

impl AgentSender {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }

    /// Serialize and send a command to the agent.
    pub async fn send(&self, command: &AgentCommand) -> SandboxResult<()> {
        let line = serde_json::to_string(command)
            .map_err(|e| SandboxError::Connection(format!("encoding command: {e}")))?;
        self.send_raw(line).await
    }

    /// Send an already serialized command line.
    pub async fn send_raw(&self, line: String) -> SandboxResult<()> {
        self.tx
            .send(line)
            .await
            .map_err(|_| SandboxError::Connection("agent channel closed".to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Bidirectional message channel to the agent process.
///
/// `events` yields one JSON value per agent frame and ends when the agent's
/// output closes.
#[derive(Debug)]
pub struct AgentChannel {
    pub sender: AgentSender,
    pub events: mpsc::Receiver<Value>,
}

/// A provisioned sandbox.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Stable identifier (usually derived from the session id).
    fn id(&self) -> &str;

    /// Working directory that is synchronized to durable storage.
    fn workdir(&self) -> &str;

    /// Set environment variables for subsequent commands and processes.
    async fn set_env(&self, vars: HashMap<String, String>) -> SandboxResult<()>;

    /// Run a shell command with a timeout.
    async fn exec(&self, command: &str, timeout: Duration) -> SandboxResult<ExecOutput>;

    /// Start the agent process and wait until it reports healthy.
    async fn start_process(&self, spec: &ProcessSpec) -> SandboxResult<()>;

    /// Open the message channel to the started process.
    async fn open_channel(&self) -> SandboxResult<AgentChannel>;

    /// Stop the agent process. Stopping a stopped sandbox is a no-op.
    async fn stop(&self) -> SandboxResult<()>;
}

/// Creates (or reattaches to) the sandbox for a session.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn provision(&self, session_id: &str) -> SandboxResult<Arc<dyn Sandbox>>;
}
