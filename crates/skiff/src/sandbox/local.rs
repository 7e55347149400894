//! Local process sandbox.
//!
//! Each session gets a directory `{base_dir}/{session_id}` with a `workspace/`
//! subdirectory that acts as the sandbox working directory. Shell commands run
//! through `sh -c` inside it, and the agent is a child process speaking
//! newline-delimited JSON on stdin/stdout.
//!
//! This is a development backend: it provides no isolation beyond a separate
//! working directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;

use super::{
    AgentChannel, AgentSender, ExecOutput, ProcessSpec, Sandbox, SandboxError, SandboxProvider,
    SandboxResult,
};

/// Capacity of the agent event channel.
const EVENT_BUFFER_SIZE: usize = 256;

/// Capacity of the agent command channel.
const COMMAND_BUFFER_SIZE: usize = 64;

/// Time allowed for the agent process to exit after kill.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Configuration for the local sandbox provider.
#[derive(Debug, Clone)]
pub struct LocalSandboxConfig {
    /// Directory holding one subdirectory per session.
    pub base_dir: PathBuf,
}

/// Provisions [`LocalSandbox`]es below a base directory.
///
/// The workspace directory always exists after `provision`. A recycled
/// sandbox therefore has an empty workspace, not a missing one.
#[derive(Debug, Clone)]
pub struct LocalSandboxProvider {
    config: LocalSandboxConfig,
}

impl LocalSandboxProvider {
    pub fn new(config: LocalSandboxConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SandboxProvider for LocalSandboxProvider {
    async fn provision(&self, session_id: &str) -> SandboxResult<Arc<dyn Sandbox>> {
        if session_id.is_empty() || session_id.contains(['/', '\\']) || session_id == ".." {
            return Err(SandboxError::Provisioning(format!(
                "invalid session id: {session_id:?}"
            )));
        }

        let root = self.config.base_dir.join(session_id);
        let workdir = root.join("workspace");
        tokio::fs::create_dir_all(&workdir).await.map_err(|e| {
            SandboxError::Provisioning(format!("creating {}: {}", workdir.display(), e))
        })?;

        info!(
            "Provisioned local sandbox for session {} at {}",
            session_id,
            root.display()
        );
        Ok(Arc::new(LocalSandbox::new(session_id, workdir)))
    }
}

/// Stdio of a started agent process that has not been claimed by a channel yet.
struct AgentStdio {
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

/// A sandbox backed by a local directory and child processes.
pub struct LocalSandbox {
    id: String,
    workdir: PathBuf,
    workdir_str: String,
    env: Mutex<HashMap<String, String>>,
    child: tokio::sync::Mutex<Option<Child>>,
    stdio: Mutex<Option<AgentStdio>>,
}

impl LocalSandbox {
    pub fn new(id: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        let workdir = workdir.into();
        let workdir_str = workdir.to_string_lossy().to_string();
        Self {
            id: id.into(),
            workdir,
            workdir_str,
            env: Mutex::new(HashMap::new()),
            child: tokio::sync::Mutex::new(None),
            stdio: Mutex::new(None),
        }
    }

    pub fn workdir_path(&self) -> &Path {
        &self.workdir
    }

    fn env_snapshot(&self) -> HashMap<String, String> {
        self.env
            .lock()
            .map(|env| env.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn workdir(&self) -> &str {
        &self.workdir_str
    }

    async fn set_env(&self, vars: HashMap<String, String>) -> SandboxResult<()> {
        let mut env = self
            .env
            .lock()
            .map_err(|_| SandboxError::Provisioning("environment lock poisoned".to_string()))?;
        env.extend(vars);
        Ok(())
    }

    async fn exec(&self, command: &str, timeout: Duration) -> SandboxResult<ExecOutput> {
        debug!("Sandbox[{}] exec: {}", self.id, command);

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.workdir)
            .envs(self.env_snapshot())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| SandboxError::Exec {
            command: command.to_string(),
            message: e.to_string(),
        })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| SandboxError::Exec {
                command: command.to_string(),
                message: e.to_string(),
            })?,
            Err(_) => {
                return Err(SandboxError::Timeout {
                    operation: "exec",
                    after: timeout,
                });
            }
        };

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            exit_code: output.status.code(),
        })
    }

    async fn start_process(&self, spec: &ProcessSpec) -> SandboxResult<()> {
        let mut child_slot = self.child.lock().await;
        if let Some(child) = child_slot.as_mut()
            && matches!(child.try_wait(), Ok(None))
        {
            debug!("Sandbox[{}] agent already running", self.id);
            return Ok(());
        }

        info!(
            "Sandbox[{}] starting agent: {} {:?}",
            self.id, spec.command, spec.args
        );

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .current_dir(&self.workdir)
            .envs(self.env_snapshot())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            SandboxError::Provisioning(format!("spawning {}: {}", spec.command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Provisioning("agent stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Provisioning("agent stdout unavailable".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let id = self.id.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    if !line.trim().is_empty() {
                        debug!("Agent[{}] stderr: {}", id, line);
                    }
                }
            });
        }

        let mut lines = BufReader::new(stdout).lines();
        let ready = tokio::time::timeout(spec.ready_timeout, wait_for_ready(&mut lines)).await;
        match ready {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(e);
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(SandboxError::Timeout {
                    operation: "agent readiness",
                    after: spec.ready_timeout,
                });
            }
        }

        info!(
            "Sandbox[{}] agent ready (pid={})",
            self.id,
            child.id().unwrap_or(0)
        );

        *child_slot = Some(child);
        let mut stdio = self
            .stdio
            .lock()
            .map_err(|_| SandboxError::Provisioning("stdio lock poisoned".to_string()))?;
        *stdio = Some(AgentStdio {
            stdin,
            stdout: lines,
        });
        Ok(())
    }

    async fn open_channel(&self) -> SandboxResult<AgentChannel> {
        let stdio = self
            .stdio
            .lock()
            .map_err(|_| SandboxError::Connection("stdio lock poisoned".to_string()))?
            .take()
            .ok_or_else(|| SandboxError::Connection("agent process not started".to_string()))?;

        let AgentStdio { mut stdin, stdout } = stdio;
        let (event_tx, event_rx) = mpsc::channel::<Value>(EVENT_BUFFER_SIZE);
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<String>(COMMAND_BUFFER_SIZE);

        let id = self.id.clone();
        tokio::spawn(async move {
            let mut lines = stdout;
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(&line) {
                    Ok(value) => {
                        if event_tx.send(value).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Agent[{}] emitted invalid JSON: {} - line: {}", id, e, line),
                }
            }
            info!("Agent[{}] stdout closed", id);
        });

        let id = self.id.clone();
        tokio::spawn(async move {
            while let Some(line) = cmd_rx.recv().await {
                let written = async {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.flush().await
                }
                .await;
                if let Err(e) = written {
                    warn!("Agent[{}] stdin write failed: {}", id, e);
                    break;
                }
            }
        });

        Ok(AgentChannel {
            sender: AgentSender::new(cmd_tx),
            events: event_rx,
        })
    }

    async fn stop(&self) -> SandboxResult<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        if let Err(e) = child.kill().await {
            debug!("Sandbox[{}] kill failed (already exited?): {}", self.id, e);
        }
        match tokio::time::timeout(KILL_WAIT, child.wait()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Error waiting for agent in sandbox {}: {:?}", self.id, e),
            Err(_) => warn!("Timeout waiting for agent in sandbox {} to exit", self.id),
        }
        info!("Sandbox[{}] agent stopped", self.id);
        Ok(())
    }
}

/// Consume agent output until it reports `{"type":"ready"}`.
async fn wait_for_ready(lines: &mut Lines<BufReader<ChildStdout>>) -> SandboxResult<()> {
    loop {
        let Some(line) = lines.next_line().await? else {
            return Err(SandboxError::Provisioning(
                "agent exited before becoming ready".to_string(),
            ));
        };
        let is_ready = serde_json::from_str::<Value>(&line)
            .ok()
            .and_then(|v| v.get("type").and_then(Value::as_str).map(|t| t == "ready"))
            .unwrap_or(false);
        if is_ready {
            return Ok(());
        }
        debug!("Ignoring pre-ready agent output: {}", line);
    }
}
