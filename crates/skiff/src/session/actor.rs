//! Per-session actor.
//!
//! The actor task owns all live state of one session and processes three
//! inputs in a single `select!` loop: commands from handles (browser traffic,
//! status queries), events from the agent channel, and the supervisor's
//! shutdown token. An actor with neither a browser nor a sandbox evicts
//! itself after the configured idle timeout; durable state survives it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use skiff_protocol::{
    AgentCommand, AgentEvent, BrowserEvent, ClientCommand, ConnectionStatus, MessageMetadata,
    MessageRole, MessageType, ServerEvent, TokenUsage,
};

use super::error::{SessionError, SessionResult};
use super::handle::{SessionCommand, SessionHandle, SessionStatus};
use super::interactions::{InteractionKind, PendingInteraction, PendingInteractions};
use super::{CONTINUE_CONTENT, SessionServices};
use crate::buffer::PendingMessageBuffer;
use crate::persistence::PersistenceQueue;
use crate::sandbox::{AgentChannel, AgentSender, Sandbox};
use crate::state::SessionState;
use crate::storage::CopyFromStatus;
use crate::sync::{RecoveryLedger, RecoveryStatus, SandboxSyncTarget, SyncManager};

/// Command channel capacity.
const CHANNEL_CAPACITY: usize = 64;

struct BrowserConnection {
    id: u64,
    tx: mpsc::Sender<BrowserEvent>,
}

struct SandboxConnection {
    sandbox: Arc<dyn Sandbox>,
    sender: AgentSender,
    sync: SyncManager,
}

/// Parameters of the last `start`, reused for automatic reconnects.
#[derive(Debug, Clone)]
struct StartParams {
    system_prompt: Option<String>,
    task_id: Option<String>,
    project_id: Option<String>,
}

impl StartParams {
    fn to_command(&self, session_id: &str, content: Option<String>) -> AgentCommand {
        AgentCommand::Start {
            session_id: session_id.to_string(),
            system_prompt: self.system_prompt.clone(),
            task_id: self.task_id.clone(),
            project_id: self.project_id.clone(),
            content,
        }
    }
}

pub struct SessionActor {
    id: String,
    services: SessionServices,

    // Connections
    browser: Option<BrowserConnection>,
    next_connection_id: u64,
    sandbox: Option<SandboxConnection>,
    agent_events: Option<mpsc::Receiver<Value>>,
    /// Final sync and stop of the last lost sandbox. Every copy of a session
    /// runs after it completes.
    retiring: Option<JoinHandle<()>>,

    // Session state
    assistant_text: String,
    interactions: PendingInteractions,
    buffer: PendingMessageBuffer,
    persistence: PersistenceQueue,
    ledger: RecoveryLedger,
    last_start: Option<StartParams>,
    idle_since: Option<Instant>,

    command_rx: mpsc::Receiver<SessionCommand>,
    shutdown: CancellationToken,
}

impl SessionActor {
    /// Spawn an actor for `id` on the services' supervisor.
    pub fn spawn(id: String, services: SessionServices) -> (SessionHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let state = SessionState::new(services.state.clone(), id.clone());
        let persistence = PersistenceQueue::new(
            id.clone(),
            services.records.clone(),
            services.config.persistence,
            services.supervisor.clone(),
        );

        let actor = Self {
            id: id.clone(),
            browser: None,
            next_connection_id: 0,
            sandbox: None,
            agent_events: None,
            retiring: None,
            assistant_text: String::new(),
            interactions: PendingInteractions::new(state.clone()),
            buffer: PendingMessageBuffer::new(services.config.buffer),
            persistence,
            ledger: RecoveryLedger::new(state),
            last_start: None,
            idle_since: Some(Instant::now()),
            command_rx: rx,
            shutdown: services.supervisor.shutdown_token(),
            services,
        };

        let supervisor = actor.services.supervisor.clone();
        let join = supervisor.spawn("session-actor", actor.run());
        (SessionHandle::new(id, tx), join)
    }

    async fn run(mut self) {
        info!("Session actor {} started", self.id);

        loop {
            let idle_deadline = self
                .idle_since
                .map(|since| since + self.services.config.idle_timeout);

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Session actor {} received shutdown signal", self.id);
                    self.teardown().await;
                    break;
                }

                command = self.command_rx.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => {
                            debug!("All handles to {} dropped, shutting down", self.id);
                            self.teardown().await;
                            break;
                        }
                    }
                }

                event = next_agent_event(&mut self.agent_events) => {
                    match event {
                        Some(event) => self.handle_agent_event(event).await,
                        None => self.handle_sandbox_disconnect().await,
                    }
                }

                _ = sleep_until(idle_deadline) => {
                    info!("Evicting idle session {}", self.id);
                    self.teardown().await;
                    break;
                }
            }

            self.update_idle();
        }

        info!("Session actor {} stopped", self.id);
    }

    fn update_idle(&mut self) {
        let idle = self.browser.is_none() && self.sandbox.is_none();
        match (idle, self.idle_since) {
            (true, None) => self.idle_since = Some(Instant::now()),
            (false, Some(_)) => self.idle_since = None,
            _ => {}
        }
    }

    /// Final sync, persistence flush and agent stop.
    async fn teardown(&mut self) {
        self.agent_events = None;
        self.await_retired_sandbox().await;
        if let Some(conn) = self.sandbox.take() {
            let outcome = conn.sync.force_sync().await;
            info!("Final sync for {}: {:?}", self.id, outcome);
            if let Err(e) = conn.sandbox.stop().await {
                warn!("Failed to stop sandbox for {}: {}", self.id, e);
            }
        }
        self.persistence.flush().await;
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::AttachBrowser { sender, reply } => {
                self.next_connection_id += 1;
                let id = self.next_connection_id;
                if self
                    .browser
                    .replace(BrowserConnection { id, tx: sender })
                    .is_some()
                {
                    debug!("Browser connection replaced in session {}", self.id);
                }
                let _ = reply.send(id);
            }
            SessionCommand::DetachBrowser { connection_id } => {
                if self
                    .browser
                    .as_ref()
                    .is_some_and(|b| b.id == connection_id)
                {
                    self.handle_browser_disconnect();
                }
            }
            SessionCommand::Client(command) => self.handle_client(command).await,
            SessionCommand::ProtocolError(message) => {
                warn!("Protocol error in session {}: {}", self.id, message);
                let error = SessionError::protocol(message);
                self.send_to_browser(ServerEvent::error(error.to_string()))
                    .await;
            }
            SessionCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    async fn handle_client(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Start {
                session_id,
                system_prompt,
                task_id,
                project_id,
            } => {
                if session_id != self.id {
                    let error = SessionError::protocol(format!(
                        "start for session {} sent to session {}",
                        session_id, self.id
                    ));
                    self.send_to_browser(ServerEvent::error(error.to_string()))
                        .await;
                    return;
                }
                self.handle_start(StartParams {
                    system_prompt,
                    task_id,
                    project_id,
                })
                .await;
            }
            ClientCommand::Message { content } => self.handle_user_message(content).await,
            ClientCommand::PermissionResponse {
                request_id,
                decision,
                modified_input,
            } => {
                let response = json!({
                    "requestId": request_id,
                    "decision": decision,
                    "modifiedInput": modified_input,
                });
                let command = AgentCommand::PermissionResponse {
                    request_id: request_id.clone(),
                    decision,
                    modified_input,
                };
                self.handle_interaction_response(
                    request_id,
                    InteractionKind::Permission,
                    response,
                    command,
                )
                .await;
            }
            ClientCommand::AskUserAnswer {
                request_id,
                answers,
            } => {
                let response = json!({
                    "requestId": request_id,
                    "answers": answers,
                });
                let command = AgentCommand::AskUserAnswer {
                    request_id: request_id.clone(),
                    answers,
                };
                self.handle_interaction_response(
                    request_id,
                    InteractionKind::Question,
                    response,
                    command,
                )
                .await;
            }
            ClientCommand::Abort => self.handle_abort().await,
        }
    }

    async fn handle_start(&mut self, params: StartParams) {
        self.last_start = Some(params.clone());

        // A live agent still owns its pending interactions: replay them to the
        // browser and leave them open. Only a fresh agent gets "continue".
        if self.sandbox.is_some() {
            debug!("Reusing sandbox connection for {}", self.id);
            self.replay_pending_interactions().await;
            if let Err(e) = self.forward(&params.to_command(&self.id, None)).await {
                warn!("Could not forward start for {}: {}", self.id, e);
                return;
            }
            self.send_status(ConnectionStatus::Connected, None).await;
            return;
        }

        self.connect_or_report(&params).await;
    }

    async fn handle_user_message(&mut self, content: String) {
        let _receipt = self.persistence.enqueue(
            MessageRole::User,
            content.clone(),
            None,
            MessageType::Message,
        );

        let command = AgentCommand::Message { content };
        if self.sandbox.is_some() && self.forward(&command).await.is_ok() {
            return;
        }

        match serde_json::to_string(&command) {
            Ok(raw) => {
                let id = self.buffer.add(raw, "message");
                debug!("Buffered message {} for disconnected session {}", id, self.id);
            }
            Err(e) => {
                error!("Could not encode message for {}: {}", self.id, e);
                return;
            }
        }

        match self.last_start.clone() {
            Some(params) => {
                info!("Reconnecting session {} to deliver buffered messages", self.id);
                self.connect_or_report(&params).await;
            }
            None => {
                self.send_to_browser(ServerEvent::error(
                    "session not started; message will be delivered after start",
                ))
                .await;
            }
        }
    }

    async fn handle_interaction_response(
        &mut self,
        request_id: String,
        kind: InteractionKind,
        response: Value,
        command: AgentCommand,
    ) {
        match self.interactions.find(&request_id, kind).await {
            Ok(Some(interaction)) => {
                // Request and response are queued back to back so they persist
                // as an adjacent pair.
                let _ = self.persistence.enqueue(
                    MessageRole::Assistant,
                    interaction.payload.to_string(),
                    None,
                    kind.request_type(),
                );
                let _ = self.persistence.enqueue(
                    MessageRole::User,
                    response.to_string(),
                    None,
                    kind.response_type(),
                );
            }
            Ok(None) => warn!(
                "No pending {:?} interaction {} in session {}",
                kind, request_id, self.id
            ),
            Err(e) => warn!(
                "Could not look up interaction {} in session {}: {}",
                request_id, self.id, e
            ),
        }

        if let Err(e) = self.forward(&command).await {
            self.send_to_browser(ServerEvent::error(format!(
                "could not deliver response to agent: {e}"
            )))
            .await;
        }

        if let Err(e) = self.interactions.remove(&request_id, kind).await {
            warn!(
                "Could not remove interaction {} from session {}: {}",
                request_id, self.id, e
            );
        }
    }

    async fn handle_abort(&mut self) {
        if let Err(e) = self.forward(&AgentCommand::Abort).await {
            debug!("Abort not forwarded for {}: {}", self.id, e);
        }

        match self.interactions.clear().await {
            Ok(cancelled) => {
                for interaction in cancelled {
                    self.send_to_browser(ServerEvent::InteractionCancelled {
                        request_id: interaction.request_id,
                    })
                    .await;
                }
            }
            Err(e) => warn!("Could not clear interactions for {}: {}", self.id, e),
        }
    }

    fn handle_browser_disconnect(&mut self) {
        self.browser = None;
        info!("Browser disconnected from session {}", self.id);

        if let Some(conn) = &self.sandbox {
            let waiter = conn.sync.force_sync();
            let id = self.id.clone();
            self.services
                .supervisor
                .spawn("disconnect-sync", async move {
                    let outcome = waiter.await;
                    debug!("Disconnect sync for {}: {:?}", id, outcome);
                });
        }
    }

    fn status(&mut self) -> SessionStatus {
        SessionStatus {
            session_id: self.id.clone(),
            browser_connected: self.browser.is_some(),
            sandbox_connected: self.sandbox.is_some(),
            pending_interactions: self.interactions.live_count(),
            buffered_messages: self.buffer.len(),
            queued_records: self.persistence.len(),
            sync: self.sandbox.as_ref().map(|c| c.sync.context()),
        }
    }

    // ------------------------------------------------------------------------
    // Sandbox lifecycle
    // ------------------------------------------------------------------------

    async fn connect_or_report(&mut self, params: &StartParams) {
        if let Err(e) = self.connect(params).await {
            error!("Failed to start session {}: {}", self.id, e);
            self.send_status(ConnectionStatus::Failed, Some(e.to_string()))
                .await;
            self.send_to_browser(ServerEvent::error(format!("failed to start session: {e}")))
                .await;
        }
    }

    async fn connect(&mut self, params: &StartParams) -> SessionResult<()> {
        self.send_status(ConnectionStatus::Connecting, None).await;
        // Recovery and the new sync manager copy the same workspace.
        self.await_retired_sandbox().await;

        let sandbox = self
            .services
            .sandboxes
            .provision(&self.id)
            .await
            .map_err(SessionError::Provisioning)?;

        let (channel, target) = match self.prepare_sandbox(&sandbox, params).await {
            Ok(prepared) => prepared,
            Err(e) => {
                if let Err(stop_err) = sandbox.stop().await {
                    warn!(
                        "Failed to stop sandbox after setup error in {}: {}",
                        self.id, stop_err
                    );
                }
                return Err(e);
            }
        };

        let sync = SyncManager::new(
            self.id.clone(),
            target,
            self.ledger.clone(),
            self.services.config.sync,
            self.services.supervisor.clone(),
        );
        self.assistant_text.clear();
        self.sandbox = Some(SandboxConnection {
            sandbox,
            sender: channel.sender,
            sync,
        });
        self.agent_events = Some(channel.events);

        let content = self.take_orphaned_interactions().await;
        self.forward(&params.to_command(&self.id, content)).await?;
        self.send_status(ConnectionStatus::Connected, None).await;
        self.drain_buffer().await;

        info!("Session {} connected", self.id);
        Ok(())
    }

    /// Environment, storage mount, failed-sync recovery, restore, agent start.
    async fn prepare_sandbox(
        &mut self,
        sandbox: &Arc<dyn Sandbox>,
        params: &StartParams,
    ) -> SessionResult<(AgentChannel, Arc<SandboxSyncTarget>)> {
        sandbox.set_env(self.sandbox_env(params)).await?;
        self.services
            .storage
            .mount(sandbox.as_ref(), &self.services.config.mount)
            .await?;

        self.send_status(ConnectionStatus::Restoring, None).await;

        let target = Arc::new(SandboxSyncTarget::new(
            self.services.storage.clone(),
            sandbox.clone(),
            self.id.clone(),
        ));
        match self.ledger.attempt_recovery(target.as_ref(), &self.id).await {
            Ok(report) if report.status == RecoveryStatus::NoFailure => {}
            Ok(report) => info!("Failed-sync recovery for {}: {:?}", self.id, report),
            Err(e) => warn!("Failed-sync recovery for {} did not run: {}", self.id, e),
        }

        match self
            .services
            .storage
            .copy_from(sandbox.as_ref(), &self.id)
            .await?
        {
            CopyFromStatus::Restored => info!("Restored workspace for {}", self.id),
            CopyFromStatus::NoRemoteData => debug!("No stored workspace for {}", self.id),
            status => warn!("Workspace restore for {} incomplete: {}", self.id, status),
        }
        self.send_status(ConnectionStatus::Restored, None).await;

        sandbox
            .start_process(&self.services.config.agent)
            .await
            .map_err(SessionError::Provisioning)?;
        let channel = sandbox.open_channel().await?;
        Ok((channel, target))
    }

    fn sandbox_env(&self, params: &StartParams) -> HashMap<String, String> {
        let mut env = self.services.config.sandbox_env.clone();
        env.insert("SKIFF_SESSION_ID".to_string(), self.id.clone());
        if let Some(task_id) = &params.task_id {
            env.insert("SKIFF_TASK_ID".to_string(), task_id.clone());
        }
        if let Some(project_id) = &params.project_id {
            env.insert("SKIFF_PROJECT_ID".to_string(), project_id.clone());
        }
        env
    }

    /// A fresh agent has no outstanding requests, so anything still pending
    /// belongs to a previous incarnation. Clear it and ask the agent to
    /// continue so it re-issues what it still needs.
    async fn take_orphaned_interactions(&mut self) -> Option<String> {
        match self.interactions.clear().await {
            Ok(orphaned) if orphaned.is_empty() => None,
            Ok(orphaned) => {
                info!(
                    "Session {} resumes with {} unresolved interactions",
                    self.id,
                    orphaned.len()
                );
                for interaction in orphaned {
                    self.send_to_browser(ServerEvent::InteractionCancelled {
                        request_id: interaction.request_id,
                    })
                    .await;
                }
                Some(CONTINUE_CONTENT.to_string())
            }
            Err(e) => {
                warn!(
                    "Could not read pending interactions for {}: {}",
                    self.id, e
                );
                None
            }
        }
    }

    async fn drain_buffer(&mut self) {
        let pending = self.buffer.drain();
        if pending.is_empty() {
            return;
        }
        info!(
            "Redelivering {} buffered messages to session {}",
            pending.len(),
            self.id
        );

        let mut pending = pending.into_iter();
        while let Some(message) = pending.next() {
            let sent = match &self.sandbox {
                Some(conn) => conn.sender.send_raw(message.raw.clone()).await,
                None => Err(crate::sandbox::SandboxError::Connection(
                    "sandbox gone".to_string(),
                )),
            };
            if let Err(e) = sent {
                warn!("Redelivery to {} interrupted: {}", self.id, e);
                let mut rest = vec![message];
                rest.extend(pending);
                self.buffer.requeue(rest);
                self.handle_sandbox_disconnect().await;
                return;
            }
        }
    }

    async fn forward(&mut self, command: &AgentCommand) -> SessionResult<()> {
        let Some(conn) = &self.sandbox else {
            return Err(SessionError::NotConnected);
        };
        if let Err(e) = conn.sender.send(command).await {
            warn!("Agent channel for {} failed: {}", self.id, e);
            self.handle_sandbox_disconnect().await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn handle_sandbox_disconnect(&mut self) {
        self.agent_events = None;
        self.assistant_text.clear();
        let Some(conn) = self.sandbox.take() else {
            return;
        };
        warn!("Sandbox connection for session {} closed", self.id);

        let id = self.id.clone();
        let previous = self.retiring.take();
        let retiring = self
            .services
            .supervisor
            .spawn("sandbox-teardown", async move {
                if let Some(previous) = previous {
                    let _ = previous.await;
                }
                let outcome = conn.sync.force_sync().await;
                debug!("Sync after sandbox loss for {}: {:?}", id, outcome);
                if let Err(e) = conn.sandbox.stop().await {
                    warn!("Failed to stop sandbox for {}: {}", id, e);
                }
            });
        self.retiring = Some(retiring);

        self.send_status(ConnectionStatus::Disconnected, None).await;
    }

    async fn await_retired_sandbox(&mut self) {
        let Some(retiring) = self.retiring.take() else {
            return;
        };
        if !retiring.is_finished() {
            debug!("Waiting for the previous sandbox of {} to sync", self.id);
        }
        if let Err(e) = retiring.await {
            warn!("Sandbox teardown for {} failed: {}", self.id, e);
        }
    }

    // ------------------------------------------------------------------------
    // Agent events
    // ------------------------------------------------------------------------

    async fn handle_agent_event(&mut self, raw: Value) {
        match AgentEvent::from_value(&raw) {
            Some(AgentEvent::TextDelta { text }) => {
                self.assistant_text.push_str(&text);
                self.send_to_browser(BrowserEvent::Forwarded(raw)).await;
            }
            Some(AgentEvent::TurnComplete { usage, stop_reason }) => {
                self.complete_turn(usage, stop_reason).await;
            }
            Some(AgentEvent::PermissionRequest {
                request_id,
                tool_name,
                input,
            }) => {
                let payload = json!({
                    "requestId": request_id,
                    "toolName": tool_name,
                    "input": input,
                });
                self.record_interaction(request_id, InteractionKind::Permission, payload, raw)
                    .await;
            }
            Some(AgentEvent::AskUser {
                request_id,
                questions,
            }) => {
                let payload = json!({
                    "requestId": request_id,
                    "questions": questions,
                });
                self.record_interaction(request_id, InteractionKind::Question, payload, raw)
                    .await;
            }
            Some(AgentEvent::InteractionCancelled { request_id }) => {
                if let Err(e) = self.interactions.remove_any(&request_id).await {
                    warn!(
                        "Could not remove cancelled interaction {} in {}: {}",
                        request_id, self.id, e
                    );
                }
                self.send_to_browser(BrowserEvent::Forwarded(raw)).await;
            }
            Some(AgentEvent::Error { message }) => {
                warn!("Agent error in session {}: {}", self.id, message);
                self.send_to_browser(BrowserEvent::Forwarded(raw)).await;
            }
            _ => self.send_to_browser(BrowserEvent::Forwarded(raw)).await,
        }
    }

    async fn complete_turn(&mut self, usage: Option<TokenUsage>, stop_reason: Option<String>) {
        let content = std::mem::take(&mut self.assistant_text);

        let message_id = if content.is_empty() {
            None
        } else {
            let metadata = MessageMetadata {
                input_tokens: usage.as_ref().map(|u| u.input_tokens),
                output_tokens: usage.as_ref().map(|u| u.output_tokens),
                stop_reason: stop_reason.clone(),
            };
            self.persistence
                .enqueue(
                    MessageRole::Assistant,
                    content.clone(),
                    Some(metadata),
                    MessageType::Message,
                )
                .await
        };

        self.send_to_browser(ServerEvent::MessageComplete {
            message_id,
            content,
            stop_reason,
            usage,
        })
        .await;

        if let Some(conn) = &self.sandbox {
            // The waiter is not needed; failures land in the ledger.
            drop(conn.sync.request_sync());
        }
    }

    async fn record_interaction(
        &mut self,
        request_id: String,
        kind: InteractionKind,
        payload: Value,
        raw: Value,
    ) {
        let interaction = PendingInteraction {
            request_id,
            kind,
            payload,
            event: raw.clone(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.interactions.record(interaction).await {
            warn!("Could not persist pending interaction in {}: {}", self.id, e);
        }
        self.send_to_browser(BrowserEvent::Forwarded(raw)).await;
    }

    async fn replay_pending_interactions(&mut self) {
        let events: Vec<Value> = self
            .interactions
            .live()
            .into_iter()
            .map(|i| i.event.clone())
            .collect();
        for event in events {
            self.send_to_browser(BrowserEvent::Forwarded(event)).await;
        }
    }

    // ------------------------------------------------------------------------
    // Browser output
    // ------------------------------------------------------------------------

    async fn send_to_browser(&mut self, event: impl Into<BrowserEvent>) {
        let Some(browser) = &self.browser else {
            return;
        };
        if browser.tx.send(event.into()).await.is_err() {
            debug!("Browser channel for {} closed", self.id);
            self.handle_browser_disconnect();
        }
    }

    async fn send_status(&mut self, status: ConnectionStatus, message: Option<String>) {
        debug!("Session {} status: {}", self.id, status);
        self.send_to_browser(ServerEvent::Status { status, message })
            .await;
    }
}

async fn next_agent_event(events: &mut Option<mpsc::Receiver<Value>>) -> Option<Value> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
