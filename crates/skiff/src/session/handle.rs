//! Handle for talking to a session actor.
//!
//! `SessionHandle` wraps the actor's command sender. It is cheap to clone and
//! every method is a message to the actor.

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use skiff_protocol::{BrowserEvent, ClientCommand};

use super::error::{SessionError, SessionResult};
use crate::sync::SyncContext;

/// Commands processed by the actor loop, one at a time.
#[derive(Debug)]
pub enum SessionCommand {
    /// A browser connected. Replaces any previous browser.
    AttachBrowser {
        sender: mpsc::Sender<BrowserEvent>,
        reply: oneshot::Sender<u64>,
    },
    /// The browser with this connection id went away.
    DetachBrowser { connection_id: u64 },
    /// A decoded browser message.
    Client(ClientCommand),
    /// A browser frame that could not be decoded.
    ProtocolError(String),
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
}

/// Snapshot of a live session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session_id: String,
    pub browser_connected: bool,
    pub sandbox_connected: bool,
    pub pending_interactions: usize,
    pub buffered_messages: usize,
    pub queued_records: usize,
    /// Present while a sandbox is attached.
    pub sync: Option<SyncContext>,
}

#[derive(Clone, Debug)]
pub struct SessionHandle {
    id: String,
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub(crate) fn new(id: String, tx: mpsc::Sender<SessionCommand>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the actor has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) fn same_actor(&self, other: &SessionHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }

    async fn send(&self, command: SessionCommand) -> SessionResult<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| SessionError::ActorShutdown)
    }

    /// Attach a browser; returns its connection id.
    pub async fn attach_browser(&self, sender: mpsc::Sender<BrowserEvent>) -> SessionResult<u64> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::AttachBrowser { sender, reply })
            .await?;
        rx.await.map_err(|_| SessionError::ActorShutdown)
    }

    pub async fn detach_browser(&self, connection_id: u64) -> SessionResult<()> {
        self.send(SessionCommand::DetachBrowser { connection_id })
            .await
    }

    pub async fn send_client(&self, command: ClientCommand) -> SessionResult<()> {
        self.send(SessionCommand::Client(command)).await
    }

    pub async fn report_protocol_error(&self, message: impl Into<String>) -> SessionResult<()> {
        self.send(SessionCommand::ProtocolError(message.into()))
            .await
    }

    pub async fn status(&self) -> SessionResult<SessionStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Status { reply }).await?;
        rx.await.map_err(|_| SessionError::ActorShutdown)
    }
}
