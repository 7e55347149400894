//! Browser <-> session actor messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::TokenUsage;

// ============================================================================
// Commands (Browser -> Server)
// ============================================================================

/// Commands sent by the browser over the session WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientCommand {
    /// Start (or resume) the session's sandbox and agent.
    Start {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        system_prompt: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
    },

    /// A user chat message.
    Message { content: String },

    /// Decision on a tool permission request.
    PermissionResponse {
        request_id: String,
        decision: PermissionDecision,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        modified_input: Option<Value>,
    },

    /// Answers to an agent question.
    AskUserAnswer { request_id: String, answers: Value },

    /// Abort the agent's current turn.
    Abort,
}

/// Human decision on a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    Allow,
    AllowAlways,
    Deny,
}

impl PermissionDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::AllowAlways => "allow_always",
            Self::Deny => "deny",
        }
    }
}

// ============================================================================
// Events (Server -> Browser)
// ============================================================================

/// Coarse-grained session status shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Restoring,
    Restored,
    Failed,
    Disconnected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Restoring => write!(f, "restoring"),
            ConnectionStatus::Restored => write!(f, "restored"),
            ConnectionStatus::Failed => write!(f, "failed"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Events generated by the session actor itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Session status changed.
    Status {
        status: ConnectionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// An assistant turn finished and was handed to the record store.
    ///
    /// `message_id` is the durable id, or `None` when persistence gave up.
    MessageComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },

    /// A pending permission request or question was withdrawn.
    InteractionCancelled { request_id: String },

    /// Human-readable error.
    Error { message: String },
}

impl ServerEvent {
    pub fn status(status: ConnectionStatus) -> Self {
        ServerEvent::Status {
            status,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }
}

/// Anything the actor sends to the browser: its own events, or agent events
/// forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BrowserEvent {
    Server(ServerEvent),
    Forwarded(Value),
}

impl From<ServerEvent> for BrowserEvent {
    fn from(event: ServerEvent) -> Self {
        BrowserEvent::Server(event)
    }
}
