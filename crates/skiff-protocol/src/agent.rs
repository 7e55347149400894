//! Session actor <-> agent process messages.
//!
//! The agent speaks newline-delimited JSON over its channel. The actor only
//! interprets the handful of event types it has to act on; every other frame
//! is forwarded to the browser untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::browser::PermissionDecision;

/// Commands written to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AgentCommand {
    /// Begin or resume a conversation.
    Start {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        system_prompt: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
        /// Synthetic content injected on resume (e.g. "continue").
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },

    /// User chat message.
    Message { content: String },

    /// Decision on a permission request.
    PermissionResponse {
        request_id: String,
        decision: PermissionDecision,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        modified_input: Option<Value>,
    },

    /// Answers to a question.
    AskUserAnswer { request_id: String, answers: Value },

    /// Abort the current turn.
    Abort,
}

/// Token counts reported with a completed turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Agent events the session actor acts on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AgentEvent {
    /// Agent process finished booting.
    Ready,

    /// A new assistant turn started.
    TurnStart,

    /// Streamed assistant text.
    TextDelta { text: String },

    /// The assistant turn ended.
    TurnComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_reason: Option<String>,
    },

    /// Agent asks for permission to run a tool.
    PermissionRequest {
        request_id: String,
        tool_name: String,
        #[serde(default)]
        input: Value,
    },

    /// Agent asks the user one or more questions.
    AskUser { request_id: String, questions: Value },

    /// Agent withdrew a pending request.
    InteractionCancelled { request_id: String },

    /// Agent-side error (non-fatal to the session).
    Error { message: String },
}

impl AgentEvent {
    /// Interpret a raw agent frame. Returns `None` for event types the actor
    /// does not act on; those are forwarded verbatim.
    pub fn from_value(value: &Value) -> Option<AgentEvent> {
        serde_json::from_value(value.clone()).ok()
    }
}
