//! Skiff wire protocol.
//!
//! Three conversations share these types:
//!
//! ```text
//! browser  <── ClientCommand / BrowserEvent ──>  session actor
//! session actor  <── AgentCommand / AgentEvent ──>  agent process (in sandbox)
//! session actor  ── NewRecord ──>  record store
//! ```
//!
//! All payloads are JSON. Browser and agent messages are tagged by a `type`
//! field with snake_case values and camelCase field names.

pub mod agent;
pub mod browser;
pub mod records;

pub use agent::{AgentCommand, AgentEvent, TokenUsage};
pub use browser::{BrowserEvent, ClientCommand, ConnectionStatus, PermissionDecision, ServerEvent};
pub use records::{MessageMetadata, MessageRole, MessageType, NewRecord, RecordReceipt};
