//! Session actors.
//!
//! One actor task owns each live session: its browser connection, its
//! sandbox connection, pending interactions, the disconnect buffer, the
//! persistence queue and the sync manager. Every entry point is a message on
//! the actor's command channel, so session-local state needs no locks.
//!
//! Shared collaborators are injected through [`SessionServices`]; nothing in
//! here is a process-wide singleton.

mod actor;
mod error;
mod handle;
pub mod interactions;
mod registry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::buffer::BufferConfig;
use crate::persistence::{PersistenceConfig, RecordStore};
use crate::sandbox::{ProcessSpec, SandboxProvider};
use crate::state::StateStore;
use crate::storage::{MountOptions, WorkspaceStorage};
use crate::supervisor::Supervisor;
use crate::sync::SyncConfig;

pub use actor::SessionActor;
pub use error::{SessionError, SessionResult};
pub use handle::{SessionCommand, SessionHandle, SessionStatus};
pub use interactions::{InteractionKind, PendingInteraction, PendingInteractions};
pub use registry::SessionRegistry;

/// Content injected into the start request when a resumed session finds
/// interactions left unanswered by a previous incarnation.
pub const CONTINUE_CONTENT: &str = "continue";

/// Per-session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Agent process started inside each sandbox.
    pub agent: ProcessSpec,
    /// Extra environment for the sandbox.
    pub sandbox_env: HashMap<String, String>,
    pub mount: MountOptions,
    pub persistence: PersistenceConfig,
    pub sync: SyncConfig,
    pub buffer: BufferConfig,
    /// An actor with neither browser nor sandbox stops after this long.
    pub idle_timeout: Duration,
}

/// Collaborators shared by all session actors.
#[derive(Clone)]
pub struct SessionServices {
    pub sandboxes: Arc<dyn SandboxProvider>,
    pub storage: Arc<dyn WorkspaceStorage>,
    pub records: Arc<dyn RecordStore>,
    pub state: Arc<dyn StateStore>,
    pub supervisor: Supervisor,
    pub config: SessionConfig,
}

/// Session ids become path components in state and storage.
pub fn validate_session_id(session_id: &str) -> SessionResult<()> {
    let valid = !session_id.is_empty()
        && session_id.len() <= 128
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && session_id != "."
        && session_id != "..";
    if valid {
        Ok(())
    } else {
        Err(SessionError::protocol(format!(
            "invalid session id: {session_id:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_session_id() {
        assert!(validate_session_id("ses_01HX-abc.1").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("..").is_err());
        assert!(validate_session_id("a/b").is_err());
        assert!(validate_session_id("with space").is_err());
    }
}
