//! One actor per session id.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, info};
use tokio::task::JoinHandle;

use super::actor::SessionActor;
use super::error::{SessionError, SessionResult};
use super::handle::SessionHandle;
use super::{SessionServices, validate_session_id};

/// Maps session ids to live actors and spawns them on demand.
///
/// Each spawned actor gets a reaper task that removes its handle once the
/// actor stops (idle eviction or shutdown), so the next lookup starts a fresh
/// incarnation from durable state.
#[derive(Clone)]
pub struct SessionRegistry {
    handles: Arc<DashMap<String, SessionHandle>>,
    services: SessionServices,
}

impl SessionRegistry {
    pub fn new(services: SessionServices) -> Self {
        Self {
            handles: Arc::new(DashMap::new()),
            services,
        }
    }

    pub fn services(&self) -> &SessionServices {
        &self.services
    }

    /// Handle to the session's actor, spawning one if none is resident.
    pub fn get_or_spawn(&self, session_id: &str) -> SessionResult<SessionHandle> {
        validate_session_id(session_id)?;
        if self.services.supervisor.is_shutting_down() {
            return Err(SessionError::ActorShutdown);
        }

        let mut spawned = None;
        let handle = match self.handles.entry(session_id.to_string()) {
            Entry::Occupied(mut entry) if entry.get().is_closed() => {
                let (handle, join) = self.spawn_actor(session_id);
                entry.insert(handle.clone());
                spawned = Some(join);
                handle
            }
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let (handle, join) = self.spawn_actor(session_id);
                entry.insert(handle.clone());
                spawned = Some(join);
                handle
            }
        };

        if let Some(join) = spawned {
            self.spawn_reaper(handle.clone(), join);
        }
        Ok(handle)
    }

    /// Handle to a resident actor, if any.
    pub fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.handles
            .get(session_id)
            .map(|h| h.clone())
            .filter(|h| !h.is_closed())
    }

    /// Number of resident actors.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop every actor and wait for background work to finish.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        info!("Shutting down {} session actors", self.handles.len());
        let clean = self.services.supervisor.shutdown(timeout).await;
        self.handles.clear();
        clean
    }

    fn spawn_actor(&self, session_id: &str) -> (SessionHandle, JoinHandle<()>) {
        debug!("Spawning actor for session {}", session_id);
        SessionActor::spawn(session_id.to_string(), self.services.clone())
    }

    fn spawn_reaper(&self, handle: SessionHandle, join: JoinHandle<()>) {
        let handles = self.handles.clone();
        self.services
            .supervisor
            .spawn("session-reaper", async move {
                let _ = join.await;
                let removed = handles
                    .remove_if(handle.id(), |_, current| current.same_actor(&handle))
                    .is_some();
                if removed {
                    debug!("Removed stopped actor for session {}", handle.id());
                }
            });
    }
}
