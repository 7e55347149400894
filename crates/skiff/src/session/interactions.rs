//! Pending interactive requests (tool permissions and questions).
//!
//! Every entry lives in memory and is mirrored to durable actor state under
//! `pendingPermissions` / `pendingQuestions`, so an actor restarted after
//! eviction can still find requests the agent issued before.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use skiff_protocol::MessageType;

use crate::state::{PENDING_PERMISSIONS_KEY, PENDING_QUESTIONS_KEY, SessionState, StateResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Permission,
    Question,
}

impl InteractionKind {
    pub const ALL: [InteractionKind; 2] = [InteractionKind::Permission, InteractionKind::Question];

    fn state_key(self) -> &'static str {
        match self {
            Self::Permission => PENDING_PERMISSIONS_KEY,
            Self::Question => PENDING_QUESTIONS_KEY,
        }
    }

    /// Record type of the agent's request.
    pub fn request_type(self) -> MessageType {
        match self {
            Self::Permission => MessageType::PermissionRequest,
            Self::Question => MessageType::Question,
        }
    }

    /// Record type of the human's response.
    pub fn response_type(self) -> MessageType {
        match self {
            Self::Permission => MessageType::PermissionResponse,
            Self::Question => MessageType::QuestionAnswer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingInteraction {
    pub request_id: String,
    pub kind: InteractionKind,
    /// Tool name and input, or the question list.
    pub payload: Value,
    /// The agent event as received, replayed to reconnecting browsers.
    pub event: Value,
    pub created_at: DateTime<Utc>,
}

/// In-memory map of pending interactions with a durable mirror.
pub struct PendingInteractions {
    state: SessionState,
    live: HashMap<String, PendingInteraction>,
}

impl PendingInteractions {
    pub fn new(state: SessionState) -> Self {
        Self {
            state,
            live: HashMap::new(),
        }
    }

    /// Live entries, oldest first.
    pub fn live(&self) -> Vec<&PendingInteraction> {
        let mut entries: Vec<_> = self.live.values().collect();
        entries.sort_by_key(|i| i.created_at);
        entries
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Record a new interaction in memory and durable state.
    pub async fn record(&mut self, interaction: PendingInteraction) -> StateResult<()> {
        let kind = interaction.kind;
        let mut durable = self.load_kind(kind).await?;
        durable.retain(|i| i.request_id != interaction.request_id);
        durable.push(interaction.clone());
        self.save_kind(kind, &durable).await?;
        self.live.insert(interaction.request_id.clone(), interaction);
        Ok(())
    }

    /// Find an interaction, falling back to durable state when memory has
    /// lost it. Rehydrated entries are put back into memory.
    pub async fn find(
        &mut self,
        request_id: &str,
        kind: InteractionKind,
    ) -> StateResult<Option<PendingInteraction>> {
        if let Some(interaction) = self.live.get(request_id)
            && interaction.kind == kind
        {
            return Ok(Some(interaction.clone()));
        }

        let found = self
            .load_kind(kind)
            .await?
            .into_iter()
            .find(|i| i.request_id == request_id);
        if let Some(interaction) = &found {
            self.live
                .insert(interaction.request_id.clone(), interaction.clone());
        }
        Ok(found)
    }

    /// Remove an interaction from memory and durable state.
    pub async fn remove(&mut self, request_id: &str, kind: InteractionKind) -> StateResult<()> {
        if self
            .live
            .get(request_id)
            .is_some_and(|i| i.kind == kind)
        {
            self.live.remove(request_id);
        }

        let mut durable = self.load_kind(kind).await?;
        let before = durable.len();
        durable.retain(|i| i.request_id != request_id);
        if durable.len() != before {
            self.save_kind(kind, &durable).await?;
        }
        Ok(())
    }

    /// Remove an interaction of either kind. Returns the kind it had.
    pub async fn remove_any(&mut self, request_id: &str) -> StateResult<Option<InteractionKind>> {
        let mut removed = self.live.remove(request_id).map(|i| i.kind);
        for kind in InteractionKind::ALL {
            let mut durable = self.load_kind(kind).await?;
            let before = durable.len();
            durable.retain(|i| i.request_id != request_id);
            if durable.len() != before {
                self.save_kind(kind, &durable).await?;
                removed = removed.or(Some(kind));
            }
        }
        Ok(removed)
    }

    /// Every interaction in memory or durable state, oldest first.
    pub async fn all(&self) -> StateResult<Vec<PendingInteraction>> {
        let mut all: HashMap<String, PendingInteraction> = HashMap::new();
        for kind in InteractionKind::ALL {
            for interaction in self.load_kind(kind).await? {
                all.insert(interaction.request_id.clone(), interaction);
            }
        }
        for (id, interaction) in &self.live {
            all.entry(id.clone()).or_insert_with(|| interaction.clone());
        }

        let mut all: Vec<_> = all.into_values().collect();
        all.sort_by_key(|i| i.created_at);
        Ok(all)
    }

    /// Remove everything, returning what was removed.
    pub async fn clear(&mut self) -> StateResult<Vec<PendingInteraction>> {
        let all = self.all().await?;
        for kind in InteractionKind::ALL {
            self.state.remove(kind.state_key()).await?;
        }
        self.live.clear();
        Ok(all)
    }

    async fn load_kind(&self, kind: InteractionKind) -> StateResult<Vec<PendingInteraction>> {
        Ok(self
            .state
            .load::<Vec<PendingInteraction>>(kind.state_key())
            .await?
            .unwrap_or_default())
    }

    async fn save_kind(
        &self,
        kind: InteractionKind,
        entries: &[PendingInteraction],
    ) -> StateResult<()> {
        if entries.is_empty() {
            self.state.remove(kind.state_key()).await
        } else {
            self.state.save(kind.state_key(), &entries).await
        }
    }
}
