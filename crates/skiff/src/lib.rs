//! Skiff: per-session actors that connect a browser to an agent running in
//! an ephemeral sandbox, persist the conversation in order and keep the
//! sandbox workspace synchronized to durable storage.
//!
//! ```text
//!             ┌──────────────┐   ClientCommand    ┌────────────────┐   AgentCommand   ┌─────────┐
//!  browser ──►│  ws handler  │───────────────────►│ session actor  │─────────────────►│ sandbox │
//!          ◄──│              │◄───────────────────│                │◄─────────────────│ (agent) │
//!             └──────────────┘   BrowserEvent     └──┬──────────┬──┘   agent events   └────┬────┘
//!                                                    │          │                          │
//!                                        PersistenceQueue   SyncManager ── copy_to ────────┘
//!                                                    │          │
//!                                              record store   durable storage
//! ```

pub mod api;
pub mod buffer;
pub mod config;
pub mod persistence;
pub mod retry;
pub mod sandbox;
pub mod session;
pub mod state;
pub mod storage;
pub mod supervisor;
pub mod sync;
pub mod ws;
