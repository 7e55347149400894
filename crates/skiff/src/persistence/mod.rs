//! Conversation persistence.
//!
//! - [`RecordStore`]: append-only record store contract, with
//!   [`HttpRecordStore`] for a real backend and [`MemoryRecordStore`] for
//!   development
//! - [`PersistenceQueue`]: per-session ordered writer with retry

mod error;
mod queue;
mod record_store;

pub use error::{PersistenceError, PersistenceResult};
pub use queue::{PersistReceipt, PersistenceConfig, PersistenceQueue};
pub use record_store::{HttpRecordStore, MemoryRecordStore, RecordStore};
