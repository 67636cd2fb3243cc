//! Durable store for LRA and participant records.
//!
//! Every state change is written through before it is acknowledged, so that a
//! restarted coordinator can rebuild its registries from [`LraStore::load`]
//! and resume termination.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use std::sync::Arc;

use async_trait::async_trait;

use lra_common::{Lra, LraError, LraId, ParticipantId, ParticipantRecord, Result};

/// Everything needed to rebuild the registries.
#[derive(Debug, Clone, Default)]
pub struct StoredState {
    pub lras: Vec<Lra>,
    pub participants: Vec<ParticipantRecord>,
}

/// Persistence for LRA and participant records.
#[async_trait]
pub trait LraStore: Send + Sync {
    /// Insert or replace an LRA record.
    async fn save_lra(&self, lra: &Lra) -> Result<()>;

    /// Remove an LRA and all of its participants.
    async fn remove_lra(&self, lra_id: &LraId) -> Result<()>;

    /// Insert or replace a participant record.
    async fn save_participant(&self, participant: &ParticipantRecord) -> Result<()>;

    /// Remove a participant record.
    async fn remove_participant(&self, lra_id: &LraId, participant_id: &ParticipantId) -> Result<()>;

    /// Load every persisted record.
    async fn load(&self) -> Result<StoredState>;
}

/// Shared store handle.
pub type SharedStore = Arc<dyn LraStore>;

pub(crate) fn store_error(err: impl std::fmt::Display) -> LraError {
    LraError::StoreError(err.to_string())
}
