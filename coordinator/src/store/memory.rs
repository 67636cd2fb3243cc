//! In-memory store.

use async_trait::async_trait;
use dashmap::DashMap;

use lra_common::{Lra, LraId, ParticipantId, ParticipantRecord, Result};

use super::{LraStore, StoredState};

/// Store keeping records in process memory.
///
/// Records survive a coordinator restart as long as the same store instance is
/// handed to the new coordinator, which is how restart recovery is exercised
/// without a database.
#[derive(Default)]
pub struct MemoryStore {
    lras: DashMap<LraId, Lra>,
    participants: DashMap<(LraId, ParticipantId), ParticipantRecord>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted LRAs.
    pub fn lra_count(&self) -> usize {
        self.lras.len()
    }

    /// Number of persisted participants.
    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }
}

#[async_trait]
impl LraStore for MemoryStore {
    async fn save_lra(&self, lra: &Lra) -> Result<()> {
        self.lras.insert(lra.id.clone(), lra.clone());
        Ok(())
    }

    async fn remove_lra(&self, lra_id: &LraId) -> Result<()> {
        self.lras.remove(lra_id);
        self.participants.retain(|(owner, _), _| owner != lra_id);
        Ok(())
    }

    async fn save_participant(&self, participant: &ParticipantRecord) -> Result<()> {
        self.participants.insert(
            (participant.lra_id.clone(), participant.id),
            participant.clone(),
        );
        Ok(())
    }

    async fn remove_participant(&self, lra_id: &LraId, participant_id: &ParticipantId) -> Result<()> {
        self.participants.remove(&(lra_id.clone(), *participant_id));
        Ok(())
    }

    async fn load(&self) -> Result<StoredState> {
        Ok(StoredState {
            lras: self.lras.iter().map(|l| l.value().clone()).collect(),
            participants: self.participants.iter().map(|p| p.value().clone()).collect(),
        })
    }
}
