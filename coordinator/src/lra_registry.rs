//! Registry of live and recovering LRAs.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Duration;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use lra_common::{
    earliest, Clock, Lra, LraError, LraEvent, LraId, LraInfo, LraStatus, Result, Timestamp,
};

use crate::participant_registry::ParticipantSet;
use crate::store::{SharedStore, StoredState};

/// Mutable state of one LRA, guarded by its handle.
#[derive(Debug, Clone)]
pub struct LraEntry {
    /// The LRA record.
    pub lra: Lra,
    /// Enlisted participants.
    pub participants: ParticipantSet,
    /// Nested LRAs started under this one.
    pub children: Vec<LraId>,
}

impl LraEntry {
    fn new(lra: Lra) -> Self {
        Self {
            lra,
            participants: ParticipantSet::default(),
            children: Vec::new(),
        }
    }

    /// Earliest of the LRA deadline and any participant time limit.
    pub fn effective_deadline(&self) -> Option<Timestamp> {
        earliest(self.lra.deadline, self.participants.earliest_time_limit())
    }

    /// Whether the effective deadline passed while the LRA is still active.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.lra.status == LraStatus::Active
            && self.effective_deadline().map_or(false, |d| d <= now)
    }
}

/// Per-LRA exclusive sections.
///
/// `state` serializes every mutation of the record. `termination` is held for
/// the whole of a termination pass so that a participant never sees two
/// passes of the same LRA at once; it is never taken while `state` is held.
pub struct LraHandle {
    id: LraId,
    pub(crate) state: Mutex<LraEntry>,
    pub(crate) termination: Mutex<()>,
}

impl LraHandle {
    fn new(entry: LraEntry) -> Self {
        Self {
            id: entry.lra.id.clone(),
            state: Mutex::new(entry),
            termination: Mutex::new(()),
        }
    }

    /// LRA id.
    pub fn id(&self) -> &LraId {
        &self.id
    }

    /// Copy of the current record.
    pub async fn snapshot(&self) -> Lra {
        self.state.lock().await.lra.clone()
    }
}

/// Owns every LRA known to the coordinator, including finished LRAs still
/// inside their retention window.
pub struct LraRegistry {
    /// LRA handles by id.
    lras: DashMap<LraId, Arc<LraHandle>>,
    /// Durable store.
    store: SharedStore,
    /// Time source.
    clock: Arc<dyn Clock>,
    /// Prefix for new LRA ids.
    base_url: String,
}

impl LraRegistry {
    /// Create an empty registry.
    pub fn new(base_url: impl Into<String>, store: SharedStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            lras: DashMap::new(),
            store,
            clock,
            base_url: base_url.into(),
        }
    }

    /// Start a new LRA, nested under `parent_id` when given.
    #[instrument(skip(self))]
    pub async fn create(
        &self,
        parent_id: Option<&LraId>,
        client_id: &str,
        timeout: Duration,
    ) -> Result<Lra> {
        let lra = Lra::new(
            LraId::generate(&self.base_url),
            parent_id.cloned(),
            client_id,
            self.clock.now(),
            timeout,
        );

        match parent_id {
            Some(parent_id) => {
                let parent = self
                    .handle(parent_id)
                    .map_err(|_| LraError::ParentNotFound(parent_id.clone()))?;
                let mut parent_entry = parent.state.lock().await;
                if parent_entry.lra.status != LraStatus::Active {
                    return Err(LraError::InvalidState {
                        lra_id: parent_id.clone(),
                        status: parent_entry.lra.status,
                        operation: "start a nested LRA under".to_string(),
                    });
                }
                self.store.save_lra(&lra).await?;
                parent_entry.children.push(lra.id.clone());
                self.insert(LraEntry::new(lra.clone()));
            }
            None => {
                self.store.save_lra(&lra).await?;
                self.insert(LraEntry::new(lra.clone()));
            }
        }

        info!(
            lra_id = %lra.id,
            parent_id = ?lra.parent_id.as_ref().map(|p| p.as_str()),
            deadline = ?lra.deadline,
            "LRA started"
        );
        Ok(lra)
    }

    /// Handle of an LRA.
    pub fn handle(&self, lra_id: &LraId) -> Result<Arc<LraHandle>> {
        self.lras
            .get(lra_id)
            .map(|h| h.value().clone())
            .ok_or_else(|| LraError::NotFound(lra_id.clone()))
    }

    /// Whether the LRA is known.
    pub fn contains(&self, lra_id: &LraId) -> bool {
        self.lras.contains_key(lra_id)
    }

    /// Number of LRAs held, finished ones included.
    pub fn len(&self) -> usize {
        self.lras.len()
    }

    /// Whether no LRA is held.
    pub fn is_empty(&self) -> bool {
        self.lras.is_empty()
    }

    /// Copy of an LRA record.
    pub async fn get(&self, lra_id: &LraId) -> Result<Lra> {
        Ok(self.handle(lra_id)?.snapshot().await)
    }

    /// Current status of an LRA.
    pub async fn status(&self, lra_id: &LraId) -> Result<LraStatus> {
        Ok(self.get(lra_id).await?.status)
    }

    /// Summary of an LRA.
    pub async fn info(&self, lra_id: &LraId) -> Result<LraInfo> {
        Ok(self.get(lra_id).await?.info(self.clock.now()))
    }

    /// LRAs still open for work, plus finished nested LRAs held for a
    /// parent that has not terminated.
    pub async fn list_active(&self) -> Vec<LraInfo> {
        self.list(|lra, held| lra.status == LraStatus::Active || held)
            .await
    }

    /// Every LRA that has not reached a terminal status, plus finished
    /// nested LRAs held for their parent.
    pub async fn list_all(&self) -> Vec<LraInfo> {
        self.list(|lra, held| !lra.is_terminal() || held).await
    }

    /// LRAs waiting for recovery to finish their participants.
    pub async fn list_recovering(&self) -> Vec<LraInfo> {
        self.list(|lra, _| lra.recovering && !lra.is_terminal())
            .await
    }

    /// Snapshot of every handle.
    pub fn handles(&self) -> Vec<Arc<LraHandle>> {
        self.lras.iter().map(|h| h.value().clone()).collect()
    }

    /// Apply a state machine event and persist the result.
    #[instrument(skip(self))]
    pub async fn transition(&self, lra_id: &LraId, event: LraEvent) -> Result<LraStatus> {
        let handle = self.handle(lra_id)?;
        let mut entry = handle.state.lock().await;
        let before = entry.lra.clone();
        let status = entry.lra.apply(event, self.clock.now())?;
        if entry.lra != before {
            self.persist(&entry.lra).await?;
        }
        Ok(status)
    }

    /// Replace the LRA's own time limit. Returns the new effective deadline.
    #[instrument(skip(self))]
    pub async fn renew_timeout(&self, lra_id: &LraId, timeout: Duration) -> Result<Option<Timestamp>> {
        let handle = self.handle(lra_id)?;
        let mut entry = handle.state.lock().await;
        entry.lra.renew(self.clock.now(), timeout)?;
        self.persist(&entry.lra).await?;
        info!(lra_id = %lra_id, deadline = ?entry.lra.deadline, "LRA time limit renewed");
        Ok(entry.effective_deadline())
    }

    /// Write an LRA record through to the store.
    pub async fn persist(&self, lra: &Lra) -> Result<()> {
        self.store.save_lra(lra).await
    }

    /// Forget an LRA entirely, together with its participants.
    #[instrument(skip(self))]
    pub async fn remove(&self, lra_id: &LraId) -> Result<()> {
        self.store.remove_lra(lra_id).await?;
        if let Some((_, handle)) = self.lras.remove(lra_id) {
            let parent_id = handle.state.lock().await.lra.parent_id.clone();
            if let Some(parent) = parent_id.and_then(|p| self.handle(&p).ok()) {
                parent.state.lock().await.children.retain(|c| c != lra_id);
            }
        }
        debug!(lra_id = %lra_id, "LRA removed");
        Ok(())
    }

    /// Rebuild the registry from persisted records. Returns the restored LRAs.
    pub fn restore(&self, stored: StoredState) -> Vec<LraEntry> {
        let mut entries: BTreeMap<LraId, LraEntry> = stored
            .lras
            .into_iter()
            .map(|lra| (lra.id.clone(), LraEntry::new(lra)))
            .collect();

        for participant in stored.participants {
            if let Some(entry) = entries.get_mut(&participant.lra_id) {
                entry.participants.insert(participant);
            }
        }

        let links: Vec<(LraId, LraId)> = entries
            .values()
            .filter_map(|e| e.lra.parent_id.clone().map(|p| (p, e.lra.id.clone())))
            .collect();
        for (parent_id, child_id) in links {
            if let Some(parent) = entries.get_mut(&parent_id) {
                parent.children.push(child_id);
            }
        }

        let restored: Vec<LraEntry> = entries.into_values().collect();
        for entry in &restored {
            self.insert(entry.clone());
        }
        info!(count = restored.len(), "LRAs restored from store");
        restored
    }

    // --- Private methods ---

    fn insert(&self, entry: LraEntry) {
        let id = entry.lra.id.clone();
        self.lras.insert(id, Arc::new(LraHandle::new(entry)));
    }

    /// `filter` also learns whether a terminal LRA is held for its parent.
    async fn list<F>(&self, filter: F) -> Vec<LraInfo>
    where
        F: Fn(&Lra, bool) -> bool,
    {
        let now = self.clock.now();
        let mut snapshot = BTreeMap::new();
        for handle in self.handles() {
            let lra = handle.snapshot().await;
            snapshot.insert(lra.id.clone(), lra);
        }

        let mut infos = Vec::new();
        for lra in snapshot.values() {
            let held = lra.is_terminal()
                && lra
                    .parent_id
                    .as_ref()
                    .and_then(|parent_id| snapshot.get(parent_id))
                    .map_or(false, |parent| !parent.is_terminal());
            if filter(lra, held) {
                infos.push(lra.info(now));
            }
        }
        infos.sort_by(|a, b| (a.start_time, &a.lra_id).cmp(&(b.start_time, &b.lra_id)));
        infos
    }
}
