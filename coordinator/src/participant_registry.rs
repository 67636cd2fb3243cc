//! Participant enlistment per LRA.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Duration;
use tracing::{info, instrument, warn};

use lra_common::{
    CallbackKind, CallbackOutcome, CallbackRequest, Clock, Endpoints, LraError, LraId, LraStatus,
    Outcome, ParticipantId, ParticipantRecord, Result, Timestamp,
};

use crate::lra_registry::{LraEntry, LraRegistry};
use crate::metrics::SharedMetrics;
use crate::scheduler::TimeoutScheduler;
use crate::store::SharedStore;

/// Effect of a callback result on the participant set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// The record changed and must be persisted.
    Updated(ParticipantRecord),
    /// The participant acknowledged forget and was removed.
    Forgotten(ParticipantId),
    /// The participant left or was forgotten while the call was in flight.
    Skipped,
}

/// Participants of a single LRA.
#[derive(Debug, Clone, Default)]
pub struct ParticipantSet {
    participants: BTreeMap<ParticipantId, ParticipantRecord>,
    left: BTreeSet<ParticipantId>,
}

impl ParticipantSet {
    /// Add a record.
    pub fn insert(&mut self, record: ParticipantRecord) {
        self.participants.insert(record.id, record);
    }

    /// Look up a participant.
    pub fn get(&self, participant_id: &ParticipantId) -> Option<&ParticipantRecord> {
        self.participants.get(participant_id)
    }

    /// Current participant enlisted with exactly these endpoints.
    pub fn find_by_endpoints(&self, endpoints: &Endpoints) -> Option<&ParticipantRecord> {
        self.participants.values().find(|p| &p.endpoints == endpoints)
    }

    /// Remove a participant, remembering that it left.
    pub fn leave(&mut self, participant_id: &ParticipantId) -> Option<ParticipantRecord> {
        let removed = self.participants.remove(participant_id);
        if removed.is_some() {
            self.left.insert(*participant_id);
        }
        removed
    }

    /// Whether the participant left the LRA.
    pub fn has_left(&self, participant_id: &ParticipantId) -> bool {
        self.left.contains(participant_id)
    }

    /// Remove a participant record for good.
    pub fn remove(&mut self, participant_id: &ParticipantId) -> Option<ParticipantRecord> {
        self.participants.remove(participant_id)
    }

    /// All current participants.
    pub fn iter(&self) -> impl Iterator<Item = &ParticipantRecord> {
        self.participants.values()
    }

    /// Number of current participants.
    pub fn len(&self) -> usize {
        self.participants.len()
    }

    /// Whether there are no current participants.
    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Participants not yet in a terminal status.
    pub fn pending_count(&self) -> usize {
        self.participants.values().filter(|p| p.is_pending()).count()
    }

    /// Whether any participant ended in a `FailedTo*` status.
    pub fn any_failed(&self) -> bool {
        self.participants.values().any(|p| p.status.is_failed())
    }

    /// Whether any participant still waits for a forget callback.
    pub fn has_pending_forgets(&self) -> bool {
        self.participants.values().any(|p| p.forget_pending)
    }

    /// Earliest participant time limit.
    pub fn earliest_time_limit(&self) -> Option<Timestamp> {
        self.participants.values().filter_map(|p| p.time_limit).min()
    }

    /// Make completed participants eligible for compensation again.
    /// Returns the records that changed.
    pub fn reopen_completed(&mut self) -> Vec<ParticipantRecord> {
        let mut reopened = Vec::new();
        for participant in self.participants.values_mut() {
            if participant.status == LraStatus::Completed {
                participant.status = LraStatus::Active;
                participant.accepted = false;
                participant.forget_pending = false;
                participant.last_error = None;
                reopened.push(participant.clone());
            }
        }
        reopened
    }

    /// Work out the callbacks of one termination pass.
    ///
    /// Participants that already accepted the outcome and expose a status
    /// endpoint are polled rather than asked again. Participants without an
    /// endpoint for the outcome have nothing to do and are finished directly.
    pub fn plan(&mut self, lra_id: &LraId, outcome: Outcome) -> Vec<CallbackRequest> {
        let mut calls = Vec::new();

        for participant in self.participants.values_mut() {
            if participant.is_terminal() {
                continue;
            }
            if let Some(direction) = participant.status.outcome() {
                if direction != outcome {
                    warn!(
                        lra_id = %lra_id,
                        participant_id = %participant.id,
                        direction = %direction,
                        requested = %outcome,
                        "Participant already driven in the other direction"
                    );
                    continue;
                }
            }

            let (kind, endpoint) = match &participant.endpoints.status {
                Some(status) if participant.accepted => (CallbackKind::Status, Some(status.clone())),
                _ => (
                    CallbackKind::for_outcome(outcome),
                    participant.endpoints.for_outcome(outcome).map(str::to_string),
                ),
            };

            let Some(endpoint) = endpoint else {
                participant.status = outcome.success_status();
                participant.accepted = false;
                continue;
            };

            participant.status = outcome.in_progress_status();
            calls.push(CallbackRequest {
                kind,
                lra_id: lra_id.clone(),
                participant_id: participant.id,
                endpoint,
                outcome,
                data: participant.data.clone(),
            });
        }

        calls
    }

    /// Forget callbacks owed to terminal participants.
    pub fn plan_forgets(&self, lra_id: &LraId) -> Vec<CallbackRequest> {
        self.participants
            .values()
            .filter(|p| p.forget_pending)
            .filter_map(|p| {
                let endpoint = p.endpoints.forget.clone()?;
                let outcome = p.status.outcome()?;
                Some(CallbackRequest {
                    kind: CallbackKind::Forget,
                    lra_id: lra_id.clone(),
                    participant_id: p.id,
                    endpoint,
                    outcome,
                    data: p.data.clone(),
                })
            })
            .collect()
    }

    /// Fold a callback result into the participant's record.
    pub fn apply(&mut self, request: &CallbackRequest, result: CallbackOutcome) -> Applied {
        let Some(participant) = self.participants.get_mut(&request.participant_id) else {
            return Applied::Skipped;
        };

        match (request.kind, result) {
            (CallbackKind::Forget, CallbackOutcome::Failed(reason)) => {
                participant.pending_retries += 1;
                participant.last_error = Some(reason);
            }
            (CallbackKind::Forget, _) => {
                self.participants.remove(&request.participant_id);
                return Applied::Forgotten(request.participant_id);
            }
            (kind, CallbackOutcome::Finished(status))
                if status.is_terminal() && request.outcome.matches(status) =>
            {
                participant.status = status;
                participant.accepted = false;
                participant.last_error = None;
                if participant.endpoints.forget.is_some()
                    && (kind == CallbackKind::Status || status.is_failed())
                {
                    participant.forget_pending = true;
                }
            }
            (kind, CallbackOutcome::Finished(status)) if status.is_terminal() => {
                // finished the other way round, it can never honour this outcome
                warn!(
                    lra_id = %request.lra_id,
                    participant_id = %request.participant_id,
                    kind = %kind,
                    status = %status,
                    requested = %request.outcome,
                    "Participant finished in the opposite direction"
                );
                participant.status = request.outcome.failure_status();
                participant.accepted = false;
                participant.last_error = Some(format!("{} reported {}", kind, status));
                if participant.endpoints.forget.is_some() {
                    participant.forget_pending = true;
                }
            }
            (kind, CallbackOutcome::Finished(status)) => {
                warn!(
                    lra_id = %request.lra_id,
                    participant_id = %request.participant_id,
                    kind = %kind,
                    status = %status,
                    "Participant reported unexpected status"
                );
                participant.pending_retries += 1;
                participant.last_error = Some(format!("{} reported unexpected status {}", kind, status));
            }
            (_, CallbackOutcome::InProgress) => {
                participant.accepted = true;
            }
            (kind, CallbackOutcome::Failed(reason)) => {
                participant.pending_retries += 1;
                participant.last_error = Some(reason);
                if kind != CallbackKind::Status {
                    participant.accepted = false;
                }
            }
        }

        Applied::Updated(participant.clone())
    }
}

/// Manages enlistment, departure and reported status of participants.
pub struct ParticipantRegistry {
    /// LRA registry owning the participant sets.
    lras: Arc<LraRegistry>,
    /// Durable store.
    store: SharedStore,
    /// Deadline timers, re-armed when a participant brings a time limit.
    scheduler: Arc<TimeoutScheduler>,
    /// Time source.
    clock: Arc<dyn Clock>,
    /// Metrics.
    metrics: SharedMetrics,
}

impl ParticipantRegistry {
    /// Create a new participant registry.
    pub fn new(
        lras: Arc<LraRegistry>,
        store: SharedStore,
        scheduler: Arc<TimeoutScheduler>,
        clock: Arc<dyn Clock>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            lras,
            store,
            scheduler,
            clock,
            metrics,
        }
    }

    /// Enlist a participant. Enlisting the same endpoint set twice returns the
    /// existing enlistment.
    #[instrument(skip(self, endpoints, data))]
    pub async fn enlist(
        &self,
        lra_id: &LraId,
        endpoints: Endpoints,
        data: Option<String>,
        time_limit: Option<Duration>,
    ) -> Result<ParticipantId> {
        if endpoints.is_empty() {
            return Err(LraError::InvalidIdentifier(
                "participant registers no termination endpoint".to_string(),
            ));
        }

        let handle = self.lras.handle(lra_id)?;
        let mut entry = handle.state.lock().await;
        ensure_active(&entry, "join")?;

        if let Some(existing) = entry.participants.find_by_endpoints(&endpoints) {
            info!(lra_id = %lra_id, participant_id = %existing.id, "Participant already enlisted");
            return Ok(existing.id);
        }

        let record = ParticipantRecord::new(lra_id.clone(), endpoints, data, time_limit, self.clock.now());
        let participant_id = record.id;
        self.store.save_participant(&record).await?;
        entry.participants.insert(record);

        if time_limit.is_some() {
            self.scheduler.schedule(lra_id, entry.effective_deadline());
        }
        self.metrics.participant_enlisted();

        info!(lra_id = %lra_id, participant_id = %participant_id, "Participant enlisted");
        Ok(participant_id)
    }

    /// Remove a participant without any callback. Leaving twice is a no-op.
    #[instrument(skip(self))]
    pub async fn leave(&self, lra_id: &LraId, participant_id: &ParticipantId) -> Result<()> {
        let handle = self.lras.handle(lra_id)?;
        let mut entry = handle.state.lock().await;

        if entry.participants.has_left(participant_id) {
            return Ok(());
        }
        if entry.participants.get(participant_id).is_none() {
            return Err(participant_not_found(lra_id, participant_id));
        }
        ensure_active(&entry, "leave")?;

        self.store.remove_participant(lra_id, participant_id).await?;
        entry.participants.leave(participant_id);
        self.scheduler.schedule(lra_id, entry.effective_deadline());
        self.metrics.participant_left();

        info!(lra_id = %lra_id, participant_id = %participant_id, "Participant left");
        Ok(())
    }

    /// Drop the record of a participant that reached a terminal status.
    #[instrument(skip(self))]
    pub async fn forget(&self, lra_id: &LraId, participant_id: &ParticipantId) -> Result<()> {
        let handle = self.lras.handle(lra_id)?;
        let mut entry = handle.state.lock().await;

        let participant = entry
            .participants
            .get(participant_id)
            .ok_or_else(|| participant_not_found(lra_id, participant_id))?;
        if !participant.is_terminal() {
            return Err(LraError::InvalidState {
                lra_id: lra_id.clone(),
                status: participant.status,
                operation: "forget a participant of".to_string(),
            });
        }

        self.store.remove_participant(lra_id, participant_id).await?;
        entry.participants.remove(participant_id);
        info!(lra_id = %lra_id, participant_id = %participant_id, "Participant forgotten");
        Ok(())
    }

    /// Record a status reported by the participant itself.
    #[instrument(skip(self))]
    pub async fn record_status(
        &self,
        lra_id: &LraId,
        participant_id: &ParticipantId,
        status: LraStatus,
    ) -> Result<()> {
        let handle = self.lras.handle(lra_id)?;
        let mut entry = handle.state.lock().await;

        let participant = entry
            .participants
            .get(participant_id)
            .ok_or_else(|| participant_not_found(lra_id, participant_id))?;
        let mut updated = participant.clone();
        updated.record_status(status)?;

        self.store.save_participant(&updated).await?;
        entry.participants.insert(updated);
        info!(lra_id = %lra_id, participant_id = %participant_id, status = %status, "Participant status recorded");
        Ok(())
    }

    /// Replace the endpoints and data of a participant while its LRA is active.
    #[instrument(skip(self, endpoints, data))]
    pub async fn update(
        &self,
        lra_id: &LraId,
        participant_id: &ParticipantId,
        endpoints: Endpoints,
        data: Option<String>,
    ) -> Result<()> {
        let handle = self.lras.handle(lra_id)?;
        let mut entry = handle.state.lock().await;
        ensure_active(&entry, "update a participant of")?;

        let mut updated = entry
            .participants
            .get(participant_id)
            .cloned()
            .ok_or_else(|| participant_not_found(lra_id, participant_id))?;
        updated.endpoints = endpoints;
        updated.data = data;

        self.store.save_participant(&updated).await?;
        entry.participants.insert(updated);
        info!(lra_id = %lra_id, participant_id = %participant_id, "Participant updated");
        Ok(())
    }

    /// Copy of a participant record.
    pub async fn get(&self, lra_id: &LraId, participant_id: &ParticipantId) -> Result<ParticipantRecord> {
        let handle = self.lras.handle(lra_id)?;
        let entry = handle.state.lock().await;
        entry
            .participants
            .get(participant_id)
            .cloned()
            .ok_or_else(|| participant_not_found(lra_id, participant_id))
    }

    /// Copies of every participant of an LRA.
    pub async fn list(&self, lra_id: &LraId) -> Result<Vec<ParticipantRecord>> {
        let handle = self.lras.handle(lra_id)?;
        let entry = handle.state.lock().await;
        Ok(entry.participants.iter().cloned().collect())
    }
}

fn ensure_active(entry: &LraEntry, operation: &str) -> Result<()> {
    if entry.lra.status != LraStatus::Active {
        return Err(LraError::InvalidState {
            lra_id: entry.lra.id.clone(),
            status: entry.lra.status,
            operation: operation.to_string(),
        });
    }
    Ok(())
}

fn participant_not_found(lra_id: &LraId, participant_id: &ParticipantId) -> LraError {
    LraError::ParticipantNotFound {
        lra_id: lra_id.clone(),
        participant_id: *participant_id,
    }
}
