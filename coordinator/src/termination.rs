//! Termination driver: completes or compensates the participants of an LRA.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture, FutureExt};
use tracing::{debug, info, instrument, warn};

use lra_common::{
    CallbackOutcome, CallbackRequest, Clock, LraEvent, LraId, LraStatus, Outcome,
    ParticipantTransport, Result,
};

use crate::lra_registry::{LraEntry, LraHandle, LraRegistry};
use crate::metrics::SharedMetrics;
use crate::participant_registry::Applied;
use crate::scheduler::TimeoutScheduler;
use crate::store::SharedStore;

/// What to do when another termination pass of the same LRA is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassMode {
    /// Wait for it to finish, then run.
    Wait,
    /// Leave the LRA to the pass already running.
    SkipIfBusy,
}

/// Drives participants towards the outcome chosen for their LRA.
///
/// A pass sends every pending participant exactly one callback, concurrently
/// and without holding the LRA's state lock, each bounded by the callback
/// timeout. Failures and in-progress answers leave the participant pending and
/// the LRA `recovering`; they are never reported to the caller as errors.
pub struct TerminationDriver {
    /// LRA registry.
    lras: Arc<LraRegistry>,
    /// Participant callback delivery.
    transport: Arc<dyn ParticipantTransport>,
    /// Deadline timers, disarmed once an LRA leaves `Active`.
    scheduler: Arc<TimeoutScheduler>,
    /// Durable store.
    store: SharedStore,
    /// Time source.
    clock: Arc<dyn Clock>,
    /// Callback and lifecycle counters.
    metrics: SharedMetrics,
    /// Upper bound for a single participant callback.
    callback_timeout: Duration,
}

impl TerminationDriver {
    /// Create a new termination driver.
    pub fn new(
        lras: Arc<LraRegistry>,
        transport: Arc<dyn ParticipantTransport>,
        scheduler: Arc<TimeoutScheduler>,
        store: SharedStore,
        clock: Arc<dyn Clock>,
        metrics: SharedMetrics,
        callback_timeout: Duration,
    ) -> Self {
        Self {
            lras,
            transport,
            scheduler,
            store,
            clock,
            metrics,
            callback_timeout,
        }
    }

    /// Close an LRA: complete its participants.
    #[instrument(skip(self))]
    pub async fn close(&self, lra_id: &LraId) -> Result<LraStatus> {
        self.terminate(lra_id, Some(LraEvent::Close), PassMode::Wait).await
    }

    /// Cancel an LRA: compensate its participants.
    ///
    /// A nested LRA that already closed can still be cancelled while its
    /// parent has not terminated; its completed participants are then
    /// compensated.
    #[instrument(skip(self))]
    pub async fn cancel(&self, lra_id: &LraId) -> Result<LraStatus> {
        let lra = self.lras.get(lra_id).await?;
        if let (Some(parent_id), LraStatus::Completed) = (&lra.parent_id, lra.status) {
            if let Some(status) = self.cancel_closed_nested(lra_id, parent_id).await? {
                return Ok(status);
            }
        }
        self.terminate(lra_id, Some(LraEvent::Cancel), PassMode::Wait).await
    }

    /// Cancel an LRA whose deadline or participant time limit elapsed.
    /// Does nothing if the LRA is no longer active or the deadline moved.
    #[instrument(skip(self))]
    pub async fn expire(&self, lra_id: &LraId) -> Result<LraStatus> {
        self.terminate(lra_id, Some(LraEvent::TimeoutFired), PassMode::SkipIfBusy)
            .await
    }

    /// Run another pass for an LRA that is completing or compensating.
    #[instrument(skip(self))]
    pub async fn resume(&self, lra_id: &LraId, mode: PassMode) -> Result<LraStatus> {
        self.terminate(lra_id, None, mode).await
    }

    /// Send outstanding forget callbacks of a finished LRA.
    #[instrument(skip(self))]
    pub async fn flush_forgets(&self, lra_id: &LraId) -> Result<()> {
        let handle = self.lras.handle(lra_id)?;
        let Ok(_pass) = handle.termination.try_lock() else {
            return Ok(());
        };
        self.send_forgets(&handle).await
    }

    // --- Private methods ---

    fn terminate<'a>(
        &'a self,
        lra_id: &'a LraId,
        event: Option<LraEvent>,
        mode: PassMode,
    ) -> BoxFuture<'a, Result<LraStatus>> {
        async move {
            let handle = self.lras.handle(lra_id)?;
            let _pass = match mode {
                PassMode::Wait => handle.termination.lock().await,
                PassMode::SkipIfBusy => match handle.termination.try_lock() {
                    Ok(guard) => guard,
                    Err(_) => {
                        debug!(lra_id = %lra_id, "Termination pass already running");
                        return Ok(handle.snapshot().await.status);
                    }
                },
            };

            let (outcome, children) = {
                let mut entry = handle.state.lock().await;
                if let Some(event) = event {
                    if let Some(status) = self.request(&mut entry, event).await? {
                        return Ok(status);
                    }
                }
                match entry.lra.status.outcome() {
                    Some(outcome) if entry.lra.status.is_in_progress() => {
                        (outcome, entry.children.clone())
                    }
                    _ => return Ok(entry.lra.status),
                }
            };

            for child in &children {
                self.terminate_child(child, outcome).await;
            }

            self.run_pass(&handle, outcome).await?;
            let status = self.settle(&handle, &children).await?;
            self.send_forgets(&handle).await?;
            if status.is_terminal() {
                for child in &children {
                    if let Err(e) = self.flush_forgets(child).await {
                        debug!(lra_id = %child, error = %e, "Nested forgets left for recovery");
                    }
                }
            }
            Ok(status)
        }
        .boxed()
    }

    /// Reopen a closed nested LRA for compensation and drive it. Returns
    /// `None` when the parent is gone or terminated, leaving the strict rules.
    async fn cancel_closed_nested(
        &self,
        lra_id: &LraId,
        parent_id: &LraId,
    ) -> Result<Option<LraStatus>> {
        let Ok(parent) = self.lras.handle(parent_id) else {
            return Ok(None);
        };
        // parent passes take the child's lock after their own
        let _parent_pass = parent.termination.lock().await;
        if parent.snapshot().await.is_terminal() {
            return Ok(None);
        }

        {
            let handle = self.lras.handle(lra_id)?;
            let _pass = handle.termination.lock().await;
            let mut entry = handle.state.lock().await;
            if entry.lra.status == LraStatus::Completed {
                entry.lra.reopen_for_compensation(self.clock.now())?;
                for record in entry.participants.reopen_completed() {
                    self.store.save_participant(&record).await?;
                }
                self.lras.persist(&entry.lra).await?;
                self.metrics.closed_lra_cancelled();
                info!(lra_id = %lra_id, parent_id = %parent_id, "Closed nested LRA cancelled, compensating");
            }
        }

        self.resume(lra_id, PassMode::Wait).await.map(Some)
    }

    /// Apply a client or timer event. Returns a status when there is nothing
    /// left for this call to do.
    async fn request(
        &self,
        entry: &mut LraEntry,
        event: LraEvent,
    ) -> Result<Option<LraStatus>> {
        let now = self.clock.now();
        let lra_id = entry.lra.id.clone();

        if event == LraEvent::TimeoutFired && !entry.is_expired(now) {
            if entry.lra.status == LraStatus::Active {
                self.scheduler.schedule(&lra_id, entry.effective_deadline());
            }
            return Ok(Some(entry.lra.status));
        }

        let before = entry.lra.status;
        let status = entry.lra.apply(event, now)?;
        if before == LraStatus::Active && status != LraStatus::Active {
            self.scheduler.cancel(&lra_id);
            match event {
                LraEvent::Close => self.metrics.lra_closed(),
                LraEvent::Cancel => self.metrics.lra_cancelled(),
                LraEvent::TimeoutFired => {
                    warn!(lra_id = %lra_id, "LRA time limit elapsed, compensating");
                    self.metrics.lra_timed_out();
                }
                _ => {}
            }
            info!(lra_id = %lra_id, status = %status, "LRA termination requested");
            self.lras.persist(&entry.lra).await?;
        }
        Ok(None)
    }

    /// Drive a nested LRA along with its parent. Children that already
    /// reached a terminal status keep it.
    async fn terminate_child(&self, child: &LraId, outcome: Outcome) {
        let event = match self.lras.status(child).await {
            Err(_) => return,
            Ok(status) if status.is_terminal() => return,
            Ok(LraStatus::Active) => Some(outcome.event()),
            Ok(_) => None,
        };

        if let Err(e) = self.terminate(child, event, PassMode::Wait).await {
            warn!(lra_id = %child, error = %e, "Nested LRA could not be terminated with its parent");
        }
    }

    async fn run_pass(&self, handle: &LraHandle, outcome: Outcome) -> Result<()> {
        let calls = {
            let mut entry = handle.state.lock().await;
            let calls = entry.participants.plan(handle.id(), outcome);
            for participant in entry.participants.iter() {
                self.store.save_participant(participant).await?;
            }
            calls
        };

        if calls.is_empty() {
            return Ok(());
        }
        debug!(lra_id = %handle.id(), calls = calls.len(), outcome = %outcome, "Termination pass");

        let results = join_all(calls.iter().map(|call| self.invoke(call))).await;
        self.apply_results(handle, &calls, results).await
    }

    async fn send_forgets(&self, handle: &LraHandle) -> Result<()> {
        if self.held_for_parent(handle).await {
            return Ok(());
        }
        let calls = handle.state.lock().await.participants.plan_forgets(handle.id());
        if calls.is_empty() {
            return Ok(());
        }

        let results = join_all(calls.iter().map(|call| self.invoke(call))).await;
        self.apply_results(handle, &calls, results).await
    }

    /// A closed nested LRA keeps its participants until the parent
    /// terminates, since a cancel may still compensate them.
    async fn held_for_parent(&self, handle: &LraHandle) -> bool {
        let lra = handle.snapshot().await;
        match (&lra.parent_id, lra.status) {
            (Some(parent_id), LraStatus::Completed) => self
                .lras
                .status(parent_id)
                .await
                .map_or(false, |status| !status.is_terminal()),
            _ => false,
        }
    }

    async fn apply_results(
        &self,
        handle: &LraHandle,
        calls: &[CallbackRequest],
        results: Vec<CallbackOutcome>,
    ) -> Result<()> {
        let mut entry = handle.state.lock().await;
        for (call, result) in calls.iter().zip(results) {
            match entry.participants.apply(call, result) {
                Applied::Updated(record) => self.store.save_participant(&record).await?,
                Applied::Forgotten(participant_id) => {
                    info!(lra_id = %handle.id(), participant_id = %participant_id, "Participant forgotten");
                    self.store.remove_participant(handle.id(), &participant_id).await?
                }
                Applied::Skipped => {}
            }
        }
        Ok(())
    }

    async fn invoke(&self, call: &CallbackRequest) -> CallbackOutcome {
        self.metrics.callback_sent(call.kind);

        let result = match tokio::time::timeout(self.callback_timeout, self.transport.invoke(call)).await {
            Ok(result) => result,
            Err(_) => CallbackOutcome::Failed(format!(
                "{} timed out after {}ms",
                call.kind,
                self.callback_timeout.as_millis()
            )),
        };

        match &result {
            CallbackOutcome::Failed(reason) => {
                self.metrics.callback_failed();
                warn!(
                    lra_id = %call.lra_id,
                    participant_id = %call.participant_id,
                    kind = %call.kind,
                    reason = %reason,
                    "Participant callback failed, left for recovery"
                );
            }
            CallbackOutcome::Finished(status) if status.is_failed() => {
                warn!(
                    lra_id = %call.lra_id,
                    participant_id = %call.participant_id,
                    status = %status,
                    "Participant cannot honour the outcome"
                );
            }
            _ => {}
        }
        result
    }

    /// Finish the LRA if every participant and nested LRA is terminal,
    /// otherwise mark it recovering.
    async fn settle(&self, handle: &LraHandle, children: &[LraId]) -> Result<LraStatus> {
        let mut children_done = true;
        for child in children {
            if let Ok(status) = self.lras.status(child).await {
                children_done &= status.is_terminal();
            }
        }

        let mut entry = handle.state.lock().await;
        if !entry.lra.status.is_in_progress() {
            return Ok(entry.lra.status);
        }

        let pending = entry.participants.pending_count();
        if pending == 0 && children_done {
            let event = if entry.participants.any_failed() {
                LraEvent::ParticipantsFailed
            } else {
                LraEvent::ParticipantsFinished
            };
            let status = entry.lra.apply(event, self.clock.now())?;
            info!(lra_id = %handle.id(), status = %status, "LRA finished");
        } else {
            if !entry.lra.recovering {
                info!(lra_id = %handle.id(), pending, children_done, "LRA left for recovery");
            }
            entry.lra.recovering = true;
        }

        self.lras.persist(&entry.lra).await?;
        Ok(entry.lra.status)
    }
}
