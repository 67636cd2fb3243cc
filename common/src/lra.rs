//! LRA record and its state machine.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::time::{deadline_after, epoch_millis, Timestamp};
use crate::{LraError, LraEvent, LraId, LraStatus};

/// A Long Running Action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lra {
    /// Unique LRA identifier.
    pub id: LraId,
    /// Enclosing LRA, `None` for top-level LRAs.
    pub parent_id: Option<LraId>,
    /// Client supplied label.
    pub client_id: String,
    /// Current status.
    pub status: LraStatus,
    /// When the LRA was started.
    pub created_at: Timestamp,
    /// When the LRA is cancelled automatically, `None` if never.
    pub deadline: Option<Timestamp>,
    /// When close, cancel or the deadline moved the LRA out of `Active`.
    pub finish_requested_at: Option<Timestamp>,
    /// When the LRA reached a terminal status.
    pub finished_at: Option<Timestamp>,
    /// Some participant has not reached a terminal status after a termination pass.
    pub recovering: bool,
    /// Cancellation was triggered by a deadline rather than by a client.
    pub timed_out: bool,
}

impl Lra {
    /// Create a new active LRA.
    pub fn new(
        id: LraId,
        parent_id: Option<LraId>,
        client_id: impl Into<String>,
        created_at: Timestamp,
        timeout: Duration,
    ) -> Self {
        Self {
            id,
            parent_id,
            client_id: client_id.into(),
            status: LraStatus::Active,
            created_at,
            deadline: deadline_after(created_at, timeout),
            finish_requested_at: None,
            finished_at: None,
            recovering: false,
            timed_out: false,
        }
    }

    /// Whether the LRA has no parent.
    pub fn is_top_level(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Whether the LRA reached a final status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the LRA is still active with its deadline in the past.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.status == LraStatus::Active && self.deadline.map_or(false, |d| d <= now)
    }

    /// Apply a state machine event.
    ///
    /// Re-requesting the outcome the LRA is already heading for (or has
    /// reached) is a no-op returning the current status. A deadline firing on
    /// an LRA that already left `Active` is ignored.
    pub fn apply(&mut self, event: LraEvent, now: Timestamp) -> Result<LraStatus, LraError> {
        use LraStatus::*;

        let next = match (event, self.status) {
            (LraEvent::Close, Active) => Completing,
            (LraEvent::Cancel, Active) | (LraEvent::TimeoutFired, Active) => Compensating,
            (LraEvent::Close, current @ (Completing | Completed | FailedToComplete)) => {
                return Ok(current)
            }
            (LraEvent::Cancel, current @ (Compensating | Compensated | FailedToCompensate)) => {
                return Ok(current)
            }
            (LraEvent::TimeoutFired, current) => return Ok(current),
            (LraEvent::ParticipantsFinished, Completing) => Completed,
            (LraEvent::ParticipantsFinished, Compensating) => Compensated,
            (LraEvent::ParticipantsFailed, Completing) => FailedToComplete,
            (LraEvent::ParticipantsFailed, Compensating) => FailedToCompensate,
            (LraEvent::ParticipantsFinished | LraEvent::ParticipantsFailed, current)
                if current.is_terminal() =>
            {
                return Ok(current)
            }
            (event, from) => {
                return Err(LraError::InvalidStateTransition {
                    lra_id: self.id.clone(),
                    from,
                    event,
                })
            }
        };

        debug_assert!(self.status.can_transition_to(next));

        if self.status == Active {
            self.finish_requested_at = Some(now);
            self.timed_out = event == LraEvent::TimeoutFired;
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
            self.recovering = false;
        }
        self.status = next;
        Ok(next)
    }

    /// Cancel a nested LRA that already closed, so its participants are
    /// compensated. Callers check that the parent has not terminated.
    pub fn reopen_for_compensation(&mut self, now: Timestamp) -> Result<LraStatus, LraError> {
        if self.is_top_level() || self.status != LraStatus::Completed {
            return Err(LraError::InvalidStateTransition {
                lra_id: self.id.clone(),
                from: self.status,
                event: LraEvent::Cancel,
            });
        }
        self.status = LraStatus::Compensating;
        self.finish_requested_at = Some(now);
        self.finished_at = None;
        self.recovering = false;
        Ok(self.status)
    }

    /// Replace the deadline with `timeout` from now. Only legal while active.
    pub fn renew(&mut self, now: Timestamp, timeout: Duration) -> Result<Option<Timestamp>, LraError> {
        if self.status != LraStatus::Active {
            return Err(LraError::InvalidState {
                lra_id: self.id.clone(),
                status: self.status,
                operation: "renew the time limit of".to_string(),
            });
        }
        self.deadline = deadline_after(now, timeout);
        Ok(self.deadline)
    }

    /// Externally visible summary.
    pub fn info(&self, now: Timestamp) -> LraInfo {
        LraInfo {
            lra_id: self.id.clone(),
            client_id: self.client_id.clone(),
            status: self.status,
            is_complete: self.status == LraStatus::Completed,
            is_compensated: self.status == LraStatus::Compensated,
            is_recovering: self.recovering,
            is_active: self.status == LraStatus::Active,
            is_top_level: self.is_top_level(),
            start_time: epoch_millis(self.created_at),
            finish_time: self
                .finished_at
                .or(self.deadline)
                .map(epoch_millis)
                .unwrap_or(0),
            time_now: epoch_millis(now),
        }
    }
}

/// Snapshot of an LRA as reported by the query operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LraInfo {
    pub lra_id: LraId,
    pub client_id: String,
    pub status: LraStatus,
    pub is_complete: bool,
    pub is_compensated: bool,
    pub is_recovering: bool,
    pub is_active: bool,
    pub is_top_level: bool,
    /// Epoch millis when the LRA started.
    pub start_time: i64,
    /// Epoch millis when it finished, or its deadline while still running; 0 if neither.
    pub finish_time: i64,
    /// Epoch millis when the snapshot was taken.
    pub time_now: i64,
}
