//! Participant enlistment records.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::time::{deadline_after, Timestamp};
use crate::{LraError, LraId, LraStatus, Outcome, ParticipantId};

/// Callback endpoints registered by a participant. Absent endpoints denote
/// capabilities the participant does not offer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoints {
    pub complete: Option<String>,
    pub compensate: Option<String>,
    pub status: Option<String>,
    pub forget: Option<String>,
    pub leave: Option<String>,
}

impl Endpoints {
    /// Conventional endpoint set rooted at `base`.
    pub fn from_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            complete: Some(format!("{}/complete", base)),
            compensate: Some(format!("{}/compensate", base)),
            status: Some(format!("{}/status", base)),
            forget: Some(format!("{}/forget", base)),
            leave: Some(format!("{}/leave", base)),
        }
    }

    /// Drop the status endpoint.
    pub fn without_status(mut self) -> Self {
        self.status = None;
        self
    }

    /// Drop the forget endpoint.
    pub fn without_forget(mut self) -> Self {
        self.forget = None;
        self
    }

    /// Drop the complete endpoint.
    pub fn without_complete(mut self) -> Self {
        self.complete = None;
        self
    }

    /// Drop the compensate endpoint.
    pub fn without_compensate(mut self) -> Self {
        self.compensate = None;
        self
    }

    /// Endpoint to call for the given outcome.
    pub fn for_outcome(&self, outcome: Outcome) -> Option<&str> {
        match outcome {
            Outcome::Complete => self.complete.as_deref(),
            Outcome::Compensate => self.compensate.as_deref(),
        }
    }

    /// Whether no termination endpoint is registered at all.
    pub fn is_empty(&self) -> bool {
        self.complete.is_none() && self.compensate.is_none() && self.status.is_none()
    }
}

/// A participant enlisted in an LRA.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    /// Enlistment id.
    pub id: ParticipantId,
    /// Owning LRA.
    pub lra_id: LraId,
    /// Callback endpoints.
    pub endpoints: Endpoints,
    /// Opaque data returned verbatim on every callback.
    pub data: Option<String>,
    /// Per-participant status. `Active` until a termination call is issued.
    pub status: LraStatus,
    /// The participant acknowledged the outcome as in progress.
    pub accepted: bool,
    /// A terminal status was observed and the participant asked to be told to forget it.
    pub forget_pending: bool,
    /// Failed callback attempts so far.
    pub pending_retries: u32,
    /// Last callback failure.
    pub last_error: Option<String>,
    /// When the participant enlisted.
    pub enlisted_at: Timestamp,
    /// After this instant an unfinished LRA is cancelled on the participant's behalf.
    pub time_limit: Option<Timestamp>,
}

impl ParticipantRecord {
    /// Create a new participant record.
    pub fn new(
        lra_id: LraId,
        endpoints: Endpoints,
        data: Option<String>,
        time_limit: Option<Duration>,
        now: Timestamp,
    ) -> Self {
        Self {
            id: ParticipantId::new(),
            lra_id,
            endpoints,
            data,
            status: LraStatus::Active,
            accepted: false,
            forget_pending: false,
            pending_retries: 0,
            last_error: None,
            enlisted_at: now,
            time_limit: time_limit.and_then(|limit| deadline_after(now, limit)),
        }
    }

    /// Whether the participant reached a final status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the participant still needs driving towards an outcome.
    pub fn is_pending(&self) -> bool {
        !self.is_terminal()
    }

    /// Record a status reported by the participant itself.
    ///
    /// Only `Completing -> Completed | FailedToComplete` and
    /// `Compensating -> Compensated | FailedToCompensate` are accepted;
    /// reporting the current status again is a no-op.
    pub fn record_status(&mut self, status: LraStatus) -> Result<(), LraError> {
        if status == self.status {
            return Ok(());
        }
        if !self.status.is_in_progress() || !self.status.can_transition_to(status) {
            return Err(LraError::InvalidState {
                lra_id: self.lra_id.clone(),
                status: self.status,
                operation: format!("record participant status {} in", status),
            });
        }
        self.status = status;
        self.accepted = false;
        if status.is_failed() && self.endpoints.forget.is_some() {
            self.forget_pending = true;
        }
        Ok(())
    }
}
