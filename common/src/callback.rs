//! Participant callback contract.
//!
//! The coordinator never talks to a participant directly: every termination,
//! status or forget call goes through a [`ParticipantTransport`] that maps the
//! wire response onto one of three [`CallbackOutcome`]s.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{LraId, LraStatus, Outcome, ParticipantId};

/// Header carrying the LRA id on every request and callback.
pub const LRA_HTTP_HEADER: &str = "Long-Running-Action";

/// Header carrying the participant's recovery id on callbacks.
pub const LRA_HTTP_RECOVERY_HEADER: &str = "Long-Running-Action-Recovery";

/// Which participant endpoint a callback targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackKind {
    Complete,
    Compensate,
    Status,
    Forget,
}

impl CallbackKind {
    /// Termination call for an outcome.
    pub fn for_outcome(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Complete => CallbackKind::Complete,
            Outcome::Compensate => CallbackKind::Compensate,
        }
    }
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackKind::Complete => f.write_str("complete"),
            CallbackKind::Compensate => f.write_str("compensate"),
            CallbackKind::Status => f.write_str("status"),
            CallbackKind::Forget => f.write_str("forget"),
        }
    }
}

/// A single callback to a participant endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackRequest {
    pub kind: CallbackKind,
    pub lra_id: LraId,
    pub participant_id: ParticipantId,
    /// Resolved endpoint address.
    pub endpoint: String,
    /// Direction the LRA is terminating in.
    pub outcome: Outcome,
    /// Opaque enlistment data.
    pub data: Option<String>,
}

impl CallbackRequest {
    /// Id a participant can use to refer to its enlistment.
    pub fn recovery_id(&self) -> String {
        format!("{}/{}", self.lra_id, self.participant_id)
    }
}

/// Interpreted participant response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// The participant reached (or reports) a terminal status.
    Finished(LraStatus),
    /// Accepted, the participant will finish asynchronously.
    InProgress,
    /// Unreachable, timed out or answered something unparseable.
    Failed(String),
}

impl CallbackOutcome {
    /// Outcome for a participant that answered a status poll.
    pub fn from_reported_status(status: LraStatus) -> Self {
        if status.is_terminal() {
            CallbackOutcome::Finished(status)
        } else if status.is_in_progress() {
            CallbackOutcome::InProgress
        } else {
            CallbackOutcome::Failed(format!("participant reported {}", status))
        }
    }
}

/// Delivers callbacks to participants.
#[async_trait]
pub trait ParticipantTransport: Send + Sync {
    /// Invoke one participant endpoint. Implementations never panic or hang
    /// on participant misbehaviour; failures come back as
    /// [`CallbackOutcome::Failed`].
    async fn invoke(&self, request: &CallbackRequest) -> CallbackOutcome;
}
