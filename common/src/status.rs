//! LRA status enumeration, termination outcomes and state machine events.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::LraError;

/// Status shared by LRAs and their participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LraStatus {
    /// Open for work and enlistment.
    Active,
    /// Close requested, participants being completed.
    Completing,
    /// All participants completed.
    Completed,
    /// At least one participant can never complete.
    FailedToComplete,
    /// Cancel requested or deadline passed, participants being compensated.
    Compensating,
    /// All participants compensated.
    Compensated,
    /// At least one participant can never compensate.
    FailedToCompensate,
}

impl LraStatus {
    /// Check if this is a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LraStatus::Completed
                | LraStatus::FailedToComplete
                | LraStatus::Compensated
                | LraStatus::FailedToCompensate
        )
    }

    /// Terminal, but the outcome could not be honoured.
    pub fn is_failed(&self) -> bool {
        matches!(self, LraStatus::FailedToComplete | LraStatus::FailedToCompensate)
    }

    /// Termination started but not finished.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, LraStatus::Completing | LraStatus::Compensating)
    }

    /// Get valid next states from current state.
    pub fn valid_transitions(&self) -> &[LraStatus] {
        match self {
            LraStatus::Active => &[LraStatus::Completing, LraStatus::Compensating],
            LraStatus::Completing => &[LraStatus::Completed, LraStatus::FailedToComplete],
            LraStatus::Compensating => &[LraStatus::Compensated, LraStatus::FailedToCompensate],
            LraStatus::Completed
            | LraStatus::FailedToComplete
            | LraStatus::Compensated
            | LraStatus::FailedToCompensate => &[],
        }
    }

    /// Check if transition to given state is valid.
    pub fn can_transition_to(&self, next: LraStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// The termination direction this status belongs to, if any.
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            LraStatus::Active => None,
            LraStatus::Completing | LraStatus::Completed | LraStatus::FailedToComplete => {
                Some(Outcome::Complete)
            }
            LraStatus::Compensating | LraStatus::Compensated | LraStatus::FailedToCompensate => {
                Some(Outcome::Compensate)
            }
        }
    }

    /// Canonical name, as carried on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            LraStatus::Active => "Active",
            LraStatus::Completing => "Completing",
            LraStatus::Completed => "Completed",
            LraStatus::FailedToComplete => "FailedToComplete",
            LraStatus::Compensating => "Compensating",
            LraStatus::Compensated => "Compensated",
            LraStatus::FailedToCompensate => "FailedToCompensate",
        }
    }
}

impl fmt::Display for LraStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LraStatus {
    type Err = LraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_matches('"') {
            "Active" => Ok(LraStatus::Active),
            "Completing" => Ok(LraStatus::Completing),
            "Completed" => Ok(LraStatus::Completed),
            "FailedToComplete" => Ok(LraStatus::FailedToComplete),
            "Compensating" => Ok(LraStatus::Compensating),
            "Compensated" => Ok(LraStatus::Compensated),
            "FailedToCompensate" => Ok(LraStatus::FailedToCompensate),
            other => Err(LraError::CommunicationFailure(format!(
                "unrecognised status '{}'",
                other
            ))),
        }
    }
}

/// Direction in which an LRA is terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Complete,
    Compensate,
}

impl Outcome {
    /// Status while participants are being driven.
    pub fn in_progress_status(&self) -> LraStatus {
        match self {
            Outcome::Complete => LraStatus::Completing,
            Outcome::Compensate => LraStatus::Compensating,
        }
    }

    /// Status once every participant honoured the outcome.
    pub fn success_status(&self) -> LraStatus {
        match self {
            Outcome::Complete => LraStatus::Completed,
            Outcome::Compensate => LraStatus::Compensated,
        }
    }

    /// Status when a participant can never honour the outcome.
    pub fn failure_status(&self) -> LraStatus {
        match self {
            Outcome::Complete => LraStatus::FailedToComplete,
            Outcome::Compensate => LraStatus::FailedToCompensate,
        }
    }

    /// Whether a status belongs to this direction.
    pub fn matches(&self, status: LraStatus) -> bool {
        status.outcome() == Some(*self)
    }

    /// Client event requesting this outcome.
    pub fn event(&self) -> LraEvent {
        match self {
            Outcome::Complete => LraEvent::Close,
            Outcome::Compensate => LraEvent::Cancel,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Complete => f.write_str("complete"),
            Outcome::Compensate => f.write_str("compensate"),
        }
    }
}

/// Events accepted by the LRA state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LraEvent {
    /// Client asked to close.
    Close,
    /// Client asked to cancel.
    Cancel,
    /// The deadline (or a participant time limit) elapsed.
    TimeoutFired,
    /// Every participant reached the requested outcome.
    ParticipantsFinished,
    /// Every participant is terminal and at least one failed.
    ParticipantsFailed,
}
