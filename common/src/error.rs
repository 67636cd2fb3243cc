//! Error types for LRA coordination.

use crate::{LraEvent, LraId, LraStatus, ParticipantId};
use thiserror::Error;

/// Main error type for LRA operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LraError {
    /// The LRA is unknown or has already been purged.
    #[error("LRA not found: {0}")]
    NotFound(LraId),

    /// The participant is not enlisted with the LRA.
    #[error("Participant {participant_id} not found in LRA {lra_id}")]
    ParticipantNotFound {
        lra_id: LraId,
        participant_id: ParticipantId,
    },

    /// A nested LRA was requested under an unknown parent.
    #[error("Parent LRA not found: {0}")]
    ParentNotFound(LraId),

    /// Operation is not legal in the LRA's current status.
    #[error("Cannot {operation} LRA {lra_id} in status {status}")]
    InvalidState {
        lra_id: LraId,
        status: LraStatus,
        operation: String,
    },

    /// The state machine rejected the event.
    #[error("Invalid transition of LRA {lra_id} from {from} on {event:?}")]
    InvalidStateTransition {
        lra_id: LraId,
        from: LraStatus,
        event: LraEvent,
    },

    /// Malformed identifier.
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Participant unreachable or returned an unparseable response.
    #[error("Communication failure: {0}")]
    CommunicationFailure(String),

    /// A participant reported that it can never complete or compensate.
    #[error("Participant {participant_id} of LRA {lra_id} reported {status}")]
    TerminationFailure {
        lra_id: LraId,
        participant_id: ParticipantId,
        status: LraStatus,
    },

    /// The invocation policy requires an LRA context but none was supplied.
    #[error("LRA context required: {0}")]
    ContextRequired(String),

    /// The invocation policy forbids an LRA context but one was supplied.
    #[error("LRA context not allowed, received {0}")]
    ContextNotAllowed(LraId),

    /// Durable store failure.
    #[error("Store error: {0}")]
    StoreError(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Coordinator is not accepting requests.
    #[error("Coordinator unavailable, retry after {retry_after_ms}ms")]
    CoordinatorUnavailable { retry_after_ms: u64 },
}

impl LraError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LraError::CommunicationFailure(_)
                | LraError::StoreError(_)
                | LraError::CoordinatorUnavailable { .. }
        )
    }

    /// Get suggested retry delay in milliseconds.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            LraError::CoordinatorUnavailable { retry_after_ms } => Some(*retry_after_ms),
            LraError::CommunicationFailure(_) => Some(500),
            LraError::StoreError(_) => Some(1000),
            _ => None,
        }
    }

    /// Stable error code for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            LraError::NotFound(_) => "LRA_NOT_FOUND",
            LraError::ParticipantNotFound { .. } => "PARTICIPANT_NOT_FOUND",
            LraError::ParentNotFound(_) => "PARENT_NOT_FOUND",
            LraError::InvalidState { .. } => "INVALID_STATE",
            LraError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            LraError::InvalidIdentifier(_) => "INVALID_IDENTIFIER",
            LraError::CommunicationFailure(_) => "COMMUNICATION_FAILURE",
            LraError::TerminationFailure { .. } => "TERMINATION_FAILURE",
            LraError::ContextRequired(_) => "CONTEXT_REQUIRED",
            LraError::ContextNotAllowed(_) => "CONTEXT_NOT_ALLOWED",
            LraError::StoreError(_) => "STORE_ERROR",
            LraError::ConfigurationError(_) => "CONFIGURATION_ERROR",
            LraError::CoordinatorUnavailable { .. } => "COORDINATOR_UNAVAILABLE",
        }
    }

    /// Whether the error means the LRA no longer exists.
    pub fn is_not_found(&self) -> bool {
        matches!(self, LraError::NotFound(_) | LraError::ParticipantNotFound { .. })
    }
}

/// Result type alias for LRA operations.
pub type Result<T> = std::result::Result<T, LraError>;
