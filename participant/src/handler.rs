//! Participant callback handlers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

use lra_common::{
    CallbackKind, CallbackOutcome, CallbackRequest, LraId, LraStatus, Outcome, ParticipantId,
    ParticipantTransport,
};

/// What a participant answers to a callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Current or final status of the participant's work.
    Status(LraStatus),
    /// Accepted, the work finishes later.
    Accepted,
    /// The participant no longer knows the LRA.
    Gone,
    /// Transient failure, ask again later.
    Unavailable(String),
}

/// Data passed to a participant callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackContext {
    pub lra_id: LraId,
    pub participant_id: ParticipantId,
    /// `{lra_id}/{participant_id}`.
    pub recovery_id: String,
    /// Data given at enlistment.
    pub data: Option<String>,
}

impl From<&CallbackRequest> for CallbackContext {
    fn from(request: &CallbackRequest) -> Self {
        Self {
            lra_id: request.lra_id.clone(),
            participant_id: request.participant_id,
            recovery_id: request.recovery_id(),
            data: request.data.clone(),
        }
    }
}

/// Trait for handling coordinator callbacks to one participant resource.
#[async_trait]
pub trait ParticipantHandler: Send + Sync {
    /// Confirm the work done under the LRA.
    async fn complete(&self, ctx: &CallbackContext) -> Reply;

    /// Undo the work done under the LRA.
    async fn compensate(&self, ctx: &CallbackContext) -> Reply;

    /// Report progress of an accepted complete or compensate.
    async fn status(&self, _ctx: &CallbackContext) -> Reply {
        Reply::Gone
    }

    /// Drop any record of the LRA.
    async fn forget(&self, _ctx: &CallbackContext) -> Reply {
        Reply::Gone
    }
}

type Callback = Box<dyn Fn(&CallbackContext) -> Reply + Send + Sync>;

/// Handler that forwards callbacks to closures. Missing closures report
/// success.
pub struct FnHandler {
    on_complete: Option<Callback>,
    on_compensate: Option<Callback>,
    on_status: Option<Callback>,
}

impl FnHandler {
    pub fn new() -> Self {
        Self {
            on_complete: None,
            on_compensate: None,
            on_status: None,
        }
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&CallbackContext) -> Reply + Send + Sync + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }

    pub fn on_compensate<F>(mut self, callback: F) -> Self
    where
        F: Fn(&CallbackContext) -> Reply + Send + Sync + 'static,
    {
        self.on_compensate = Some(Box::new(callback));
        self
    }

    pub fn on_status<F>(mut self, callback: F) -> Self
    where
        F: Fn(&CallbackContext) -> Reply + Send + Sync + 'static,
    {
        self.on_status = Some(Box::new(callback));
        self
    }
}

impl Default for FnHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ParticipantHandler for FnHandler {
    async fn complete(&self, ctx: &CallbackContext) -> Reply {
        match &self.on_complete {
            Some(callback) => callback(ctx),
            None => Reply::Status(LraStatus::Completed),
        }
    }

    async fn compensate(&self, ctx: &CallbackContext) -> Reply {
        match &self.on_compensate {
            Some(callback) => callback(ctx),
            None => Reply::Status(LraStatus::Compensated),
        }
    }

    async fn status(&self, ctx: &CallbackContext) -> Reply {
        match &self.on_status {
            Some(callback) => callback(ctx),
            None => Reply::Gone,
        }
    }
}

/// In-process participant transport: routes each callback to the handler
/// mounted at the endpoint's resource URL.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn ParticipantHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount a handler at a resource URL, replacing any previous one.
    pub fn mount(&self, resource_url: impl Into<String>, handler: Arc<dyn ParticipantHandler>) {
        self.handlers.write().insert(resource_url.into(), handler);
    }

    /// Unmount a handler. Callbacks to it fail as if it were unreachable.
    pub fn unmount(&self, resource_url: &str) -> bool {
        self.handlers.write().remove(resource_url).is_some()
    }

    fn resolve(&self, endpoint: &str) -> Option<Arc<dyn ParticipantHandler>> {
        let (resource, _) = endpoint.rsplit_once('/')?;
        self.handlers.read().get(resource).cloned()
    }
}

#[async_trait]
impl ParticipantTransport for HandlerRegistry {
    async fn invoke(&self, request: &CallbackRequest) -> CallbackOutcome {
        let Some(handler) = self.resolve(&request.endpoint) else {
            warn!(endpoint = %request.endpoint, "No participant mounted");
            return CallbackOutcome::Failed(format!("no participant at {}", request.endpoint));
        };

        let ctx = CallbackContext::from(request);
        let reply = match request.kind {
            CallbackKind::Complete => handler.complete(&ctx).await,
            CallbackKind::Compensate => handler.compensate(&ctx).await,
            CallbackKind::Status => handler.status(&ctx).await,
            CallbackKind::Forget => handler.forget(&ctx).await,
        };
        debug!(endpoint = %request.endpoint, reply = ?reply, "Participant replied");

        to_outcome(request.kind, request.outcome, reply)
    }
}

/// Map a participant reply onto a callback outcome.
pub fn to_outcome(kind: CallbackKind, outcome: Outcome, reply: Reply) -> CallbackOutcome {
    match (kind, reply) {
        (_, Reply::Unavailable(reason)) => CallbackOutcome::Failed(reason),
        (CallbackKind::Forget, _) | (_, Reply::Gone) => {
            CallbackOutcome::Finished(outcome.success_status())
        }
        (_, Reply::Accepted) => CallbackOutcome::InProgress,
        (CallbackKind::Status, Reply::Status(status)) => {
            CallbackOutcome::from_reported_status(status)
        }
        (kind, Reply::Status(status)) if !outcome.matches(status) => {
            CallbackOutcome::Failed(format!("{} answered with status {}", kind, status))
        }
        (_, Reply::Status(status)) if status.is_in_progress() => CallbackOutcome::InProgress,
        (_, Reply::Status(status)) => CallbackOutcome::Finished(status),
    }
}
