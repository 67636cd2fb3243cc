//! Interceptor chain around participant operations.
//!
//! [`LraFilter::on_entry`] resolves the LRA an operation runs in from the
//! caller's context and the operation's [`LraPolicy`], starting, suspending
//! or joining LRAs as needed. [`LraFilter::on_exit`] ends what the entry stage
//! started and hands back the context to resume.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use lra_common::{Endpoints, LraError, LraId, LraStatus, ParticipantId, Result};

use crate::client::CoordinatorClient;
use crate::config::ParticipantConfig;
use crate::policy::{LraPolicy, LraType};

/// LRA state of one intercepted invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationContext {
    /// LRA the operation runs in, propagated to outgoing calls.
    pub lra_id: Option<LraId>,
    /// LRA started by this invocation.
    pub started: Option<LraId>,
    /// Incoming LRA set aside for the duration of the call.
    pub suspended: Option<LraId>,
    /// Enlistment made on entry.
    pub participant_id: Option<ParticipantId>,
}

/// Result of the exit stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitOutcome {
    /// LRA ended on exit and the status it reached.
    pub ended: Option<(LraId, LraStatus)>,
    /// Context to restore for the caller.
    pub resumed: Option<LraId>,
}

/// Applies [`LraPolicy`] around participant operations.
pub struct LraFilter {
    client: Arc<dyn CoordinatorClient>,
    config: ParticipantConfig,
}

impl LraFilter {
    pub fn new(client: Arc<dyn CoordinatorClient>, config: ParticipantConfig) -> Self {
        Self { client, config }
    }

    /// Entry stage. `resource` names the participant resource whose endpoints
    /// are enlisted when the policy joins.
    #[instrument(skip(self, policy, data), fields(lra_type = ?policy.lra_type))]
    pub async fn on_entry(
        &self,
        policy: &LraPolicy,
        incoming: Option<&LraId>,
        resource: &str,
        data: Option<String>,
    ) -> Result<InvocationContext> {
        let mut ctx = InvocationContext::default();

        match (policy.lra_type, incoming) {
            (LraType::Mandatory, None) => {
                return Err(LraError::ContextRequired(resource.to_string()));
            }
            (LraType::Never, Some(lra_id)) => {
                return Err(LraError::ContextNotAllowed(lra_id.clone()));
            }
            (LraType::Required, None) | (LraType::RequiresNew, None) => {
                ctx.started = Some(self.start(policy, None).await?);
            }
            (LraType::RequiresNew, Some(lra_id)) => {
                ctx.suspended = Some(lra_id.clone());
                ctx.started = Some(self.start(policy, None).await?);
            }
            (LraType::NotSupported, Some(lra_id)) => {
                ctx.suspended = Some(lra_id.clone());
            }
            (_, Some(lra_id)) if policy.nested => {
                ctx.started = Some(self.start(policy, Some(lra_id)).await?);
            }
            (_, Some(lra_id)) => {
                ctx.lra_id = Some(lra_id.clone());
            }
            (_, None) => {}
        }

        if ctx.started.is_some() {
            ctx.lra_id = ctx.started.clone();
        }

        if let (true, Some(lra_id)) = (policy.join, &ctx.lra_id) {
            let endpoints = Endpoints::from_base(&self.config.resource_url(resource));
            let joined = self
                .client
                .join_lra(lra_id, endpoints, data, self.config.time_limit)
                .await;
            match joined {
                Ok(participant_id) => ctx.participant_id = Some(participant_id),
                Err(e) => {
                    // nothing the caller can run inside; undo what entry started
                    if let Some(started) = &ctx.started {
                        if let Err(cancel) = self.client.cancel_lra(started).await {
                            warn!(lra_id = %started, error = %cancel, "Failed to cancel LRA after join error");
                        }
                    }
                    return Err(e);
                }
            }
        }

        debug!(lra_id = ?ctx.lra_id, suspended = ?ctx.suspended, "LRA context resolved");
        Ok(ctx)
    }

    /// Exit stage. `status_code` is the operation's response status.
    #[instrument(skip(self, policy, ctx), fields(lra_id = ?ctx.lra_id))]
    pub async fn on_exit(
        &self,
        policy: &LraPolicy,
        ctx: InvocationContext,
        status_code: u16,
    ) -> Result<ExitOutcome> {
        let mut outcome = ExitOutcome {
            ended: None,
            resumed: ctx.suspended.clone(),
        };

        let Some(lra_id) = ctx.lra_id else {
            return Ok(outcome);
        };

        if policy.should_cancel(status_code) {
            info!(lra_id = %lra_id, status_code, "Operation failed, cancelling LRA");
            let status = self.client.cancel_lra(&lra_id).await?;
            outcome.ended = Some((lra_id, status));
        } else if policy.terminal || (policy.end && ctx.started.as_ref() == Some(&lra_id)) {
            let status = self.client.close_lra(&lra_id).await?;
            outcome.ended = Some((lra_id, status));
        }

        Ok(outcome)
    }

    /// Remove a resource's enlistment without ending the LRA.
    pub async fn leave(&self, lra_id: &LraId, participant_id: &ParticipantId) -> Result<()> {
        self.client.leave_lra(lra_id, participant_id).await
    }

    // --- Private methods ---

    async fn start(&self, policy: &LraPolicy, parent: Option<&LraId>) -> Result<LraId> {
        let timeout = policy.timeout.unwrap_or(self.config.default_timeout);
        let lra_id = self
            .client
            .start_lra(parent, &self.config.client_id, timeout)
            .await?;
        info!(lra_id = %lra_id, parent_id = ?parent, "LRA started on entry");
        Ok(lra_id)
    }
}
