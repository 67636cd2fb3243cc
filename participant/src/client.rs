//! Coordinator operations used by participant services.

use async_trait::async_trait;
use chrono::Duration;

use lra_common::{Endpoints, LraId, LraStatus, ParticipantId, Result};

/// Client side of the coordinator API.
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    /// Start an LRA, nested under `parent` when given.
    async fn start_lra(&self, parent: Option<&LraId>, client_id: &str, timeout: Duration) -> Result<LraId>;

    async fn close_lra(&self, lra_id: &LraId) -> Result<LraStatus>;

    async fn cancel_lra(&self, lra_id: &LraId) -> Result<LraStatus>;

    /// Enlist a participant.
    async fn join_lra(
        &self,
        lra_id: &LraId,
        endpoints: Endpoints,
        data: Option<String>,
        time_limit: Option<Duration>,
    ) -> Result<ParticipantId>;

    async fn leave_lra(&self, lra_id: &LraId, participant_id: &ParticipantId) -> Result<()>;
}
