//! Core coordinator implementation.

use std::sync::Arc;

use chrono::Duration;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use lra_common::{
    Clock, Endpoints, LraError, LraId, LraInfo, LraStatus, ParticipantId, ParticipantRecord,
    ParticipantTransport, Result, SystemClock,
};

use crate::config::CoordinatorConfig;
use crate::lra_registry::LraRegistry;
use crate::metrics::{Metrics, MetricsSnapshot, SharedMetrics};
use crate::participant_registry::ParticipantRegistry;
use crate::recovery::RecoveryManager;
use crate::scheduler::TimeoutScheduler;
use crate::state::CoordinatorState;
use crate::store::{MemoryStore, SharedStore};
use crate::termination::{PassMode, TerminationDriver};
use crate::transport::HttpTransport;

/// Hint returned to callers while the coordinator is not running.
const RETRY_AFTER_MS: u64 = 1000;

/// Builds a [`Coordinator`] from configuration and optional collaborators.
pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
    node_id: Option<String>,
    store: Option<SharedStore>,
    transport: Option<Arc<dyn ParticipantTransport>>,
    clock: Option<Arc<dyn Clock>>,
    metrics: Option<SharedMetrics>,
}

impl CoordinatorBuilder {
    /// Start from a configuration.
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            node_id: None,
            store: None,
            transport: None,
            clock: None,
            metrics: None,
        }
    }

    /// Node id, overriding the configured one.
    pub fn node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Durable store. Defaults to an in-memory store.
    pub fn store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Participant transport. Defaults to HTTP.
    pub fn transport(mut self, transport: Arc<dyn ParticipantTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Assemble the coordinator. It does not accept requests until started.
    pub fn build(self) -> Result<Coordinator> {
        self.config
            .validate()
            .map_err(LraError::ConfigurationError)?;

        let transport: Arc<dyn ParticipantTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&self.config.callback_config)?),
        };
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(Metrics::new()));
        let node_id = self
            .node_id
            .or_else(|| self.config.node_id.clone())
            .unwrap_or_else(|| format!("coordinator-{}", uuid::Uuid::new_v4()));

        let lras = Arc::new(LraRegistry::new(
            self.config.base_url.clone(),
            store.clone(),
            clock.clone(),
        ));
        let scheduler = Arc::new(TimeoutScheduler::new(clock.clone()));
        let participants = Arc::new(ParticipantRegistry::new(
            lras.clone(),
            store.clone(),
            scheduler.clone(),
            clock.clone(),
            metrics.clone(),
        ));
        let driver = Arc::new(TerminationDriver::new(
            lras.clone(),
            transport,
            scheduler.clone(),
            store.clone(),
            clock.clone(),
            metrics.clone(),
            self.config.callback_config.request_timeout,
        ));
        let recovery = Arc::new(RecoveryManager::new(
            lras.clone(),
            driver.clone(),
            clock,
            metrics.clone(),
            self.config.recovery_config.clone(),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Coordinator {
            config: self.config,
            node_id,
            state: Arc::new(RwLock::new(CoordinatorState::Starting)),
            store,
            metrics,
            lras,
            participants,
            scheduler,
            driver,
            recovery,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// The coordinator: owns every LRA and drives their participants.
pub struct Coordinator {
    /// Configuration.
    config: CoordinatorConfig,
    /// Node ID for this coordinator instance.
    node_id: String,
    /// Current coordinator state.
    state: Arc<RwLock<CoordinatorState>>,
    /// Durable store the registries write through to.
    store: SharedStore,
    /// Counters.
    metrics: SharedMetrics,
    /// LRA registry.
    lras: Arc<LraRegistry>,
    /// Participant registry.
    participants: Arc<ParticipantRegistry>,
    /// Deadline timers.
    scheduler: Arc<TimeoutScheduler>,
    /// Termination driver.
    driver: Arc<TerminationDriver>,
    /// Recovery manager.
    recovery: Arc<RecoveryManager>,
    /// Shutdown signal for background tasks.
    shutdown_tx: watch::Sender<bool>,
    /// Background task handles.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    /// Builder with default collaborators.
    pub fn builder(config: CoordinatorConfig) -> CoordinatorBuilder {
        CoordinatorBuilder::new(config)
    }

    /// Start the coordinator: reload persisted LRAs, then start the deadline
    /// timer and the periodic recovery scan.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        info!(node_id = %self.node_id, "Starting coordinator");
        *self.state.write() = CoordinatorState::Recovering;

        if let Err(e) = self.restore().await {
            error!(error = %e, "Failed to restore LRAs from store");
            *self.state.write() = CoordinatorState::Stopped;
            return Err(e);
        }

        *self.state.write() = CoordinatorState::Running;
        self.start_background_tasks();

        info!(node_id = %self.node_id, lras = self.lras.len(), "Coordinator started successfully");
        Ok(())
    }

    /// Stop the coordinator gracefully.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        info!(node_id = %self.node_id, "Stopping coordinator");
        *self.state.write() = CoordinatorState::ShuttingDown;

        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        *self.state.write() = CoordinatorState::Stopped;
        info!(node_id = %self.node_id, "Coordinator stopped");
        Ok(())
    }

    /// Start a new LRA, nested under `parent_id` when given. A zero or
    /// negative timeout means no deadline.
    #[instrument(skip(self))]
    pub async fn start_lra(
        &self,
        parent_id: Option<&LraId>,
        client_id: &str,
        timeout: Duration,
    ) -> Result<LraId> {
        self.ensure_accepting()?;

        let lra = self.lras.create(parent_id, client_id, timeout).await?;
        self.scheduler.schedule(&lra.id, lra.deadline);
        self.metrics.lra_started();
        Ok(lra.id)
    }

    /// Enlist a participant with an LRA.
    #[instrument(skip(self, endpoints, data))]
    pub async fn join_lra(
        &self,
        lra_id: &LraId,
        endpoints: Endpoints,
        data: Option<String>,
        time_limit: Option<Duration>,
    ) -> Result<ParticipantId> {
        self.ensure_accepting()?;
        self.participants.enlist(lra_id, endpoints, data, time_limit).await
    }

    /// Remove a participant from an active LRA without any callback.
    #[instrument(skip(self))]
    pub async fn leave_lra(&self, lra_id: &LraId, participant_id: &ParticipantId) -> Result<()> {
        self.ensure_accepting()?;
        self.participants.leave(lra_id, participant_id).await
    }

    /// Close an LRA. Returns the final status, or an in-progress status when
    /// some participant is left for recovery.
    #[instrument(skip(self))]
    pub async fn close_lra(&self, lra_id: &LraId) -> Result<LraStatus> {
        self.ensure_accepting()?;
        self.driver.close(lra_id).await
    }

    /// Cancel an LRA. Returns like [`Coordinator::close_lra`].
    #[instrument(skip(self))]
    pub async fn cancel_lra(&self, lra_id: &LraId) -> Result<LraStatus> {
        self.ensure_accepting()?;
        self.driver.cancel(lra_id).await
    }

    /// Status of an LRA, `None` while it is still active and undecided.
    pub async fn get_status(&self, lra_id: &LraId) -> Result<Option<LraStatus>> {
        let status = self.lras.status(lra_id).await?;
        Ok((status != LraStatus::Active).then_some(status))
    }

    /// Summary of one LRA.
    pub async fn get_info(&self, lra_id: &LraId) -> Result<LraInfo> {
        self.lras.info(lra_id).await
    }

    /// LRAs still accepting participants.
    pub async fn get_active_lras(&self) -> Vec<LraInfo> {
        self.lras.list_active().await
    }

    /// Every LRA that has not finished.
    pub async fn get_all_lras(&self) -> Vec<LraInfo> {
        self.lras.list_all().await
    }

    /// LRAs with participants left for recovery.
    pub async fn get_recovering_lras(&self) -> Vec<LraInfo> {
        self.lras.list_recovering().await
    }

    /// Replace the time limit of an active LRA, measured from now.
    #[instrument(skip(self))]
    pub async fn renew_time_limit(&self, lra_id: &LraId, timeout: Duration) -> Result<()> {
        self.ensure_accepting()?;
        let deadline = self.lras.renew_timeout(lra_id, timeout).await?;
        self.scheduler.schedule(lra_id, deadline);
        Ok(())
    }

    /// Replace the endpoints and data of a participant while its LRA is active.
    #[instrument(skip(self, endpoints, data))]
    pub async fn update_participant(
        &self,
        lra_id: &LraId,
        participant_id: &ParticipantId,
        endpoints: Endpoints,
        data: Option<String>,
    ) -> Result<()> {
        self.ensure_accepting()?;
        self.participants
            .update(lra_id, participant_id, endpoints, data)
            .await
    }

    /// Record a status pushed by a participant that finished asynchronously.
    /// Returns the LRA status after settling.
    #[instrument(skip(self))]
    pub async fn report_participant_status(
        &self,
        lra_id: &LraId,
        participant_id: &ParticipantId,
        status: LraStatus,
    ) -> Result<LraStatus> {
        self.ensure_accepting()?;
        self.participants
            .record_status(lra_id, participant_id, status)
            .await?;
        self.driver.resume(lra_id, PassMode::Wait).await
    }

    /// Drop the record of a participant that already reached a terminal status.
    #[instrument(skip(self))]
    pub async fn forget_participant(
        &self,
        lra_id: &LraId,
        participant_id: &ParticipantId,
    ) -> Result<()> {
        self.ensure_accepting()?;
        self.participants.forget(lra_id, participant_id).await
    }

    /// Participants of an LRA.
    pub async fn get_participants(&self, lra_id: &LraId) -> Result<Vec<ParticipantRecord>> {
        self.participants.list(lra_id).await
    }

    /// Run one recovery scan now. Returns the LRAs still recovering.
    #[instrument(skip(self))]
    pub async fn trigger_recovery(&self) -> Result<Vec<LraInfo>> {
        self.ensure_accepting()?;
        Ok(self.recovery.run_scan().await)
    }

    /// Whether the LRA is active.
    pub async fn is_active_lra(&self, lra_id: &LraId) -> Result<bool> {
        Ok(self.lras.status(lra_id).await? == LraStatus::Active)
    }

    /// Whether the LRA completed.
    pub async fn is_completed_lra(&self, lra_id: &LraId) -> Result<bool> {
        Ok(self.lras.status(lra_id).await? == LraStatus::Completed)
    }

    /// Whether the LRA was compensated.
    pub async fn is_compensated_lra(&self, lra_id: &LraId) -> Result<bool> {
        Ok(self.lras.status(lra_id).await? == LraStatus::Compensated)
    }

    /// Check if the coordinator is accepting requests.
    pub fn is_accepting_requests(&self) -> bool {
        self.state.read().accepts_requests()
    }

    /// Get the current coordinator state.
    pub fn state(&self) -> CoordinatorState {
        *self.state.read()
    }

    /// Node id of this coordinator.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Configuration the coordinator was built with.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Current counter values.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Shared counters, for exporters.
    pub fn metrics_handle(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    // --- Private methods ---

    fn ensure_accepting(&self) -> Result<()> {
        if !self.is_accepting_requests() {
            return Err(LraError::CoordinatorUnavailable {
                retry_after_ms: RETRY_AFTER_MS,
            });
        }
        Ok(())
    }

    async fn restore(&self) -> Result<()> {
        let stored = self.store.load().await?;
        let restored = self.lras.restore(stored);

        for entry in restored {
            let lra = &entry.lra;
            if lra.status == LraStatus::Active {
                self.scheduler.schedule(&lra.id, entry.effective_deadline());
                self.metrics.lra_restored();
            } else if lra.status.is_in_progress() && !lra.recovering {
                // interrupted mid-pass; recovery resumes it
                let handle = self.lras.handle(&lra.id)?;
                let mut current = handle.state.lock().await;
                current.lra.recovering = true;
                self.lras.persist(&current.lra).await?;
            }
        }
        Ok(())
    }

    fn start_background_tasks(&self) {
        let mut tasks = self.tasks.lock();

        if let Some(tick) = self.config.timeout_config.tick_interval {
            let scheduler = self.scheduler.clone();
            let driver = self.driver.clone();
            let shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                scheduler
                    .run_loop(tick, shutdown, move |lra_id| {
                        let driver = driver.clone();
                        async move {
                            if let Err(e) = driver.expire(&lra_id).await {
                                warn!(lra_id = %lra_id, error = %e, "Failed to cancel expired LRA");
                            }
                        }
                    })
                    .await;
            }));
        }

        if let Some(interval) = self.config.recovery_config.scan_interval {
            let recovery = self.recovery.clone();
            let shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                recovery.run_loop(interval, shutdown).await;
            }));
        }
    }
}
