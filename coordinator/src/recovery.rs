//! Periodic recovery: expires overdue LRAs, re-drives unfinished
//! participants and purges finished LRAs past retention.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use lra_common::{Clock, LraId, LraInfo, Timestamp};

use crate::config::RecoveryConfig;
use crate::lra_registry::LraRegistry;
use crate::metrics::SharedMetrics;
use crate::termination::{PassMode, TerminationDriver};

/// Work found by one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Task {
    Expire(LraId),
    Resume(LraId),
    Forget(LraId),
}

/// A finished LRA that may be purged.
struct Finished {
    id: LraId,
    parent_id: Option<LraId>,
    finished_at: Timestamp,
}

/// Runs recovery scans over the registry.
pub struct RecoveryManager {
    lras: Arc<LraRegistry>,
    driver: Arc<TerminationDriver>,
    clock: Arc<dyn Clock>,
    metrics: SharedMetrics,
    config: RecoveryConfig,
}

impl RecoveryManager {
    /// Create a new recovery manager.
    pub fn new(
        lras: Arc<LraRegistry>,
        driver: Arc<TerminationDriver>,
        clock: Arc<dyn Clock>,
        metrics: SharedMetrics,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            lras,
            driver,
            clock,
            metrics,
            config,
        }
    }

    /// Run one scan and return the LRAs still recovering afterwards.
    ///
    /// LRAs whose termination pass is already running elsewhere are skipped
    /// and picked up by a later scan.
    #[instrument(skip(self))]
    pub async fn run_scan(&self) -> Vec<LraInfo> {
        self.metrics.recovery_pass();
        let now = self.clock.now();

        let mut tasks = Vec::new();
        let mut finished = Vec::new();
        for handle in self.lras.handles() {
            let entry = handle.state.lock().await;
            let lra = &entry.lra;
            if entry.is_expired(now) {
                tasks.push(Task::Expire(lra.id.clone()));
            } else if lra.status.is_in_progress() {
                tasks.push(Task::Resume(lra.id.clone()));
            } else if entry.participants.has_pending_forgets() {
                tasks.push(Task::Forget(lra.id.clone()));
            } else if let Some(finished_at) = lra.finished_at {
                finished.push(Finished {
                    id: lra.id.clone(),
                    parent_id: lra.parent_id.clone(),
                    finished_at,
                });
            }
        }

        if !tasks.is_empty() {
            debug!(tasks = tasks.len(), "Recovery scan");
        }
        let limit = self.config.max_concurrent_passes.max(1);
        stream::iter(tasks)
            .for_each_concurrent(limit, |task| self.run_task(task))
            .await;

        self.purge(finished, now).await;
        self.lras.list_recovering().await
    }

    /// Scan every `interval` until shutdown is signalled.
    pub async fn run_loop(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let recovering = self.run_scan().await;
                    if !recovering.is_empty() {
                        debug!(count = recovering.len(), "LRAs still recovering");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("Recovery loop stopped");
    }

    // --- Private methods ---

    async fn run_task(&self, task: Task) {
        let result = match &task {
            Task::Expire(lra_id) => self.driver.expire(lra_id).await.map(|_| ()),
            Task::Resume(lra_id) => self
                .driver
                .resume(lra_id, PassMode::SkipIfBusy)
                .await
                .map(|_| ()),
            Task::Forget(lra_id) => self.driver.flush_forgets(lra_id).await,
        };

        if let Err(e) = result {
            if !e.is_not_found() {
                warn!(task = ?task, error = %e, "Recovery task failed");
            }
        }
    }

    /// Purge finished LRAs past retention. A nested LRA is kept while its
    /// parent exists: with the parent when the parent is finished, or for
    /// `nested_retention` when the parent never terminates.
    async fn purge(&self, finished: Vec<Finished>, now: Timestamp) {
        for lra in finished {
            let retention = match &lra.parent_id {
                Some(parent_id) => match self.lras.status(parent_id).await {
                    Ok(status) if status.is_terminal() => continue,
                    Ok(_) => self.config.nested_retention,
                    Err(_) => self.config.retention,
                },
                None => self.config.retention,
            };

            if !elapsed(lra.finished_at, retention, now) {
                continue;
            }
            self.purge_tree(&lra.id).await;
        }
    }

    async fn purge_tree(&self, root: &LraId) {
        let mut pending = vec![root.clone()];
        let mut order = Vec::new();
        while let Some(lra_id) = pending.pop() {
            if let Ok(handle) = self.lras.handle(&lra_id) {
                pending.extend(handle.state.lock().await.children.iter().cloned());
                order.push(lra_id);
            }
        }

        for lra_id in order.iter().rev() {
            match self.lras.remove(lra_id).await {
                Ok(()) => {
                    self.metrics.lra_purged();
                    info!(lra_id = %lra_id, "Finished LRA purged");
                }
                Err(e) => warn!(lra_id = %lra_id, error = %e, "Failed to purge LRA"),
            }
        }
    }
}

fn elapsed(since: Timestamp, period: Duration, now: Timestamp) -> bool {
    chrono::Duration::from_std(period)
        .ok()
        .and_then(|period| since.checked_add_signed(period))
        .map_or(false, |until| until <= now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::participant_registry::ParticipantRegistry;
    use crate::scheduler::TimeoutScheduler;
    use crate::store::MemoryStore;
    use crate::test_support::ScriptedTransport;
    use chrono::Duration as ChronoDuration;
    use lra_common::{CallbackOutcome, Endpoints, LraStatus, ManualClock};

    struct Fixture {
        lras: Arc<LraRegistry>,
        participants: ParticipantRegistry,
        driver: Arc<TerminationDriver>,
        recovery: RecoveryManager,
        transport: Arc<ScriptedTransport>,
        store: Arc<MemoryStore>,
        metrics: SharedMetrics,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new());
        let metrics = Arc::new(Metrics::new());
        let transport = Arc::new(ScriptedTransport::new());
        let lras = Arc::new(LraRegistry::new("http://localhost/lra", store.clone(), clock.clone()));
        let scheduler = Arc::new(TimeoutScheduler::new(clock.clone()));
        let participants = ParticipantRegistry::new(
            lras.clone(),
            store.clone(),
            scheduler.clone(),
            clock.clone(),
            metrics.clone(),
        );
        let driver = Arc::new(TerminationDriver::new(
            lras.clone(),
            transport.clone(),
            scheduler,
            store.clone(),
            clock.clone(),
            metrics.clone(),
            Duration::from_secs(1),
        ));
        let config = RecoveryConfig {
            scan_interval: None,
            max_concurrent_passes: 4,
            retention: Duration::from_secs(60),
            nested_retention: Duration::from_secs(600),
        };
        let recovery = RecoveryManager::new(
            lras.clone(),
            driver.clone(),
            clock.clone(),
            metrics.clone(),
            config,
        );
        Fixture {
            lras,
            participants,
            driver,
            recovery,
            transport,
            store,
            metrics,
            clock,
        }
    }

    async fn start(f: &Fixture, parent: Option<&LraId>, timeout: ChronoDuration) -> LraId {
        f.lras.create(parent, "test", timeout).await.unwrap().id
    }

    async fn join(f: &Fixture, lra_id: &LraId, base: &str) {
        f.participants
            .enlist(lra_id, Endpoints::from_base(base), None, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_scan_expires_overdue_lra() {
        let f = fixture();
        let lra_id = start(&f, None, ChronoDuration::milliseconds(500)).await;
        join(&f, &lra_id, "http://svc/a").await;

        assert!(f.recovery.run_scan().await.is_empty());
        assert_eq!(f.lras.status(&lra_id).await.unwrap(), LraStatus::Active);

        f.clock.advance(ChronoDuration::seconds(1));
        f.recovery.run_scan().await;
        assert_eq!(f.lras.status(&lra_id).await.unwrap(), LraStatus::Compensated);
        assert_eq!(f.transport.calls("http://svc/a/compensate"), 1);
        assert_eq!(f.transport.calls("http://svc/a/complete"), 0);
    }

    #[tokio::test]
    async fn test_scan_resumes_recovering_lra() {
        let f = fixture();
        let lra_id = start(&f, None, ChronoDuration::zero()).await;
        join(&f, &lra_id, "http://svc/a").await;
        f.transport.script(
            "http://svc/a/compensate",
            vec![
                CallbackOutcome::Failed("connection reset".into()),
                CallbackOutcome::Failed("connection reset".into()),
            ],
        );

        f.driver.cancel(&lra_id).await.unwrap();
        let recovering = f.recovery.run_scan().await;
        assert_eq!(recovering.len(), 1);
        assert_eq!(recovering[0].lra_id, lra_id);
        assert!(recovering[0].is_recovering);

        assert!(f.recovery.run_scan().await.is_empty());
        assert_eq!(f.lras.status(&lra_id).await.unwrap(), LraStatus::Compensated);
        assert_eq!(f.transport.calls("http://svc/a/compensate"), 3);
        assert_eq!(f.metrics.snapshot().recovery_passes, 2);
    }

    #[tokio::test]
    async fn test_purge_after_retention() {
        let f = fixture();
        let lra_id = start(&f, None, ChronoDuration::zero()).await;
        join(&f, &lra_id, "http://svc/a").await;
        f.driver.close(&lra_id).await.unwrap();

        f.recovery.run_scan().await;
        assert_eq!(f.lras.status(&lra_id).await.unwrap(), LraStatus::Completed);

        f.clock.advance(ChronoDuration::seconds(61));
        f.recovery.run_scan().await;
        assert!(f.lras.status(&lra_id).await.unwrap_err().is_not_found());
        assert_eq!(f.store.lra_count(), 0);
        assert_eq!(f.store.participant_count(), 0);
        assert_eq!(f.metrics.snapshot().lras_purged, 1);
    }

    #[tokio::test]
    async fn test_nested_lra_held_for_active_parent() {
        let f = fixture();
        let parent = start(&f, None, ChronoDuration::zero()).await;
        let child = start(&f, Some(&parent), ChronoDuration::zero()).await;
        f.driver.close(&child).await.unwrap();

        f.clock.advance(ChronoDuration::seconds(61));
        f.recovery.run_scan().await;
        assert_eq!(f.lras.status(&child).await.unwrap(), LraStatus::Completed);

        f.clock.advance(ChronoDuration::seconds(600));
        f.recovery.run_scan().await;
        assert!(f.lras.status(&child).await.is_err());
        assert_eq!(f.lras.get(&parent).await.unwrap().status, LraStatus::Active);
    }

    #[tokio::test]
    async fn test_nested_lra_purged_with_parent() {
        let f = fixture();
        let parent = start(&f, None, ChronoDuration::zero()).await;
        let child = start(&f, Some(&parent), ChronoDuration::zero()).await;
        f.driver.close(&parent).await.unwrap();

        f.clock.advance(ChronoDuration::seconds(61));
        f.recovery.run_scan().await;
        assert!(f.lras.status(&parent).await.is_err());
        assert!(f.lras.status(&child).await.is_err());
        assert_eq!(f.metrics.snapshot().lras_purged, 2);
    }

    #[tokio::test]
    async fn test_scan_flushes_failed_forget() {
        let f = fixture();
        let lra_id = start(&f, None, ChronoDuration::zero()).await;
        join(&f, &lra_id, "http://svc/a").await;
        f.transport.script(
            "http://svc/a/complete",
            vec![CallbackOutcome::Finished(LraStatus::FailedToComplete)],
        );
        f.transport
            .script("http://svc/a/forget", vec![CallbackOutcome::Failed("down".into())]);

        assert_eq!(f.driver.close(&lra_id).await.unwrap(), LraStatus::FailedToComplete);
        assert_eq!(f.participants.list(&lra_id).await.unwrap().len(), 1);

        f.recovery.run_scan().await;
        assert_eq!(f.transport.calls("http://svc/a/forget"), 2);
        assert!(f.participants.list(&lra_id).await.unwrap().is_empty());
    }

    #[test]
    fn test_elapsed() {
        let now = lra_common::now();
        assert!(elapsed(now, Duration::ZERO, now));
        assert!(!elapsed(now, Duration::from_secs(1), now));
        assert!(elapsed(now - ChronoDuration::seconds(2), Duration::from_secs(1), now));
    }
}
