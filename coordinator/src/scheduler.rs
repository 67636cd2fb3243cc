//! Deadline timers for active LRAs.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::debug;

use lra_common::{Clock, LraId, Timestamp};

/// Tracks the effective deadline of every active LRA that has one.
///
/// A deadline is either the LRA's own time limit or the earliest time limit of
/// one of its participants. Timers are disarmed as soon as the LRA leaves
/// `Active`, so a finished LRA never produces unsolicited work.
pub struct TimeoutScheduler {
    /// Armed deadlines by LRA.
    deadlines: DashMap<LraId, Timestamp>,
    /// Time source.
    clock: Arc<dyn Clock>,
}

impl TimeoutScheduler {
    /// Create a new scheduler.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            deadlines: DashMap::new(),
            clock,
        }
    }

    /// Arm (or re-arm) the timer for an LRA. `None` disarms it.
    pub fn schedule(&self, lra_id: &LraId, deadline: Option<Timestamp>) {
        match deadline {
            Some(deadline) => {
                debug!(lra_id = %lra_id, deadline = %deadline, "Deadline armed");
                self.deadlines.insert(lra_id.clone(), deadline);
            }
            None => self.cancel(lra_id),
        }
    }

    /// Disarm the timer for an LRA.
    pub fn cancel(&self, lra_id: &LraId) {
        if self.deadlines.remove(lra_id).is_some() {
            debug!(lra_id = %lra_id, "Deadline disarmed");
        }
    }

    /// Currently armed deadline.
    pub fn deadline(&self, lra_id: &LraId) -> Option<Timestamp> {
        self.deadlines.get(lra_id).map(|d| *d)
    }

    /// Number of armed timers.
    pub fn armed_count(&self) -> usize {
        self.deadlines.len()
    }

    /// Remove and return every LRA whose deadline has passed.
    pub fn take_due(&self) -> Vec<LraId> {
        let now = self.clock.now();
        let due: Vec<LraId> = self
            .deadlines
            .iter()
            .filter(|d| *d.value() <= now)
            .map(|d| d.key().clone())
            .collect();

        for lra_id in &due {
            self.deadlines.remove_if(lra_id, |_, deadline| *deadline <= now);
        }
        due
    }

    /// Fire due deadlines every `tick` until shutdown is signalled.
    ///
    /// Each due LRA is handled on its own task, so a slow termination pass
    /// never delays the deadline of another LRA.
    pub async fn run_loop<F, Fut>(&self, tick: Duration, mut shutdown: watch::Receiver<bool>, on_due: F)
    where
        F: Fn(LraId) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for lra_id in self.take_due() {
                        tokio::spawn(on_due(lra_id));
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use lra_common::ManualClock;

    fn scheduler() -> (Arc<ManualClock>, TimeoutScheduler) {
        let clock = Arc::new(ManualClock::new());
        let scheduler = TimeoutScheduler::new(clock.clone());
        (clock, scheduler)
    }

    #[test]
    fn test_take_due() {
        let (clock, scheduler) = scheduler();
        let soon = LraId::generate("http://localhost/lra");
        let later = LraId::generate("http://localhost/lra");

        scheduler.schedule(&soon, Some(clock.now() + ChronoDuration::milliseconds(10)));
        scheduler.schedule(&later, Some(clock.now() + ChronoDuration::seconds(10)));
        assert!(scheduler.take_due().is_empty());

        clock.advance(ChronoDuration::milliseconds(10));
        assert_eq!(scheduler.take_due(), vec![soon]);
        assert!(scheduler.take_due().is_empty());
        assert_eq!(scheduler.armed_count(), 1);
    }

    #[test]
    fn test_reschedule_and_cancel() {
        let (clock, scheduler) = scheduler();
        let lra_id = LraId::generate("http://localhost/lra");

        scheduler.schedule(&lra_id, Some(clock.now() + ChronoDuration::milliseconds(10)));
        scheduler.schedule(&lra_id, Some(clock.now() + ChronoDuration::seconds(10)));
        clock.advance(ChronoDuration::seconds(1));
        assert!(scheduler.take_due().is_empty());

        scheduler.schedule(&lra_id, None);
        assert_eq!(scheduler.deadline(&lra_id), None);
    }

    #[tokio::test]
    async fn test_run_loop_fires_and_stops() {
        let (clock, scheduler) = scheduler();
        let scheduler = Arc::new(scheduler);
        let lra_id = LraId::generate("http://localhost/lra");
        scheduler.schedule(&lra_id, Some(clock.now()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (fired_tx, mut fired_rx) = tokio::sync::mpsc::unbounded_channel();

        let looping = scheduler.clone();
        let handle = tokio::spawn(async move {
            looping
                .run_loop(Duration::from_millis(5), shutdown_rx, |id| {
                    let fired_tx = fired_tx.clone();
                    async move {
                        let _ = fired_tx.send(id);
                    }
                })
                .await;
        });

        assert_eq!(fired_rx.recv().await, Some(lra_id));
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_handler_does_not_delay_other_deadlines() {
        let (clock, scheduler) = scheduler();
        let scheduler = Arc::new(scheduler);
        let slow = LraId::generate("http://localhost/lra");
        let fast = LraId::generate("http://localhost/lra");
        scheduler.schedule(&slow, Some(clock.now()));
        scheduler.schedule(&fast, Some(clock.now() + ChronoDuration::milliseconds(1)));
        clock.advance(ChronoDuration::seconds(1));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (fired_tx, mut fired_rx) = tokio::sync::mpsc::unbounded_channel();

        let looping = scheduler.clone();
        let stalled = slow.clone();
        let handle = tokio::spawn(async move {
            looping
                .run_loop(Duration::from_millis(5), shutdown_rx, move |id| {
                    let fired_tx = fired_tx.clone();
                    let stalls = id == stalled;
                    async move {
                        if stalls {
                            tokio::time::sleep(Duration::from_secs(60)).await;
                        }
                        let _ = fired_tx.send(id);
                    }
                })
                .await;
        });

        let fired = tokio::time::timeout(Duration::from_secs(5), fired_rx.recv())
            .await
            .unwrap();
        assert_eq!(fired, Some(fast));
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
