//! End-to-end LRA scenarios with in-process participants.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use parking_lot::Mutex;

use lra_common::{Endpoints, LraId, LraStatus, ManualClock, ParticipantId, Result};
use lra_coordinator::{Coordinator, CoordinatorConfig, MemoryStore};
use lra_participant::{
    CallbackContext, CoordinatorClient, HandlerRegistry, LraFilter, LraPolicy, LraType,
    ParticipantConfig, ParticipantHandler, Reply,
};

/// Participant that counts callbacks and answers from scripts.
#[derive(Default)]
struct Activity {
    completions: AtomicUsize,
    compensations: AtomicUsize,
    status_calls: AtomicUsize,
    forgets: AtomicUsize,
    complete_replies: Mutex<VecDeque<Reply>>,
    compensate_replies: Mutex<VecDeque<Reply>>,
    status_replies: Mutex<VecDeque<Reply>>,
}

impl Activity {
    fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    fn compensations(&self) -> usize {
        self.compensations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ParticipantHandler for Activity {
    async fn complete(&self, _ctx: &CallbackContext) -> Reply {
        self.completions.fetch_add(1, Ordering::SeqCst);
        self.complete_replies
            .lock()
            .pop_front()
            .unwrap_or(Reply::Status(LraStatus::Completed))
    }

    async fn compensate(&self, _ctx: &CallbackContext) -> Reply {
        self.compensations.fetch_add(1, Ordering::SeqCst);
        self.compensate_replies
            .lock()
            .pop_front()
            .unwrap_or(Reply::Status(LraStatus::Compensated))
    }

    async fn status(&self, _ctx: &CallbackContext) -> Reply {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.status_replies.lock().pop_front().unwrap_or(Reply::Gone)
    }

    async fn forget(&self, _ctx: &CallbackContext) -> Reply {
        self.forgets.fetch_add(1, Ordering::SeqCst);
        Reply::Gone
    }
}

/// Coordinator client calling the coordinator in process.
struct LocalClient(Arc<Coordinator>);

#[async_trait]
impl CoordinatorClient for LocalClient {
    async fn start_lra(&self, parent: Option<&LraId>, client_id: &str, timeout: Duration) -> Result<LraId> {
        self.0.start_lra(parent, client_id, timeout).await
    }

    async fn close_lra(&self, lra_id: &LraId) -> Result<LraStatus> {
        self.0.close_lra(lra_id).await
    }

    async fn cancel_lra(&self, lra_id: &LraId) -> Result<LraStatus> {
        self.0.cancel_lra(lra_id).await
    }

    async fn join_lra(
        &self,
        lra_id: &LraId,
        endpoints: Endpoints,
        data: Option<String>,
        time_limit: Option<Duration>,
    ) -> Result<ParticipantId> {
        self.0.join_lra(lra_id, endpoints, data, time_limit).await
    }

    async fn leave_lra(&self, lra_id: &LraId, participant_id: &ParticipantId) -> Result<()> {
        self.0.leave_lra(lra_id, participant_id).await
    }
}

struct Harness {
    coordinator: Arc<Coordinator>,
    participants: Arc<HandlerRegistry>,
    clock: Arc<ManualClock>,
}

impl Harness {
    async fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new())).await
    }

    async fn with_store(store: Arc<MemoryStore>) -> Self {
        let mut config = CoordinatorConfig::default();
        config.recovery_config.scan_interval = None;
        config.timeout_config.tick_interval = None;

        let participants = Arc::new(HandlerRegistry::new());
        let clock = Arc::new(ManualClock::new());
        let coordinator = Coordinator::builder(config)
            .store(store)
            .transport(participants.clone())
            .clock(clock.clone())
            .build()
            .unwrap();
        coordinator.start().await.unwrap();

        Self {
            coordinator: Arc::new(coordinator),
            participants,
            clock,
        }
    }

    fn activity(&self, url: &str) -> Arc<Activity> {
        let activity = Arc::new(Activity::default());
        self.participants.mount(url, activity.clone());
        activity
    }

    async fn start(&self, parent: Option<&LraId>) -> LraId {
        self.coordinator
            .start_lra(parent, "tck", Duration::seconds(50))
            .await
            .unwrap()
    }

    async fn join(&self, lra_id: &LraId, url: &str) -> ParticipantId {
        self.coordinator
            .join_lra(lra_id, Endpoints::from_base(url), None, None)
            .await
            .unwrap()
    }

    async fn listed(&self, lra_id: &LraId) -> bool {
        self.coordinator
            .get_all_lras()
            .await
            .iter()
            .any(|info| &info.lra_id == lra_id)
    }
}

#[tokio::test]
async fn cancel_compensates_and_delists() {
    let h = Harness::new().await;
    let p1 = h.activity("http://svc/p1");
    let lra_id = h.start(None).await;
    h.join(&lra_id, "http://svc/p1").await;

    assert_eq!(h.coordinator.cancel_lra(&lra_id).await.unwrap(), LraStatus::Compensated);
    assert!(!h.listed(&lra_id).await);
    assert_eq!(p1.compensations(), 1);
    assert_eq!(p1.completions(), 0);
}

#[tokio::test]
async fn close_delists_immediately() {
    let h = Harness::new().await;
    let p1 = h.activity("http://svc/p1");
    let lra_id = h.start(None).await;
    h.join(&lra_id, "http://svc/p1").await;

    h.coordinator.close_lra(&lra_id).await.unwrap();
    assert!(h.coordinator.get_active_lras().await.is_empty());
    assert!(!h.listed(&lra_id).await);
    assert_eq!(p1.completions(), 1);
}

#[tokio::test]
async fn joining_twice_completes_once() {
    let h = Harness::new().await;
    let p1 = h.activity("http://svc/p1");
    let lra_id = h.start(None).await;
    let first = h.join(&lra_id, "http://svc/p1").await;
    let second = h.join(&lra_id, "http://svc/p1").await;
    assert_eq!(first, second);

    h.coordinator.close_lra(&lra_id).await.unwrap();
    assert_eq!(p1.completions(), 1);
}

#[tokio::test]
async fn leaving_participant_gets_no_callbacks() {
    let h = Harness::new().await;
    let gone = h.activity("http://svc/gone");
    let stays = h.activity("http://svc/stays");
    let lra_id = h.start(None).await;
    let participant_id = h.join(&lra_id, "http://svc/gone").await;
    h.join(&lra_id, "http://svc/stays").await;

    h.coordinator.leave_lra(&lra_id, &participant_id).await.unwrap();
    h.coordinator.leave_lra(&lra_id, &participant_id).await.unwrap();
    h.coordinator.close_lra(&lra_id).await.unwrap();

    assert_eq!(gone.completions() + gone.compensations(), 0);
    assert_eq!(stays.completions(), 1);
}

#[tokio::test]
async fn deadline_compensates_through_recovery_scan() {
    let h = Harness::new().await;
    let p1 = h.activity("http://svc/p1");
    let lra_id = h
        .coordinator
        .start_lra(None, "tck", Duration::milliseconds(500))
        .await
        .unwrap();
    h.join(&lra_id, "http://svc/p1").await;

    h.clock.advance(Duration::seconds(1));
    assert!(h.coordinator.trigger_recovery().await.unwrap().is_empty());

    assert_eq!(h.coordinator.get_status(&lra_id).await.unwrap(), Some(LraStatus::Compensated));
    assert_eq!(p1.compensations(), 1);
    assert_eq!(p1.completions(), 0);
    assert!(h.coordinator.get_info(&lra_id).await.unwrap().is_compensated);
}

#[tokio::test]
async fn accepted_participant_is_polled_to_completion() {
    let h = Harness::new().await;
    let p1 = h.activity("http://svc/p1");
    p1.compensate_replies.lock().push_back(Reply::Accepted);
    p1.status_replies
        .lock()
        .extend([Reply::Status(LraStatus::Compensating), Reply::Status(LraStatus::Compensated)]);

    let lra_id = h.start(None).await;
    h.join(&lra_id, "http://svc/p1").await;

    assert_eq!(h.coordinator.cancel_lra(&lra_id).await.unwrap(), LraStatus::Compensating);
    assert_eq!(h.coordinator.get_recovering_lras().await.len(), 1);

    assert_eq!(h.coordinator.trigger_recovery().await.unwrap().len(), 1);
    assert!(h.coordinator.trigger_recovery().await.unwrap().is_empty());

    assert_eq!(h.coordinator.get_status(&lra_id).await.unwrap(), Some(LraStatus::Compensated));
    assert_eq!(p1.compensations(), 1);
    assert_eq!(p1.completions(), 0);
    assert_eq!(p1.status_calls.load(Ordering::SeqCst), 2);
    assert_eq!(p1.forgets.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unreachable_participant_compensated_on_recovery() {
    let h = Harness::new().await;
    let lra_id = h.start(None).await;
    h.join(&lra_id, "http://svc/p1").await;

    // not mounted yet: the first compensate fails like a dropped connection
    assert_eq!(h.coordinator.cancel_lra(&lra_id).await.unwrap(), LraStatus::Compensating);
    assert!(h.listed(&lra_id).await);

    let p1 = h.activity("http://svc/p1");
    assert!(h.coordinator.trigger_recovery().await.unwrap().is_empty());
    assert_eq!(p1.compensations(), 1);
    assert!(!h.listed(&lra_id).await);
    assert_eq!(h.coordinator.metrics().compensate_calls, 2);
}

#[tokio::test]
async fn participant_failure_is_terminal() {
    let h = Harness::new().await;
    let p1 = h.activity("http://svc/p1");
    p1.complete_replies
        .lock()
        .push_back(Reply::Status(LraStatus::FailedToComplete));
    let lra_id = h.start(None).await;
    h.join(&lra_id, "http://svc/p1").await;

    assert_eq!(h.coordinator.close_lra(&lra_id).await.unwrap(), LraStatus::FailedToComplete);
    assert!(h.coordinator.trigger_recovery().await.unwrap().is_empty());
    assert_eq!(p1.completions(), 1);
    assert_eq!(p1.forgets.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn closed_nested_lra_not_completed_again() {
    let h = Harness::new().await;
    let parent_activity = h.activity("http://svc/parent");
    let child_activity = h.activity("http://svc/child");
    let parent = h.start(None).await;
    let child = h.start(Some(&parent)).await;
    h.join(&parent, "http://svc/parent").await;
    h.join(&child, "http://svc/child").await;

    h.coordinator.close_lra(&child).await.unwrap();
    assert_eq!(child_activity.completions(), 1);

    h.coordinator.close_lra(&parent).await.unwrap();
    assert_eq!(child_activity.completions(), 1);
    assert_eq!(child_activity.compensations(), 0);
    assert_eq!(parent_activity.completions(), 1);
}

#[tokio::test]
async fn cancelled_nested_lra_among_closing_siblings() {
    let h = Harness::new().await;
    let parent = h.start(None).await;

    let mut nested = Vec::new();
    for i in 0..3 {
        let url = format!("http://svc/nested-{}", i);
        let activity = h.activity(&url);
        let child = h.start(Some(&parent)).await;
        h.join(&child, &url).await;
        nested.push((child, activity));
    }

    h.coordinator.cancel_lra(&nested[0].0).await.unwrap();
    assert_eq!(h.coordinator.close_lra(&parent).await.unwrap(), LraStatus::Completed);

    let compensations: usize = nested.iter().map(|(_, a)| a.compensations()).sum();
    let completions: usize = nested.iter().map(|(_, a)| a.completions()).sum();
    assert_eq!(compensations, 1);
    assert_eq!(completions, 2);
    assert_eq!(
        h.coordinator.get_status(&nested[0].0).await.unwrap(),
        Some(LraStatus::Compensated)
    );
}

#[tokio::test]
async fn closed_nested_lra_cancelled_before_parent_closes() {
    let h = Harness::new().await;
    let parent = h.start(None).await;

    let mut nested = Vec::new();
    for i in 0..3 {
        let url = format!("http://svc/closed-{}", i);
        let activity = h.activity(&url);
        let child = h.start(Some(&parent)).await;
        h.join(&child, &url).await;
        assert_eq!(h.coordinator.close_lra(&child).await.unwrap(), LraStatus::Completed);
        nested.push((child, activity));
    }

    // finished nested LRAs stay listed while the parent is open
    let active = h.coordinator.get_active_lras().await;
    for (child, _) in &nested {
        assert!(active.iter().any(|info| &info.lra_id == child));
    }

    assert_eq!(
        h.coordinator.cancel_lra(&nested[0].0).await.unwrap(),
        LraStatus::Compensated
    );
    assert_eq!(h.coordinator.close_lra(&parent).await.unwrap(), LraStatus::Completed);

    let compensations: usize = nested.iter().map(|(_, a)| a.compensations()).sum();
    let completions: usize = nested.iter().map(|(_, a)| a.completions()).sum();
    assert_eq!(compensations, 1);
    assert_eq!(completions, 3);
    assert_eq!(nested[0].1.compensations(), 1);
    assert!(h.coordinator.is_compensated_lra(&nested[0].0).await.unwrap());
    assert!(h.coordinator.is_completed_lra(&nested[1].0).await.unwrap());

    // the parent finished, so nothing is held any more
    assert!(h.coordinator.get_active_lras().await.is_empty());
    assert!(h.coordinator.cancel_lra(&nested[1].0).await.is_err());
}

#[tokio::test]
async fn cancelled_parent_compensates_open_children() {
    let h = Harness::new().await;
    let child_activity = h.activity("http://svc/child");
    let parent = h.start(None).await;
    let child = h.start(Some(&parent)).await;
    h.join(&child, "http://svc/child").await;

    assert_eq!(h.coordinator.cancel_lra(&parent).await.unwrap(), LraStatus::Compensated);
    assert_eq!(h.coordinator.get_status(&child).await.unwrap(), Some(LraStatus::Compensated));
    assert_eq!(child_activity.compensations(), 1);
}

#[tokio::test]
async fn nested_start_under_unknown_parent_fails() {
    let h = Harness::new().await;
    let unknown = LraId::generate("http://localhost:8080/lra-coordinator");
    assert!(h
        .coordinator
        .start_lra(Some(&unknown), "tck", Duration::zero())
        .await
        .is_err());
}

#[tokio::test]
async fn recovery_survives_restart() {
    let store = Arc::new(MemoryStore::new());
    let lra_id = {
        let h = Harness::with_store(store.clone()).await;
        let lra_id = h.start(None).await;
        h.join(&lra_id, "http://svc/p1").await;
        // nobody mounted: the compensation stays pending
        assert_eq!(h.coordinator.cancel_lra(&lra_id).await.unwrap(), LraStatus::Compensating);
        h.coordinator.stop().await.unwrap();
        lra_id
    };

    let h = Harness::with_store(store).await;
    let p1 = h.activity("http://svc/p1");
    assert_eq!(h.coordinator.get_recovering_lras().await.len(), 1);

    assert!(h.coordinator.trigger_recovery().await.unwrap().is_empty());
    assert_eq!(h.coordinator.get_status(&lra_id).await.unwrap(), Some(LraStatus::Compensated));
    assert_eq!(p1.compensations(), 1);
}

#[tokio::test]
async fn filter_runs_operation_in_new_lra() {
    let h = Harness::new().await;
    let orders = h.activity("http://svc/orders");
    let filter = LraFilter::new(
        Arc::new(LocalClient(h.coordinator.clone())),
        ParticipantConfig {
            base_url: "http://svc".to_string(),
            ..ParticipantConfig::default()
        },
    );
    let policy = LraPolicy::new(LraType::Required);

    let ctx = filter.on_entry(&policy, None, "orders", None).await.unwrap();
    let lra_id = ctx.lra_id.clone().unwrap();
    assert!(h.coordinator.is_active_lra(&lra_id).await.unwrap());

    let exit = filter.on_exit(&policy, ctx, 200).await.unwrap();
    assert_eq!(exit.ended, Some((lra_id, LraStatus::Completed)));
    assert_eq!(orders.completions(), 1);
}

#[tokio::test]
async fn filter_cancels_on_failed_nested_operation() {
    let h = Harness::new().await;
    let orders = h.activity("http://svc/orders");
    let filter = LraFilter::new(
        Arc::new(LocalClient(h.coordinator.clone())),
        ParticipantConfig {
            base_url: "http://svc".to_string(),
            ..ParticipantConfig::default()
        },
    );
    let parent = h.start(None).await;
    let policy = LraPolicy::new(LraType::Mandatory).nested();

    let ctx = filter.on_entry(&policy, Some(&parent), "orders", None).await.unwrap();
    let child = ctx.lra_id.clone().unwrap();
    assert_ne!(child, parent);

    let exit = filter.on_exit(&policy, ctx, 500).await.unwrap();
    assert_eq!(exit.ended, Some((child, LraStatus::Compensated)));
    assert_eq!(orders.compensations(), 1);
    assert!(h.coordinator.is_active_lra(&parent).await.unwrap());
}
