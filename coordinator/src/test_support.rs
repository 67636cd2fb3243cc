//! Scripted participant transport for unit tests.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use lra_common::{CallbackOutcome, CallbackRequest, ParticipantTransport};

/// Answers callbacks from per-endpoint scripts. An endpoint with no script
/// left reports success for the outcome being driven.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<CallbackOutcome>>>,
    delays: Mutex<HashMap<String, Duration>>,
    sent: Mutex<Vec<CallbackRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue answers for an endpoint.
    pub fn script(&self, endpoint: &str, outcomes: Vec<CallbackOutcome>) {
        self.scripts
            .lock()
            .entry(endpoint.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// Make an endpoint answer only after `delay`.
    pub fn delay(&self, endpoint: &str, delay: Duration) {
        self.delays.lock().insert(endpoint.to_string(), delay);
    }

    /// Number of calls made to an endpoint.
    pub fn calls(&self, endpoint: &str) -> usize {
        self.sent.lock().iter().filter(|r| r.endpoint == endpoint).count()
    }

    /// Every request in the order it was sent.
    pub fn requests(&self) -> Vec<CallbackRequest> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl ParticipantTransport for ScriptedTransport {
    async fn invoke(&self, request: &CallbackRequest) -> CallbackOutcome {
        self.sent.lock().push(request.clone());

        let delay = self.delays.lock().get(&request.endpoint).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .scripts
            .lock()
            .get_mut(&request.endpoint)
            .and_then(|queue| queue.pop_front());
        scripted.unwrap_or(CallbackOutcome::Finished(request.outcome.success_status()))
    }
}
