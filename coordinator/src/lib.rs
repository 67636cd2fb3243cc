//! LRA Coordinator
//!
//! The coordinator owns Long Running Actions: it enlists participants, and
//! when an LRA is closed, cancelled or times out it drives every participant
//! to complete or compensate, retrying through recovery until each one
//! reaches a terminal status.

pub mod config;
pub mod coordinator;
pub mod lra_registry;
pub mod metrics;
pub mod participant_registry;
pub mod recovery;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod termination;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use config::CoordinatorConfig;
pub use coordinator::{Coordinator, CoordinatorBuilder};
pub use metrics::{Metrics, MetricsSnapshot, SharedMetrics};
pub use state::CoordinatorState;
pub use store::{LraStore, MemoryStore, PgStore, SharedStore};
pub use transport::HttpTransport;
