//! LRA Participant Library
//!
//! Participant-side support for Long Running Actions: an interceptor chain
//! that applies an [`LraPolicy`] around service operations, and callback
//! handlers the coordinator drives on close, cancel and recovery.

pub mod client;
pub mod config;
pub mod filter;
pub mod handler;
pub mod policy;

pub use client::CoordinatorClient;
pub use config::ParticipantConfig;
pub use filter::{ExitOutcome, InvocationContext, LraFilter};
pub use handler::{CallbackContext, FnHandler, HandlerRegistry, ParticipantHandler, Reply};
pub use policy::{LraPolicy, LraType, StatusFamily};
