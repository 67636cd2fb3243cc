//! LRA Common Types
//!
//! Shared types for the Long Running Action coordinator and its participants:
//! identifiers, the status state machine, LRA and participant records, and the
//! participant callback contract.

pub mod callback;
pub mod error;
pub mod identifiers;
pub mod lra;
pub mod participant;
pub mod status;
pub mod time;

pub use callback::*;
pub use error::*;
pub use identifiers::*;
pub use lra::*;
pub use participant::*;
pub use status::*;
pub use time::*;
