//! How an intercepted operation relates to the LRA context of its caller.

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Context behaviour of an intercepted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LraType {
    /// Join the incoming LRA, or start a new one when there is none.
    Required,
    /// Always start a new LRA, suspending any incoming one.
    RequiresNew,
    /// Join the incoming LRA, fail when there is none.
    Mandatory,
    /// Join the incoming LRA if there is one.
    Supports,
    /// Run outside any LRA, suspending an incoming one.
    NotSupported,
    /// Run outside any LRA, fail when one is present.
    Never,
}

/// Class of HTTP status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusFamily {
    Informational,
    Successful,
    Redirection,
    ClientError,
    ServerError,
}

impl StatusFamily {
    /// Family of a status code.
    pub fn of(code: u16) -> Option<Self> {
        match code {
            100..=199 => Some(StatusFamily::Informational),
            200..=299 => Some(StatusFamily::Successful),
            300..=399 => Some(StatusFamily::Redirection),
            400..=499 => Some(StatusFamily::ClientError),
            500..=599 => Some(StatusFamily::ServerError),
            _ => None,
        }
    }
}

/// Per-operation LRA behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LraPolicy {
    pub lra_type: LraType,
    /// Close an LRA started by this operation when it returns.
    pub end: bool,
    /// Close the LRA the operation ran in when it returns, even one it joined.
    pub terminal: bool,
    /// Start a nested LRA under the incoming one.
    pub nested: bool,
    /// Enlist the operation's resource as a participant.
    pub join: bool,
    /// Timeout of an LRA started by this operation. `None` uses the default.
    pub timeout: Option<Duration>,
    /// Status codes that cancel the LRA.
    pub cancel_on: Vec<u16>,
    /// Status code families that cancel the LRA.
    pub cancel_on_family: Vec<StatusFamily>,
}

impl LraPolicy {
    pub fn new(lra_type: LraType) -> Self {
        Self {
            lra_type,
            end: true,
            terminal: false,
            nested: false,
            join: true,
            timeout: None,
            cancel_on: Vec::new(),
            cancel_on_family: vec![StatusFamily::ClientError, StatusFamily::ServerError],
        }
    }

    /// Leave an LRA started by this operation open for a later call to end.
    pub fn delay_close(mut self) -> Self {
        self.end = false;
        self
    }

    /// End the incoming LRA when the operation returns.
    pub fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }

    pub fn nested(mut self) -> Self {
        self.nested = true;
        self
    }

    /// Do not enlist the resource.
    pub fn without_join(mut self) -> Self {
        self.join = false;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancel_on(mut self, code: u16) -> Self {
        self.cancel_on.push(code);
        self
    }

    /// Replace the cancelling families.
    pub fn cancel_on_family(mut self, families: Vec<StatusFamily>) -> Self {
        self.cancel_on_family = families;
        self
    }

    /// Whether a response with this status code cancels the LRA.
    pub fn should_cancel(&self, code: u16) -> bool {
        self.cancel_on.contains(&code)
            || StatusFamily::of(code).map_or(false, |f| self.cancel_on_family.contains(&f))
    }

    /// Whether the operation runs inside an LRA when one arrives.
    pub fn uses_incoming(&self) -> bool {
        matches!(
            self.lra_type,
            LraType::Required | LraType::Mandatory | LraType::Supports
        )
    }
}

impl Default for LraPolicy {
    fn default() -> Self {
        Self::new(LraType::Required)
    }
}
