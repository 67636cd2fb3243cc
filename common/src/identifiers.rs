//! Identifier types for LRAs and their participants.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::LraError;

/// Identifier of a Long Running Action.
///
/// An LRA id is an absolute URI made of the coordinator base url followed by a
/// time-ordered UUID v7 path segment, e.g.
/// `http://localhost:8080/lra-coordinator/0190c7a4-...`. It is opaque to
/// participants; the coordinator only relies on it being stable and comparable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct LraId(String);

impl LraId {
    /// Create a new LRA id under the given coordinator base url.
    pub fn generate(base_url: &str) -> Self {
        Self(format!("{}/{}", base_url.trim_end_matches('/'), Uuid::now_v7()))
    }

    /// Parse and validate an LRA id.
    pub fn parse(s: &str) -> Result<Self, LraError> {
        let (base, uid) = s
            .rsplit_once('/')
            .ok_or_else(|| LraError::InvalidIdentifier(s.to_string()))?;
        if base.is_empty() || Uuid::parse_str(uid).is_err() {
            return Err(LraError::InvalidIdentifier(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The unique path segment of the id.
    pub fn uid(&self) -> &str {
        self.0.rsplit_once('/').map(|(_, uid)| uid).unwrap_or(&self.0)
    }

    /// The coordinator base url the id was minted under.
    pub fn base_url(&self) -> &str {
        self.0.rsplit_once('/').map(|(base, _)| base).unwrap_or("")
    }
}

impl fmt::Display for LraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LraId {
    type Err = LraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for LraId {
    type Error = LraError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

/// Identifier of a participant enlistment, scoped to one LRA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId(Uuid);

impl ParticipantId {
    /// Create a new participant ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parse from string.
    pub fn parse(s: &str) -> Result<Self, LraError> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| LraError::InvalidIdentifier(s.to_string()))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ParticipantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
