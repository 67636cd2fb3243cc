//! Participant configuration.

use chrono::Duration;

/// Configuration for a participant service.
#[derive(Debug, Clone)]
pub struct ParticipantConfig {
    /// Base URL the coordinator calls back on. Each resource registers
    /// `{base_url}/{resource}/complete` and its siblings.
    pub base_url: String,
    /// Label recorded as the client id of LRAs this service starts.
    pub client_id: String,
    /// Timeout of LRAs started without one in their policy. Zero means none.
    pub default_timeout: Duration,
    /// Time limit registered with every enlistment.
    pub time_limit: Option<Duration>,
}

impl Default for ParticipantConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8081".to_string(),
            client_id: "lra-participant".to_string(),
            default_timeout: Duration::zero(),
            time_limit: None,
        }
    }
}

impl ParticipantConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("LRA_PARTICIPANT_BASE_URL") {
            config.base_url = url;
        }

        if let Ok(client_id) = std::env::var("LRA_CLIENT_ID") {
            config.client_id = client_id;
        }

        if let Some(ms) = std::env::var("LRA_DEFAULT_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
        {
            config.default_timeout = Duration::milliseconds(ms);
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.base_url.is_empty() {
            return Err("Participant base URL cannot be empty".to_string());
        }

        if self.base_url.ends_with('/') {
            return Err("Participant base URL must not end with '/'".to_string());
        }

        if self.time_limit.map_or(false, |t| t <= Duration::zero()) {
            return Err("Participant time limit must be positive".to_string());
        }

        Ok(())
    }

    /// Endpoint base for one resource.
    pub fn resource_url(&self, resource: &str) -> String {
        format!("{}/{}", self.base_url, resource.trim_matches('/'))
    }
}
