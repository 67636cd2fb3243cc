//! Coordinator configuration.

use std::time::Duration;

/// Recovery configuration.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Interval between periodic recovery scans. `None` leaves only the on-demand trigger.
    pub scan_interval: Option<Duration>,
    /// Maximum LRAs driven concurrently by one scan.
    pub max_concurrent_passes: usize,
    /// How long a finished top-level LRA stays queryable before it is purged.
    pub retention: Duration,
    /// How long a finished nested LRA is held while its parent never terminates.
    pub nested_retention: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            scan_interval: Some(Duration::from_secs(2)),
            max_concurrent_passes: 16,
            retention: Duration::from_secs(60),
            nested_retention: Duration::from_secs(600),
        }
    }
}

/// Deadline timer configuration.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// How often due deadlines are checked. `None` leaves deadlines to recovery scans.
    pub tick_interval: Option<Duration>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            tick_interval: Some(Duration::from_millis(100)),
        }
    }
}

/// Participant callback configuration.
#[derive(Debug, Clone)]
pub struct CallbackConfig {
    /// Connection establishment timeout.
    pub connect_timeout: Duration,
    /// Per-call timeout for complete, compensate, status and forget.
    pub request_timeout: Duration,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Main coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Node ID.
    pub node_id: Option<String>,
    /// Prefix of every LRA id minted by this coordinator.
    pub base_url: String,
    /// PostgreSQL URL. The in-memory store is used when absent.
    pub database_url: Option<String>,
    /// Recovery configuration.
    pub recovery_config: RecoveryConfig,
    /// Deadline timer configuration.
    pub timeout_config: TimeoutConfig,
    /// Participant callback configuration.
    pub callback_config: CallbackConfig,
    /// Enable metrics export.
    pub metrics_enabled: bool,
    /// Log level.
    pub log_level: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            base_url: "http://localhost:8080/lra-coordinator".to_string(),
            database_url: None,
            recovery_config: RecoveryConfig::default(),
            timeout_config: TimeoutConfig::default(),
            callback_config: CallbackConfig::default(),
            metrics_enabled: true,
            log_level: "info".to_string(),
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(node_id) = std::env::var("COORDINATOR_NODE_ID") {
            config.node_id = Some(node_id);
        }

        if let Ok(url) = std::env::var("LRA_COORDINATOR_BASE_URL") {
            config.base_url = url;
        }

        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.is_empty() {
                config.database_url = Some(url);
            }
        }

        if let Some(ms) = env_millis("LRA_RECOVERY_INTERVAL_MS") {
            config.recovery_config.scan_interval = (ms > 0).then(|| Duration::from_millis(ms));
        }

        if let Some(ms) = env_millis("LRA_RETENTION_MS") {
            config.recovery_config.retention = Duration::from_millis(ms);
        }

        if let Some(ms) = env_millis("LRA_CALLBACK_TIMEOUT_MS") {
            config.callback_config.request_timeout = Duration::from_millis(ms);
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.base_url.is_empty() {
            return Err("Base URL cannot be empty".to_string());
        }

        if self.recovery_config.scan_interval == Some(Duration::ZERO) {
            return Err("Recovery scan interval cannot be 0".to_string());
        }

        if self.timeout_config.tick_interval == Some(Duration::ZERO) {
            return Err("Timeout tick interval cannot be 0".to_string());
        }

        if self.recovery_config.max_concurrent_passes == 0 {
            return Err("Recovery concurrency must be at least 1".to_string());
        }

        if self.callback_config.connect_timeout > self.callback_config.request_timeout {
            return Err("Connect timeout cannot exceed request timeout".to_string());
        }

        Ok(())
    }
}

fn env_millis(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
