use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use taskmesh_core::{TaskmeshError, TaskmeshResult};

/// Tunables for an [`Engine`](crate::Engine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on concurrently executing tasks.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Used when a submission does not carry its own timeout.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Used when a submission does not carry its own retry budget.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Whether a timed-out attempt consumes the retry budget instead of
    /// going straight to dead-letter.
    #[serde(default)]
    pub retry_on_timeout: bool,
    /// Fallback wake-up for workflow loops, which are otherwise woken by
    /// task completion events.
    #[serde(default = "default_workflow_poll_interval_ms")]
    pub workflow_poll_interval_ms: u64,
    /// Capacity of the state-change broadcast channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_max_workers() -> usize {
    4
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_workflow_poll_interval_ms() -> u64 {
    500
}

fn default_event_buffer() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            default_timeout_secs: default_timeout_secs(),
            default_max_retries: default_max_retries(),
            retry_on_timeout: false,
            workflow_poll_interval_ms: default_workflow_poll_interval_ms(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl EngineConfig {
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_default_timeout_secs(mut self, secs: u64) -> Self {
        self.default_timeout_secs = secs;
        self
    }

    pub fn with_default_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = retries;
        self
    }

    pub fn with_retry_on_timeout(mut self, retry: bool) -> Self {
        self.retry_on_timeout = retry;
        self
    }

    pub fn with_workflow_poll_interval_ms(mut self, ms: u64) -> Self {
        self.workflow_poll_interval_ms = ms;
        self
    }

    pub fn workflow_poll_interval(&self) -> Duration {
        Duration::from_millis(self.workflow_poll_interval_ms)
    }

    /// Parse a TOML document containing the engine fields at top level.
    pub fn from_toml_str(raw: &str) -> TaskmeshResult<Self> {
        let config: EngineConfig = toml::from_str(raw)
            .map_err(|e| TaskmeshError::Config(format!("invalid engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> TaskmeshResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            TaskmeshError::Config(format!("failed to read '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> TaskmeshResult<()> {
        if self.max_workers == 0 {
            return Err(TaskmeshError::Config(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if self.default_timeout_secs == 0 {
            return Err(TaskmeshError::Config(
                "default_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.workflow_poll_interval_ms == 0 {
            return Err(TaskmeshError::Config(
                "workflow_poll_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(TaskmeshError::Config(
                "event_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
