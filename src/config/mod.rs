use crate::utils::error::{PoolError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Which end of the idle queue a returned connection goes to.
///
/// Connections are always handed out from the tail, so the names describe
/// the observable reuse order rather than the push position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnPolicy {
    /// Push to the tail: the most recently returned connection is reused first.
    #[default]
    StackOrder,
    /// Push to the head: connections are reused in the order they were returned.
    QueueOrder,
}

/// Pool configuration.
///
/// Zero values are treated as "unset" by [`PoolConfig::merge`], which is how
/// partially filled configs fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Connections dialed eagerly when the pool is created
    #[serde(default = "default_initial_capacity")]
    pub initial_capacity: usize,
    /// Upper bound on live connections (idle + borrowed)
    #[serde(default = "default_max_capacity")]
    pub max_capacity: usize,
    /// Idle connections older than this are invalidated (milliseconds)
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Longest `acquire` may wait for capacity (milliseconds)
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Per-operation read/write timeout on borrowed connections (milliseconds)
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    /// Timeout for establishing new connections (milliseconds)
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default)]
    pub return_policy: ReturnPolicy,
}

fn default_initial_capacity() -> usize {
    0
}

fn default_max_capacity() -> usize {
    1
}

fn default_idle_timeout_ms() -> u64 {
    3_000
}

fn default_acquire_timeout_ms() -> u64 {
    3_000
}

fn default_io_timeout_ms() -> u64 {
    30_000
}

fn default_dial_timeout_ms() -> u64 {
    30_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_capacity: default_initial_capacity(),
            max_capacity: default_max_capacity(),
            idle_timeout_ms: default_idle_timeout_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
            dial_timeout_ms: default_dial_timeout_ms(),
            return_policy: ReturnPolicy::default(),
        }
    }
}

impl PoolConfig {
    /// Merge `incoming` into a copy of `self`.
    ///
    /// Max capacity and the four timeouts are adopted when the incoming value
    /// is non-zero and differs. Returns the merged config and whether any of
    /// them changed. Initial capacity and return policy only matter at
    /// construction and are never merged.
    pub fn merge(&self, incoming: &PoolConfig) -> (PoolConfig, bool) {
        let mut result = self.clone();
        let mut changed = false;

        if incoming.max_capacity > 0 && incoming.max_capacity != result.max_capacity {
            result.max_capacity = incoming.max_capacity;
            changed = true;
        }

        for (current, new) in [
            (&mut result.dial_timeout_ms, incoming.dial_timeout_ms),
            (&mut result.io_timeout_ms, incoming.io_timeout_ms),
            (&mut result.acquire_timeout_ms, incoming.acquire_timeout_ms),
            (&mut result.idle_timeout_ms, incoming.idle_timeout_ms),
        ] {
            if new > 0 && new != *current {
                *current = new;
                changed = true;
            }
        }

        (result, changed)
    }

    /// Fill unset fields from the defaults, keeping the construction-time
    /// settings from `self`.
    pub fn with_defaults(&self) -> PoolConfig {
        let (mut merged, _) = PoolConfig::default().merge(self);
        merged.initial_capacity = self.initial_capacity;
        merged.return_policy = self.return_policy;
        merged
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_capacity == 0 {
            return Err(PoolError::InvalidConfiguration(
                "max_capacity must be greater than 0".to_string(),
            ));
        }

        if self.initial_capacity > self.max_capacity {
            return Err(PoolError::InvalidConfiguration(format!(
                "initial_capacity ({}) exceeds max_capacity ({})",
                self.initial_capacity, self.max_capacity
            )));
        }

        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// Parse configuration from a TOML document, applying defaults and validation
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PoolConfig = toml::from_str(content)
            .map_err(|e| PoolError::Config(format!("Failed to parse config: {}", e)))?;

        let config = config.with_defaults();
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from file. An unreadable file is `PoolError::Io`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;

        Self::from_toml_str(&content)
    }

    /// Create example configuration file
    pub fn create_example<P: AsRef<Path>>(path: P) -> Result<()> {
        let example = r#"# Connections dialed when the pool is created
initial_capacity = 0
# Hard limit on live connections
max_capacity = 8

idle_timeout_ms = 3000
acquire_timeout_ms = 3000
io_timeout_ms = 30000
dial_timeout_ms = 30000

return_policy = "stack_order"  # Options: "stack_order", "queue_order"
"#;

        std::fs::write(path.as_ref(), example)?;

        Ok(())
    }
}
