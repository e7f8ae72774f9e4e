//! Configuration for the hub controllers.

use std::time::Duration;

use anyhow::Result;

/// Default size budget for one resource sub-snapshot, in bytes of
/// serialized manifest content.
pub const DEFAULT_SNAPSHOT_SIZE_BUDGET_BYTES: usize = 1024 * 1024;

/// Default cap on the failed-placements list of a binding.
pub const DEFAULT_MAX_FAILED_PLACEMENTS: usize = 20;

/// Default cap on new PickN selections per scheduling cycle.
pub const DEFAULT_MAX_BATCH_PER_CYCLE: u32 = 100;

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Interval between full resync passes of each controller.
    pub resync_interval: Duration,

    /// Size budget for one resource sub-snapshot.
    pub snapshot_size_budget_bytes: usize,

    /// Cap on the failed-placements list per binding.
    pub max_failed_placements: usize,

    /// Cap on new PickN selections per scheduling cycle.
    pub max_batch_per_cycle: u32,

    /// How long a rollout may make no progress before it is reported stuck.
    pub rollout_stuck_threshold: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            resync_interval: Duration::from_secs(30),
            snapshot_size_budget_bytes: DEFAULT_SNAPSHOT_SIZE_BUDGET_BYTES,
            max_failed_placements: DEFAULT_MAX_FAILED_PLACEMENTS,
            max_batch_per_cycle: DEFAULT_MAX_BATCH_PER_CYCLE,
            rollout_stuck_threshold: Duration::from_secs(5 * 60),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let log_level =
            std::env::var("FLEET_LOG_LEVEL").unwrap_or_else(|_| defaults.log_level.clone());

        let resync_interval = env_secs("FLEET_RECONCILE_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.resync_interval);

        let snapshot_size_budget_bytes = env_parse("FLEET_SNAPSHOT_SIZE_BUDGET_BYTES")?
            .unwrap_or(defaults.snapshot_size_budget_bytes);

        let max_failed_placements =
            env_parse("FLEET_MAX_FAILED_PLACEMENTS")?.unwrap_or(defaults.max_failed_placements);

        let max_batch_per_cycle =
            env_parse("FLEET_MAX_BATCH_PER_CYCLE")?.unwrap_or(defaults.max_batch_per_cycle);

        let rollout_stuck_threshold = env_secs("FLEET_ROLLOUT_STUCK_THRESHOLD_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.rollout_stuck_threshold);

        Ok(Self {
            log_level,
            resync_interval,
            snapshot_size_budget_bytes,
            max_failed_placements,
            max_batch_per_cycle,
            rollout_stuck_threshold,
        })
    }
}

fn env_secs(key: &str) -> Result<Option<u64>> {
    env_parse(key)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => Ok(Some(raw.parse()?)),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_failed_placements, DEFAULT_MAX_FAILED_PLACEMENTS);
        assert_eq!(
            config.snapshot_size_budget_bytes,
            DEFAULT_SNAPSHOT_SIZE_BUDGET_BYTES
        );
    }
}
