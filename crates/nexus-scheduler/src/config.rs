//! Configuration for the scheduler process

use nexus_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Consecutive model-table push failures after which a backend is marked
/// dead and left to the next beacon sweep.
pub const MAX_PUSH_FAILURES: u32 = 3;

/// Complete configuration for the scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Port the control RPC service listens on
    pub port: u16,

    /// Number of runtime worker threads
    pub nthread: usize,

    /// Model database root directory
    pub model_root: PathBuf,

    /// Optional static workload file (YAML)
    pub workload_file: Option<PathBuf>,

    /// Liveness/rps sampling interval in seconds
    pub beacon_interval_sec: u64,

    /// Epoch rescheduling interval in seconds
    pub epoch_interval_sec: u64,

    /// Enable the epoch rescheduling pass
    pub epoch_schedule: bool,

    /// Enable prefix batching across related models
    pub prefix_batch: bool,

    /// Prometheus exporter port (0 disables)
    pub metrics_port: u16,

    /// Deadline for outbound control pushes in milliseconds
    pub rpc_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            port: 10001,
            nthread: 4,
            model_root: PathBuf::from("/opt/nexus/models"),
            workload_file: None,
            beacon_interval_sec: 2,
            epoch_interval_sec: 10,
            epoch_schedule: true,
            prefix_batch: true,
            metrics_port: 0,
            rpc_timeout_ms: 1000,
        }
    }
}

impl SchedulerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.beacon_interval_sec == 0 {
            return Err(Error::config("beacon interval must be positive"));
        }
        if self.epoch_interval_sec < self.beacon_interval_sec {
            return Err(Error::config(
                "epoch interval must be at least the beacon interval",
            ));
        }
        if self.nthread == 0 {
            return Err(Error::config("nthread must be positive"));
        }
        Ok(())
    }

    /// Beacon interval as a duration
    pub fn beacon_interval(&self) -> Duration {
        Duration::from_secs(self.beacon_interval_sec)
    }

    /// Epoch interval as a duration
    pub fn epoch_interval(&self) -> Duration {
        Duration::from_secs(self.epoch_interval_sec)
    }

    /// Outbound push deadline
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Minimum rps samples before a session takes part in epoch scheduling
    pub fn min_history_len(&self) -> usize {
        self.epoch_interval_sec.div_ceil(self.beacon_interval_sec) as usize
    }

    /// Bound on the rps history window
    pub fn history_len(&self) -> usize {
        self.min_history_len() * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = SchedulerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.min_history_len(), 5);
        assert_eq!(config.history_len(), 10);
    }

    #[test]
    fn test_history_len_rounds_up() {
        let config = SchedulerConfig {
            beacon_interval_sec: 3,
            epoch_interval_sec: 10,
            ..Default::default()
        };
        assert_eq!(config.min_history_len(), 4);
        assert_eq!(config.history_len(), 8);
    }

    #[test]
    fn test_validate_rejects_bad_intervals() {
        let config = SchedulerConfig {
            beacon_interval_sec: 10,
            epoch_interval_sec: 2,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
