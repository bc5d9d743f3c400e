use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Runtime tuning for one engine instance.
///
/// The host wires channels, plugins and the remote KV store; this struct only
/// carries the knobs the engine itself owns. Every field has a production
/// default, so `EngineConfig::default()` is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Project identifier, forwarded to the sampler.
    pub project_id: String,
    /// Position of this ruleset instance in the project wiring. A `TEST.`
    /// prefix marks a test-mode instance and disables sampling.
    pub project_node_sequence: String,
    /// Lower bound for the worker pool. `None` derives `max(2, cpu/2)`.
    pub pool_min: Option<usize>,
    /// Upper bound for the worker pool. `None` derives `max(16, cpu*8)`.
    pub pool_max: Option<usize>,
    /// Seconds between auto-scaler backlog checks.
    pub scale_interval_secs: u64,
    /// Seconds between QPS recomputations.
    pub qps_interval_secs: u64,
    /// Seconds to wait for the upstream side to drain on stop, and again for
    /// the downstream side.
    pub drain_timeout_secs: u64,
    /// Entry cap for the local threshold counter cache.
    pub local_cache_max_entries: u64,
    /// Cost budget (bytes) for the local threshold counter cache.
    pub local_cache_max_cost: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            project_id: String::new(),
            project_node_sequence: String::new(),
            pool_min: None,
            pool_max: None,
            scale_interval_secs: 20,
            qps_interval_secs: 1,
            drain_timeout_secs: 10,
            local_cache_max_entries: 10_000_000,
            local_cache_max_cost: 64 * 1024 * 1024,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.scale_interval_secs == 0 {
            return Err(EngineError::config("scale_interval_secs must be positive"));
        }
        if self.qps_interval_secs == 0 {
            return Err(EngineError::config("qps_interval_secs must be positive"));
        }
        if self.local_cache_max_entries == 0 {
            return Err(EngineError::config(
                "local_cache_max_entries must be positive",
            ));
        }
        let (min, max) = self.pool_bounds();
        if min > max {
            return Err(EngineError::config(format!(
                "pool_min {} exceeds pool_max {}",
                min, max
            )));
        }
        Ok(())
    }

    /// Worker pool bounds: `min = max(2, cpu/2)`, `max = max(16, cpu*8)`
    /// unless overridden.
    pub fn pool_bounds(&self) -> (usize, usize) {
        let cpus = num_cpus::get();
        let min = self.pool_min.unwrap_or_else(|| std::cmp::max(2, cpus / 2));
        let max = self.pool_max.unwrap_or_else(|| std::cmp::max(16, cpus * 8));
        (min, max)
    }

    /// True when this instance runs under a test harness; sampling is skipped.
    pub fn is_test_mode(&self) -> bool {
        self.project_node_sequence.starts_with("TEST.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn pool_bounds_respect_overrides() {
        let mut config = EngineConfig::default();
        config.pool_min = Some(4);
        config.pool_max = Some(32);
        assert_eq!(config.pool_bounds(), (4, 32));
    }

    #[test]
    fn rejects_inverted_pool_bounds() {
        let mut config = EngineConfig::default();
        config.pool_min = Some(64);
        config.pool_max = Some(8);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mode_gate() {
        let mut config = EngineConfig::default();
        config.project_node_sequence = "TEST.p1.input1.ruleset1".to_string();
        assert!(config.is_test_mode());
        config.project_node_sequence = "p1.input1.ruleset1".to_string();
        assert!(!config.is_test_mode());
    }
}
