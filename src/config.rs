use std::time::Duration;

use anyhow::{bail, Result};
use serde::Deserialize;

/// Aggregation engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorConfig {
    /// Interval between maintenance sweeps across owned shards.
    /// Zero disables the tick worker. Default: 1m.
    #[serde(default = "default_check_interval", with = "humantime_serde")]
    pub check_interval: Duration,

    /// How often the placement watcher re-fetches the placement even
    /// without a change notification. Default: 10s.
    #[serde(default = "default_placement_check_interval", with = "humantime_serde")]
    pub placement_check_interval: Duration,

    /// Upper bound on how long an election resignation may take. Default: 1m.
    #[serde(default = "default_resign_timeout", with = "humantime_serde")]
    pub resign_timeout: Duration,

    /// Accept writes regardless of shard cutover/cutoff windows.
    #[serde(default)]
    pub writes_ignore_cutoff_cutover: bool,

    /// Rewrite every pipeline with reset transforms on ingest.
    #[serde(default)]
    pub add_to_reset: bool,

    /// Regex allowlist of rollup ids whose pipelines may keep resend
    /// enabled. Patterns that fail to compile are logged and skipped.
    #[serde(default)]
    pub resend_enabled_rollup_patterns: Vec<String>,

    /// Namespace prefix applied to every exported metric. Default: "shardagg".
    #[serde(default = "default_metrics_namespace")]
    pub metrics_namespace: String,
}

// --- Default value functions ---

fn default_check_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_placement_check_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_resign_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_metrics_namespace() -> String {
    "shardagg".to_string()
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            placement_check_interval: default_placement_check_interval(),
            resign_timeout: default_resign_timeout(),
            writes_ignore_cutoff_cutover: false,
            add_to_reset: false,
            resend_enabled_rollup_patterns: Vec::new(),
            metrics_namespace: default_metrics_namespace(),
        }
    }
}

impl AggregatorConfig {
    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.placement_check_interval.is_zero() {
            bail!("placement_check_interval must be positive");
        }

        if self.resign_timeout.is_zero() {
            bail!("resign_timeout must be positive");
        }

        if self.metrics_namespace.is_empty() {
            bail!("metrics_namespace is required");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = AggregatorConfig::default();
        assert_eq!(cfg.check_interval, Duration::from_secs(60));
        assert_eq!(cfg.placement_check_interval, Duration::from_secs(10));
        assert_eq!(cfg.resign_timeout, Duration::from_secs(60));
        assert!(!cfg.writes_ignore_cutoff_cutover);
        assert!(!cfg.add_to_reset);
        assert!(cfg.resend_enabled_rollup_patterns.is_empty());
        assert_eq!(cfg.metrics_namespace, "shardagg");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_deserialize_with_humantime_durations() {
        let cfg: AggregatorConfig = serde_yaml::from_str(
            r#"
check_interval: 30s
placement_check_interval: 5s
resign_timeout: 2m
writes_ignore_cutoff_cutover: true
resend_enabled_rollup_patterns:
  - "^rollup\\.foo$"
"#,
        )
        .expect("config should parse");

        assert_eq!(cfg.check_interval, Duration::from_secs(30));
        assert_eq!(cfg.placement_check_interval, Duration::from_secs(5));
        assert_eq!(cfg.resign_timeout, Duration::from_secs(120));
        assert!(cfg.writes_ignore_cutoff_cutover);
        assert_eq!(cfg.resend_enabled_rollup_patterns.len(), 1);
    }

    #[test]
    fn test_validation_rejects_zero_placement_interval() {
        let cfg = AggregatorConfig {
            placement_check_interval: Duration::ZERO,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("placement_check_interval"));
    }

    #[test]
    fn test_validation_rejects_zero_resign_timeout() {
        let cfg = AggregatorConfig {
            resign_timeout: Duration::ZERO,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("resign_timeout"));
    }

    #[test]
    fn test_zero_check_interval_is_allowed() {
        // Disables the tick worker rather than failing validation.
        let cfg = AggregatorConfig {
            check_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }
}
