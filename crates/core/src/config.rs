//! Engine configuration (spec §6).
//!
//! Loadable from TOML or JSON via serde; every field has a documented
//! default so an embedding application can start from `EngineConfig::default()`
//! and override only what it needs.

use crate::registry::matcher::MatcherWeights;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default retry policy applied to a step that omits its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryDefaults {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// Initial backoff before the first retry.
    pub initial_backoff_ms: u64,
    /// Backoff multiplier applied after each attempt.
    pub backoff_multiplier: f64,
    /// Maximum backoff delay, regardless of multiplier growth.
    pub backoff_cap_ms: u64,
    /// Jitter fraction in `[0, 1]` applied to each computed delay.
    pub jitter: f64,
    /// Error kinds (spec §7 names) that trigger a retry.
    pub retry_on: Vec<String>,
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            backoff_multiplier: 2.0,
            backoff_cap_ms: 10_000,
            jitter: 0.2,
            retry_on: vec![
                "transient".to_string(),
                "timeout".to_string(),
                "noCandidates".to_string(),
                "agentFailure".to_string(),
            ],
        }
    }
}

/// One alert rule as loaded from configuration (spec §6 `alertRules`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRuleConfig {
    /// Rule name, used as part of the dedup key `"{name}:{subject}"`.
    pub name: String,
    /// Which sampled signal this rule watches.
    pub signal: orchestrator_observability::Signal,
    /// Comparison applied to `signal` against `threshold`.
    pub comparator: orchestrator_observability::Comparator,
    /// Threshold value.
    pub threshold: f64,
    /// Severity assigned when the rule fires.
    pub severity: orchestrator_observability::Severity,
    /// Minimum time between re-reports of an already-active alert.
    pub cooldown_ms: u64,
}

impl From<AlertRuleConfig> for orchestrator_observability::AlertRule {
    fn from(cfg: AlertRuleConfig) -> Self {
        orchestrator_observability::AlertRule::new(
            cfg.name,
            cfg.signal,
            cfg.comparator,
            cfg.threshold,
            cfg.severity,
            Duration::from_millis(cfg.cooldown_ms),
        )
    }
}

/// Top-level engine configuration (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Engine-wide cap on running executions.
    pub max_concurrent_workflows: usize,
    /// Cap on running steps within one execution.
    pub max_concurrent_steps_per_workflow: usize,
    /// Cap on in-flight assignments per step.
    pub max_concurrent_assignments_per_step: usize,
    /// Expected interval between agent heartbeats.
    pub heartbeat_interval_ms: u64,
    /// Time after which a missed heartbeat marks an agent unreachable.
    pub heartbeat_timeout_ms: u64,
    /// Consecutive failures before an agent is marked degraded.
    pub degraded_after_failures: u32,
    /// Consecutive successes required to clear degraded status.
    pub recovered_after_successes: u32,
    /// Timer period for periodic checkpoints.
    pub checkpoint_interval_ms: u64,
    /// Checkpoint level used when a step doesn't request one explicitly.
    pub default_checkpoint_level: crate::state_manager::CheckpointLevel,
    /// Maximum checkpoints retained per execution (spec §4.4 retention).
    pub max_checkpoints_per_execution: usize,
    /// Performance Monitor sampling period.
    pub monitor_sample_period_ms: u64,
    /// Workflow metric retention window.
    pub metric_retention_ms: u64,
    /// Weights used by the `weighted` matcher strategy.
    pub matcher_weights: MatcherWeights,
    /// Default retry policy for steps that omit one.
    pub retry_defaults: RetryDefaults,
    /// Grace window for cooperative cancellation.
    pub cancel_grace_ms: u64,
    /// Maximum compare-and-set retries before `ErrConcurrentMutation`.
    pub max_cas_retries: u32,
    /// Whether checkpoint payloads are zstd-compressed (honored by
    /// `FileCheckpointer`; `MemoryCheckpointer` never serializes a byte
    /// payload so it has nothing to compress).
    pub compression_enabled: bool,
    /// Configured alert rules.
    pub alert_rules: Vec<AlertRuleConfig>,
    /// Minimum health score required to start new steps without `force`.
    pub min_health_for_start: f64,
    /// Maximum hierarchical delegation depth (spec §9 Open Question #3).
    pub max_delegation_depth: u32,
    /// Size of the decoded-`ExecutionState` LRU cache.
    pub state_cache_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 256,
            max_concurrent_steps_per_workflow: 32,
            max_concurrent_assignments_per_step: 16,
            heartbeat_interval_ms: 10_000,
            heartbeat_timeout_ms: 30_000,
            degraded_after_failures: 3,
            recovered_after_successes: 5,
            checkpoint_interval_ms: 60_000,
            default_checkpoint_level: crate::state_manager::CheckpointLevel::Standard,
            max_checkpoints_per_execution: 10,
            monitor_sample_period_ms: 30_000,
            metric_retention_ms: 300_000,
            matcher_weights: MatcherWeights::default(),
            retry_defaults: RetryDefaults::default(),
            cancel_grace_ms: 5_000,
            max_cas_retries: 5,
            compression_enabled: true,
            alert_rules: Vec::new(),
            min_health_for_start: 20.0,
            max_delegation_depth: 4,
            state_cache_size: 256,
        }
    }
}

impl EngineConfig {
    /// Parse configuration from a TOML document.
    pub fn from_toml(input: &str) -> crate::error::Result<Self> {
        toml::from_str(input).map_err(|e| crate::error::Error::Validation(e.to_string()))
    }

    /// Parse configuration from a JSON document.
    pub fn from_json(input: &str) -> crate::error::Result<Self> {
        serde_json::from_str(input).map_err(|e| crate::error::Error::Validation(e.to_string()))
    }

    /// Heartbeat timeout as a [`Duration`].
    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Cancellation grace window as a [`Duration`].
    #[must_use]
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let cfg = EngineConfig::default();
        let serialized = toml::to_string(&cfg).expect("serialize");
        let reloaded = EngineConfig::from_toml(&serialized).expect("parse");
        assert_eq!(
            reloaded.max_concurrent_workflows,
            cfg.max_concurrent_workflows
        );
        assert_eq!(reloaded.max_cas_retries, cfg.max_cas_retries);
    }

    #[test]
    fn default_config_round_trips_through_json() {
        let cfg = EngineConfig::default();
        let serialized = serde_json::to_string(&cfg).expect("serialize");
        let reloaded = EngineConfig::from_json(&serialized).expect("parse");
        assert_eq!(reloaded.cancel_grace_ms, cfg.cancel_grace_ms);
    }
}
