//! Alert rules, firing, and cooldown (spec §4.5, §7).

use crate::metrics::WorkflowMetricSample;
use crate::sampler::SystemSample;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Alert severity, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational only.
    Info,
    /// Worth a human glancing at, not urgent.
    Warn,
    /// Something is broken; surfaced in `corruption`/`agentFailure` paths.
    Error,
    /// Operator attention required (spec's `corruption`/`fatal` kinds).
    Critical,
}

/// A named signal the alert predicate can reference.
///
/// This is the "explicit and configurable" rule table the spec calls for
/// (§4.3, §4.5) rather than a free-form expression language: each rule
/// names one signal, a comparison, and a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    /// CPU utilization percent.
    CpuPercent,
    /// Memory utilization percent.
    MemoryPercent,
    /// Disk utilization percent.
    DiskPercent,
    /// Workflow error rate over the retained window.
    ErrorRate,
    /// Mean step latency in milliseconds.
    AvgStepLatencyMs,
    /// Queue depth (scheduled-but-not-running steps).
    QueueDepth,
    /// In-flight assignment count.
    Concurrency,
}

/// Comparison operator for a rule predicate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    /// `signal > threshold`
    GreaterThan,
    /// `signal >= threshold`
    GreaterOrEqual,
    /// `signal < threshold`
    LessThan,
    /// `signal <= threshold`
    LessOrEqual,
}

/// One alert rule: `predicate`, `severity`, `cooldownMs` (spec §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    /// Stable name identifying this rule, used as part of the alert id.
    pub name: String,
    /// Signal the predicate reads.
    pub signal: Signal,
    /// Comparison applied to the signal.
    pub comparator: Comparator,
    /// Threshold compared against the signal.
    pub threshold: f64,
    /// Severity assigned when this rule fires.
    pub severity: Severity,
    /// Minimum time between distinct firings on the same subject.
    pub cooldown: Duration,
}

impl AlertRule {
    /// Construct a rule from its parts.
    #[must_use]
    pub fn new(
        name: String,
        signal: Signal,
        comparator: Comparator,
        threshold: f64,
        severity: Severity,
        cooldown: Duration,
    ) -> Self {
        Self {
            name,
            signal,
            comparator,
            threshold,
            severity,
            cooldown,
        }
    }

    fn evaluate_signal(&self, system: &SystemSample, workflow: &WorkflowMetricSample) -> f64 {
        match self.signal {
            Signal::CpuPercent => system.cpu_percent,
            Signal::MemoryPercent => system.memory_percent,
            Signal::DiskPercent => system.disk_percent,
            Signal::ErrorRate => workflow.error_rate,
            Signal::AvgStepLatencyMs => workflow.avg_step_latency_ms,
            Signal::QueueDepth => workflow.queue_depth as f64,
            Signal::Concurrency => workflow.concurrency as f64,
        }
    }

    /// Evaluate the predicate against a combined sample.
    #[must_use]
    pub fn fires(&self, system: &SystemSample, workflow: &WorkflowMetricSample) -> bool {
        let value = self.evaluate_signal(system, workflow);
        match self.comparator {
            Comparator::GreaterThan => value > self.threshold,
            Comparator::GreaterOrEqual => value >= self.threshold,
            Comparator::LessThan => value < self.threshold,
            Comparator::LessOrEqual => value <= self.threshold,
        }
    }
}

/// A generated alert (spec §3 Alert).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Unique alert id: `{rule_name}:{subject}`.
    pub id: String,
    /// Severity of the rule that generated this alert.
    pub severity: Severity,
    /// Name of the rule that fired.
    pub rule: String,
    /// Subject the alert concerns (`workflowId`/`agentId`/`"system"`).
    pub subject: String,
    /// When this alert was first observed.
    pub first_seen: DateTime<Utc>,
    /// When this alert was last observed (updated on repeat firings within cooldown).
    pub last_seen: DateTime<Utc>,
    /// Number of times this alert has fired since `first_seen`.
    pub count: u64,
    /// Firings before this instant are folded into `count` rather than re-alerting.
    pub cooldown_until: DateTime<Utc>,
}

/// Evaluates alert rules against samples and tracks active alerts with cooldown.
pub struct AlertEngine {
    rules: Vec<AlertRule>,
    active: DashMap<String, Alert>,
}

impl AlertEngine {
    /// Construct an engine over a fixed rule table.
    #[must_use]
    pub fn new(rules: Vec<AlertRule>) -> Self {
        Self {
            rules,
            active: DashMap::new(),
        }
    }

    /// Evaluate all rules against one combined sample for `subject`.
    ///
    /// Returns alerts that newly fired or had their `last_seen`/`count`
    /// updated; a rule firing again within its cooldown window only updates
    /// the existing alert and is not re-returned as "new".
    pub fn evaluate(
        &self,
        subject: &str,
        system: &SystemSample,
        workflow: &WorkflowMetricSample,
    ) -> Vec<Alert> {
        let now = Utc::now();
        let mut newly_fired = Vec::new();

        for rule in &self.rules {
            if !rule.fires(system, workflow) {
                continue;
            }
            let key = format!("{}:{subject}", rule.name);
            match self.active.get_mut(&key) {
                Some(mut existing) => {
                    existing.count += 1;
                    existing.last_seen = now;
                    if now >= existing.cooldown_until {
                        existing.cooldown_until = now + chrono_duration(rule.cooldown);
                        newly_fired.push(existing.clone());
                    }
                }
                None => {
                    let alert = Alert {
                        id: key.clone(),
                        severity: rule.severity,
                        rule: rule.name.clone(),
                        subject: subject.to_string(),
                        first_seen: now,
                        last_seen: now,
                        count: 1,
                        cooldown_until: now + chrono_duration(rule.cooldown),
                    };
                    self.active.insert(key, alert.clone());
                    newly_fired.push(alert);
                }
            }
        }

        newly_fired
    }

    /// Clear an active alert, e.g. once the underlying condition recovers.
    pub fn clear(&self, rule_name: &str, subject: &str) -> Option<Alert> {
        self.active
            .remove(&format!("{rule_name}:{subject}"))
            .map(|(_, a)| a)
    }

    /// Snapshot all currently active alerts.
    #[must_use]
    pub fn active_alerts(&self) -> Vec<Alert> {
        self.active.iter().map(|r| r.clone()).collect()
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule() -> AlertRule {
        AlertRule {
            name: "high_error_rate".to_string(),
            signal: Signal::ErrorRate,
            comparator: Comparator::GreaterThan,
            threshold: 0.1,
            severity: Severity::Error,
            cooldown: Duration::from_secs(60),
        }
    }

    #[test]
    fn fires_when_threshold_exceeded() {
        let engine = AlertEngine::new(vec![rule()]);
        let system = SystemSample::default();
        let mut workflow = WorkflowMetricSample::default();
        workflow.error_rate = 0.5;

        let fired = engine.evaluate("wf-1", &system, &workflow);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].count, 1);
    }

    #[test]
    fn repeated_firing_within_cooldown_updates_but_does_not_rereport() {
        let engine = AlertEngine::new(vec![rule()]);
        let system = SystemSample::default();
        let mut workflow = WorkflowMetricSample::default();
        workflow.error_rate = 0.5;

        let first = engine.evaluate("wf-1", &system, &workflow);
        assert_eq!(first.len(), 1);

        let second = engine.evaluate("wf-1", &system, &workflow);
        assert!(second.is_empty(), "should not re-fire inside cooldown");

        let alerts = engine.active_alerts();
        assert_eq!(alerts[0].count, 2);
    }

    #[test]
    fn does_not_fire_below_threshold() {
        let engine = AlertEngine::new(vec![rule()]);
        let system = SystemSample::default();
        let workflow = WorkflowMetricSample::default();
        assert!(engine.evaluate("wf-1", &system, &workflow).is_empty());
    }
}
