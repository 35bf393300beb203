//! Performance Monitor (spec §4.5).
//!
//! Ties the system sampler, workflow metrics collector, alert engine, and
//! health score together, and publishes everything through a caller-supplied
//! sink. The monitor never mutates core execution state — it only publishes
//! (spec §4.5 "No mutation of core state").

use crate::alerts::{Alert, AlertEngine, AlertRule};
use crate::health::{HealthScore, HealthWeights};
use crate::metrics::{WorkflowEvent, WorkflowMetricSample, WorkflowMetricsCollector};
use crate::sampler::{SystemSample, SystemSampler};
use std::sync::Arc;
use std::time::Duration;

/// Sink the monitor publishes samples and alerts into.
///
/// The orchestration core implements this over its event bus so that
/// `metric.sample`, `alert.fired`, and `alert.cleared` (spec §6) are emitted
/// without `orchestrator-observability` depending on `orchestrator-core`.
pub trait MonitorSink: Send + Sync {
    /// Called once per sampling period with the combined system+workflow sample.
    fn on_sample(&self, system: SystemSample, workflow: WorkflowMetricSample, health: HealthScore);
    /// Called whenever a rule newly fires (or re-fires after cooldown).
    fn on_alert(&self, alert: Alert);
}

/// Configuration for the Performance Monitor (spec §6).
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// How often to sample system + workflow signals. Default 30s (spec §4.5).
    pub sample_period: Duration,
    /// How long workflow events are retained for rollup.
    pub metric_retention: Duration,
    /// Alert rule table.
    pub alert_rules: Vec<AlertRule>,
    /// Weights for the blended health score.
    pub health_weights: HealthWeights,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_period: crate::sampler::DEFAULT_SAMPLE_PERIOD,
            metric_retention: Duration::from_secs(300),
            alert_rules: Vec::new(),
            health_weights: HealthWeights::default(),
        }
    }
}

/// The Performance Monitor.
pub struct PerformanceMonitor {
    sampler: SystemSampler,
    workflow_metrics: WorkflowMetricsCollector,
    alerts: AlertEngine,
    config: MonitorConfig,
    on_time: OnTimeTracker,
}

struct OnTimeTracker {
    window: parking_lot::Mutex<std::collections::VecDeque<bool>>,
    capacity: usize,
}

impl OnTimeTracker {
    fn new(capacity: usize) -> Self {
        Self {
            window: parking_lot::Mutex::new(std::collections::VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn record(&self, on_time: bool) {
        let mut window = self.window.lock();
        if window.len() == self.capacity {
            window.pop_front();
        }
        window.push_back(on_time);
    }

    fn ratio(&self) -> f64 {
        let window = self.window.lock();
        if window.is_empty() {
            return 1.0;
        }
        let on_time = window.iter().filter(|v| **v).count();
        on_time as f64 / window.len() as f64
    }
}

impl PerformanceMonitor {
    /// Construct a monitor from config.
    #[must_use]
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            sampler: SystemSampler::new(),
            workflow_metrics: WorkflowMetricsCollector::new(config.metric_retention),
            alerts: AlertEngine::new(config.alert_rules.clone()),
            config,
            on_time: OnTimeTracker::new(256),
        }
    }

    /// Record a workflow-level event (step lifecycle, assignment lifecycle).
    pub fn record_event(&self, event: WorkflowEvent) {
        self.workflow_metrics.record(event);
    }

    /// Record whether a just-finished step met its timeout budget.
    pub fn record_timeliness(&self, on_time: bool) {
        self.on_time.record(on_time);
    }

    /// Take one sampling pass: sample signals, compute health, evaluate
    /// alerts, and publish everything to `sink`.
    pub fn tick(&self, subject: &str, sink: &dyn MonitorSink) {
        let system = self.sampler.sample();
        let workflow = self.workflow_metrics.sample();
        let health = HealthScore::compute(
            &system,
            &workflow,
            self.on_time.ratio(),
            self.config.health_weights,
        );
        sink.on_sample(system, workflow.clone(), health);

        for alert in self.alerts.evaluate(subject, &system, &workflow) {
            sink.on_alert(alert);
        }
    }

    /// The configured sampling period, for driving an external interval timer.
    #[must_use]
    pub fn sample_period(&self) -> Duration {
        self.config.sample_period
    }

    /// Run the monitor's sampling loop until `shutdown` resolves.
    ///
    /// The embedding application owns the task; this just loops `tick` on
    /// the configured interval, matching spec §5's "suspension points"
    /// guidance (the only suspension here is the timer itself).
    pub async fn run(
        self: Arc<Self>,
        subject: String,
        sink: Arc<dyn MonitorSink>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(self.sample_period());
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(&subject, sink.as_ref());
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink {
        samples: Mutex<usize>,
        alerts: Mutex<Vec<Alert>>,
    }

    impl MonitorSink for RecordingSink {
        fn on_sample(&self, _: SystemSample, _: WorkflowMetricSample, _: HealthScore) {
            *self.samples.lock().unwrap() += 1;
        }

        fn on_alert(&self, alert: Alert) {
            self.alerts.lock().unwrap().push(alert);
        }
    }

    #[test]
    fn tick_publishes_one_sample() {
        let monitor = PerformanceMonitor::new(MonitorConfig::default());
        let sink = RecordingSink {
            samples: Mutex::new(0),
            alerts: Mutex::new(Vec::new()),
        };
        monitor.tick("wf-1", &sink);
        assert_eq!(*sink.samples.lock().unwrap(), 1);
    }

    #[test]
    fn on_time_ratio_reflects_recorded_outcomes() {
        let monitor = PerformanceMonitor::new(MonitorConfig::default());
        monitor.record_timeliness(true);
        monitor.record_timeliness(true);
        monitor.record_timeliness(false);
        assert!((monitor.on_time.ratio() - 2.0 / 3.0).abs() < 1e-9);
    }
}
