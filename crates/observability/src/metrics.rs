//! Workflow-derived metrics.
//!
//! Per spec §4.5: steps started/succeeded/failed, average step latency,
//! error rate by kind, queue depth (scheduled steps), concurrency (running
//! assignments) — sampled per execution and aggregated across the engine.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// One event fed into the workflow metrics collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkflowEvent {
    /// A step was scheduled (entered the run queue).
    StepScheduled,
    /// A step started running.
    StepStarted,
    /// A step finished successfully; `latency_ms` is its wall-clock duration.
    StepSucceeded {
        /// Duration of the step in milliseconds.
        latency_ms: u64,
    },
    /// A step finished in failure, tagged with the error kind that caused it.
    StepFailed {
        /// Duration of the step in milliseconds.
        latency_ms: u64,
        /// The error kind (spec §7 taxonomy name, e.g. `"timeout"`).
        kind: String,
    },
    /// An assignment was dispatched (increments concurrency).
    AssignmentStarted,
    /// An assignment settled, successfully or not (decrements concurrency).
    AssignmentSettled,
}

#[derive(Debug, Clone)]
struct TimedEvent {
    at: Instant,
    event: WorkflowEvent,
}

/// A point-in-time rollup of workflow signals over the retained window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowMetricSample {
    // NOTE: field order kept stable for serde round-tripping across versions.
    /// Steps that entered `scheduled` within the window.
    pub steps_scheduled: u64,
    /// Steps that started running within the window.
    pub steps_started: u64,
    /// Steps that succeeded within the window.
    pub steps_succeeded: u64,
    /// Steps that failed within the window.
    pub steps_failed: u64,
    /// Mean step latency in milliseconds across succeeded + failed steps.
    pub avg_step_latency_ms: f64,
    /// Error rate (failed / (succeeded + failed)), `0.0` when no steps finished.
    pub error_rate: f64,
    /// Error rate broken down by error kind.
    pub error_rate_by_kind: HashMap<String, f64>,
    /// Steps currently scheduled but not yet running.
    pub queue_depth: i64,
    /// Assignments currently in flight.
    pub concurrency: i64,
}

/// Collects [`WorkflowEvent`]s in a bounded rolling window and rolls them up
/// into a [`WorkflowMetricSample`] on demand.
pub struct WorkflowMetricsCollector {
    retention: Duration,
    events: RwLock<VecDeque<TimedEvent>>,
    queue_depth: std::sync::atomic::AtomicI64,
    concurrency: std::sync::atomic::AtomicI64,
}

impl WorkflowMetricsCollector {
    /// Create a collector retaining events for `retention` (spec's
    /// `metricRetentionMs`).
    #[must_use]
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            events: RwLock::new(VecDeque::new()),
            queue_depth: std::sync::atomic::AtomicI64::new(0),
            concurrency: std::sync::atomic::AtomicI64::new(0),
        }
    }

    /// Record a workflow event, updating live counters and the rolling log.
    pub fn record(&self, event: WorkflowEvent) {
        use std::sync::atomic::Ordering;
        match &event {
            WorkflowEvent::StepScheduled => {
                self.queue_depth.fetch_add(1, Ordering::Relaxed);
            }
            WorkflowEvent::StepStarted => {
                self.queue_depth.fetch_sub(1, Ordering::Relaxed);
            }
            WorkflowEvent::AssignmentStarted => {
                self.concurrency.fetch_add(1, Ordering::Relaxed);
            }
            WorkflowEvent::AssignmentSettled => {
                self.concurrency.fetch_sub(1, Ordering::Relaxed);
            }
            WorkflowEvent::StepSucceeded { .. } | WorkflowEvent::StepFailed { .. } => {}
        }

        let mut events = self.events.write();
        events.push_back(TimedEvent {
            at: Instant::now(),
            event,
        });
        self.evict_stale(&mut events);
    }

    fn evict_stale(&self, events: &mut VecDeque<TimedEvent>) {
        let cutoff = Instant::now()
            .checked_sub(self.retention)
            .unwrap_or_else(Instant::now);
        while let Some(front) = events.front() {
            if front.at < cutoff {
                events.pop_front();
            } else {
                break;
            }
        }
    }

    /// Roll up the retained window into a single sample.
    pub fn sample(&self) -> WorkflowMetricSample {
        use std::sync::atomic::Ordering;
        let mut events = self.events.write();
        self.evict_stale(&mut events);

        let mut sample = WorkflowMetricSample {
            queue_depth: self.queue_depth.load(Ordering::Relaxed).max(0),
            concurrency: self.concurrency.load(Ordering::Relaxed).max(0),
            ..Default::default()
        };

        let mut total_latency_ms: u128 = 0;
        let mut finished = 0u64;
        let mut failed_by_kind: HashMap<String, u64> = HashMap::new();

        for timed in events.iter() {
            match &timed.event {
                WorkflowEvent::StepScheduled => sample.steps_scheduled += 1,
                WorkflowEvent::StepStarted => sample.steps_started += 1,
                WorkflowEvent::StepSucceeded { latency_ms } => {
                    sample.steps_succeeded += 1;
                    total_latency_ms += u128::from(*latency_ms);
                    finished += 1;
                }
                WorkflowEvent::StepFailed { latency_ms, kind } => {
                    sample.steps_failed += 1;
                    total_latency_ms += u128::from(*latency_ms);
                    finished += 1;
                    *failed_by_kind.entry(kind.clone()).or_insert(0) += 1;
                }
                WorkflowEvent::AssignmentStarted | WorkflowEvent::AssignmentSettled => {}
            }
        }

        if finished > 0 {
            sample.avg_step_latency_ms = total_latency_ms as f64 / finished as f64;
            sample.error_rate = sample.steps_failed as f64 / finished as f64;
            for (kind, count) in failed_by_kind {
                sample
                    .error_rate_by_kind
                    .insert(kind, count as f64 / finished as f64);
            }
        }

        sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollup_computes_error_rate() {
        let collector = WorkflowMetricsCollector::new(Duration::from_secs(60));
        collector.record(WorkflowEvent::StepSucceeded { latency_ms: 100 });
        collector.record(WorkflowEvent::StepFailed {
            latency_ms: 50,
            kind: "timeout".to_string(),
        });

        let sample = collector.sample();
        assert_eq!(sample.steps_succeeded, 1);
        assert_eq!(sample.steps_failed, 1);
        assert!((sample.error_rate - 0.5).abs() < f64::EPSILON);
        assert!((sample.avg_step_latency_ms - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn concurrency_tracks_in_flight_assignments() {
        let collector = WorkflowMetricsCollector::new(Duration::from_secs(60));
        collector.record(WorkflowEvent::AssignmentStarted);
        collector.record(WorkflowEvent::AssignmentStarted);
        assert_eq!(collector.sample().concurrency, 2);
        collector.record(WorkflowEvent::AssignmentSettled);
        assert_eq!(collector.sample().concurrency, 1);
    }

    #[test]
    fn old_events_are_evicted() {
        let collector = WorkflowMetricsCollector::new(Duration::from_millis(10));
        collector.record(WorkflowEvent::StepSucceeded { latency_ms: 5 });
        std::thread::sleep(Duration::from_millis(30));
        collector.record(WorkflowEvent::AssignmentStarted);
        let sample = collector.sample();
        assert_eq!(sample.steps_succeeded, 0);
    }
}
