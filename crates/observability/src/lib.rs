//! Performance monitoring for the orchestration core.
//!
//! Samples system resources and workflow-derived signals, evaluates alert
//! rules, and computes a bounded health score (spec §4.5). This crate never
//! touches execution state directly; it publishes through a [`MonitorSink`]
//! that the orchestration core implements over its event bus.
//!
//! # Example
//!
//! ```rust,ignore
//! use orchestrator_observability::{MonitorConfig, PerformanceMonitor};
//!
//! let monitor = PerformanceMonitor::new(MonitorConfig::default());
//! monitor.record_event(orchestrator_observability::WorkflowEvent::StepStarted);
//! ```

pub mod alerts;
pub mod error;
pub mod health;
pub mod metrics;
pub mod monitor;
pub mod sampler;

pub use alerts::{Alert, AlertEngine, AlertRule, Comparator, Severity, Signal};
pub use error::{ObservabilityError, Result};
pub use health::{HealthScore, HealthWeights};
pub use metrics::{WorkflowEvent, WorkflowMetricSample, WorkflowMetricsCollector};
pub use monitor::{MonitorConfig, MonitorSink, PerformanceMonitor};
pub use sampler::{SystemSample, SystemSampler, DEFAULT_SAMPLE_PERIOD};
