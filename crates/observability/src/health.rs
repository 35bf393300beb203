//! Health score computation (spec §4.5 / GLOSSARY "Health score").

use crate::metrics::WorkflowMetricSample;
use crate::sampler::SystemSample;
use serde::{Deserialize, Serialize};

/// Weights for the three components of the health score. Must sum to 1.0
/// for the result to stay within `[0, 100]`; [`HealthWeights::normalized`]
/// rescales otherwise.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HealthWeights {
    /// Weight on `(1 - normalized resource pressure)`.
    pub resource: f64,
    /// Weight on `(1 - error rate)`.
    pub error_rate: f64,
    /// Weight on the on-time completion ratio.
    pub on_time: f64,
}

impl Default for HealthWeights {
    fn default() -> Self {
        Self {
            resource: 0.3,
            error_rate: 0.4,
            on_time: 0.3,
        }
    }
}

impl HealthWeights {
    /// Rescale weights so they sum to 1.0 (no-op if already normalized or all-zero).
    #[must_use]
    pub fn normalized(self) -> Self {
        let sum = self.resource + self.error_rate + self.on_time;
        if sum <= 0.0 {
            return Self::default();
        }
        Self {
            resource: self.resource / sum,
            error_rate: self.error_rate / sum,
            on_time: self.on_time / sum,
        }
    }
}

/// Bounded `[0, 100]` blend of resource pressure, error rate, and on-time
/// completion ratio, exposed to the coordinator's `adaptive` strategy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthScore(f64);

impl HealthScore {
    /// The raw `[0, 100]` score.
    #[must_use]
    pub fn value(self) -> f64 {
        self.0
    }

    /// Compute a health score from sampled signals.
    ///
    /// `on_time_ratio` is the fraction of recently-finished steps that
    /// completed within their configured timeout (1.0 if none finished).
    #[must_use]
    pub fn compute(
        system: &SystemSample,
        workflow: &WorkflowMetricSample,
        on_time_ratio: f64,
        weights: HealthWeights,
    ) -> Self {
        let weights = weights.normalized();

        let resource_pressure = ((system.cpu_percent + system.memory_percent + system.disk_percent)
            / 3.0
            / 100.0)
            .clamp(0.0, 1.0);
        let resource_term = 1.0 - resource_pressure;

        let error_term = 1.0 - workflow.error_rate.clamp(0.0, 1.0);

        let on_time_term = on_time_ratio.clamp(0.0, 1.0);

        let blended = weights.resource * resource_term
            + weights.error_rate * error_term
            + weights.on_time * on_time_term;

        Self((blended * 100.0).clamp(0.0, 100.0))
    }
}
