//! System resource sampling.
//!
//! Samples CPU, memory, disk, and network signals at a configurable period.
//! These feed the health score (see [`crate::health`]) alongside the
//! workflow-derived signals collected in [`crate::metrics`].

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use sysinfo::{Disks, Networks, System};

/// A single point-in-time reading of system resource pressure.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SystemSample {
    /// CPU utilization in the range `[0.0, 100.0]`.
    pub cpu_percent: f64,
    /// Memory utilization in the range `[0.0, 100.0]`.
    pub memory_percent: f64,
    /// Disk utilization in the range `[0.0, 100.0]`, averaged across mounts.
    pub disk_percent: f64,
    /// Combined network I/O rate in bytes/sec since the previous sample.
    pub network_bytes_per_sec: f64,
}

/// Samples system resources on demand.
///
/// Wraps `sysinfo::System` behind a mutex since refreshing it requires `&mut
/// self`; the monitor calls `sample()` from its own periodic loop so
/// contention is not expected in practice.
pub struct SystemSampler {
    inner: Mutex<SamplerState>,
}

struct SamplerState {
    system: System,
    networks: Networks,
    last_network_bytes: u64,
    last_sample_at: Option<std::time::Instant>,
}

impl SystemSampler {
    /// Create a sampler with a freshly initialized `sysinfo` snapshot.
    #[must_use]
    pub fn new() -> Self {
        let mut system = System::new_all();
        system.refresh_all();
        let networks = Networks::new_with_refreshed_list();
        Self {
            inner: Mutex::new(SamplerState {
                system,
                networks,
                last_network_bytes: 0,
                last_sample_at: None,
            }),
        }
    }

    /// Take a fresh sample of system resource pressure.
    pub fn sample(&self) -> SystemSample {
        let mut state = self.inner.lock();
        state.system.refresh_cpu_usage();
        state.system.refresh_memory();
        state.networks.refresh(true);

        let cpu_percent = f64::from(state.system.global_cpu_usage());

        let total_memory = state.system.total_memory();
        let used_memory = state.system.used_memory();
        let memory_percent = if total_memory == 0 {
            0.0
        } else {
            (used_memory as f64 / total_memory as f64) * 100.0
        };

        let disks = Disks::new_with_refreshed_list();
        let disk_percent = if disks.is_empty() {
            0.0
        } else {
            let sum: f64 = disks
                .iter()
                .map(|d| {
                    let total = d.total_space();
                    if total == 0 {
                        0.0
                    } else {
                        let used = total.saturating_sub(d.available_space());
                        (used as f64 / total as f64) * 100.0
                    }
                })
                .sum();
            sum / disks.len() as f64
        };

        let network_bytes: u64 = state
            .networks
            .iter()
            .map(|(_, data)| data.received() + data.transmitted())
            .sum();
        let now = std::time::Instant::now();
        let network_bytes_per_sec = match state.last_sample_at {
            Some(prev) => {
                let elapsed = now.duration_since(prev).as_secs_f64().max(0.001);
                let delta = network_bytes.saturating_sub(state.last_network_bytes);
                delta as f64 / elapsed
            }
            None => 0.0,
        };
        state.last_network_bytes = network_bytes;
        state.last_sample_at = Some(now);

        SystemSample {
            cpu_percent,
            memory_percent,
            disk_percent,
            network_bytes_per_sec,
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Default system sampling period: 30 seconds (spec §4.5).
pub const DEFAULT_SAMPLE_PERIOD: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_is_bounded() {
        let sampler = SystemSampler::new();
        let sample = sampler.sample();
        assert!(sample.cpu_percent >= 0.0);
        assert!(sample.memory_percent >= 0.0 && sample.memory_percent <= 100.0);
        assert!(sample.disk_percent >= 0.0);
    }

    #[test]
    fn second_sample_computes_a_rate() {
        let sampler = SystemSampler::new();
        let _ = sampler.sample();
        let second = sampler.sample();
        assert!(second.network_bytes_per_sec >= 0.0);
    }
}
