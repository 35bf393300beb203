//! Agent Pool & Capability Matcher (spec §4.1, §4.2).

pub mod matcher;

use crate::clock::Clock;
use crate::error::{Error, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use matcher::{CapabilityMatcher, CapabilityRequirement, MatchStrategy, MatcherWeights};

/// Advisory resource limits declared by an agent (spec §3 `resourceLimits`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceLimits {
    /// Maximum concurrent tasks the agent accepts.
    pub max_concurrent_tasks: u32,
    /// Advisory memory budget in megabytes.
    pub memory_budget_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 1,
            memory_budget_mb: 512,
        }
    }
}

/// Identity and declared capabilities of a worker agent (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentDescriptor {
    /// Stable id, unique across the process lifetime.
    pub id: String,
    /// Informational type tag (code, devops, github, research, ...).
    pub agent_type: String,
    /// Capability tags this agent advertises.
    pub capabilities: HashSet<String>,
    /// Tool names this agent may invoke.
    pub tools: HashSet<String>,
    /// Cost hint used for tie-breaking and the `cost-optimized` strategy.
    pub cost: f64,
    /// Priority hint used for tie-breaking and the `weighted` strategy.
    pub priority: f64,
    /// Advisory resource limits.
    pub resource_limits: ResourceLimits,
}

/// Observed lifecycle status of a registered agent (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Eligible for new assignments.
    Available,
    /// At capacity; not currently eligible for new assignments.
    Busy,
    /// Eligible but penalized after consecutive failures (spec §4.1).
    Degraded,
    /// Missed `heartbeatTimeoutMs`; excluded from matching.
    Unreachable,
    /// Terminal. Never returns to any other status.
    Retired,
}

/// A heartbeat sample reported by an agent (spec §4.1 `heartbeat`).
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatSample {
    /// Self-reported load in `[0, 1]`.
    pub load_factor: f64,
    /// Number of tasks the agent reports currently running.
    pub in_flight: u32,
    /// When the agent took this sample, milliseconds since epoch. Used to
    /// detect and drop stale, out-of-order deliveries.
    pub observed_at_ms: u64,
}

/// Observed runtime state of a registered agent (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRuntime {
    /// Current lifecycle status.
    pub status: AgentStatus,
    /// Self-reported load in `[0, 1]`.
    pub load_factor: f64,
    /// Milliseconds since epoch of the last accepted heartbeat.
    pub last_heartbeat_ms: u64,
    /// Rolling success rate in `[0, 1]`.
    pub success_rate: f64,
    /// Rolling average latency in milliseconds.
    pub avg_latency_ms: f64,
    /// Tasks the agent reports currently running.
    pub in_flight: u32,
    /// Tasks the coordinator has dispatched but not yet settled. Mutated
    /// only through [`AgentRegistry::update_load`]; distinct from
    /// self-reported `in_flight` because it is the coordinator's own
    /// accounting, used to prove the load-counter balance invariant
    /// (spec §8).
    #[serde(skip)]
    pub coordinator_load: Arc<AtomicU32>,
    /// Consecutive failures since the last success.
    pub consecutive_failures: u32,
    /// Consecutive successes since the last failure.
    pub consecutive_successes: u32,
}

impl Default for AgentRuntime {
    fn default() -> Self {
        Self {
            status: AgentStatus::Available,
            load_factor: 0.0,
            last_heartbeat_ms: 0,
            success_rate: 1.0,
            avg_latency_ms: 0.0,
            in_flight: 0,
            coordinator_load: Arc::new(AtomicU32::new(0)),
            consecutive_failures: 0,
            consecutive_successes: 0,
        }
    }
}

/// Immutable snapshot of one agent's descriptor and runtime, used by the
/// matcher and monitor (spec §4.1 `snapshot`, §9 "copy-on-write snapshots
/// for readers").
#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    /// Static descriptor.
    pub descriptor: AgentDescriptor,
    /// Runtime status at snapshot time.
    pub status: AgentStatus,
    pub(crate) load_factor: f64,
    pub(crate) last_heartbeat_ms: u64,
    pub(crate) success_rate: f64,
    pub(crate) avg_latency_ms: f64,
    pub(crate) in_flight: u32,
}

/// Thresholds governing degraded/recovery transitions (spec §4.1).
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    /// Consecutive failures before an agent is marked degraded.
    pub degraded_after_failures: u32,
    /// Consecutive successes required to clear degraded status.
    pub recovered_after_successes: u32,
    /// Heartbeats older than this are ignored (spec §4.1: "stale
    /// heartbeats older than 3x interval are ignored").
    pub stale_heartbeat_ms: u64,
    /// Time since last heartbeat after which an agent is unreachable.
    pub heartbeat_timeout_ms: u64,
}

/// In-memory index of agent descriptors, runtime state, and heartbeats
/// (spec §4.1).
pub struct AgentRegistry {
    entries: DashMap<String, (AgentDescriptor, AgentRuntime)>,
    thresholds: HealthThresholds,
    clock: Arc<dyn crate::clock::Clock>,
}

impl AgentRegistry {
    /// Construct a registry with the given health thresholds.
    #[must_use]
    pub fn new(thresholds: HealthThresholds, clock: Arc<dyn crate::clock::Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            thresholds,
            clock,
        }
    }

    /// Register a new agent. Fails if `id` already exists in a
    /// non-retired state (spec §4.1).
    pub fn register(&self, descriptor: AgentDescriptor) -> Result<()> {
        if let Some(existing) = self.entries.get(&descriptor.id) {
            if existing.1.status != AgentStatus::Retired {
                return Err(Error::Validation(format!(
                    "agent {} already registered",
                    descriptor.id
                )));
            }
        }
        let id = descriptor.id.clone();
        let mut runtime = AgentRuntime::default();
        runtime.last_heartbeat_ms = self.clock.now_ms();
        info!(agent_id = %id, "agent registered");
        self.entries.insert(id, (descriptor, runtime));
        Ok(())
    }

    /// Record a heartbeat. Fails with a validation error if the agent is
    /// unknown or retired. Heartbeats reporting a timestamp older than 3x
    /// the heartbeat interval relative to now are ignored (spec §4.1).
    pub fn heartbeat(&self, id: &str, sample: HeartbeatSample) -> Result<()> {
        let mut entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::Validation(format!("unknown agent {id}")))?;
        if entry.1.status == AgentStatus::Retired {
            return Err(Error::Validation(format!("agent {id} is retired")));
        }

        let now = self.clock.now_ms();
        if sample.observed_at_ms < entry.1.last_heartbeat_ms
            || now.saturating_sub(sample.observed_at_ms) > self.thresholds.stale_heartbeat_ms
        {
            debug!(agent_id = %id, "ignoring stale heartbeat");
            return Ok(());
        }

        entry.1.last_heartbeat_ms = sample.observed_at_ms;
        entry.1.load_factor = sample.load_factor.clamp(0.0, 1.0);
        entry.1.in_flight = sample.in_flight;
        if entry.1.status == AgentStatus::Unreachable {
            entry.1.status = AgentStatus::Available;
            info!(agent_id = %id, "agent recovered from unreachable");
        }
        Ok(())
    }

    /// Adjust the coordinator-tracked load counter by `delta` (spec §4.3
    /// "Dispatch"/"Settle"). Never blocks; backed by an atomic.
    pub fn update_load(&self, id: &str, delta: i64) {
        if let Some(entry) = self.entries.get(id) {
            let counter = Arc::clone(&entry.1.coordinator_load);
            if delta >= 0 {
                counter.fetch_add(delta as u32, Ordering::SeqCst);
            } else {
                counter.fetch_sub((-delta) as u32, Ordering::SeqCst);
            }
        }
    }

    /// Record the outcome of a completed assignment, updating degraded /
    /// recovery counters (spec §4.1).
    pub fn record_outcome(&self, id: &str, success: bool) {
        let Some(mut entry) = self.entries.get_mut(id) else {
            return;
        };
        if success {
            entry.1.consecutive_successes += 1;
            entry.1.consecutive_failures = 0;
            if entry.1.status == AgentStatus::Degraded
                && entry.1.consecutive_successes >= self.thresholds.recovered_after_successes
            {
                entry.1.status = AgentStatus::Available;
                info!(agent_id = %id, "agent recovered from degraded");
            }
        } else {
            entry.1.consecutive_failures += 1;
            entry.1.consecutive_successes = 0;
            if entry.1.status == AgentStatus::Available
                && entry.1.consecutive_failures >= self.thresholds.degraded_after_failures
            {
                entry.1.status = AgentStatus::Degraded;
                warn!(agent_id = %id, "agent marked degraded");
            }
        }
    }

    /// Retire an agent. Terminal; outstanding assignments are still honored
    /// by the coordinator but no new ones are issued (spec §4.1).
    pub fn retire(&self, id: &str) -> Result<()> {
        let mut entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::Validation(format!("unknown agent {id}")))?;
        entry.1.status = AgentStatus::Retired;
        info!(agent_id = %id, "agent retired");
        Ok(())
    }

    /// Mark agents whose last heartbeat exceeded the timeout as
    /// unreachable. Intended to be invoked periodically by a background
    /// sweeper task (spec §4.1).
    pub fn sweep_unreachable(&self) -> Vec<String> {
        let now = self.clock.now_ms();
        let mut newly_unreachable = Vec::new();
        for mut entry in self.entries.iter_mut() {
            if entry.status == AgentStatus::Retired || entry.status == AgentStatus::Unreachable {
                continue;
            }
            if now.saturating_sub(entry.last_heartbeat_ms) > self.thresholds.heartbeat_timeout_ms {
                entry.status = AgentStatus::Unreachable;
                newly_unreachable.push(entry.key().clone());
            }
        }
        newly_unreachable
    }

    /// Take an immutable, copy-on-write snapshot of all registered agents
    /// for the matcher and monitor to consume (spec §4.1 `snapshot`).
    #[must_use]
    pub fn snapshot(&self) -> Vec<AgentSnapshot> {
        self.entries
            .iter()
            .map(|r| {
                let (descriptor, runtime) = r.value();
                AgentSnapshot {
                    descriptor: descriptor.clone(),
                    status: runtime.status,
                    load_factor: runtime.load_factor,
                    last_heartbeat_ms: runtime.last_heartbeat_ms,
                    success_rate: runtime.success_rate,
                    avg_latency_ms: runtime.avg_latency_ms,
                    in_flight: runtime.in_flight,
                }
            })
            .collect()
    }

    /// Current coordinator-tracked load counter for an agent, used by
    /// tests asserting the load-balance invariant (spec §8).
    #[must_use]
    pub fn coordinator_load(&self, id: &str) -> u32 {
        self.entries
            .get(id)
            .map(|e| e.1.coordinator_load.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}
