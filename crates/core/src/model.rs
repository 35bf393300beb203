//! Static and dynamic data model (spec §3).
//!
//! `WorkflowDefinition`/`StepDefinition` are the static plan; `ExecutionState`/
//! `StepState` are the dynamic per-run record the State Manager owns.
//! Strategy parameters are tagged variants on [`StepKind`] rather than a
//! generic parameter bag, per spec §9's "dynamic dispatch on agents and
//! strategies: model as sum types/tagged variants".

use crate::error::ErrorKind;
use crate::registry::CapabilityRequirement;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How to partition a collection input across scatter-gather workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PartitionStrategy {
    /// `index % partitionCount`.
    HashMod,
    /// Contiguous ranges of roughly equal size.
    Range,
    /// Round-robin assignment by index.
    RoundRobin,
}

/// How a `parallel` step combines its sub-task outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum Aggregation {
    /// Every sub-task must succeed.
    All,
    /// Cancel the remainder on the first success.
    FirstSuccess,
    /// Require `ceil(n/2) + 1` identical outputs under the equivalence
    /// relation named by `equivalence`.
    Majority {
        /// Name of a registered equivalence relation (see
        /// `coordinator::equivalence`).
        equivalence: String,
    },
    /// A custom reducer identified by name, resolved at runtime.
    CustomReducer {
        /// Name of a registered reducer.
        reducer_id: String,
    },
}

/// Parameters for the `parallel` strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelParams {
    /// Number of candidates to fan out to; clamped to matcher result size.
    pub fan_out: usize,
    /// How sub-task outcomes combine into the step outcome.
    pub aggregation: Aggregation,
}

/// Parameters for the `sequential` strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequentialParams {
    /// Ordered substeps; each sees prior substeps' outputs on the blackboard.
    pub substeps: Vec<StepDefinition>,
}

/// Parameters for the `pipeline` strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineParams {
    /// Ordered substeps; each sees only the previous substep's output.
    pub substeps: Vec<StepDefinition>,
}

/// Parameters for the `scatter-gather` strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScatterGatherParams {
    /// Number of partitions (and agents) to scatter across.
    pub partition_count: usize,
    /// Partitioning scheme.
    pub partition_strategy: PartitionStrategy,
    /// Name of a registered reducer applied to per-partition outputs.
    pub reducer_id: String,
}

/// Parameters for the `consensus` strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusParams {
    /// Number of agents to query.
    pub n: usize,
    /// Quorum fraction; default `0.51` (spec §4.3).
    pub quorum_fraction: f64,
    /// Name of a registered equivalence relation used to group equal
    /// outputs. Spec §9 Open Question #1: the source material never
    /// specifies one, so this is a required, explicitly-named reference
    /// rather than a silent default.
    pub equivalence: String,
}

/// Parameters for the `hierarchical` strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HierarchicalParams {
    /// Requirement used to select the leader (distinct from the worker
    /// requirement when set).
    pub leader_requirement: Option<CapabilityRequirement>,
    /// Number of worker agents the leader may delegate to.
    pub worker_count: usize,
    /// Maximum delegation depth before `Error::Fatal` (spec §9 Open
    /// Question #3). Configurable per step; falls back to the engine
    /// default when unset.
    pub max_delegation_depth: Option<u32>,
}

/// A rule in the `adaptive` strategy's rule table (spec §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveRule {
    /// Human-readable name, for logging and debugging.
    pub name: String,
    /// Minimum viable candidate count for this rule to apply.
    pub min_candidates: Option<usize>,
    /// Required step priority for this rule to apply.
    pub min_priority: Option<f64>,
    /// Require the input to be a JSON array (collection input).
    pub requires_collection_input: bool,
    /// Require idempotent steps only.
    pub requires_idempotent: bool,
    /// Minimum health score for this rule to apply.
    pub min_health_score: Option<f64>,
    /// The concrete strategy to run when this rule matches.
    pub resolved_kind: Box<StepKind>,
}

/// Parameters for the `adaptive` strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveParams {
    /// Explicit, configurable rule table (spec §4.3, §9: "rules are
    /// explicit and configurable").
    pub rules: Vec<AdaptiveRule>,
    /// Whether this step's input is idempotent (safe to consensus/retry).
    pub idempotent: bool,
}

/// Tagged strategy kind with its own parameters (spec §4.3, §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "strategy")]
pub enum StepKind {
    /// A terminal leaf task dispatched to exactly one agent.
    Task,
    /// Fan out to N candidates (spec §4.3 `parallel`).
    Parallel(ParallelParams),
    /// Ordered substeps sharing a blackboard (spec §4.3 `sequential`).
    Sequential(SequentialParams),
    /// Ordered substeps, each pinned to a distinct agent (spec §4.3 `pipeline`).
    Pipeline(PipelineParams),
    /// Partition a collection across agents (spec §4.3 `scatter-gather`).
    ScatterGather(ScatterGatherParams),
    /// Quorum vote across N agents (spec §4.3 `consensus`).
    Consensus(ConsensusParams),
    /// Leader/worker delegation (spec §4.3 `hierarchical`).
    Hierarchical(HierarchicalParams),
    /// Runtime strategy selection (spec §4.3 `adaptive`).
    Adaptive(AdaptiveParams),
}

/// What happens to the step (and therefore, absent `continue`/`compensate`,
/// the execution) when it fails (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Fail the enclosing execution.
    Abort,
    /// Continue to subsequent steps despite this step's failure.
    Continue,
    /// Run the named compensator step, then mark this step `compensated`.
    Compensate,
}

/// Backoff schedule for retries (spec §4.3 "Retry").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial_ms: u64,
    /// Multiplier applied after each attempt.
    pub multiplier: f64,
    /// Jitter fraction in `[0, 1]`.
    pub jitter: f64,
    /// Maximum delay regardless of multiplier growth.
    pub cap_ms: u64,
}

/// Per-step retry policy (spec §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum attempts, including the first. `1` means exactly one try.
    pub max_attempts: u32,
    /// Backoff schedule between attempts.
    pub backoff: BackoffPolicy,
    /// Error kinds that trigger a retry.
    pub retry_on: Vec<ErrorKind>,
}

impl RetryPolicy {
    /// Whether `kind` is configured to retry under this policy.
    #[must_use]
    pub fn retries_on(&self, kind: ErrorKind) -> bool {
        self.retry_on.contains(&kind)
    }
}

/// Static definition of one step (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    /// Unique id within the workflow.
    pub step_id: String,
    /// Coordination strategy and its parameters.
    pub kind: StepKind,
    /// Capability requirement used to select agents. `None` only valid
    /// for steps that resolve their own (e.g. pipeline substeps referencing
    /// a pinned agent).
    pub requirement: Option<CapabilityRequirement>,
    /// References to earlier step outputs or literal constants, resolved
    /// against the blackboard at Prepare time.
    pub inputs: HashMap<String, serde_json::Value>,
    /// Step timeout in milliseconds. `0` means "no timeout" (spec §8).
    pub timeout_ms: u64,
    /// Retry policy. Falls back to `EngineConfig::retry_defaults` if the
    /// definition omits fields.
    pub retry: RetryPolicy,
    /// What to do when this step ultimately fails.
    pub on_failure: OnFailure,
    /// Step id of the compensator to run when `on_failure = compensate`.
    pub compensator_step_id: Option<String>,
}

/// Static plan (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Stable workflow id.
    pub id: String,
    /// Definition version, bumped on incompatible changes.
    pub version: u32,
    /// Ordered list of top-level steps.
    pub steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    /// All capability tags referenced transitively by this definition
    /// (including substeps), used by `start()`'s validation (spec §4.6).
    #[must_use]
    pub fn referenced_capabilities(&self) -> std::collections::HashSet<String> {
        fn walk(step: &StepDefinition, tags: &mut std::collections::HashSet<String>) {
            if let Some(req) = &step.requirement {
                tags.extend(req.required.iter().cloned());
                tags.extend(req.preferred.iter().cloned());
            }
            match &step.kind {
                StepKind::Sequential(p) => {
                    for sub in &p.substeps {
                        walk(sub, tags);
                    }
                }
                StepKind::Pipeline(p) => {
                    for sub in &p.substeps {
                        walk(sub, tags);
                    }
                }
                _ => {}
            }
        }
        let mut tags = std::collections::HashSet::new();
        for step in &self.steps {
            walk(step, &mut tags);
        }
        tags
    }

    /// Every step id referenced in `steps` (top-level only; substeps are
    /// scoped to their parent and do not need execution-wide unique ids
    /// beyond that scope).
    #[must_use]
    pub fn step_ids(&self) -> std::collections::HashSet<&str> {
        self.steps.iter().map(|s| s.step_id.as_str()).collect()
    }
}

/// Dynamic lifecycle phase of one execution (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    /// Created but not yet dispatching steps.
    Pending,
    /// Actively dispatching and awaiting steps.
    Running,
    /// New dispatch frozen; in-flight assignments allowed to finish.
    Paused,
    /// Terminal: every step reached a terminal status, no failures.
    Completed,
    /// Terminal: a step failed with `onFailure = abort`.
    Failed,
    /// Terminal: user-initiated cancellation completed.
    Cancelled,
}

impl ExecutionPhase {
    /// Whether this phase is terminal (spec §3 "Sum of non-terminal step
    /// statuses = 0 iff execution phase is terminal").
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionPhase::Completed | ExecutionPhase::Failed | ExecutionPhase::Cancelled
        )
    }
}

/// Per-step dynamic status (spec §3 state machine, §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet scheduled.
    NotStarted,
    /// Enqueued, not yet dispatched.
    Scheduled,
    /// Dispatched, awaiting outcomes.
    Running,
    /// Blocked on another step's inputs.
    AwaitingDependencies,
    /// Terminal success.
    Succeeded,
    /// Terminal failure.
    Failed,
    /// Never ran (e.g. short-circuited sequential).
    Skipped,
    /// Failed, but its compensator ran to completion.
    Compensated,
}

impl StepStatus {
    /// Whether this status is terminal for the step.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded
                | StepStatus::Failed
                | StepStatus::Skipped
                | StepStatus::Compensated
        )
    }
}

/// Outcome of one assignment (spec §3 `StepState.assignments`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AssignmentOutcome {
    /// The agent returned a successful result.
    Success {
        /// Opaque result payload.
        payload: serde_json::Value,
    },
    /// The agent returned a structured failure.
    Failure {
        /// Taxonomy kind (spec §7).
        error_kind: ErrorKind,
        /// Human-readable reason.
        message: String,
    },
    /// The assignment exceeded its timeout.
    Timeout,
    /// The assignment was cancelled before completion.
    Cancelled,
    /// The assignment was still running after the cancellation grace
    /// window and was given up on (spec §5).
    Abandoned,
}

impl AssignmentOutcome {
    /// Whether this outcome counts as a success for aggregation purposes.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, AssignmentOutcome::Success { .. })
    }
}

/// One (agent, attempt) pairing (spec §3, GLOSSARY "Assignment").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    /// Agent this assignment was dispatched to.
    pub agent_id: String,
    /// 1-based attempt number within the step's retry policy.
    pub attempt: u32,
    /// Milliseconds since epoch when dispatched.
    pub started_at_ms: u64,
    /// Milliseconds since epoch when settled, if settled.
    pub finished_at_ms: Option<u64>,
    /// Terminal outcome, if settled.
    pub outcome: Option<AssignmentOutcome>,
}

/// Per-step timings and counters (spec §3 `StepState.metrics`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepMetrics {
    /// Total assignments dispatched across all attempts.
    pub assignments_dispatched: u32,
    /// Assignments that succeeded.
    pub assignments_succeeded: u32,
    /// Assignments that failed (any non-success outcome).
    pub assignments_failed: u32,
    /// Sum of per-assignment wall-clock durations, for averaging.
    pub total_latency_ms: u64,
    /// For `consensus`: the observed output tally, stringified.
    pub consensus_tally: HashMap<String, usize>,
}

/// Structured error attached to a failed step (spec §7).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredError {
    /// Taxonomy kind.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// The step this error originated from, if applicable.
    pub step_id: Option<String>,
}

/// Per-step dynamic record (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepState {
    /// Current status.
    pub status: StepStatus,
    /// History of dispatched assignments across all attempts.
    pub assignments: Vec<Assignment>,
    /// Output, present iff `status == succeeded`.
    pub output: Option<serde_json::Value>,
    /// Structured error, present iff `status == failed`.
    pub error: Option<StructuredError>,
    /// Timings and counters.
    pub metrics: StepMetrics,
    /// Current hierarchical delegation depth, if this step is hierarchical.
    pub delegation_depth: u32,
}

impl Default for StepState {
    fn default() -> Self {
        Self {
            status: StepStatus::NotStarted,
            assignments: Vec::new(),
            output: None,
            error: None,
            metrics: StepMetrics::default(),
            delegation_depth: 0,
        }
    }
}

/// Dynamic state of one workflow run (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    /// Unique id of this run.
    pub execution_id: String,
    /// The workflow definition this run executes.
    pub workflow_id: String,
    /// Definition version this run was created against.
    pub version: u32,
    /// Current lifecycle phase.
    pub phase: ExecutionPhase,
    /// Milliseconds since epoch at creation.
    pub started_at_ms: u64,
    /// Milliseconds since epoch of the last mutation.
    pub updated_at_ms: u64,
    /// Milliseconds since epoch when `phase` became terminal.
    pub finished_at_ms: Option<u64>,
    /// Per-step dynamic records.
    pub step_states: HashMap<String, StepState>,
    /// Scratch space carrying completed steps' outputs.
    pub blackboard: HashMap<String, serde_json::Value>,
    /// Monotonically increasing per successful checkpoint.
    pub checkpoint_version: u64,
    /// Hash over the canonical serialization of the above, recomputed on
    /// every checkpoint (spec §3, §8).
    pub integrity_hash: String,
}

impl ExecutionState {
    /// Whether every step has reached a terminal status (spec §3 invariant:
    /// "sum of non-terminal step statuses = 0 iff phase is terminal").
    #[must_use]
    pub fn all_steps_terminal(&self) -> bool {
        self.step_states.values().all(|s| s.status.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_phase_terminal_classification() {
        assert!(ExecutionPhase::Completed.is_terminal());
        assert!(!ExecutionPhase::Running.is_terminal());
    }

    #[test]
    fn step_status_terminal_classification() {
        assert!(StepStatus::Compensated.is_terminal());
        assert!(!StepStatus::AwaitingDependencies.is_terminal());
    }

    #[test]
    fn retry_policy_checks_configured_kinds() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: BackoffPolicy {
                initial_ms: 100,
                multiplier: 2.0,
                jitter: 0.1,
                cap_ms: 1000,
            },
            retry_on: vec![ErrorKind::Timeout],
        };
        assert!(policy.retries_on(ErrorKind::Timeout));
        assert!(!policy.retries_on(ErrorKind::Fatal));
    }
}
