//! Multi-Agent Coordinator (spec §4.3).
//!
//! The coordinator is the only component allowed to invoke agent task
//! execution, through the abstract [`AgentExecutor`]. It drives one step
//! through the seven-phase lifecycle (Plan/Prepare/Dispatch/Await/
//! Aggregate/Commit/Settle) honoring timeouts, retries, and failure policy.

pub mod equivalence;
pub mod reducers;
pub mod retry;
mod strategies;

use crate::clock::{Clock, IdGenerator};
use crate::config::EngineConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::event_bus::{topics, Event, EventBus};
use crate::model::{
    AssignmentOutcome, ExecutionState, OnFailure, StepDefinition, StepStatus, StructuredError,
};
use crate::registry::{AgentRegistry, CapabilityMatcher, CapabilityRequirement};
use async_trait::async_trait;
use equivalence::EquivalenceRegistry;
use reducers::ReducerRegistry;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info_span, warn, Instrument};

/// The task payload sent to an agent (spec §6 `AgentExecutor` interface).
#[derive(Debug, Clone)]
pub struct TaskEnvelope {
    /// Task kind, opaque to the core, meaningful to the executor.
    pub task_kind: String,
    /// Resolved inputs for this invocation.
    pub inputs: Value,
    /// Per-assignment timeout. `0` means no timeout.
    pub timeout_ms: u64,
    /// Correlation id for tracing, shared across retries of one step.
    pub correlation_id: String,
    /// Worker agent ids, populated only for `hierarchical` leader envelopes.
    pub worker_ids: Vec<String>,
    /// Opaque callback token resolving back to this coordinator instance,
    /// used by `hierarchical` leaders to delegate sub-tasks (spec §9).
    pub callback_token: Option<String>,
}

/// Cooperative cancellation flag shared between the coordinator and an
/// in-flight invocation (spec §5 "cancellation is cooperative").
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Create a fresh, not-yet-cancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been signalled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Context passed alongside a [`TaskEnvelope`] (spec §6).
#[derive(Debug, Clone)]
pub struct InvokeContext {
    /// Cancellation signal for this invocation.
    pub cancellation: CancellationToken,
    /// Current hierarchical delegation depth, for leaders re-entering the
    /// coordinator through `callback_token`.
    pub delegation_depth: u32,
}

/// The boundary the coordinator uses to invoke agents. Implementations
/// plug in the real tool transport (out of scope here; spec §1).
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Invoke `agent_id` with `envelope`, honoring `ctx.cancellation`.
    async fn invoke(&self, agent_id: &str, envelope: TaskEnvelope, ctx: InvokeContext)
        -> AssignmentOutcome;
}

/// Construction parameters for [`Coordinator`].
pub struct CoordinatorDeps {
    /// Agent pool.
    pub registry: Arc<AgentRegistry>,
    /// Agent invocation boundary.
    pub executor: Arc<dyn AgentExecutor>,
    /// Event bus for lifecycle publication.
    pub event_bus: EventBus,
    /// Injected clock.
    pub clock: Arc<dyn Clock>,
    /// Injected id generator, for assignment correlation ids.
    pub ids: Arc<dyn IdGenerator>,
    /// Engine configuration.
    pub config: Arc<EngineConfig>,
    /// Named equivalence relations for consensus/majority.
    pub equivalence: EquivalenceRegistry,
    /// Named reducers for scatter-gather/custom-reducer aggregation.
    pub reducers: ReducerRegistry,
    /// Current health score, read by the `adaptive` strategy (spec §4.3).
    pub health_score: Arc<dyn Fn() -> f64 + Send + Sync>,
}

/// Executes one [`StepDefinition`] at a time by one of the seven
/// coordination strategies (spec §4.3). Holds no persistent data of its
/// own; all durable state lives in the [`ExecutionState`] passed in.
pub struct Coordinator {
    pub(crate) registry: Arc<AgentRegistry>,
    pub(crate) executor: Arc<dyn AgentExecutor>,
    pub(crate) event_bus: EventBus,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) equivalence: EquivalenceRegistry,
    pub(crate) reducers: ReducerRegistry,
    pub(crate) health_score: Arc<dyn Fn() -> f64 + Send + Sync>,
}

impl Coordinator {
    /// Construct a coordinator from its dependencies.
    #[must_use]
    pub fn new(deps: CoordinatorDeps) -> Self {
        Self {
            registry: deps.registry,
            executor: deps.executor,
            event_bus: deps.event_bus,
            clock: deps.clock,
            ids: deps.ids,
            config: deps.config,
            equivalence: deps.equivalence,
            reducers: deps.reducers,
            health_score: deps.health_score,
        }
    }

    fn publish(&self, topic: &str, subject: &str, payload: Value) {
        self.event_bus.publish(Event {
            topic: topic.to_string(),
            subject: subject.to_string(),
            payload,
            emitted_at_ms: self.clock.now_ms(),
        });
    }

    pub(crate) fn plan(
        &self,
        requirement: &CapabilityRequirement,
        limit: Option<usize>,
    ) -> Result<Vec<String>> {
        let mut requirement = requirement.clone();
        if let Some(limit) = limit {
            requirement.limit = Some(limit);
        }
        let snapshot = self.registry.snapshot();
        let candidates = CapabilityMatcher::match_candidates(
            &snapshot,
            &requirement,
            self.config.matcher_weights,
        )?;
        Ok(candidates.into_iter().map(|c| c.agent_id).collect())
    }

    fn requirement_of<'a>(&self, step: &'a StepDefinition) -> Result<&'a CapabilityRequirement> {
        step.requirement
            .as_ref()
            .ok_or_else(|| Error::Validation(format!("step {} has no requirement", step.step_id)))
    }

    pub(crate) async fn dispatch_single(
        &self,
        agent_id: &str,
        attempt: u32,
        envelope: TaskEnvelope,
        delegation_depth: u32,
    ) -> crate::model::Assignment {
        self.registry.update_load(agent_id, 1);
        let started = self.clock.now_ms();
        let cancellation = CancellationToken::new();
        let ctx = InvokeContext {
            cancellation: cancellation.clone(),
            delegation_depth,
        };

        let span = info_span!("dispatch", agent_id = %agent_id, attempt, correlation_id = %envelope.correlation_id);
        let outcome = async {
            if envelope.timeout_ms == 0 {
                self.executor.invoke(agent_id, envelope.clone(), ctx).await
            } else {
                let duration = Duration::from_millis(envelope.timeout_ms);
                match tokio::time::timeout(duration, self.executor.invoke(agent_id, envelope.clone(), ctx)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        cancellation.cancel();
                        warn!(agent_id = %agent_id, "assignment timed out");
                        AssignmentOutcome::Timeout
                    }
                }
            }
        }
        .instrument(span)
        .await;

        let finished = self.clock.now_ms();
        self.registry.update_load(agent_id, -1);
        self.registry.record_outcome(agent_id, outcome.is_success());

        crate::model::Assignment {
            agent_id: agent_id.to_string(),
            attempt,
            started_at_ms: started,
            finished_at_ms: Some(finished),
            outcome: Some(outcome),
        }
    }

    fn envelope_for(&self, step: &StepDefinition, inputs: Value) -> TaskEnvelope {
        TaskEnvelope {
            task_kind: step.step_id.clone(),
            inputs,
            timeout_ms: assignment_timeout_ms(step),
            correlation_id: self.ids.next_id(),
            worker_ids: Vec::new(),
            callback_token: None,
        }
    }

    fn resolve_inputs(&self, exec: &ExecutionState, step: &StepDefinition) -> Value {
        let mut resolved = serde_json::Map::new();
        for (key, reference) in &step.inputs {
            let value = if let Some(ref_step) = reference.as_str().and_then(|s| s.strip_prefix("$step:")) {
                exec.blackboard.get(ref_step).cloned().unwrap_or(Value::Null)
            } else {
                reference.clone()
            };
            resolved.insert(key.clone(), value);
        }
        Value::Object(resolved)
    }

    /// Run one step through its full lifecycle, mutating `exec` in place.
    /// Retries reuse the planning phase (spec §4.3 "Retry").
    pub async fn execute_step(&self, exec: &mut ExecutionState, step: &StepDefinition, depth: u32) {
        exec.step_states.entry(step.step_id.clone()).or_default().status = StepStatus::Scheduled;
        self.publish(topics::STEP_SCHEDULED, &exec.execution_id, serde_json::json!({"stepId": step.step_id}));

        let max_attempts = step.retry.max_attempts.max(1);
        let mut rng = rand::thread_rng();
        let mut last_error: Option<Error> = None;

        for attempt in 1..=max_attempts {
            exec.step_states.get_mut(&step.step_id).unwrap().status = StepStatus::Running;
            self.publish(topics::STEP_STARTED, &exec.execution_id, serde_json::json!({"stepId": step.step_id, "attempt": attempt}));

            match self.run_strategy(exec, step, attempt, depth).await {
                Ok(output) => {
                    let state = exec.step_states.get_mut(&step.step_id).unwrap();
                    state.status = StepStatus::Succeeded;
                    state.output = Some(output.clone());
                    exec.blackboard.insert(step.step_id.clone(), output);
                    self.publish(
                        topics::STEP_FINISHED,
                        &exec.execution_id,
                        serde_json::json!({"stepId": step.step_id, "outcome": "succeeded"}),
                    );
                    return;
                }
                Err(err) => {
                    let kind = err.kind();
                    last_error = Some(err);
                    if attempt < max_attempts && step.retry.retries_on(kind) {
                        self.publish(
                            topics::STEP_RETRY,
                            &exec.execution_id,
                            serde_json::json!({"stepId": step.step_id, "attempt": attempt, "kind": format!("{kind:?}")}),
                        );
                        let delay = retry::backoff_delay(&step.retry.backoff, attempt, &mut rng);
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    break;
                }
            }
        }

        let err = last_error.unwrap_or_else(|| Error::Fatal("no attempts executed".to_string()));
        // Compensation (onFailure = compensate) requires looking up the
        // compensator's own StepDefinition, which lives in the enclosing
        // WorkflowDefinition rather than here; the workflow engine runs it
        // and transitions this status to `Compensated` once it succeeds.
        let state = exec.step_states.get_mut(&step.step_id).unwrap();
        state.status = StepStatus::Failed;
        state.error = Some(StructuredError {
            kind: err.kind(),
            message: err.to_string(),
            step_id: Some(step.step_id.clone()),
        });
        self.publish(
            topics::STEP_FINISHED,
            &exec.execution_id,
            serde_json::json!({"stepId": step.step_id, "outcome": "failed", "kind": format!("{:?}", err.kind())}),
        );
    }

    async fn run_strategy(
        &self,
        exec: &mut ExecutionState,
        step: &StepDefinition,
        attempt: u32,
        depth: u32,
    ) -> Result<Value> {
        use crate::model::StepKind;
        match &step.kind {
            StepKind::Task => self.run_task(exec, step, attempt, depth).await,
            StepKind::Parallel(params) => self.run_parallel(exec, step, params, attempt, depth).await,
            StepKind::Sequential(params) => self.run_sequential(exec, step, params, depth).await,
            StepKind::Pipeline(params) => self.run_pipeline(exec, step, params, depth).await,
            StepKind::ScatterGather(params) => {
                self.run_scatter_gather(exec, step, params, attempt, depth).await
            }
            StepKind::Consensus(params) => self.run_consensus(exec, step, params, attempt, depth).await,
            StepKind::Hierarchical(params) => {
                self.run_hierarchical(exec, step, params, attempt, depth).await
            }
            StepKind::Adaptive(params) => self.run_adaptive(exec, step, params, attempt, depth).await,
        }
    }

    async fn run_task(
        &self,
        exec: &mut ExecutionState,
        step: &StepDefinition,
        attempt: u32,
        depth: u32,
    ) -> Result<Value> {
        let requirement = self.requirement_of(step)?;
        let candidates = self.plan(requirement, Some(1))?;
        let agent_id = candidates.first().cloned().ok_or_else(|| {
            Error::NoCandidates(format!("no candidate for step {}", step.step_id))
        })?;

        let inputs = self.resolve_inputs(exec, step);
        let envelope = self.envelope_for(step, inputs);
        let assignment = self.dispatch_single(&agent_id, attempt, envelope, depth).await;
        let outcome = assignment.outcome.clone();
        record_assignment(exec, step, assignment);
        outcome_to_result(outcome)
    }

    async fn run_parallel(
        &self,
        exec: &mut ExecutionState,
        step: &StepDefinition,
        params: &crate::model::ParallelParams,
        attempt: u32,
        depth: u32,
    ) -> Result<Value> {
        strategies::run_parallel(self, exec, step, params, attempt, depth).await
    }

    async fn run_sequential(
        &self,
        exec: &mut ExecutionState,
        step: &StepDefinition,
        params: &crate::model::SequentialParams,
        depth: u32,
    ) -> Result<Value> {
        let mut last_output = Value::Null;
        for substep in &params.substeps {
            self.execute_step(exec, substep, depth).await;
            let state = exec
                .step_states
                .get(&substep.step_id)
                .expect("execute_step always inserts a state");
            match state.status {
                StepStatus::Succeeded => {
                    last_output = state.output.clone().unwrap_or(Value::Null);
                }
                _ => {
                    if substep.on_failure == OnFailure::Continue {
                        continue;
                    }
                    return Err(Error::AgentFailure {
                        agent_id: "sequential".to_string(),
                        reason: format!("substep {} failed", substep.step_id),
                    });
                }
            }
        }
        Ok(last_output)
    }

    async fn run_pipeline(
        &self,
        exec: &mut ExecutionState,
        step: &StepDefinition,
        params: &crate::model::PipelineParams,
        depth: u32,
    ) -> Result<Value> {
        let mut previous = self.resolve_inputs(exec, step);
        for substep in &params.substeps {
            exec.blackboard.insert("__pipeline_previous".to_string(), previous.clone());
            self.execute_step(exec, substep, depth).await;
            let state = exec
                .step_states
                .get(&substep.step_id)
                .expect("execute_step always inserts a state");
            if state.status != StepStatus::Succeeded {
                return Err(Error::AgentFailure {
                    agent_id: "pipeline".to_string(),
                    reason: format!("substep {} failed", substep.step_id),
                });
            }
            previous = state.output.clone().unwrap_or(Value::Null);
        }
        exec.blackboard.remove("__pipeline_previous");
        Ok(previous)
    }

    async fn run_scatter_gather(
        &self,
        exec: &mut ExecutionState,
        step: &StepDefinition,
        params: &crate::model::ScatterGatherParams,
        attempt: u32,
        depth: u32,
    ) -> Result<Value> {
        strategies::run_scatter_gather(self, exec, step, params, attempt, depth).await
    }

    async fn run_consensus(
        &self,
        exec: &mut ExecutionState,
        step: &StepDefinition,
        params: &crate::model::ConsensusParams,
        attempt: u32,
        depth: u32,
    ) -> Result<Value> {
        strategies::run_consensus(self, exec, step, params, attempt, depth).await
    }

    async fn run_hierarchical(
        &self,
        exec: &mut ExecutionState,
        step: &StepDefinition,
        params: &crate::model::HierarchicalParams,
        attempt: u32,
        depth: u32,
    ) -> Result<Value> {
        strategies::run_hierarchical(self, exec, step, params, attempt, depth).await
    }

    async fn run_adaptive(
        &self,
        exec: &mut ExecutionState,
        step: &StepDefinition,
        params: &crate::model::AdaptiveParams,
        attempt: u32,
        depth: u32,
    ) -> Result<Value> {
        strategies::run_adaptive(self, exec, step, params, attempt, depth).await
    }
}

pub(crate) fn assignment_timeout_ms(step: &StepDefinition) -> u64 {
    if step.timeout_ms == 0 {
        0
    } else {
        (step.timeout_ms / step.retry.max_attempts.max(1) as u64).max(1)
    }
}

pub(crate) fn record_assignment(
    exec: &mut ExecutionState,
    step: &StepDefinition,
    assignment: crate::model::Assignment,
) {
    let state = exec.step_states.entry(step.step_id.clone()).or_default();
    let is_success = assignment
        .outcome
        .as_ref()
        .map(AssignmentOutcome::is_success)
        .unwrap_or(false);
    if is_success {
        state.metrics.assignments_succeeded += 1;
    } else {
        state.metrics.assignments_failed += 1;
    }
    state.metrics.assignments_dispatched += 1;
    if let (Some(started), Some(finished)) = (Some(assignment.started_at_ms), assignment.finished_at_ms) {
        state.metrics.total_latency_ms += finished.saturating_sub(started);
    }
    state.assignments.push(assignment);
}

pub(crate) fn outcome_to_result(outcome: Option<AssignmentOutcome>) -> Result<Value> {
    match outcome {
        Some(AssignmentOutcome::Success { payload }) => Ok(payload),
        Some(AssignmentOutcome::Failure { error_kind, message }) => match error_kind {
            ErrorKind::AgentFailure => Err(Error::AgentFailure {
                agent_id: "unknown".to_string(),
                reason: message,
            }),
            ErrorKind::Transient => Err(Error::Transient(message)),
            other => Err(Error::AgentFailure {
                agent_id: "unknown".to_string(),
                reason: format!("{other:?}: {message}"),
            }),
        },
        Some(AssignmentOutcome::Timeout) => Err(Error::Timeout(Duration::from_secs(0))),
        Some(AssignmentOutcome::Cancelled) => Err(Error::Cancelled("assignment cancelled".to_string())),
        Some(AssignmentOutcome::Abandoned) => {
            Err(Error::Transient("assignment abandoned after grace window".to_string()))
        }
        None => Err(Error::Fatal("assignment never settled".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{FixedClock, SequentialGenerator};
    use crate::model::*;
    use crate::registry::{AgentDescriptor, HealthThresholds, ResourceLimits};
    use std::collections::HashMap;

    struct EchoExecutor;

    #[async_trait]
    impl AgentExecutor for EchoExecutor {
        async fn invoke(&self, agent_id: &str, _: TaskEnvelope, _: InvokeContext) -> AssignmentOutcome {
            AssignmentOutcome::Success {
                payload: Value::String(format!("ok-{agent_id}")),
            }
        }
    }

    fn descriptor(id: &str) -> AgentDescriptor {
        AgentDescriptor {
            id: id.to_string(),
            agent_type: "code".to_string(),
            capabilities: ["x".to_string()].into_iter().collect(),
            tools: ["t".to_string()].into_iter().collect(),
            cost: 1.0,
            priority: 1.0,
            resource_limits: ResourceLimits::default(),
        }
    }

    fn new_coordinator(executor: Arc<dyn AgentExecutor>) -> Coordinator {
        let clock = Arc::new(FixedClock::new(0));
        let registry = Arc::new(AgentRegistry::new(
            HealthThresholds {
                degraded_after_failures: 3,
                recovered_after_successes: 5,
                stale_heartbeat_ms: 90_000,
                heartbeat_timeout_ms: 30_000,
            },
            clock.clone(),
        ));
        registry.register(descriptor("A")).unwrap();
        registry.register(descriptor("B")).unwrap();

        Coordinator::new(CoordinatorDeps {
            registry,
            executor,
            event_bus: EventBus::new(64),
            clock,
            ids: Arc::new(SequentialGenerator::new()),
            config: Arc::new(EngineConfig::default()),
            equivalence: EquivalenceRegistry::with_defaults(),
            reducers: ReducerRegistry::with_defaults(),
            health_score: Arc::new(|| 100.0),
        })
    }

    fn requirement() -> CapabilityRequirement {
        CapabilityRequirement {
            required: ["x".to_string()].into_iter().collect(),
            tools: ["t".to_string()].into_iter().collect(),
            ..Default::default()
        }
    }

    fn new_execution() -> ExecutionState {
        ExecutionState {
            execution_id: "e1".to_string(),
            workflow_id: "wf".to_string(),
            version: 1,
            phase: ExecutionPhase::Running,
            started_at_ms: 0,
            updated_at_ms: 0,
            finished_at_ms: None,
            step_states: HashMap::new(),
            blackboard: HashMap::new(),
            checkpoint_version: 0,
            integrity_hash: String::new(),
        }
    }

    fn retry_once() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 1,
            backoff: BackoffPolicy {
                initial_ms: 1,
                multiplier: 1.0,
                jitter: 0.0,
                cap_ms: 1,
            },
            retry_on: vec![],
        }
    }

    #[tokio::test]
    async fn task_step_dispatches_to_one_candidate() {
        let coordinator = new_coordinator(Arc::new(EchoExecutor));
        let mut exec = new_execution();
        let step = StepDefinition {
            step_id: "s1".to_string(),
            kind: StepKind::Task,
            requirement: Some(requirement()),
            inputs: HashMap::new(),
            timeout_ms: 0,
            retry: retry_once(),
            on_failure: OnFailure::Abort,
            compensator_step_id: None,
        };
        coordinator.execute_step(&mut exec, &step, 0).await;
        let state = &exec.step_states["s1"];
        assert_eq!(state.status, StepStatus::Succeeded);
        assert_eq!(state.assignments.len(), 1);
    }

    #[tokio::test]
    async fn no_candidates_fails_the_step() {
        let coordinator = new_coordinator(Arc::new(EchoExecutor));
        let mut exec = new_execution();
        let mut req = requirement();
        req.required.insert("unknown-cap".to_string());
        let step = StepDefinition {
            step_id: "s1".to_string(),
            kind: StepKind::Task,
            requirement: Some(req),
            inputs: HashMap::new(),
            timeout_ms: 0,
            retry: retry_once(),
            on_failure: OnFailure::Abort,
            compensator_step_id: None,
        };
        coordinator.execute_step(&mut exec, &step, 0).await;
        let state = &exec.step_states["s1"];
        assert_eq!(state.status, StepStatus::Failed);
        assert_eq!(state.error.as_ref().unwrap().kind, ErrorKind::NoCandidates);
    }

    #[tokio::test]
    async fn load_counter_returns_to_zero_after_dispatch() {
        let coordinator = new_coordinator(Arc::new(EchoExecutor));
        let mut exec = new_execution();
        let step = StepDefinition {
            step_id: "s1".to_string(),
            kind: StepKind::Task,
            requirement: Some(requirement()),
            inputs: HashMap::new(),
            timeout_ms: 0,
            retry: retry_once(),
            on_failure: OnFailure::Abort,
            compensator_step_id: None,
        };
        coordinator.execute_step(&mut exec, &step, 0).await;
        assert_eq!(coordinator.registry.coordinator_load("A"), 0);
        assert_eq!(coordinator.registry.coordinator_load("B"), 0);
    }
}
