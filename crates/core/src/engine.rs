//! Workflow Engine façade (spec §4.6).
//!
//! Ties the agent registry, coordinator, and state manager together behind
//! the user-facing operations: `start`, `status`, `pause`/`resume`/`cancel`,
//! and `subscribe`. One execution's top-level steps run on a spawned task
//! owned by the engine; the coordinator only ever sees one step at a time,
//! so this is also where `onFailure=compensate` resolves a compensator's
//! own `StepDefinition` from the enclosing `WorkflowDefinition` (something
//! the coordinator itself has no visibility into).

use crate::clock::{Clock, IdGenerator};
use crate::config::EngineConfig;
use crate::coordinator::equivalence::EquivalenceRegistry;
use crate::coordinator::reducers::ReducerRegistry;
use crate::coordinator::{AgentExecutor, CancellationToken, Coordinator, CoordinatorDeps};
use crate::error::{Error, Result};
use crate::event_bus::{topics, Event, EventBus, EventSubscription, RecvOutcome, TopicFilter};
use crate::model::{ExecutionPhase, ExecutionState, OnFailure, StepStatus, WorkflowDefinition};
use crate::registry::AgentRegistry;
use crate::state_manager::{CheckpointLevel, Checkpointer, StateManager};
use crate::state_store::StateStore;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Read-only projection of an [`ExecutionState`] for `status()` (spec §4.6:
/// "projection without internal metrics blob").
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStateView {
    /// Execution id.
    pub execution_id: String,
    /// Workflow this execution runs.
    pub workflow_id: String,
    /// Definition version this run was created against.
    pub version: u32,
    /// Current lifecycle phase.
    pub phase: ExecutionPhase,
    /// Per-step status, omitting metrics and assignment history.
    pub step_statuses: HashMap<String, StepStatus>,
    /// Milliseconds since epoch at creation.
    pub started_at_ms: u64,
    /// Milliseconds since epoch of the last mutation.
    pub updated_at_ms: u64,
    /// Milliseconds since epoch when `phase` became terminal.
    pub finished_at_ms: Option<u64>,
}

impl From<&ExecutionState> for ExecutionStateView {
    fn from(state: &ExecutionState) -> Self {
        Self {
            execution_id: state.execution_id.clone(),
            workflow_id: state.workflow_id.clone(),
            version: state.version,
            phase: state.phase,
            step_statuses: state
                .step_states
                .iter()
                .map(|(id, s)| (id.clone(), s.status))
                .collect(),
            started_at_ms: state.started_at_ms,
            updated_at_ms: state.updated_at_ms,
            finished_at_ms: state.finished_at_ms,
        }
    }
}

/// Construction parameters for [`WorkflowEngine`].
pub struct EngineDeps {
    /// Agent pool, shared with the coordinator.
    pub registry: Arc<AgentRegistry>,
    /// Agent invocation boundary.
    pub executor: Arc<dyn AgentExecutor>,
    /// Primary state store.
    pub store: Arc<dyn StateStore>,
    /// Checkpoint storage backend.
    pub checkpointer: Arc<dyn Checkpointer>,
    /// Event bus for lifecycle publication.
    pub event_bus: EventBus,
    /// Injected clock.
    pub clock: Arc<dyn Clock>,
    /// Injected id generator.
    pub ids: Arc<dyn IdGenerator>,
    /// Engine configuration.
    pub config: Arc<EngineConfig>,
    /// Named equivalence relations for consensus/majority.
    pub equivalence: EquivalenceRegistry,
    /// Named reducers for scatter-gather/custom-reducer aggregation.
    pub reducers: ReducerRegistry,
    /// Current health score, read by the `adaptive` strategy and the
    /// `minHealthForStart` gate.
    pub health_score: Arc<dyn Fn() -> f64 + Send + Sync>,
}

struct ExecutionControl {
    paused: AtomicBool,
    cancellation: CancellationToken,
    force: bool,
}

impl ExecutionControl {
    fn new(force: bool) -> Self {
        Self {
            paused: AtomicBool::new(false),
            cancellation: CancellationToken::new(),
            force,
        }
    }
}

fn validate_workflow(workflow: &WorkflowDefinition) -> Result<()> {
    if workflow.steps.is_empty() {
        return Err(Error::Validation("workflow has no steps".to_string()));
    }
    let ids = workflow.step_ids();
    if ids.len() != workflow.steps.len() {
        return Err(Error::Validation(format!(
            "workflow {} has duplicate step ids",
            workflow.id
        )));
    }
    for step in &workflow.steps {
        match (&step.on_failure, &step.compensator_step_id) {
            (OnFailure::Compensate, None) => {
                return Err(Error::Validation(format!(
                    "step {} has onFailure=compensate but no compensatorStepId",
                    step.step_id
                )));
            }
            (_, Some(comp_id)) => {
                if comp_id == &step.step_id {
                    return Err(Error::Validation(format!(
                        "step {} cannot compensate itself",
                        step.step_id
                    )));
                }
                if !ids.contains(comp_id.as_str()) {
                    return Err(Error::Validation(format!(
                        "step {} references unknown compensator {comp_id}",
                        step.step_id
                    )));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// User-facing entry point tying the registry, coordinator, and state
/// manager together (spec §4.6).
pub struct WorkflowEngine {
    coordinator: Arc<Coordinator>,
    state_manager: Arc<StateManager>,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    config: Arc<EngineConfig>,
    health_score: Arc<dyn Fn() -> f64 + Send + Sync>,
    definitions: DashMap<String, WorkflowDefinition>,
    controls: DashMap<String, Arc<ExecutionControl>>,
}

impl WorkflowEngine {
    /// Construct an engine from its dependencies.
    #[must_use]
    pub fn new(deps: EngineDeps) -> Self {
        let coordinator = Arc::new(Coordinator::new(CoordinatorDeps {
            registry: deps.registry,
            executor: deps.executor,
            event_bus: deps.event_bus.clone(),
            clock: deps.clock.clone(),
            ids: deps.ids.clone(),
            config: deps.config.clone(),
            equivalence: deps.equivalence,
            reducers: deps.reducers,
            health_score: deps.health_score.clone(),
        }));
        let state_manager = Arc::new(StateManager::new(
            deps.store,
            deps.checkpointer,
            deps.clock.clone(),
            deps.config.clone(),
        ));
        Self {
            coordinator,
            state_manager,
            event_bus: deps.event_bus,
            clock: deps.clock,
            ids: deps.ids,
            config: deps.config,
            health_score: deps.health_score,
            definitions: DashMap::new(),
            controls: DashMap::new(),
        }
    }

    fn publish(&self, topic: &str, subject: &str, payload: serde_json::Value) {
        self.event_bus.publish(Event {
            topic: topic.to_string(),
            subject: subject.to_string(),
            payload,
            emitted_at_ms: self.clock.now_ms(),
        });
    }

    /// Validate `workflow`, create its execution state, and spawn the task
    /// driving it through completion (spec §4.6 `start`).
    ///
    /// `force` bypasses the `minHealthForStart` gate (spec §5 backpressure).
    pub async fn start(
        self: &Arc<Self>,
        workflow: WorkflowDefinition,
        inputs: serde_json::Value,
        force: bool,
    ) -> Result<String> {
        validate_workflow(&workflow)?;

        if !force && (self.health_score)() < self.config.min_health_for_start {
            return Err(Error::Validation(format!(
                "health score below minHealthForStart ({})",
                self.config.min_health_for_start
            )));
        }
        if self.controls.len() >= self.config.max_concurrent_workflows {
            return Err(Error::Validation(
                "maxConcurrentWorkflows reached".to_string(),
            ));
        }

        let execution_id = self.ids.next_id();
        self.state_manager
            .create(&workflow, execution_id.clone(), inputs)
            .await?;
        self.definitions.insert(execution_id.clone(), workflow);
        self.controls
            .insert(execution_id.clone(), Arc::new(ExecutionControl::new(force)));
        self.publish(topics::WORKFLOW_STARTED, &execution_id, serde_json::json!({}));

        let engine = Arc::clone(self);
        let spawned_id = execution_id.clone();
        tokio::spawn(async move {
            engine.run_execution(spawned_id).await;
        });

        Ok(execution_id)
    }

    async fn checkpoint_and_persist(&self, execution_id: &str, state: &mut ExecutionState) {
        let snapshot = state.clone();
        match self
            .state_manager
            .mutate(execution_id, move |s| *s = snapshot.clone())
            .await
        {
            Ok(persisted) => {
                match self
                    .state_manager
                    .checkpoint(&persisted, self.config.default_checkpoint_level)
                    .await
                {
                    Ok(checkpointed) => *state = checkpointed,
                    Err(err) => {
                        warn!(execution_id, %err, "failed to checkpoint execution state");
                        *state = persisted;
                    }
                }
            }
            Err(err) => warn!(execution_id, %err, "failed to persist execution state"),
        }
    }

    async fn run_execution(self: Arc<Self>, execution_id: String) {
        let Some(workflow) = self.definitions.get(&execution_id).map(|w| w.clone()) else {
            return;
        };
        let Some(control) = self.controls.get(&execution_id).map(|c| Arc::clone(&c)) else {
            return;
        };
        let mut state = match self.state_manager.load(&execution_id).await {
            Ok(s) => s,
            Err(err) => {
                warn!(execution_id, %err, "failed to load execution state for run");
                return;
            }
        };
        state.phase = ExecutionPhase::Running;

        let mut cancelled = false;
        let mut aborted = false;

        for step in &workflow.steps {
            let mut throttled_announced = false;
            loop {
                if control.cancellation.is_cancelled() {
                    break;
                }
                if control.paused.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_millis(25)).await;
                    continue;
                }
                if !control.force && (self.health_score)() < self.config.min_health_for_start {
                    if !throttled_announced {
                        self.publish(
                            topics::WORKFLOW_THROTTLED,
                            &execution_id,
                            serde_json::json!({"stepId": step.step_id}),
                        );
                        throttled_announced = true;
                    }
                    tokio::time::sleep(Duration::from_millis(25)).await;
                    continue;
                }
                break;
            }
            if control.cancellation.is_cancelled() {
                cancelled = true;
                break;
            }

            let already_done = state
                .step_states
                .get(&step.step_id)
                .map(|s| s.status.is_terminal())
                .unwrap_or(false);
            if already_done {
                continue;
            }

            self.coordinator.execute_step(&mut state, step, 0).await;
            self.checkpoint_and_persist(&execution_id, &mut state).await;

            let status = state.step_states.get(&step.step_id).map(|s| s.status);
            if status == Some(StepStatus::Failed) {
                match step.on_failure {
                    OnFailure::Abort => {
                        aborted = true;
                    }
                    OnFailure::Continue => {}
                    OnFailure::Compensate => {
                        if let Some(comp_id) = &step.compensator_step_id {
                            if let Some(compensator) =
                                workflow.steps.iter().find(|s| &s.step_id == comp_id)
                            {
                                self.coordinator.execute_step(&mut state, compensator, 0).await;
                                let compensator_succeeded = state
                                    .step_states
                                    .get(comp_id)
                                    .map(|s| s.status == StepStatus::Succeeded)
                                    .unwrap_or(false);
                                if compensator_succeeded {
                                    if let Some(original) = state.step_states.get_mut(&step.step_id) {
                                        original.status = StepStatus::Compensated;
                                    }
                                }
                                self.checkpoint_and_persist(&execution_id, &mut state).await;
                            }
                        }
                    }
                }
            }
            if aborted {
                break;
            }
        }

        if cancelled {
            state.phase = ExecutionPhase::Cancelled;
            self.publish(topics::WORKFLOW_CANCELLED, &execution_id, serde_json::json!({}));
        } else if aborted {
            state.phase = ExecutionPhase::Failed;
        } else {
            state.phase = if state.all_steps_terminal() {
                ExecutionPhase::Completed
            } else {
                ExecutionPhase::Failed
            };
        }
        state.finished_at_ms = Some(self.clock.now_ms());
        self.checkpoint_and_persist(&execution_id, &mut state).await;
        self.publish(
            topics::WORKFLOW_FINISHED,
            &execution_id,
            serde_json::json!({"phase": format!("{:?}", state.phase)}),
        );
        self.controls.remove(&execution_id);
        info!(execution_id, phase = ?state.phase, "execution finished");
    }

    /// Current projection of an execution's state (spec §4.6 `status`).
    pub async fn status(&self, execution_id: &str) -> Result<ExecutionStateView> {
        let state = self.state_manager.load(execution_id).await?;
        Ok(ExecutionStateView::from(&state))
    }

    /// Freeze new dispatch for `execution_id`; in-flight assignments are
    /// allowed to finish (spec §4.6 `pause`, §5).
    pub fn pause(&self, execution_id: &str) -> Result<()> {
        let control = self
            .controls
            .get(execution_id)
            .ok_or_else(|| Error::Validation(format!("unknown execution {execution_id}")))?;
        control.paused.store(true, Ordering::SeqCst);
        self.publish(topics::WORKFLOW_PAUSED, execution_id, serde_json::json!({}));
        Ok(())
    }

    /// Resume a paused execution (spec §4.6 `resume`).
    pub fn resume(&self, execution_id: &str) -> Result<()> {
        let control = self
            .controls
            .get(execution_id)
            .ok_or_else(|| Error::Validation(format!("unknown execution {execution_id}")))?;
        control.paused.store(false, Ordering::SeqCst);
        self.publish(topics::WORKFLOW_RESUMED, execution_id, serde_json::json!({}));
        Ok(())
    }

    /// Signal cooperative cancellation (spec §4.6 `cancel`, §5 "cancellation
    /// is cooperative"). The running task observes this at the next step
    /// boundary and marks the execution `cancelled`.
    pub fn cancel(&self, execution_id: &str) -> Result<()> {
        let control = self
            .controls
            .get(execution_id)
            .ok_or_else(|| Error::Validation(format!("unknown execution {execution_id}")))?;
        control.cancellation.cancel();
        control.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Reconstruct an execution from its latest valid checkpoint and resume
    /// it from the first non-terminal step (spec §4.4 `recover`, §8
    /// scenario 5/6).
    pub async fn recover(self: &Arc<Self>, execution_id: &str) -> Result<()> {
        if !self.definitions.contains_key(execution_id) {
            return Err(Error::Validation(format!(
                "recover called for unknown execution {execution_id}; workflow definition must be re-registered first"
            )));
        }
        self.state_manager.recover(execution_id).await?;
        self.controls
            .insert(execution_id.to_string(), Arc::new(ExecutionControl::new(false)));
        self.publish(topics::WORKFLOW_RECOVERED, execution_id, serde_json::json!({}));

        let engine = Arc::clone(self);
        let spawned_id = execution_id.to_string();
        tokio::spawn(async move {
            engine.run_execution(spawned_id).await;
        });
        Ok(())
    }

    /// Subscribe to `execution_id`'s lifecycle events matching `filter`.
    /// Spec §4.6 calls for late subscribers to see a snapshot before the
    /// live tail; callers get that by reading `status()` immediately before
    /// subscribing, since the bus itself carries no replay buffer (spec §9
    /// "never use it to carry authoritative state").
    #[must_use]
    pub fn subscribe(&self, execution_id: &str, filter: TopicFilter) -> ExecutionSubscription {
        ExecutionSubscription {
            inner: self.event_bus.subscribe(filter),
            execution_id: execution_id.to_string(),
        }
    }
}

/// An [`EventSubscription`] additionally scoped to one execution's subject.
/// `TopicFilter` only discriminates on `Event::topic`; this layer adds the
/// `Event::subject == execution_id` check `subscribe()` needs on top of it.
pub struct ExecutionSubscription {
    inner: EventSubscription,
    execution_id: String,
}

impl ExecutionSubscription {
    /// Wait for the next event matching both the topic filter and this
    /// execution's subject.
    pub async fn recv(&mut self) -> RecvOutcome {
        loop {
            match self.inner.recv().await {
                RecvOutcome::Event(event) if event.subject == self.execution_id => {
                    return RecvOutcome::Event(event)
                }
                RecvOutcome::Event(_) => continue,
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{FixedClock, SequentialGenerator};
    use crate::coordinator::{InvokeContext, TaskEnvelope};
    use crate::model::{
        AssignmentOutcome, BackoffPolicy, ParallelParams, RetryPolicy, StepDefinition, StepKind,
    };
    use crate::registry::{AgentDescriptor, CapabilityRequirement, HealthThresholds, ResourceLimits};
    use crate::state_manager::MemoryCheckpointer;
    use crate::state_store::InMemoryStateStore;
    use async_trait::async_trait;

    struct EchoExecutor;

    #[async_trait]
    impl AgentExecutor for EchoExecutor {
        async fn invoke(&self, agent_id: &str, _: TaskEnvelope, _: InvokeContext) -> AssignmentOutcome {
            AssignmentOutcome::Success {
                payload: serde_json::Value::String(format!("ok-{agent_id}")),
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

    fn engine() -> Arc<WorkflowEngine> {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(0));
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

        Arc::new(WorkflowEngine::new(EngineDeps {
            registry,
            executor: Arc::new(EchoExecutor),
            store: Arc::new(InMemoryStateStore::new()),
            checkpointer: Arc::new(MemoryCheckpointer::new()),
            event_bus: EventBus::new(256),
            clock,
            ids: Arc::new(SequentialGenerator::new()),
            config: Arc::new(EngineConfig::default()),
            equivalence: EquivalenceRegistry::with_defaults(),
            reducers: ReducerRegistry::with_defaults(),
            health_score: Arc::new(|| 100.0),
        }))
    }

    fn task_step(step_id: &str) -> StepDefinition {
        StepDefinition {
            step_id: step_id.to_string(),
            kind: StepKind::Task,
            requirement: Some(CapabilityRequirement {
                required: ["x".to_string()].into_iter().collect(),
                tools: ["t".to_string()].into_iter().collect(),
                ..Default::default()
            }),
            inputs: HashMap::new(),
            timeout_ms: 0,
            retry: RetryPolicy {
                max_attempts: 1,
                backoff: BackoffPolicy {
                    initial_ms: 1,
                    multiplier: 1.0,
                    jitter: 0.0,
                    cap_ms: 1,
                },
                retry_on: vec![],
            },
            on_failure: OnFailure::Abort,
            compensator_step_id: None,
        }
    }

    fn workflow(steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf".to_string(),
            version: 1,
            steps,
        }
    }

    async fn wait_until_terminal(engine: &WorkflowEngine, execution_id: &str) -> ExecutionStateView {
        for _ in 0..200 {
            let view = engine.status(execution_id).await.unwrap();
            if view.phase.is_terminal() {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("execution {execution_id} never reached a terminal phase");
    }

    #[tokio::test]
    async fn validate_rejects_empty_workflow() {
        assert!(validate_workflow(&workflow(vec![])).is_err());
    }

    #[tokio::test]
    async fn validate_rejects_compensate_without_compensator() {
        let mut step = task_step("s1");
        step.on_failure = OnFailure::Compensate;
        assert!(validate_workflow(&workflow(vec![step])).is_err());
    }

    #[tokio::test]
    async fn start_runs_a_single_task_step_to_completion() {
        let engine = engine();
        let execution_id = engine
            .start(workflow(vec![task_step("s1")]), serde_json::Value::Null, false)
            .await
            .unwrap();
        let view = wait_until_terminal(&engine, &execution_id).await;
        assert_eq!(view.phase, ExecutionPhase::Completed);
        assert_eq!(view.step_statuses["s1"], StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn start_rejects_duplicate_step_ids() {
        let engine = engine();
        let steps = vec![task_step("s1"), task_step("s1")];
        let result = engine.start(workflow(steps), serde_json::Value::Null, false).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn cancel_before_first_step_marks_execution_cancelled() {
        let engine = engine();
        let execution_id = engine
            .start(
                workflow(vec![task_step("s1"), task_step("s2")]),
                serde_json::Value::Null,
                false,
            )
            .await
            .unwrap();
        engine.cancel(&execution_id).unwrap();
        let view = wait_until_terminal(&engine, &execution_id).await;
        assert_eq!(view.phase, ExecutionPhase::Cancelled);
    }

    #[tokio::test]
    async fn parallel_step_with_no_candidates_aborts_execution() {
        let engine = engine();
        let mut step = task_step("s1");
        step.kind = StepKind::Parallel(ParallelParams {
            fan_out: 2,
            aggregation: crate::model::Aggregation::All,
        });
        step.requirement = Some(CapabilityRequirement {
            required: ["unknown-cap".to_string()].into_iter().collect(),
            ..Default::default()
        });
        let execution_id = engine
            .start(workflow(vec![step]), serde_json::Value::Null, false)
            .await
            .unwrap();
        let view = wait_until_terminal(&engine, &execution_id).await;
        assert_eq!(view.phase, ExecutionPhase::Failed);
    }
}
