//! End-to-end scenarios (spec §8) driven entirely through the public API:
//! `WorkflowEngine::start`/`status`/`recover` and a scripted [`AgentExecutor`]
//! standing in for real agent transports.

use async_trait::async_trait;
use dashmap::DashMap;
use orchestrator_core::{
    AgentDescriptor, AgentExecutor, AgentRegistry, Aggregation, AssignmentOutcome, BackoffPolicy,
    CapabilityRequirement, Checkpoint, CheckpointLevel, Checkpointer, ConsensusParams, EngineConfig,
    EngineDeps, EventBus, ExecutionPhase, FixedClock, HealthThresholds, InvokeContext, OnFailure,
    ParallelParams, PartitionStrategy, ResourceLimits, RetryPolicy, ScatterGatherParams,
    SequentialGenerator, StepDefinition, StepKind, StepStatus, TaskEnvelope, WorkflowDefinition,
    WorkflowEngine,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Dispatches a fixed, per-agent scripted outcome; agents with no entry
/// echo their inputs back as a success payload.
struct ScriptedExecutor {
    outcomes: DashMap<String, AssignmentOutcome>,
}

impl ScriptedExecutor {
    fn new() -> Self {
        Self {
            outcomes: DashMap::new(),
        }
    }

    fn script(self, agent_id: &str, outcome: AssignmentOutcome) -> Self {
        self.outcomes.insert(agent_id.to_string(), outcome);
        self
    }
}

#[async_trait]
impl AgentExecutor for ScriptedExecutor {
    async fn invoke(
        &self,
        agent_id: &str,
        envelope: TaskEnvelope,
        _ctx: InvokeContext,
    ) -> AssignmentOutcome {
        self.outcomes
            .get(agent_id)
            .map(|o| o.clone())
            .unwrap_or(AssignmentOutcome::Success {
                payload: envelope.inputs,
            })
    }
}

fn thresholds() -> HealthThresholds {
    HealthThresholds {
        degraded_after_failures: 3,
        recovered_after_successes: 5,
        stale_heartbeat_ms: 90_000,
        heartbeat_timeout_ms: 30_000,
    }
}

fn descriptor(id: &str) -> AgentDescriptor {
    AgentDescriptor {
        id: id.to_string(),
        agent_type: "code".to_string(),
        capabilities: ["exec".to_string()].into_iter().collect(),
        tools: ["t".to_string()].into_iter().collect(),
        cost: 1.0,
        priority: 1.0,
        resource_limits: ResourceLimits::default(),
    }
}

fn requirement() -> CapabilityRequirement {
    CapabilityRequirement {
        required: ["exec".to_string()].into_iter().collect(),
        tools: ["t".to_string()].into_iter().collect(),
        ..Default::default()
    }
}

fn no_retry() -> RetryPolicy {
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

fn workflow(steps: Vec<StepDefinition>) -> WorkflowDefinition {
    WorkflowDefinition {
        id: "wf".to_string(),
        version: 1,
        steps,
    }
}

fn task_step(step_id: &str) -> StepDefinition {
    StepDefinition {
        step_id: step_id.to_string(),
        kind: StepKind::Task,
        requirement: Some(requirement()),
        inputs: HashMap::new(),
        timeout_ms: 0,
        retry: no_retry(),
        on_failure: OnFailure::Abort,
        compensator_step_id: None,
    }
}

/// Builds an engine with `agent_count` registered agents, sharing back the
/// store/checkpointer `Arc`s so a test can inspect or mutate persisted state
/// through the same public `StateManager`/`Checkpointer` API the engine uses.
fn build_engine(
    agent_count: usize,
    executor: ScriptedExecutor,
) -> (
    Arc<WorkflowEngine>,
    Arc<dyn orchestrator_core::StateStore>,
    Arc<dyn Checkpointer>,
) {
    let clock: Arc<dyn orchestrator_core::Clock> = Arc::new(FixedClock::new(0));
    let registry = Arc::new(AgentRegistry::new(thresholds(), clock.clone()));
    for i in 0..agent_count {
        registry.register(descriptor(&format!("agent-{i}"))).unwrap();
    }
    let store: Arc<dyn orchestrator_core::StateStore> =
        Arc::new(orchestrator_core::InMemoryStateStore::new());
    let checkpointer: Arc<dyn Checkpointer> =
        Arc::new(orchestrator_core::state_manager::MemoryCheckpointer::new());

    let engine = Arc::new(WorkflowEngine::new(EngineDeps {
        registry,
        executor: Arc::new(executor),
        store: store.clone(),
        checkpointer: checkpointer.clone(),
        event_bus: EventBus::new(256),
        clock,
        ids: Arc::new(SequentialGenerator::new()),
        config: Arc::new(EngineConfig::default()),
        equivalence: orchestrator_core::coordinator::equivalence::EquivalenceRegistry::with_defaults(),
        reducers: orchestrator_core::coordinator::reducers::ReducerRegistry::with_defaults(),
        health_score: Arc::new(|| 100.0),
    }));
    (engine, store, checkpointer)
}

async fn wait_until_terminal(
    engine: &WorkflowEngine,
    execution_id: &str,
) -> orchestrator_core::engine::ExecutionStateView {
    for _ in 0..400 {
        let view = engine.status(execution_id).await.unwrap();
        if view.phase.is_terminal() {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("execution {execution_id} never reached a terminal phase");
}

#[tokio::test]
async fn parallel_all_aggregation_succeeds_when_every_fanout_succeeds() {
    let (engine, _, _) = build_engine(3, ScriptedExecutor::new());
    let mut step = task_step("fanout");
    step.kind = StepKind::Parallel(ParallelParams {
        fan_out: 3,
        aggregation: Aggregation::All,
    });

    let execution_id = engine
        .start(workflow(vec![step]), serde_json::json!({}), false)
        .await
        .unwrap();
    let view = wait_until_terminal(&engine, &execution_id).await;

    assert_eq!(view.phase, ExecutionPhase::Completed);
    assert_eq!(view.step_statuses["fanout"], StepStatus::Succeeded);
}

#[tokio::test]
async fn parallel_all_aggregation_aborts_when_one_fanout_fails_and_retry_is_exhausted() {
    let executor = ScriptedExecutor::new().script(
        "agent-1",
        AssignmentOutcome::Failure {
            error_kind: orchestrator_core::ErrorKind::AgentFailure,
            message: "boom".to_string(),
        },
    );
    let (engine, _, _) = build_engine(2, executor);
    let mut step = task_step("fanout");
    step.kind = StepKind::Parallel(ParallelParams {
        fan_out: 2,
        aggregation: Aggregation::All,
    });

    let execution_id = engine
        .start(workflow(vec![step]), serde_json::json!({}), false)
        .await
        .unwrap();
    let view = wait_until_terminal(&engine, &execution_id).await;

    assert_eq!(view.phase, ExecutionPhase::Failed);
    assert_eq!(view.step_statuses["fanout"], StepStatus::Failed);
}

#[tokio::test]
async fn consensus_reaches_quorum_on_majority_output() {
    let executor = ScriptedExecutor::new()
        .script(
            "agent-0",
            AssignmentOutcome::Success {
                payload: serde_json::json!("A"),
            },
        )
        .script(
            "agent-1",
            AssignmentOutcome::Success {
                payload: serde_json::json!("A"),
            },
        )
        .script(
            "agent-2",
            AssignmentOutcome::Success {
                payload: serde_json::json!("B"),
            },
        );
    let (engine, _, _) = build_engine(3, executor);
    let mut step = task_step("vote");
    step.kind = StepKind::Consensus(ConsensusParams {
        n: 3,
        quorum_fraction: 0.51,
        equivalence: "json_deep_eq".to_string(),
    });

    let execution_id = engine
        .start(workflow(vec![step]), serde_json::json!({}), false)
        .await
        .unwrap();
    let view = wait_until_terminal(&engine, &execution_id).await;

    assert_eq!(view.phase, ExecutionPhase::Completed);
    assert_eq!(view.step_statuses["vote"], StepStatus::Succeeded);
}

#[tokio::test]
async fn scatter_gather_hash_mod_recombines_every_partitioned_item() {
    let (engine, _, _) = build_engine(2, ScriptedExecutor::new());
    let mut step = task_step("scatter");
    step.kind = StepKind::ScatterGather(ScatterGatherParams {
        partition_count: 2,
        partition_strategy: PartitionStrategy::HashMod,
        reducer_id: "concat".to_string(),
    });
    step.inputs.insert(
        "items".to_string(),
        serde_json::json!([1, 2, 3, 4, 5, 6]),
    );

    let execution_id = engine
        .start(workflow(vec![step]), serde_json::json!({}), false)
        .await
        .unwrap();
    let view = wait_until_terminal(&engine, &execution_id).await;

    assert_eq!(view.phase, ExecutionPhase::Completed);
    assert_eq!(view.step_statuses["scatter"], StepStatus::Succeeded);
}

#[tokio::test]
async fn recovering_mid_pipeline_resumes_only_the_unfinished_step() {
    let (engine, _, checkpointer) = build_engine(1, ScriptedExecutor::new());
    let workflow_def = workflow(vec![task_step("s1"), task_step("s2")]);

    let execution_id = engine
        .start(workflow_def, serde_json::json!({}), false)
        .await
        .unwrap();

    // Freeze dispatch as soon as s1 has had a chance to complete and
    // checkpoint, modelling a crash after step one but before step two.
    for _ in 0..200 {
        let view = engine.status(&execution_id).await.unwrap();
        if view.step_statuses.get("s1") == Some(&StepStatus::Succeeded) {
            engine.pause(&execution_id).unwrap();
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    // Give the paused background task a moment to actually reach its wait loop.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let before = engine.status(&execution_id).await.unwrap();
    assert_eq!(before.step_statuses["s1"], StepStatus::Succeeded);
    assert!(!before.phase.is_terminal());

    engine.recover(&execution_id).await.unwrap();
    let after = wait_until_terminal(&engine, &execution_id).await;

    assert_eq!(after.phase, ExecutionPhase::Completed);
    assert_eq!(after.step_statuses["s1"], StepStatus::Succeeded);
    assert_eq!(after.step_statuses["s2"], StepStatus::Succeeded);
    // Sanity: the checkpointer actually holds more than one version by now.
    assert!(!checkpointer.list_versions(&execution_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn recover_falls_back_past_a_corrupted_checkpoint_and_still_finishes_the_workflow() {
    let (engine, _, checkpointer) = build_engine(1, ScriptedExecutor::new());
    let workflow_def = workflow(vec![task_step("s1"), task_step("s2")]);

    let execution_id = engine
        .start(workflow_def, serde_json::json!({}), false)
        .await
        .unwrap();

    for _ in 0..200 {
        let view = engine.status(&execution_id).await.unwrap();
        if view.step_statuses.get("s1") == Some(&StepStatus::Succeeded) {
            engine.pause(&execution_id).unwrap();
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let good_state = engine.status(&execution_id).await.unwrap();
    let last_good_version = checkpointer
        .list_versions(&execution_id)
        .await
        .unwrap()
        .into_iter()
        .max()
        .unwrap();

    // Graft a newer checkpoint whose stored integrity hash doesn't match
    // its payload, simulating on-disk corruption of the most recent write.
    let mut corrupted = orchestrator_core::ExecutionState {
        execution_id: execution_id.clone(),
        workflow_id: "wf".to_string(),
        version: 1,
        phase: ExecutionPhase::Completed,
        started_at_ms: 0,
        updated_at_ms: 0,
        finished_at_ms: None,
        step_states: HashMap::new(),
        blackboard: HashMap::new(),
        checkpoint_version: last_good_version + 1,
        integrity_hash: "not-the-real-hash".to_string(),
    };
    corrupted.step_states.insert("s1".into(), Default::default());
    corrupted.step_states.insert("s2".into(), Default::default());
    checkpointer
        .save(&Checkpoint {
            execution_id: execution_id.clone(),
            level: CheckpointLevel::Standard,
            version: last_good_version + 1,
            parent_version: last_good_version,
            created_at_ms: 0,
            state: corrupted,
        })
        .await
        .unwrap();

    engine.recover(&execution_id).await.unwrap();
    let after = wait_until_terminal(&engine, &execution_id).await;

    assert_eq!(after.phase, ExecutionPhase::Completed);
    assert_eq!(after.step_statuses["s1"], StepStatus::Succeeded);
    assert_eq!(after.step_statuses["s2"], StepStatus::Succeeded);
    assert_eq!(good_state.step_statuses["s1"], StepStatus::Succeeded);
}
