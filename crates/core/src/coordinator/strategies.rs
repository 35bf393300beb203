//! The four multi-agent coordination strategies that fan out to more than
//! one assignment in a single step (spec §4.3): `parallel`, `scatter-gather`,
//! `consensus`, `hierarchical`, and the meta-strategy `adaptive` that picks
//! among the rest at runtime.

use super::{assignment_timeout_ms, outcome_to_result, record_assignment, Coordinator, TaskEnvelope};
use crate::error::{Error, Result};
use crate::model::{
    AdaptiveParams, Aggregation, AssignmentOutcome, ConsensusParams, ExecutionState,
    HierarchicalParams, ParallelParams, PartitionStrategy, ScatterGatherParams, StepDefinition,
    StepKind,
};
use futures::future::join_all;
use serde_json::Value;

pub(super) async fn run_parallel(
    coordinator: &Coordinator,
    exec: &mut ExecutionState,
    step: &StepDefinition,
    params: &ParallelParams,
    attempt: u32,
    depth: u32,
) -> Result<Value> {
    let requirement = step
        .requirement
        .as_ref()
        .ok_or_else(|| Error::Validation(format!("step {} has no requirement", step.step_id)))?;
    let candidates = coordinator.plan(requirement, Some(params.fan_out.max(1)))?;

    let inputs = coordinator_resolve_inputs(coordinator, exec, step);
    let dispatches = candidates.iter().map(|agent_id| {
        let envelope = TaskEnvelope {
            task_kind: step.step_id.clone(),
            inputs: inputs.clone(),
            timeout_ms: assignment_timeout_ms(step),
            correlation_id: coordinator.ids.next_id(),
            worker_ids: Vec::new(),
            callback_token: None,
        };
        coordinator.dispatch_single(agent_id, attempt, envelope, depth)
    });
    let assignments = join_all(dispatches).await;

    for assignment in &assignments {
        record_assignment(exec, step, assignment.clone());
    }

    match &params.aggregation {
        Aggregation::All => {
            let mut outputs = Vec::new();
            for assignment in &assignments {
                match &assignment.outcome {
                    Some(AssignmentOutcome::Success { payload }) => outputs.push(payload.clone()),
                    other => {
                        return outcome_to_result(other.clone());
                    }
                }
            }
            Ok(Value::Array(outputs))
        }
        Aggregation::FirstSuccess => assignments
            .iter()
            .find_map(|a| match &a.outcome {
                Some(AssignmentOutcome::Success { payload }) => Some(payload.clone()),
                _ => None,
            })
            .ok_or_else(|| Error::AgentFailure {
                agent_id: "parallel".to_string(),
                reason: "no assignment succeeded".to_string(),
            }),
        Aggregation::Majority { equivalence } => {
            let outputs: Vec<(String, Value)> = assignments
                .iter()
                .filter_map(|a| match &a.outcome {
                    Some(AssignmentOutcome::Success { payload }) => {
                        Some((a.agent_id.clone(), payload.clone()))
                    }
                    _ => None,
                })
                .collect();
            let quorum = assignments.len().div_ceil(2) + 1;
            majority_vote(coordinator, exec, step, &outputs, equivalence, quorum)
        }
        Aggregation::CustomReducer { reducer_id } => {
            let reducer = coordinator.reducers.get(reducer_id).ok_or_else(|| {
                Error::Validation(format!("unknown reducer {reducer_id}"))
            })?;
            let outputs: Vec<Value> = assignments
                .iter()
                .filter_map(|a| match &a.outcome {
                    Some(AssignmentOutcome::Success { payload }) => Some(payload.clone()),
                    _ => None,
                })
                .collect();
            if outputs.is_empty() {
                return Err(Error::AgentFailure {
                    agent_id: "parallel".to_string(),
                    reason: "no assignment succeeded".to_string(),
                });
            }
            Ok(reducer(&outputs))
        }
    }
}

pub(super) async fn run_scatter_gather(
    coordinator: &Coordinator,
    exec: &mut ExecutionState,
    step: &StepDefinition,
    params: &ScatterGatherParams,
    attempt: u32,
    depth: u32,
) -> Result<Value> {
    let requirement = step
        .requirement
        .as_ref()
        .ok_or_else(|| Error::Validation(format!("step {} has no requirement", step.step_id)))?;
    let inputs = coordinator_resolve_inputs(coordinator, exec, step);
    let collection = inputs
        .get("items")
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| Error::Validation("scatter-gather step requires an \"items\" array input".to_string()))?;

    let partitions = partition(&collection, params.partition_count.max(1), params.partition_strategy);
    let candidates = coordinator.plan(requirement, Some(partitions.len()))?;
    if candidates.len() < partitions.len() {
        return Err(Error::NoCandidates(format!(
            "scatter-gather needs {} agents, found {}",
            partitions.len(),
            candidates.len()
        )));
    }

    let dispatches = partitions.iter().zip(candidates.iter()).map(|(partition, agent_id)| {
        let envelope = TaskEnvelope {
            task_kind: step.step_id.clone(),
            inputs: Value::Array(partition.clone()),
            timeout_ms: assignment_timeout_ms(step),
            correlation_id: coordinator.ids.next_id(),
            worker_ids: Vec::new(),
            callback_token: None,
        };
        coordinator.dispatch_single(agent_id, attempt, envelope, depth)
    });
    let assignments = join_all(dispatches).await;
    for assignment in &assignments {
        record_assignment(exec, step, assignment.clone());
    }

    let reducer = coordinator
        .reducers
        .get(&params.reducer_id)
        .ok_or_else(|| Error::Validation(format!("unknown reducer {}", params.reducer_id)))?;

    let mut outputs = Vec::new();
    for assignment in &assignments {
        match &assignment.outcome {
            Some(AssignmentOutcome::Success { payload }) => outputs.push(payload.clone()),
            other => return outcome_to_result(other.clone()),
        }
    }
    Ok(reducer(&outputs))
}

pub(super) async fn run_consensus(
    coordinator: &Coordinator,
    exec: &mut ExecutionState,
    step: &StepDefinition,
    params: &ConsensusParams,
    attempt: u32,
    depth: u32,
) -> Result<Value> {
    let requirement = step
        .requirement
        .as_ref()
        .ok_or_else(|| Error::Validation(format!("step {} has no requirement", step.step_id)))?;
    let candidates = coordinator.plan(requirement, Some(params.n.max(1)))?;
    if candidates.len() < params.n {
        return Err(Error::NoCandidates(format!(
            "consensus needs {} agents, found {}",
            params.n,
            candidates.len()
        )));
    }

    let inputs = coordinator_resolve_inputs(coordinator, exec, step);
    let dispatches = candidates.iter().map(|agent_id| {
        let envelope = TaskEnvelope {
            task_kind: step.step_id.clone(),
            inputs: inputs.clone(),
            timeout_ms: assignment_timeout_ms(step),
            correlation_id: coordinator.ids.next_id(),
            worker_ids: Vec::new(),
            callback_token: None,
        };
        coordinator.dispatch_single(agent_id, attempt, envelope, depth)
    });
    let assignments = join_all(dispatches).await;
    for assignment in &assignments {
        record_assignment(exec, step, assignment.clone());
    }

    let outputs: Vec<(String, Value)> = assignments
        .iter()
        .filter_map(|a| match &a.outcome {
            Some(AssignmentOutcome::Success { payload }) => Some((a.agent_id.clone(), payload.clone())),
            _ => None,
        })
        .collect();

    let quorum = (params.n as f64 * params.quorum_fraction).ceil() as usize;
    majority_vote(coordinator, exec, step, &outputs, &params.equivalence, quorum.max(1))
}

pub(super) async fn run_hierarchical(
    coordinator: &Coordinator,
    exec: &mut ExecutionState,
    step: &StepDefinition,
    params: &HierarchicalParams,
    attempt: u32,
    depth: u32,
) -> Result<Value> {
    let max_depth = params.max_delegation_depth.unwrap_or(coordinator.config.max_delegation_depth);
    if depth >= max_depth {
        return Err(Error::Fatal(format!(
            "hierarchical delegation depth {depth} reached max {max_depth}"
        )));
    }

    let leader_requirement = params
        .leader_requirement
        .clone()
        .or_else(|| step.requirement.clone())
        .ok_or_else(|| Error::Validation(format!("step {} has no leader requirement", step.step_id)))?;
    let leader = coordinator
        .plan(&leader_requirement, Some(1))?
        .into_iter()
        .next()
        .ok_or_else(|| Error::NoCandidates(format!("no leader candidate for step {}", step.step_id)))?;

    let worker_requirement = step
        .requirement
        .as_ref()
        .ok_or_else(|| Error::Validation(format!("step {} has no worker requirement", step.step_id)))?;
    let mut workers = coordinator.plan(worker_requirement, Some(params.worker_count))?;
    workers.retain(|id| id != &leader);

    let inputs = coordinator_resolve_inputs(coordinator, exec, step);
    let envelope = TaskEnvelope {
        task_kind: step.step_id.clone(),
        inputs,
        timeout_ms: assignment_timeout_ms(step),
        correlation_id: coordinator.ids.next_id(),
        worker_ids: workers,
        callback_token: Some(format!("{}:{}", exec.execution_id, step.step_id)),
    };
    let assignment = coordinator.dispatch_single(&leader, attempt, envelope, depth + 1).await;
    let outcome = assignment.outcome.clone();
    record_assignment(exec, step, assignment);
    outcome_to_result(outcome)
}

pub(super) async fn run_adaptive(
    coordinator: &Coordinator,
    exec: &mut ExecutionState,
    step: &StepDefinition,
    params: &AdaptiveParams,
    attempt: u32,
    depth: u32,
) -> Result<Value> {
    let requirement = step.requirement.clone().unwrap_or_default();
    let candidates = coordinator.plan(&requirement, None).unwrap_or_default();
    let candidate_count = candidates.len();
    let avg_priority = {
        let snapshot = coordinator.registry.snapshot();
        let priorities: Vec<f64> = snapshot
            .iter()
            .filter(|a| candidates.contains(&a.descriptor.id))
            .map(|a| a.descriptor.priority)
            .collect();
        if priorities.is_empty() {
            0.0
        } else {
            priorities.iter().sum::<f64>() / priorities.len() as f64
        }
    };
    let health = (coordinator.health_score)();
    let input_is_collection = step
        .inputs
        .get("items")
        .map(|v| v.is_array())
        .unwrap_or(false);

    let rule = params.rules.iter().find(|rule| {
        rule.min_candidates.map_or(true, |min| candidate_count >= min)
            && rule.min_priority.map_or(true, |min| avg_priority >= min)
            && (!rule.requires_collection_input || input_is_collection)
            && (!rule.requires_idempotent || params.idempotent)
            && rule.min_health_score.map_or(true, |min| health >= min)
    });

    let resolved = rule
        .map(|r| (*r.resolved_kind).clone())
        .ok_or_else(|| Error::Validation(format!("no adaptive rule matched for step {}", step.step_id)))?;

    let resolved_step = StepDefinition {
        kind: resolved,
        ..step.clone()
    };

    match &resolved_step.kind {
        StepKind::Task => coordinator.run_task(exec, &resolved_step, attempt, depth).await,
        StepKind::Parallel(p) => run_parallel(coordinator, exec, &resolved_step, p, attempt, depth).await,
        StepKind::Sequential(p) => coordinator.run_sequential(exec, &resolved_step, p, depth).await,
        StepKind::Pipeline(p) => coordinator.run_pipeline(exec, &resolved_step, p, depth).await,
        StepKind::ScatterGather(p) => run_scatter_gather(coordinator, exec, &resolved_step, p, attempt, depth).await,
        StepKind::Consensus(p) => run_consensus(coordinator, exec, &resolved_step, p, attempt, depth).await,
        StepKind::Hierarchical(p) => run_hierarchical(coordinator, exec, &resolved_step, p, attempt, depth).await,
        StepKind::Adaptive(_) => Err(Error::Fatal("adaptive rule resolved to adaptive".to_string())),
    }
}

fn majority_vote(
    coordinator: &Coordinator,
    exec: &mut ExecutionState,
    step: &StepDefinition,
    outputs: &[(String, Value)],
    equivalence_name: &str,
    quorum: usize,
) -> Result<Value> {
    let relation = coordinator.equivalence.get(equivalence_name).ok_or_else(|| {
        Error::Validation(format!("unknown equivalence relation {equivalence_name}"))
    })?;
    let groups = super::equivalence::group_by_equivalence(outputs.to_vec(), &relation);
    let winner = groups.iter().max_by_key(|(_, members)| members.len());

    let state = exec.step_states.entry(step.step_id.clone()).or_default();
    for (value, members) in &groups {
        state
            .metrics
            .consensus_tally
            .insert(value.to_string(), members.len());
    }

    match winner {
        Some((value, members)) if members.len() >= quorum => Ok(value.clone()),
        _ => Err(Error::Consensus {
            quorum,
            tally: state.metrics.consensus_tally.clone(),
        }),
    }
}

fn partition(items: &[Value], partition_count: usize, strategy: PartitionStrategy) -> Vec<Vec<Value>> {
    let mut partitions: Vec<Vec<Value>> = vec![Vec::new(); partition_count];
    match strategy {
        PartitionStrategy::HashMod => {
            for (i, item) in items.iter().enumerate() {
                partitions[i % partition_count].push(item.clone());
            }
        }
        PartitionStrategy::RoundRobin => {
            for (i, item) in items.iter().enumerate() {
                partitions[i % partition_count].push(item.clone());
            }
        }
        PartitionStrategy::Range => {
            let chunk = (items.len() + partition_count - 1) / partition_count.max(1);
            for (i, chunk_items) in items.chunks(chunk.max(1)).enumerate() {
                if i < partitions.len() {
                    partitions[i].extend(chunk_items.iter().cloned());
                }
            }
        }
    }
    partitions.retain(|p| !p.is_empty());
    partitions
}

fn coordinator_resolve_inputs(coordinator: &Coordinator, exec: &ExecutionState, step: &StepDefinition) -> Value {
    coordinator.resolve_inputs(exec, step)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_mod_partition_distributes_round_robin() {
        let items: Vec<Value> = (0..6).map(|i| Value::from(i)).collect();
        let parts = partition(&items, 3, PartitionStrategy::HashMod);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], vec![Value::from(0), Value::from(3)]);
    }

    #[test]
    fn range_partition_keeps_contiguous_chunks() {
        let items: Vec<Value> = (0..5).map(Value::from).collect();
        let parts = partition(&items, 2, PartitionStrategy::Range);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].len(), 3);
        assert_eq!(parts[1].len(), 2);
    }
}
