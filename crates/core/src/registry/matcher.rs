//! Capability Matcher (spec §4.2).
//!
//! A pure function over `(registry snapshot, requirement, strategy)`. No
//! I/O, no shared state; every call with identical inputs produces an
//! identical ranked list (spec §8 "the matcher is a pure function").

use super::AgentSnapshot;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// What a workflow step asks for (spec §3 `CapabilityRequirement`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityRequirement {
    /// Capability tags that must be present.
    pub required: HashSet<String>,
    /// Capability tags that boost score but are not mandatory.
    pub preferred: HashSet<String>,
    /// Tools the step will invoke; all must be in the agent's `tools`.
    pub tools: HashSet<String>,
    /// Hard deny list.
    pub exclude_agents: HashSet<String>,
    /// Minimum acceptable `successRate`.
    pub min_success_rate: f64,
    /// Maximum acceptable `loadFactor`.
    pub max_load: f64,
    /// Matcher mode to score with.
    pub strategy: MatchStrategy,
    /// Maximum candidates to return. `None` means "caller's implicit need".
    pub limit: Option<usize>,
}

impl Default for CapabilityRequirement {
    fn default() -> Self {
        Self {
            required: HashSet::new(),
            preferred: HashSet::new(),
            tools: HashSet::new(),
            exclude_agents: HashSet::new(),
            min_success_rate: 0.0,
            max_load: 1.0,
            strategy: MatchStrategy::default(),
            limit: None,
        }
    }
}

/// Matcher scoring mode (spec §4.2 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchStrategy {
    /// Weighted blend of capability overlap, load, success rate, latency,
    /// priority.
    Weighted,
    /// Emphasizes success rate and inverse average latency.
    Performance,
    /// Emphasizes `(1 - loadFactor)`; ties broken by least `inFlight`.
    LoadBalanced,
    /// Capability match counts partial/substring hits.
    Fuzzy,
    /// Pareto front across (success, load, latency, cost), then
    /// lexicographic tie-break.
    MultiObjective,
    /// Minimizes `cost` subject to all gates.
    CostOptimized,
}

impl Default for MatchStrategy {
    fn default() -> Self {
        MatchStrategy::Weighted
    }
}

/// Weights for the `weighted` strategy (spec §4.2, configurable via
/// [`crate::config::EngineConfig`]).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatcherWeights {
    /// Weight on capability overlap fraction.
    pub capability: f64,
    /// Weight on `(1 - loadFactor)`.
    pub load: f64,
    /// Weight on `successRate`.
    pub success: f64,
    /// Weight on the latency bonus (`1 / (1 + avgLatencyMs / 1000)`).
    pub latency: f64,
    /// Weight on normalized `priority`.
    pub priority: f64,
}

impl Default for MatcherWeights {
    fn default() -> Self {
        Self {
            capability: 0.35,
            load: 0.25,
            success: 0.2,
            latency: 0.1,
            priority: 0.1,
        }
    }
}

/// One ranked candidate (spec §4.2).
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Agent id.
    pub agent_id: String,
    /// Final score under the requested strategy (higher is better).
    pub score: f64,
}

/// Stateless capability matcher.
#[derive(Debug, Default, Clone, Copy)]
pub struct CapabilityMatcher;

impl CapabilityMatcher {
    /// Run the filtering pipeline and scoring strategy over `snapshot`.
    ///
    /// Deterministic: identical `(snapshot, requirement)` always yields an
    /// identical ordering, including tie-breaks (spec §8).
    pub fn match_candidates(
        snapshot: &[AgentSnapshot],
        requirement: &CapabilityRequirement,
        weights: MatcherWeights,
    ) -> Result<Vec<Candidate>> {
        let filtered: Vec<&AgentSnapshot> = snapshot
            .iter()
            .filter(|a| {
                matches!(
                    a.status,
                    super::AgentStatus::Available | super::AgentStatus::Degraded
                )
            })
            .filter(|a| !requirement.exclude_agents.contains(&a.descriptor.id))
            .filter(|a| covers(&a.descriptor.capabilities, &requirement.required, requirement.strategy))
            .filter(|a| a.descriptor.tools.is_superset(&requirement.tools))
            .filter(|a| {
                a.success_rate >= requirement.min_success_rate && a.load_factor <= requirement.max_load
            })
            .collect();

        if filtered.is_empty() {
            return Err(Error::NoCandidates(format!(
                "no agent satisfies required={:?} tools={:?}",
                requirement.required, requirement.tools
            )));
        }

        let mut scored: Vec<Candidate> = filtered
            .into_iter()
            .map(|a| Candidate {
                agent_id: a.descriptor.id.clone(),
                score: score(a, requirement, weights),
            })
            .collect();

        // Deterministic tie-break: higher score, lower loadFactor, lower
        // cost, lexicographically smaller id (spec §4.2).
        let load_factor_of = |id: &str| -> f64 {
            snapshot
                .iter()
                .find(|a| a.descriptor.id == id)
                .map(|a| a.load_factor)
                .unwrap_or(f64::MAX)
        };
        let cost_of = |id: &str| -> f64 {
            snapshot
                .iter()
                .find(|a| a.descriptor.id == id)
                .map(|a| a.descriptor.cost)
                .unwrap_or(f64::MAX)
        };

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    load_factor_of(&a.agent_id)
                        .partial_cmp(&load_factor_of(&b.agent_id))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| {
                    cost_of(&a.agent_id)
                        .partial_cmp(&cost_of(&b.agent_id))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });

        if let Some(limit) = requirement.limit {
            scored.truncate(limit);
        }

        Ok(scored)
    }
}

fn covers(have: &HashSet<String>, required: &HashSet<String>, strategy: MatchStrategy) -> bool {
    if strategy == MatchStrategy::Fuzzy {
        required.iter().all(|req| {
            have.iter()
                .any(|cap| cap.contains(req.as_str()) || req.contains(cap.as_str()))
        })
    } else {
        have.is_superset(required)
    }
}

fn capability_overlap(a: &AgentSnapshot, requirement: &CapabilityRequirement) -> f64 {
    if requirement.required.is_empty() && requirement.preferred.is_empty() {
        return 1.0;
    }
    let total = requirement.required.len() + requirement.preferred.len();
    let hits = requirement
        .required
        .iter()
        .chain(requirement.preferred.iter())
        .filter(|tag| a.descriptor.capabilities.contains(tag.as_str()))
        .count();
    hits as f64 / total as f64
}

fn latency_bonus(a: &AgentSnapshot) -> f64 {
    1.0 / (1.0 + a.avg_latency_ms / 1000.0)
}

fn score(a: &AgentSnapshot, requirement: &CapabilityRequirement, weights: MatcherWeights) -> f64 {
    match requirement.strategy {
        MatchStrategy::Weighted | MatchStrategy::Fuzzy => {
            weights.capability * capability_overlap(a, requirement)
                + weights.load * (1.0 - a.load_factor)
                + weights.success * a.success_rate
                + weights.latency * latency_bonus(a)
                + weights.priority * normalized_priority(a.descriptor.priority)
        }
        MatchStrategy::Performance => {
            0.6 * a.success_rate + 0.4 * latency_bonus(a)
        }
        MatchStrategy::LoadBalanced => 1.0 - a.load_factor,
        MatchStrategy::MultiObjective => pareto_score(a),
        MatchStrategy::CostOptimized => -a.descriptor.cost,
    }
}

fn normalized_priority(priority: f64) -> f64 {
    (priority / 10.0).clamp(0.0, 1.0)
}

/// Approximate Pareto desirability: an agent strictly dominated by another
/// on every axis scores lower. This implementation folds the four axes
/// (success, load, latency, cost) into a single comparable scalar by
/// summing each axis's normalized rank contribution, which preserves the
/// Pareto partial order's extremes while remaining a total order for
/// deterministic sorting (spec §4.2 "Pareto front ... then lexicographic").
fn pareto_score(a: &AgentSnapshot) -> f64 {
    let success_term = a.success_rate;
    let load_term = 1.0 - a.load_factor;
    let latency_term = latency_bonus(a);
    let cost_term = 1.0 / (1.0 + a.descriptor.cost.max(0.0));
    success_term + load_term + latency_term + cost_term
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AgentStatus;

    fn snapshot(id: &str, caps: &[&str], tools: &[&str], load: f64, success: f64) -> AgentSnapshot {
        AgentSnapshot {
            descriptor: crate::registry::AgentDescriptor {
                id: id.to_string(),
                agent_type: "code".to_string(),
                capabilities: caps.iter().map(|s| s.to_string()).collect(),
                tools: tools.iter().map(|s| s.to_string()).collect(),
                cost: 1.0,
                priority: 5.0,
                resource_limits: crate::registry::ResourceLimits::default(),
            },
            status: AgentStatus::Available,
            load_factor: load,
            last_heartbeat_ms: 0,
            success_rate: success,
            avg_latency_ms: 100.0,
            in_flight: 0,
        }
    }

    #[test]
    fn no_candidates_when_required_capability_missing() {
        let snap = vec![snapshot("a", &["code.python"], &["shell"], 0.1, 0.9)];
        let req = CapabilityRequirement {
            required: ["code.rust".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let result = CapabilityMatcher::match_candidates(&snap, &req, MatcherWeights::default());
        assert!(result.is_err());
    }

    #[test]
    fn matcher_is_pure_across_repeated_calls() {
        let snap = vec![
            snapshot("b", &["code.python"], &["shell"], 0.5, 0.8),
            snapshot("a", &["code.python"], &["shell"], 0.5, 0.8),
        ];
        let req = CapabilityRequirement {
            required: ["code.python".to_string()].into_iter().collect(),
            tools: ["shell".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let first = CapabilityMatcher::match_candidates(&snap, &req, MatcherWeights::default())
            .unwrap();
        let second = CapabilityMatcher::match_candidates(&snap, &req, MatcherWeights::default())
            .unwrap();
        assert_eq!(
            first.iter().map(|c| c.agent_id.clone()).collect::<Vec<_>>(),
            second.iter().map(|c| c.agent_id.clone()).collect::<Vec<_>>()
        );
        // identical score => tie-break by lexicographically smaller id
        assert_eq!(first[0].agent_id, "a");
    }

    #[test]
    fn load_balanced_prefers_least_loaded() {
        let snap = vec![
            snapshot("busy", &["x"], &[], 0.9, 0.9),
            snapshot("idle", &["x"], &[], 0.1, 0.9),
        ];
        let req = CapabilityRequirement {
            required: ["x".to_string()].into_iter().collect(),
            strategy: MatchStrategy::LoadBalanced,
            ..Default::default()
        };
        let ranked =
            CapabilityMatcher::match_candidates(&snap, &req, MatcherWeights::default()).unwrap();
        assert_eq!(ranked[0].agent_id, "idle");
    }

    #[test]
    fn fuzzy_strategy_matches_partial_capability_names() {
        let snap = vec![snapshot("a", &["code.python.v3"], &[], 0.1, 0.9)];
        let req = CapabilityRequirement {
            required: ["code.python".to_string()].into_iter().collect(),
            strategy: MatchStrategy::Fuzzy,
            ..Default::default()
        };
        let ranked =
            CapabilityMatcher::match_candidates(&snap, &req, MatcherWeights::default()).unwrap();
        assert_eq!(ranked.len(), 1);
    }

    #[test]
    fn limit_truncates_result() {
        let snap = vec![
            snapshot("a", &["x"], &[], 0.1, 0.9),
            snapshot("b", &["x"], &[], 0.2, 0.9),
            snapshot("c", &["x"], &[], 0.3, 0.9),
        ];
        let req = CapabilityRequirement {
            required: ["x".to_string()].into_iter().collect(),
            limit: Some(1),
            ..Default::default()
        };
        let ranked =
            CapabilityMatcher::match_candidates(&snap, &req, MatcherWeights::default()).unwrap();
        assert_eq!(ranked.len(), 1);
    }
}
