//! Equivalence relations for `consensus` and `majority` aggregation
//! (spec §9 Open Question #1).
//!
//! The source material never specifies how two agent outputs are compared
//! for equality, so this crate requires callers to name one explicitly
//! rather than silently defaulting to e.g. `==`. [`json_deep_eq`] is
//! provided as an explicit opt-in default, registered under that name by
//! [`EquivalenceRegistry::with_defaults`].

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A named comparison used to group consensus/majority outputs.
pub type EquivalenceFn = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;

/// Deep structural equality over JSON values. The obvious default, but
/// never applied silently (spec §9): a step must name it explicitly.
#[must_use]
pub fn json_deep_eq(a: &Value, b: &Value) -> bool {
    a == b
}

/// Registry of named equivalence relations resolved at runtime from a
/// step's `ConsensusParams::equivalence` / `Aggregation::Majority::equivalence`.
#[derive(Clone)]
pub struct EquivalenceRegistry {
    relations: HashMap<String, EquivalenceFn>,
}

impl EquivalenceRegistry {
    /// An empty registry; every named lookup will fail until you `register`.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            relations: HashMap::new(),
        }
    }

    /// A registry preloaded with `"json_deep_eq"`.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("json_deep_eq", Arc::new(json_deep_eq));
        registry
    }

    /// Register (or replace) a named equivalence relation.
    pub fn register(&mut self, name: impl Into<String>, relation: EquivalenceFn) {
        self.relations.insert(name.into(), relation);
    }

    /// Resolve a name to its relation.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<EquivalenceFn> {
        self.relations.get(name).cloned()
    }
}

/// Group `outputs` into equivalence classes under `relation`, preserving
/// first-seen order. Returns `(representative, members)` pairs.
#[must_use]
pub fn group_by_equivalence(
    outputs: Vec<(String, Value)>,
    relation: &EquivalenceFn,
) -> Vec<(Value, Vec<String>)> {
    let mut groups: Vec<(Value, Vec<String>)> = Vec::new();
    for (agent_id, value) in outputs {
        if let Some(group) = groups.iter_mut().find(|(rep, _)| relation(rep, &value)) {
            group.1.push(agent_id);
        } else {
            groups.push((value, vec![agent_id]));
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_registry_resolves_json_deep_eq() {
        let registry = EquivalenceRegistry::with_defaults();
        let relation = registry.get("json_deep_eq").expect("registered");
        assert!(relation(&json!(42), &json!(42)));
        assert!(!relation(&json!(42), &json!(7)));
    }

    #[test]
    fn empty_registry_has_no_relations() {
        let registry = EquivalenceRegistry::empty();
        assert!(registry.get("json_deep_eq").is_none());
    }

    #[test]
    fn grouping_tallies_equal_outputs() {
        let outputs = vec![
            ("a".to_string(), json!(42)),
            ("b".to_string(), json!(42)),
            ("c".to_string(), json!(7)),
        ];
        let relation: EquivalenceFn = Arc::new(json_deep_eq);
        let groups = group_by_equivalence(outputs, &relation);
        assert_eq!(groups.len(), 2);
        let winner = groups.iter().max_by_key(|(_, members)| members.len()).unwrap();
        assert_eq!(winner.0, json!(42));
        assert_eq!(winner.1.len(), 2);
    }
}
