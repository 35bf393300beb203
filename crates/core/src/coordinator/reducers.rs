//! Named reducers for `scatter-gather` and `parallel`'s custom-reducer
//! aggregation (spec §4.3).

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A named reduction over a set of per-agent outputs.
pub type ReducerFn = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// Sum numeric outputs; non-numeric entries are treated as `0`.
#[must_use]
pub fn sum_reducer(values: &[Value]) -> Value {
    let total: f64 = values.iter().filter_map(Value::as_f64).sum();
    serde_json::json!(total)
}

/// Concatenate array outputs into one array; scalar outputs are appended
/// as-is.
#[must_use]
pub fn concat_reducer(values: &[Value]) -> Value {
    let mut out = Vec::new();
    for v in values {
        match v {
            Value::Array(items) => out.extend(items.iter().cloned()),
            other => out.push(other.clone()),
        }
    }
    Value::Array(out)
}

/// Return the first output verbatim.
#[must_use]
pub fn first_reducer(values: &[Value]) -> Value {
    values.first().cloned().unwrap_or(Value::Null)
}

/// Registry of named reducers resolved from `reducerId` fields.
#[derive(Clone)]
pub struct ReducerRegistry {
    reducers: HashMap<String, ReducerFn>,
}

impl ReducerRegistry {
    /// A registry preloaded with `"sum"`, `"concat"`, `"first"`.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            reducers: HashMap::new(),
        };
        registry.register("sum", Arc::new(sum_reducer));
        registry.register("concat", Arc::new(concat_reducer));
        registry.register("first", Arc::new(first_reducer));
        registry
    }

    /// Register (or replace) a named reducer.
    pub fn register(&mut self, name: impl Into<String>, reducer: ReducerFn) {
        self.reducers.insert(name.into(), reducer);
    }

    /// Resolve a name to its reducer.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<ReducerFn> {
        self.reducers.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sum_reducer_adds_numeric_outputs() {
        let values = vec![json!(1), json!(2), json!(3)];
        assert_eq!(sum_reducer(&values), json!(6.0));
    }

    #[test]
    fn concat_reducer_flattens_arrays() {
        let values = vec![json!([1, 2]), json!([3])];
        assert_eq!(concat_reducer(&values), json!([1, 2, 3]));
    }

    #[test]
    fn default_registry_resolves_known_names() {
        let registry = ReducerRegistry::with_defaults();
        assert!(registry.get("sum").is_some());
        assert!(registry.get("unknown").is_none());
    }
}
