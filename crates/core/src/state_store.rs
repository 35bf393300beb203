//! Abstract key/value state store (spec §2.2, §6 persistent state layout).
//!
//! Any backend supporting atomic put, compare-and-set on a version field,
//! range scan by prefix, and blob I/O suffices (spec §6). This module
//! defines the abstraction plus an in-memory implementation used by tests
//! and as the default backend; production deployments plug in a
//! document/relational store behind the same trait.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// A versioned value as stored under a key.
#[derive(Debug, Clone)]
pub struct VersionedValue {
    /// Monotonically increasing version, bumped on every successful write.
    pub version: u64,
    /// Opaque bytes (typically JSON or bincode).
    pub value: Vec<u8>,
}

/// The abstract state store interface (spec §2.2).
///
/// Keys follow the layout in spec §6, e.g. `execution/{id}/meta`,
/// `agent/{id}/descriptor`. Implementations need not understand the
/// structure of the key space beyond treating `/`-joined segments as
/// orderable strings for prefix scans.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Unconditionally write `value` under `key`, returning the new version.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64>;

    /// Write `value` under `key` only if the current version equals
    /// `expected_version` (or the key is absent and `expected_version == 0`).
    /// Returns the new version on success, `Error::ConcurrentMutation` on
    /// conflict.
    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: u64,
        value: Vec<u8>,
    ) -> Result<u64>;

    /// Read the current value and version for `key`, if present.
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>>;

    /// Delete `key` if present.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Enumerate all keys whose name starts with `prefix`, in lexicographic
    /// order.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, VersionedValue)>>;
}

/// In-memory [`StateStore`] backed by a sorted map guarded by a single
/// writer lock, matching the "single writer, lock-free readers" policy
/// spec §5 prescribes for shared mutable state. Reads take a brief shared
/// lock; they never block on writers for long since writes are O(1).
#[derive(Default)]
pub struct InMemoryStateStore {
    entries: DashMap<String, VersionedValue>,
}

impl InMemoryStateStore {
    /// Construct an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64> {
        let mut entry = self.entries.entry(key.to_string()).or_insert(VersionedValue {
            version: 0,
            value: Vec::new(),
        });
        entry.version += 1;
        entry.value = value;
        Ok(entry.version)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: u64,
        value: Vec<u8>,
    ) -> Result<u64> {
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                if entry.version != expected_version {
                    return Err(Error::ConcurrentMutation {
                        execution_id: key.to_string(),
                        attempts: 1,
                    });
                }
                entry.version += 1;
                entry.value = value;
                Ok(entry.version)
            }
            None => {
                if expected_version != 0 {
                    return Err(Error::ConcurrentMutation {
                        execution_id: key.to_string(),
                        attempts: 1,
                    });
                }
                self.entries.insert(
                    key.to_string(),
                    VersionedValue { version: 1, value },
                );
                Ok(1)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<VersionedValue>> {
        Ok(self.entries.get(key).map(|r| r.clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, VersionedValue)>> {
        let ordered: BTreeMap<String, VersionedValue> = self
            .entries
            .iter()
            .filter(|r| r.key().starts_with(prefix))
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        Ok(ordered.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = InMemoryStateStore::new();
        store.put("execution/e1/meta", b"hello".to_vec()).await.unwrap();
        let got = store.get("execution/e1/meta").await.unwrap().unwrap();
        assert_eq!(got.value, b"hello");
        assert_eq!(got.version, 1);
    }

    #[tokio::test]
    async fn cas_rejects_stale_version() {
        let store = InMemoryStateStore::new();
        store.put("k", b"v1".to_vec()).await.unwrap();
        let err = store.compare_and_set("k", 0, b"v2".to_vec()).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn cas_succeeds_on_matching_version() {
        let store = InMemoryStateStore::new();
        let v1 = store.put("k", b"v1".to_vec()).await.unwrap();
        let v2 = store
            .compare_and_set("k", v1, b"v2".to_vec())
            .await
            .unwrap();
        assert_eq!(v2, v1 + 1);
    }

    #[tokio::test]
    async fn scan_prefix_returns_lexicographic_order() {
        let store = InMemoryStateStore::new();
        store.put("agent/b/descriptor", vec![]).await.unwrap();
        store.put("agent/a/descriptor", vec![]).await.unwrap();
        let scanned = store.scan_prefix("agent/").await.unwrap();
        assert_eq!(scanned[0].0, "agent/a/descriptor");
        assert_eq!(scanned[1].0, "agent/b/descriptor");
    }
}
