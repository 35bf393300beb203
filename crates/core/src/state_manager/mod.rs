//! Workflow State Manager (spec §4.4).
//!
//! Owns the durable [`ExecutionState`] lifecycle: creation, CAS-guarded
//! mutation, checkpointing, and crash recovery. Checkpoint storage is
//! pluggable behind [`Checkpointer`]; the on-disk format (magic header,
//! CRC32, atomic rename) follows the same integrity scheme the teacher
//! crate's graph checkpointer uses, adapted to a single `ExecutionState`
//! payload instead of a generic `GraphState`.

mod file;
mod memory;

pub use file::FileCheckpointer;
pub use memory::MemoryCheckpointer;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::model::{ExecutionPhase, ExecutionState, StepState, WorkflowDefinition};
use crate::state_store::StateStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{info, warn};

/// Checkpoint granularity (spec §4.4). Coarser levels capture more but cost
/// more to write; `default_checkpoint_level` in [`EngineConfig`] picks the
/// level used when a step doesn't request one explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CheckpointLevel {
    /// Execution id, phase, and step statuses only — no outputs or blackboard.
    Minimal,
    /// Adds step outputs and the blackboard.
    Standard,
    /// Adds full assignment history per step.
    Comprehensive,
    /// Comprehensive plus unredacted structured errors, for local debugging.
    Debug,
}

/// One persisted snapshot of an [`ExecutionState`] (spec §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Execution this checkpoint belongs to.
    pub execution_id: String,
    /// Granularity this checkpoint was taken at.
    pub level: CheckpointLevel,
    /// Monotonically increasing version, matching `ExecutionState::checkpoint_version`.
    pub version: u64,
    /// The version of the checkpoint this one supersedes (0 for the first).
    pub parent_version: u64,
    /// Milliseconds since epoch when taken.
    pub created_at_ms: u64,
    /// The captured state. Always the full `ExecutionState`; `level` governs
    /// how much of it a reader is expected to rely on, not how much is
    /// physically stored (simpler and still crash-safe; see DESIGN.md).
    pub state: ExecutionState,
}

/// Checkpoint payload schema version (spec §4.4 `migrate`). Bump this and
/// add a [`SchemaMigration`] to [`KNOWN_MIGRATIONS`] whenever a change to
/// `ExecutionState`'s wire shape would break payloads written by an older
/// build, mirroring the teacher streaming crate's
/// `CURRENT_SCHEMA_VERSION`/`validate_schema_version` convention.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// A pure, ideally reversible transform between two adjacent checkpoint
/// schema versions, expressed over the untyped JSON projection of a
/// payload so a migration doesn't need the reading process's
/// `ExecutionState` type to match the version being migrated away from.
pub struct SchemaMigration {
    /// Version this step upgrades from.
    pub from: u32,
    /// Version this step upgrades to.
    pub to: u32,
    /// Pure forward transform.
    pub upgrade: fn(serde_json::Value) -> Result<serde_json::Value>,
    /// Pure inverse transform, when the upgrade is reversible.
    pub downgrade: Option<fn(serde_json::Value) -> Result<serde_json::Value>>,
}

/// Registered adjacent-version steps, ordered by `from`. Empty until the
/// checkpoint payload shape changes for the first time.
pub const KNOWN_MIGRATIONS: &[SchemaMigration] = &[];

/// Migrate a raw checkpoint payload between schema versions (spec §4.4
/// `migrate`). Walks the chain of adjacent steps registered in
/// [`KNOWN_MIGRATIONS`]; upgrading walks forward applying `upgrade`,
/// downgrading walks backward applying `downgrade`. Fails with
/// `Error::Validation` if any link in the chain is missing, rather than
/// silently skipping a version.
pub fn migrate(
    payload: serde_json::Value,
    from_version: u32,
    to_version: u32,
) -> Result<serde_json::Value> {
    if from_version == to_version {
        return Ok(payload);
    }
    let mut value = payload;
    let mut current = from_version;
    if from_version < to_version {
        while current != to_version {
            let step = KNOWN_MIGRATIONS
                .iter()
                .find(|m| m.from == current)
                .ok_or_else(|| {
                    Error::Validation(format!(
                        "no checkpoint migration registered from schema version {current}"
                    ))
                })?;
            value = (step.upgrade)(value)?;
            current = step.to;
        }
    } else {
        while current != to_version {
            let step = KNOWN_MIGRATIONS
                .iter()
                .find(|m| m.to == current)
                .ok_or_else(|| {
                    Error::Validation(format!(
                        "no checkpoint migration registered down to schema version {current}"
                    ))
                })?;
            let downgrade = step.downgrade.ok_or_else(|| {
                Error::Validation(format!(
                    "migration {}->{} has no downgrade companion",
                    step.from, step.to
                ))
            })?;
            value = downgrade(value)?;
            current = step.from;
        }
    }
    Ok(value)
}

/// Checkpoint storage backend (spec §4.4).
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Persist a checkpoint. Implementations must make this crash-safe
    /// (write-temp-then-rename or equivalent).
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Load the highest-versioned checkpoint for `execution_id`.
    async fn load_latest(&self, execution_id: &str) -> Result<Option<Checkpoint>>;

    /// Load a specific version, for corruption fallback to an older one.
    async fn load_version(&self, execution_id: &str, version: u64) -> Result<Option<Checkpoint>>;

    /// All stored versions for `execution_id`, descending.
    async fn list_versions(&self, execution_id: &str) -> Result<Vec<u64>>;

    /// Delete every version not in `keep` (retention, spec §4.4: "always
    /// retain the latest checkpoint of each level").
    async fn prune(&self, execution_id: &str, keep: &[u64]) -> Result<()>;
}

/// Compute the integrity hash stored in `ExecutionState::integrity_hash`
/// (spec §3, §8). Hashes the bincode encoding of the state with the hash
/// field itself cleared, so the hash is reproducible regardless of what it
/// was set to beforehand.
pub fn compute_integrity_hash(state: &ExecutionState) -> Result<String> {
    let mut cleared = state.clone();
    cleared.integrity_hash = String::new();
    let bytes = bincode::serialize(&cleared)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

fn store_key(execution_id: &str) -> String {
    format!("execution/{execution_id}/meta")
}

/// Owns `ExecutionState` creation, mutation, checkpointing, and recovery
/// (spec §4.4). Holds no workflow-specific logic; the coordinator and
/// engine decide what to mutate, this only guarantees it lands durably.
pub struct StateManager {
    store: Arc<dyn StateStore>,
    checkpointer: Arc<dyn Checkpointer>,
    clock: Arc<dyn Clock>,
    config: Arc<EngineConfig>,
    cache: Mutex<lru::LruCache<String, ExecutionState>>,
}

impl StateManager {
    /// Construct a state manager over `store` for primary state and
    /// `checkpointer` for point-in-time snapshots.
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        checkpointer: Arc<dyn Checkpointer>,
        clock: Arc<dyn Clock>,
        config: Arc<EngineConfig>,
    ) -> Self {
        let cache_size = NonZeroUsize::new(config.state_cache_size.max(1)).unwrap();
        Self {
            store,
            checkpointer,
            clock,
            config,
            cache: Mutex::new(lru::LruCache::new(cache_size)),
        }
    }

    /// Create a new execution for `workflow`, seeding one `StepState` per
    /// top-level step and the blackboard with `inputs` (spec §4.4 `create`).
    pub async fn create(
        &self,
        workflow: &WorkflowDefinition,
        execution_id: String,
        inputs: serde_json::Value,
    ) -> Result<ExecutionState> {
        let now = self.clock.now_ms();
        let mut step_states = std::collections::HashMap::new();
        for step in &workflow.steps {
            step_states.insert(step.step_id.clone(), StepState::default());
        }
        let mut blackboard = std::collections::HashMap::new();
        blackboard.insert("__inputs__".to_string(), inputs);

        let mut state = ExecutionState {
            execution_id: execution_id.clone(),
            workflow_id: workflow.id.clone(),
            version: workflow.version,
            phase: ExecutionPhase::Pending,
            started_at_ms: now,
            updated_at_ms: now,
            finished_at_ms: None,
            step_states,
            blackboard,
            checkpoint_version: 0,
            integrity_hash: String::new(),
        };
        state.integrity_hash = compute_integrity_hash(&state)?;

        let bytes = bincode::serialize(&state)?;
        self.store.put(&store_key(&execution_id), bytes).await?;
        self.cache.lock().put(execution_id, state.clone());

        // spec §4.4 `create`: new ExecutionState is immediately checkpointed
        // at level=standard before it's handed back.
        self.checkpoint(&state, CheckpointLevel::Standard).await
    }

    /// Load the current state for `execution_id`, preferring the in-memory
    /// cache.
    pub async fn load(&self, execution_id: &str) -> Result<ExecutionState> {
        if let Some(cached) = self.cache.lock().get(execution_id).cloned() {
            return Ok(cached);
        }
        let versioned = self
            .store
            .get(&store_key(execution_id))
            .await?
            .ok_or_else(|| Error::Validation(format!("unknown execution {execution_id}")))?;
        let state: ExecutionState = bincode::deserialize(&versioned.value)?;
        self.cache.lock().put(execution_id.to_string(), state.clone());
        Ok(state)
    }

    /// Apply `mutator` to the current state and persist it with
    /// compare-and-set, retrying on conflict up to `maxCASRetries`
    /// (spec §4.4 `mutate`).
    pub async fn mutate<F>(&self, execution_id: &str, mut mutator: F) -> Result<ExecutionState>
    where
        F: FnMut(&mut ExecutionState),
    {
        let key = store_key(execution_id);
        for attempt in 1..=self.config.max_cas_retries {
            let versioned = self
                .store
                .get(&key)
                .await?
                .ok_or_else(|| Error::Validation(format!("unknown execution {execution_id}")))?;
            let mut state: ExecutionState = bincode::deserialize(&versioned.value)?;
            mutator(&mut state);
            state.updated_at_ms = self.clock.now_ms();
            state.integrity_hash = compute_integrity_hash(&state)?;

            let bytes = bincode::serialize(&state)?;
            match self
                .store
                .compare_and_set(&key, versioned.version, bytes)
                .await
            {
                Ok(_) => {
                    self.cache.lock().put(execution_id.to_string(), state.clone());
                    return Ok(state);
                }
                Err(Error::ConcurrentMutation { .. }) if attempt < self.config.max_cas_retries => {
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::ConcurrentMutation {
            execution_id: execution_id.to_string(),
            attempts: self.config.max_cas_retries,
        })
    }

    /// Take a checkpoint of `state` at `level`, then prune to
    /// `maxCheckpointsPerExecution` while always retaining the latest of
    /// each level (spec §4.4). Advances `checkpoint_version` through the
    /// same CAS-guarded path `mutate` uses, so the new version is durable
    /// before any checkpoint claiming it is written, and returns the state
    /// with the advanced version so callers don't silently hold a stale
    /// `checkpoint_version` afterward.
    pub async fn checkpoint(
        &self,
        state: &ExecutionState,
        level: CheckpointLevel,
    ) -> Result<ExecutionState> {
        let parent_version = state.checkpoint_version;
        let next_version = parent_version + 1;
        let updated = self
            .mutate(&state.execution_id, |s| s.checkpoint_version = next_version)
            .await?;

        let checkpoint = Checkpoint {
            execution_id: updated.execution_id.clone(),
            level,
            version: updated.checkpoint_version,
            parent_version,
            created_at_ms: self.clock.now_ms(),
            state: updated.clone(),
        };
        self.checkpointer.save(&checkpoint).await?;
        self.prune_retaining_latest_per_level(&updated.execution_id).await?;
        info!(execution_id = %updated.execution_id, version = checkpoint.version, "checkpoint saved");
        Ok(updated)
    }

    async fn prune_retaining_latest_per_level(&self, execution_id: &str) -> Result<()> {
        let versions = self.checkpointer.list_versions(execution_id).await?;
        if versions.len() <= self.config.max_checkpoints_per_execution {
            return Ok(());
        }

        let mut latest_per_level = std::collections::HashMap::new();
        for &version in &versions {
            if let Some(cp) = self.checkpointer.load_version(execution_id, version).await? {
                latest_per_level
                    .entry(cp.level)
                    .and_modify(|v: &mut u64| *v = (*v).max(version))
                    .or_insert(version);
            }
        }
        let mut keep: Vec<u64> = latest_per_level.into_values().collect();
        let mut sorted_versions = versions.clone();
        sorted_versions.sort_unstable_by(|a, b| b.cmp(a));
        for &version in sorted_versions.iter().take(self.config.max_checkpoints_per_execution) {
            if !keep.contains(&version) {
                keep.push(version);
            }
        }
        self.checkpointer.prune(execution_id, &keep).await
    }

    /// Reconstruct `execution_id` from the latest valid checkpoint,
    /// falling back to progressively older versions if a checkpoint's
    /// integrity hash doesn't match its stored state (spec §4.4 `recover`,
    /// §8 "checkpoint-corruption-fallback").
    pub async fn recover(&self, execution_id: &str) -> Result<ExecutionState> {
        let mut candidates = self.checkpointer.list_versions(execution_id).await?;
        candidates.sort_unstable_by(|a, b| b.cmp(a));

        for version in candidates {
            let Some(checkpoint) = self.checkpointer.load_version(execution_id, version).await? else {
                continue;
            };
            let expected = compute_integrity_hash(&checkpoint.state)?;
            if expected == checkpoint.state.integrity_hash {
                let bytes = bincode::serialize(&checkpoint.state)?;
                self.store.put(&store_key(execution_id), bytes).await?;
                self.cache
                    .lock()
                    .put(execution_id.to_string(), checkpoint.state.clone());
                return Ok(checkpoint.state);
            }
            warn!(execution_id, version, "checkpoint failed integrity check, trying an older version");
        }

        Err(Error::Corruption(format!(
            "no valid checkpoint found for execution {execution_id}"
        )))
    }
}
