//! Durable, crash-safe [`Checkpointer`] backed by the filesystem.
//!
//! Each version is one file, written via the same integrity-wrapping and
//! atomic-rename technique the teacher crate's graph checkpointer uses:
//! a 4-byte magic, a format version, a CRC32 of the body, the body length,
//! and a compression flag byte, followed by the (optionally zstd-compressed)
//! bincode-encoded [`Checkpoint`]. Writes land in a randomized temp file in
//! the same directory, get `fsync`'d, then renamed into place so a crash
//! mid-write can never leave a partially-written file at the final path.

use super::{Checkpoint, Checkpointer};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

const MAGIC: &[u8; 4] = b"OCHK";
const FORMAT_VERSION: u32 = 1;
// magic + format version + CRC32 + length + compression flag byte.
const HEADER_SIZE: usize = 4 + 4 + 4 + 8 + 1;
const ZSTD_LEVEL: i32 = 3;

/// Wraps `payload` with the integrity header, zstd-compressing the body
/// first when `compress` is set (spec §4.4/§6: checkpoint payloads are a
/// "compressed serialization" that must round-trip losslessly). The CRC
/// and length cover the on-disk body, compressed or not, so a corrupted
/// compressed blob is caught the same way an uncompressed one is.
fn wrap(payload: &[u8], compress: bool) -> Result<Vec<u8>> {
    let (flag, body) = if compress {
        let compressed = zstd::bulk::compress(payload, ZSTD_LEVEL)
            .map_err(|e| Error::Corruption(format!("failed to compress checkpoint: {e}")))?;
        (1u8, compressed)
    } else {
        (0u8, payload.to_vec())
    };
    let crc = crc32fast::hash(&body);
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&(body.len() as u64).to_le_bytes());
    out.push(flag);
    out.extend_from_slice(&body);
    Ok(out)
}

fn unwrap(bytes: &[u8]) -> Result<Vec<u8>> {
    if bytes.len() < HEADER_SIZE {
        return Err(Error::Corruption("checkpoint file too short".to_string()));
    }
    if &bytes[0..4] != MAGIC {
        return Err(Error::Corruption("checkpoint magic mismatch".to_string()));
    }
    let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    if version != FORMAT_VERSION {
        return Err(Error::Corruption(format!(
            "unsupported checkpoint format version {version}"
        )));
    }
    let expected_crc = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
    let length = u64::from_le_bytes(bytes[12..20].try_into().unwrap()) as usize;
    let compressed = bytes[20] != 0;
    let body = bytes.get(HEADER_SIZE..HEADER_SIZE + length).ok_or_else(|| {
        Error::Corruption("checkpoint payload shorter than declared length".to_string())
    })?;
    let actual_crc = crc32fast::hash(body);
    if actual_crc != expected_crc {
        return Err(Error::Corruption("checkpoint CRC mismatch".to_string()));
    }
    if compressed {
        zstd::bulk::decompress(body, DEFAULT_MAX_DECOMPRESSED_SIZE)
            .map_err(|e| Error::Corruption(format!("failed to decompress checkpoint: {e}")))
    } else {
        Ok(body.to_vec())
    }
}

/// Matches the teacher streaming crate's decompression-bomb guard.
const DEFAULT_MAX_DECOMPRESSED_SIZE: usize = 64 * 1024 * 1024;

async fn atomic_write(path: &Path, bytes: Vec<u8>) -> Result<()> {
    let dir = path.parent().ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "checkpoint path has no parent directory",
        ))
    })?;
    tokio::fs::create_dir_all(dir).await?;
    let tmp_path = dir.join(format!(".{}.{}.tmp", uuid::Uuid::new_v4(), "chk"));
    {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        use tokio::io::AsyncWriteExt;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
    }
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

fn version_path(dir: &Path, execution_id: &str, version: u64) -> PathBuf {
    dir.join(execution_id).join(format!("{version}.chk"))
}

/// Persists checkpoints as one file per `(execution_id, version)` under a
/// root directory, with an in-memory index of known versions rebuilt
/// lazily from directory scans rather than a persisted index file: this
/// crate targets a single embedding process, not multi-process access to
/// shared checkpoint storage, so the extra cross-process locking the
/// teacher's checkpointer uses isn't load-bearing here.
pub struct FileCheckpointer {
    root: PathBuf,
    known_versions: Mutex<HashMap<String, Vec<u64>>>,
    compression_enabled: bool,
}

impl FileCheckpointer {
    /// Store checkpoints under `root`, creating it if needed, compressing
    /// payloads when `compression_enabled` is set (`EngineConfig::compression_enabled`,
    /// spec §6).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, compression_enabled: bool) -> Self {
        Self {
            root: root.into(),
            known_versions: Mutex::new(HashMap::new()),
            compression_enabled,
        }
    }

    async fn versions_on_disk(&self, execution_id: &str) -> Result<Vec<u64>> {
        if let Some(cached) = self.known_versions.lock().get(execution_id).cloned() {
            return Ok(cached);
        }
        let dir = self.root.join(execution_id);
        let mut versions = Vec::new();
        match tokio::fs::read_dir(&dir).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    if let Some(name) = entry.file_name().to_str() {
                        if let Some(stripped) = name.strip_suffix(".chk") {
                            if let Ok(version) = stripped.parse::<u64>() {
                                versions.push(version);
                            }
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.known_versions
            .lock()
            .insert(execution_id.to_string(), versions.clone());
        Ok(versions)
    }

    fn remember_version(&self, execution_id: &str, version: u64) {
        self.known_versions
            .lock()
            .entry(execution_id.to_string())
            .or_default()
            .push(version);
    }
}

#[async_trait]
impl Checkpointer for FileCheckpointer {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let payload = bincode::serialize(checkpoint)?;
        let path = version_path(&self.root, &checkpoint.execution_id, checkpoint.version);
        atomic_write(&path, wrap(&payload, self.compression_enabled)?).await?;
        self.remember_version(&checkpoint.execution_id, checkpoint.version);
        Ok(())
    }

    async fn load_latest(&self, execution_id: &str) -> Result<Option<Checkpoint>> {
        let versions = self.versions_on_disk(execution_id).await?;
        let Some(&latest) = versions.iter().max() else {
            return Ok(None);
        };
        self.load_version(execution_id, latest).await
    }

    async fn load_version(&self, execution_id: &str, version: u64) -> Result<Option<Checkpoint>> {
        let path = version_path(&self.root, execution_id, version);
        let raw = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match unwrap(&raw) {
            Ok(payload) => Ok(Some(bincode::deserialize(&payload)?)),
            Err(err) => {
                warn!(execution_id, version, %err, "checkpoint file failed integrity check");
                Err(err)
            }
        }
    }

    async fn list_versions(&self, execution_id: &str) -> Result<Vec<u64>> {
        self.versions_on_disk(execution_id).await
    }

    async fn prune(&self, execution_id: &str, keep: &[u64]) -> Result<()> {
        let versions = self.versions_on_disk(execution_id).await?;
        for version in versions {
            if !keep.contains(&version) {
                let path = version_path(&self.root, execution_id, version);
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        return Err(e.into());
                    }
                }
            }
        }
        self.known_versions
            .lock()
            .insert(execution_id.to_string(), keep.to_vec());
        Ok(())
    }
}

/// Shares one [`FileCheckpointer`] across tasks without forcing callers
/// to wrap it themselves.
pub type SharedFileCheckpointer = Arc<FileCheckpointer>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExecutionPhase;
    use crate::state_manager::CheckpointLevel;

    fn sample_state(execution_id: &str) -> crate::model::ExecutionState {
        crate::model::ExecutionState {
            execution_id: execution_id.to_string(),
            workflow_id: "wf".to_string(),
            version: 1,
            phase: ExecutionPhase::Running,
            started_at_ms: 0,
            updated_at_ms: 0,
            finished_at_ms: None,
            step_states: std::collections::HashMap::new(),
            blackboard: std::collections::HashMap::new(),
            checkpoint_version: 0,
            integrity_hash: String::new(),
        }
    }

    #[tokio::test]
    async fn round_trips_through_atomic_write_and_integrity_header() {
        let dir = tempfile::tempdir().unwrap();
        let checkpointer = FileCheckpointer::new(dir.path(), true);
        let checkpoint = Checkpoint {
            execution_id: "e1".to_string(),
            level: CheckpointLevel::Standard,
            version: 1,
            parent_version: 0,
            created_at_ms: 0,
            state: sample_state("e1"),
        };
        checkpointer.save(&checkpoint).await.unwrap();

        let loaded = checkpointer.load_latest("e1").await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.state.execution_id, "e1");
    }

    #[tokio::test]
    async fn round_trips_with_compression_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let checkpointer = FileCheckpointer::new(dir.path(), false);
        let checkpoint = Checkpoint {
            execution_id: "e1".to_string(),
            level: CheckpointLevel::Standard,
            version: 1,
            parent_version: 0,
            created_at_ms: 0,
            state: sample_state("e1"),
        };
        checkpointer.save(&checkpoint).await.unwrap();

        let loaded = checkpointer.load_latest("e1").await.unwrap().unwrap();
        assert_eq!(loaded.state.execution_id, "e1");
    }

    #[tokio::test]
    async fn detects_corrupted_payload() {
        let dir = tempfile::tempdir().unwrap();
        let checkpointer = FileCheckpointer::new(dir.path(), true);
        let checkpoint = Checkpoint {
            execution_id: "e1".to_string(),
            level: CheckpointLevel::Standard,
            version: 1,
            parent_version: 0,
            created_at_ms: 0,
            state: sample_state("e1"),
        };
        checkpointer.save(&checkpoint).await.unwrap();

        let path = version_path(dir.path(), "e1", 1);
        let mut bytes = tokio::fs::read(&path).await.unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        tokio::fs::write(&path, bytes).await.unwrap();

        let err = checkpointer.load_version("e1", 1).await.unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[tokio::test]
    async fn prune_removes_unlisted_versions() {
        let dir = tempfile::tempdir().unwrap();
        let checkpointer = FileCheckpointer::new(dir.path(), true);
        for version in 1..=3u64 {
            checkpointer
                .save(&Checkpoint {
                    execution_id: "e1".to_string(),
                    level: CheckpointLevel::Standard,
                    version,
                    parent_version: version.saturating_sub(1),
                    created_at_ms: 0,
                    state: sample_state("e1"),
                })
                .await
                .unwrap();
        }
        checkpointer.prune("e1", &[3]).await.unwrap();
        let versions = checkpointer.list_versions("e1").await.unwrap();
        assert_eq!(versions, vec![3]);
    }
}
