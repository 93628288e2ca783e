//! Checkpointing for workflow runs
//!
//! A checkpoint captures a run's engine state at a superstep boundary:
//! scoped state, queued envelopes, fan-in buffers, pending external requests
//! and executor instance state. Resuming from one always starts a fresh
//! superstep, so a handler is never observed half-applied.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  CheckpointManager                   │
//! │   Checkpoint ──▶ CheckpointCodec ──▶ bytes (json/zst) │
//! │                          │                           │
//! │            ┌─────────────┼──────────────┐            │
//! │            ▼             ▼              ▼            │
//! │       ┌────────┐    ┌────────┐    ┌──────────┐       │
//! │       │ Memory │    │  File  │    │  SQLite  │       │
//! │       └────────┘    └────────┘    └──────────┘       │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Stores only see opaque bytes keyed by [`CheckpointInfo`] (run id plus
//! superstep sequence). Saving the same key twice replaces the blob.
//!
//! # Usage
//!
//! ```ignore
//! use deepagents_workflow::checkpoint::{create_checkpoint_store, CheckpointManager, CheckpointStoreConfig};
//!
//! let store = create_checkpoint_store(CheckpointStoreConfig::File {
//!     path: PathBuf::from("./checkpoints"),
//! }).await?;
//! let manager = CheckpointManager::new(store).with_codec(CheckpointCodec::new().with_compression(true));
//! ```

mod file;
#[cfg(feature = "checkpoint-sqlite")]
mod sqlite;

pub use file::FileCheckpointStore;
#[cfg(feature = "checkpoint-sqlite")]
pub use sqlite::SqliteCheckpointStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::WorkflowError;
use crate::execution::run::RunStatus;
use crate::execution::state::RunnerStateData;
use crate::workflow::executor::ExecutorId;
use crate::workflow::graph::Workflow;

/// Current on-disk checkpoint format
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Key of a stored checkpoint
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub run_id: String,
    /// Supersteps completed when the checkpoint was taken
    pub sequence: u64,
}

impl CheckpointInfo {
    pub fn new(run_id: impl Into<String>, sequence: u64) -> Self {
        Self {
            run_id: run_id.into(),
            sequence,
        }
    }

    /// Printable identifier, `{run_id}@{sequence}`
    pub fn checkpoint_id(&self) -> String {
        format!("{}@{}", self.run_id, self.sequence)
    }
}

impl std::fmt::Display for CheckpointInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.run_id, self.sequence)
    }
}

/// Portable snapshot of a run at a superstep boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub info: CheckpointInfo,
    pub workflow_name: String,
    /// Executors of the workflow that produced the checkpoint
    pub executor_ids: Vec<ExecutorId>,
    /// Run status when the checkpoint was taken
    pub status: RunStatus,
    pub state: RunnerStateData,
    /// Previous checkpoint of the same run, if any
    pub parent: Option<CheckpointInfo>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Checkpoint {
    /// Snapshot `state` of a run of `workflow`
    pub fn new(workflow: &Workflow, run_id: impl Into<String>, status: RunStatus, state: RunnerStateData) -> Self {
        Self {
            version: CHECKPOINT_FORMAT_VERSION,
            info: CheckpointInfo::new(run_id, state.superstep as u64),
            workflow_name: workflow.name().to_string(),
            executor_ids: workflow.executor_ids().into_iter().cloned().collect(),
            status,
            state,
            parent: None,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_parent(mut self, parent: Option<CheckpointInfo>) -> Self {
        self.parent = parent;
        self
    }

    /// Add metadata to this checkpoint
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn superstep(&self) -> usize {
        self.state.superstep
    }

    pub fn pending_message_count(&self) -> usize {
        self.state.queued_messages.len()
    }

    /// Check that the checkpoint can be restored into `workflow`
    ///
    /// Executors recorded in the checkpoint must all exist in the workflow.
    /// Executors added to the workflow since only produce a warning.
    pub fn validate_against(&self, workflow: &Workflow) -> Result<(), WorkflowError> {
        if self.workflow_name != workflow.name() {
            return Err(WorkflowError::checkpoint_mismatch(workflow.name(), &self.workflow_name));
        }

        let missing: Vec<&str> = self
            .executor_ids
            .iter()
            .filter(|id| !workflow.contains(id))
            .map(ExecutorId::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(WorkflowError::checkpoint(format!(
                "checkpoint {} references executors missing from workflow '{}': {}",
                self.info,
                workflow.name(),
                missing.join(", ")
            )));
        }

        for id in workflow.executor_ids() {
            if !self.executor_ids.contains(id) {
                tracing::warn!(
                    checkpoint = %self.info,
                    executor_id = %id,
                    "Executor not present when checkpoint was taken"
                );
            }
        }
        Ok(())
    }
}

/// Byte storage for checkpoints
///
/// Implementations must make `put` all-or-nothing and return `list` in
/// ascending sequence order.
#[async_trait]
pub trait CheckpointStore: Send + Sync + Debug {
    /// Store a checkpoint blob, replacing any blob with the same key
    async fn put(&self, info: &CheckpointInfo, data: Vec<u8>) -> Result<(), WorkflowError>;

    async fn get(&self, info: &CheckpointInfo) -> Result<Option<Vec<u8>>, WorkflowError>;

    /// Checkpoints of a run, sorted by sequence
    async fn list(&self, run_id: &str) -> Result<Vec<CheckpointInfo>, WorkflowError>;

    async fn delete(&self, info: &CheckpointInfo) -> Result<(), WorkflowError>;

    async fn latest(&self, run_id: &str) -> Result<Option<CheckpointInfo>, WorkflowError> {
        Ok(self.list(run_id).await?.pop())
    }

    /// Keep only the most recent `keep` checkpoints of a run
    ///
    /// Returns the number of checkpoints deleted.
    async fn prune(&self, run_id: &str, keep: usize) -> Result<usize, WorkflowError> {
        let checkpoints = self.list(run_id).await?;
        let to_delete = checkpoints.len().saturating_sub(keep);
        let mut deleted = 0;

        for info in checkpoints.into_iter().take(to_delete) {
            self.delete(&info).await?;
            deleted += 1;
        }

        Ok(deleted)
    }

    /// Delete every checkpoint of a run
    async fn clear(&self, run_id: &str) -> Result<(), WorkflowError> {
        for info in self.list(run_id).await? {
            self.delete(&info).await?;
        }
        Ok(())
    }
}

/// In-memory checkpoint store.
///
/// Not durable. Use for tests and for time travel within one process.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: tokio::sync::RwLock<BTreeMap<CheckpointInfo, Vec<u8>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn put(&self, info: &CheckpointInfo, data: Vec<u8>) -> Result<(), WorkflowError> {
        let mut checkpoints = self.checkpoints.write().await;
        checkpoints.insert(info.clone(), data);
        Ok(())
    }

    async fn get(&self, info: &CheckpointInfo) -> Result<Option<Vec<u8>>, WorkflowError> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints.get(info).cloned())
    }

    async fn list(&self, run_id: &str) -> Result<Vec<CheckpointInfo>, WorkflowError> {
        let checkpoints = self.checkpoints.read().await;
        // BTreeMap keys sort by (run_id, sequence)
        Ok(checkpoints
            .keys()
            .filter(|info| info.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn delete(&self, info: &CheckpointInfo) -> Result<(), WorkflowError> {
        let mut checkpoints = self.checkpoints.write().await;
        checkpoints.remove(info);
        Ok(())
    }
}

/// Encoding of checkpoints to bytes
///
/// JSON, optionally zstd-compressed. Decoding detects compression from the
/// zstd frame header, so a store may hold a mix of both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointCodec {
    compression: bool,
    pretty: bool,
}

impl CheckpointCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_compression(mut self, compression: bool) -> Self {
        self.compression = compression;
        self
    }

    /// Pretty-print the JSON (ignored when compressing)
    pub fn with_pretty(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }

    pub fn encode(&self, checkpoint: &Checkpoint) -> Result<Vec<u8>, WorkflowError> {
        let json = if self.pretty && !self.compression {
            serde_json::to_vec_pretty(checkpoint)
        } else {
            serde_json::to_vec(checkpoint)
        }
        .map_err(|e| WorkflowError::checkpoint(format!("Serialization failed: {}", e)))?;

        if self.compression {
            compress(&json)
        } else {
            Ok(json)
        }
    }

    pub fn decode(&self, data: &[u8]) -> Result<Checkpoint, WorkflowError> {
        let json = if data.starts_with(&ZSTD_MAGIC) {
            decompress(data)?
        } else {
            data.to_vec()
        };

        let checkpoint: Checkpoint = serde_json::from_slice(&json)
            .map_err(|e| WorkflowError::checkpoint(format!("Deserialization failed: {}", e)))?;
        if checkpoint.version > CHECKPOINT_FORMAT_VERSION {
            return Err(WorkflowError::UnsupportedCheckpointVersion(checkpoint.version));
        }
        Ok(checkpoint)
    }
}

/// Compress data using zstd
fn compress(data: &[u8]) -> Result<Vec<u8>, WorkflowError> {
    let mut encoder = zstd::stream::Encoder::new(Vec::new(), 3)
        .map_err(|e| WorkflowError::checkpoint(format!("Compression init failed: {}", e)))?;
    encoder
        .write_all(data)
        .map_err(|e| WorkflowError::checkpoint(format!("Compression write failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| WorkflowError::checkpoint(format!("Compression finish failed: {}", e)))
}

/// Decompress data using zstd
fn decompress(data: &[u8]) -> Result<Vec<u8>, WorkflowError> {
    zstd::stream::decode_all(data)
        .map_err(|e| WorkflowError::checkpoint(format!("Decompression failed: {}", e)))
}

/// Creates, loads and validates checkpoints over a store
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    codec: CheckpointCodec,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            codec: CheckpointCodec::default(),
        }
    }

    /// Manager over a fresh [`MemoryCheckpointStore`]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCheckpointStore::new()))
    }

    pub fn with_codec(mut self, codec: CheckpointCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn codec(&self) -> CheckpointCodec {
        self.codec
    }

    /// Persist a checkpoint of `state`
    pub async fn create_checkpoint(
        &self,
        workflow: &Workflow,
        run_id: &str,
        status: RunStatus,
        state: RunnerStateData,
        parent: Option<CheckpointInfo>,
    ) -> Result<CheckpointInfo, WorkflowError> {
        let checkpoint = Checkpoint::new(workflow, run_id, status, state).with_parent(parent);
        self.save(&checkpoint).await?;
        Ok(checkpoint.info)
    }

    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<(), WorkflowError> {
        let data = self.codec.encode(checkpoint)?;
        let size = data.len();
        self.store.put(&checkpoint.info, data).await?;

        tracing::info!(
            checkpoint = %checkpoint.info,
            superstep = checkpoint.superstep(),
            status = ?checkpoint.status,
            bytes = size,
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Load a checkpoint, failing if it does not exist
    pub async fn load(&self, info: &CheckpointInfo) -> Result<Checkpoint, WorkflowError> {
        let data = self
            .store
            .get(info)
            .await?
            .ok_or_else(|| WorkflowError::checkpoint(format!("checkpoint {} not found", info)))?;
        let checkpoint = self.codec.decode(&data)?;

        if &checkpoint.info != info {
            return Err(WorkflowError::checkpoint(format!(
                "checkpoint stored as {} claims to be {}",
                info, checkpoint.info
            )));
        }
        Ok(checkpoint)
    }

    /// Load a checkpoint and check it fits `workflow`
    pub async fn restore(&self, workflow: &Workflow, info: &CheckpointInfo) -> Result<Checkpoint, WorkflowError> {
        let checkpoint = self.load(info).await?;
        checkpoint.validate_against(workflow)?;

        tracing::info!(
            checkpoint = %info,
            superstep = checkpoint.superstep(),
            pending = checkpoint.pending_message_count(),
            "Checkpoint restored"
        );
        Ok(checkpoint)
    }

    pub async fn list(&self, run_id: &str) -> Result<Vec<CheckpointInfo>, WorkflowError> {
        self.store.list(run_id).await
    }

    pub async fn latest(&self, run_id: &str) -> Result<Option<CheckpointInfo>, WorkflowError> {
        self.store.latest(run_id).await
    }
}

/// Configuration for creating checkpoint stores.
///
/// Use with [`create_checkpoint_store`] to instantiate the backend.
#[derive(Debug, Clone, Default)]
pub enum CheckpointStoreConfig {
    /// In-memory store (not durable)
    #[default]
    Memory,

    /// One file per checkpoint under `path`
    File { path: PathBuf },

    /// SQLite database file, or `:memory:`
    #[cfg(feature = "checkpoint-sqlite")]
    Sqlite { path: String },
}

/// Create a checkpoint store from configuration
pub async fn create_checkpoint_store(
    config: CheckpointStoreConfig,
) -> Result<Arc<dyn CheckpointStore>, WorkflowError> {
    match config {
        CheckpointStoreConfig::Memory => Ok(Arc::new(MemoryCheckpointStore::new())),

        CheckpointStoreConfig::File { path } => Ok(Arc::new(FileCheckpointStore::new(path))),

        #[cfg(feature = "checkpoint-sqlite")]
        CheckpointStoreConfig::Sqlite { path } => Ok(Arc::new(SqliteCheckpointStore::new(&path).await?)),
    }
}
