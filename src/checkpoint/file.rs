//! File-based checkpoint store
//!
//! One file per checkpoint, grouped by run. The bytes are whatever the
//! codec produced, so compressed and plain checkpoints share the layout.
//!
//! # Directory Structure
//!
//! ```text
//! checkpoints/
//! └── {run_id}/
//!     ├── checkpoint_00001.ckpt
//!     ├── checkpoint_00005.ckpt
//!     └── checkpoint_00010.ckpt
//! ```

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{CheckpointInfo, CheckpointStore};
use crate::error::WorkflowError;

/// Checkpoint store writing one file per checkpoint.
///
/// Atomic writes are ensured via temporary file + rename pattern.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    base_path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Directory of one run
    ///
    /// Run ids become directory names, so separators and parent references
    /// are rejected.
    fn run_dir(&self, run_id: &str) -> Result<PathBuf, WorkflowError> {
        let invalid = run_id.is_empty()
            || run_id == "."
            || run_id == ".."
            || run_id.contains(['/', '\\', '\0']);
        if invalid {
            return Err(WorkflowError::checkpoint(format!("invalid run id for file store: {:?}", run_id)));
        }
        Ok(self.base_path.join(run_id))
    }

    fn checkpoint_path(&self, info: &CheckpointInfo) -> Result<PathBuf, WorkflowError> {
        Ok(self
            .run_dir(&info.run_id)?
            .join(format!("checkpoint_{:05}.ckpt", info.sequence)))
    }

    fn temp_path(&self, info: &CheckpointInfo) -> Result<PathBuf, WorkflowError> {
        Ok(self
            .run_dir(&info.run_id)?
            .join(format!("checkpoint_{:05}.tmp", info.sequence)))
    }

    /// Parse the sequence number from a checkpoint file name
    fn parse_sequence(path: &Path) -> Option<u64> {
        let filename = path.file_name()?.to_str()?;
        filename
            .strip_prefix("checkpoint_")?
            .strip_suffix(".ckpt")?
            .parse()
            .ok()
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn put(&self, info: &CheckpointInfo, data: Vec<u8>) -> Result<(), WorkflowError> {
        let dir = self.run_dir(&info.run_id)?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| WorkflowError::checkpoint(format!("Failed to create directory: {}", e)))?;

        // Write to temp file first (atomic write pattern)
        let temp_path = self.temp_path(info)?;
        let final_path = self.checkpoint_path(info)?;

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| WorkflowError::checkpoint(format!("Failed to create temp file: {}", e)))?;

        file.write_all(&data)
            .await
            .map_err(|e| WorkflowError::checkpoint(format!("Failed to write data: {}", e)))?;

        file.sync_all()
            .await
            .map_err(|e| WorkflowError::checkpoint(format!("Failed to sync file: {}", e)))?;

        fs::rename(&temp_path, &final_path)
            .await
            .map_err(|e| WorkflowError::checkpoint(format!("Failed to rename file: {}", e)))?;

        tracing::debug!(path = %final_path.display(), bytes = data.len(), "Wrote checkpoint file");
        Ok(())
    }

    async fn get(&self, info: &CheckpointInfo) -> Result<Option<Vec<u8>>, WorkflowError> {
        let path = self.checkpoint_path(info)?;

        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(WorkflowError::checkpoint(format!("Failed to read file: {}", e))),
        }
    }

    async fn list(&self, run_id: &str) -> Result<Vec<CheckpointInfo>, WorkflowError> {
        let dir = self.run_dir(run_id)?;
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| WorkflowError::checkpoint(format!("Failed to read directory: {}", e)))?;

        let mut sequences = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| WorkflowError::checkpoint(format!("Failed to read entry: {}", e)))?
        {
            if let Some(sequence) = Self::parse_sequence(&entry.path()) {
                sequences.push(sequence);
            }
        }

        sequences.sort_unstable();
        Ok(sequences
            .into_iter()
            .map(|sequence| CheckpointInfo::new(run_id, sequence))
            .collect())
    }

    async fn delete(&self, info: &CheckpointInfo) -> Result<(), WorkflowError> {
        let path = self.checkpoint_path(info)?;

        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WorkflowError::checkpoint(format!("Failed to delete file: {}", e))),
        }
    }
}
