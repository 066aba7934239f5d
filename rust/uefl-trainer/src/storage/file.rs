//! Stores that persist into the work directory.
//!
//! ```text
//! workdir/
//! ├── state.json            the coordinator state
//! ├── summary.json          the summary of a finished run
//! └── models/
//!     └── <iteration>_<round_id>.bin
//! ```

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::Context;
use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use crate::{
    state_machine::coordinator::{CoordinatorState, Summary},
    storage::{CoordinatorStorage, ModelStorage, StorageResult, Store},
};
use uefl_core::Model;

pub const STATE_FILE: &str = "state.json";
pub const SUMMARY_FILE: &str = "summary.json";
pub const MODELS_DIR: &str = "models";

/// Writes the file next to its destination first, then moves it into place.
async fn write_atomic(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed to move {} into place", path.display()))?;
    Ok(())
}

/// Reads a file, returning `None` if it doesn't exist.
async fn read_optional(path: &Path) -> StorageResult<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

async fn remove_optional(path: &Path) -> StorageResult<()> {
    match fs::remove_file(path).await {
        Err(err) if err.kind() != ErrorKind::NotFound => {
            Err(err).with_context(|| format!("failed to remove {}", path.display()))
        }
        _ => Ok(()),
    }
}

async fn ensure_dir(dir: &Path) -> StorageResult<()> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let metadata = fs::metadata(dir).await?;
    anyhow::ensure!(
        !metadata.permissions().readonly(),
        "{} is read-only",
        dir.display()
    );
    Ok(())
}

#[derive(Debug, Clone)]
/// A coordinator store that keeps JSON files in a directory.
pub struct FileCoordinatorStore {
    dir: PathBuf,
}

impl FileCoordinatorStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }
}

#[async_trait]
impl CoordinatorStorage for FileCoordinatorStore {
    async fn set_coordinator_state(&mut self, state: &CoordinatorState) -> StorageResult<()> {
        debug!("set coordinator state");
        let bytes = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.path(STATE_FILE), &bytes).await
    }

    async fn coordinator_state(&mut self) -> StorageResult<Option<CoordinatorState>> {
        read_optional(&self.path(STATE_FILE))
            .await?
            .map(|bytes| serde_json::from_slice(&bytes).context("invalid coordinator state"))
            .transpose()
    }

    async fn set_summary(&mut self, summary: &Summary) -> StorageResult<()> {
        debug!("set summary");
        let bytes = serde_json::to_vec_pretty(summary)?;
        write_atomic(&self.path(SUMMARY_FILE), &bytes).await
    }

    async fn delete_coordinator_data(&mut self) -> StorageResult<()> {
        debug!("delete coordinator data");
        remove_optional(&self.path(STATE_FILE)).await?;
        remove_optional(&self.path(SUMMARY_FILE)).await
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        ensure_dir(&self.dir).await
    }
}

#[derive(Debug, Clone)]
/// A model store that keeps bincode encoded models in a directory.
pub struct FileModelStore {
    dir: PathBuf,
}

impl FileModelStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.bin", id))
    }
}

#[async_trait]
impl ModelStorage for FileModelStore {
    async fn set_global_model(
        &mut self,
        iteration: usize,
        round_id: u64,
        global_model: &Model,
    ) -> StorageResult<String> {
        let id = Self::create_global_model_id(iteration, round_id);
        debug!("set global model {}", id);
        let bytes = bincode::serialize(global_model)?;
        write_atomic(&self.path(&id), &bytes).await?;
        Ok(id)
    }

    async fn global_model(&mut self, id: &str) -> StorageResult<Option<Model>> {
        read_optional(&self.path(id))
            .await?
            .map(|bytes| bincode::deserialize(&bytes).context("invalid global model"))
            .transpose()
    }

    async fn delete_global_models(&mut self) -> StorageResult<()> {
        debug!("delete global models");
        match fs::remove_dir_all(&self.dir).await {
            Err(err) if err.kind() != ErrorKind::NotFound => {
                return Err(err).with_context(|| format!("failed to remove {}", self.dir.display()))
            }
            _ => {}
        }
        ensure_dir(&self.dir).await
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        ensure_dir(&self.dir).await
    }
}

/// A store that persists everything into a work directory.
pub type FileStore = Store<FileCoordinatorStore, FileModelStore>;

impl FileStore {
    /// Creates a store in the given work directory.
    pub fn in_workdir(workdir: impl AsRef<Path>) -> Self {
        let workdir = workdir.as_ref();
        Store::new(
            FileCoordinatorStore::new(workdir),
            FileModelStore::new(workdir.join(MODELS_DIR)),
        )
    }
}
