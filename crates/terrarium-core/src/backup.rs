use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::clock::Clock;
use crate::error::StorageError;
use crate::layout::{is_directory_marker, StateDirectory};
use crate::store::ObjectStore;

/// A completed copy of `state/` under `backups/{id}/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSnapshot {
    /// Epoch second used in the backup prefix.
    pub id: i64,
    /// Every key listed under `state/` when the snapshot was taken,
    /// folder markers included.
    pub state_keys: Vec<String>,
    /// Number of files copied.
    pub files: usize,
}

/// Snapshots and clears the state prefix.
#[derive(Clone)]
pub struct BackupManager {
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
}

impl BackupManager {
    pub fn new(store: Arc<dyn ObjectStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Server-side copy every file under `state/` to `backups/{id}/`.
    ///
    /// `id` is the current epoch second, moved forward past any backup prefix
    /// that already holds objects, so an earlier snapshot is never written
    /// into. A failed copy returns immediately; objects already copied remain
    /// as a partial backup.
    #[instrument(skip(self), fields(dir = dir.name()))]
    pub async fn snapshot(&self, dir: &StateDirectory) -> Result<BackupSnapshot, StorageError> {
        let id = self.free_backup_id(dir).await?;
        let state_keys = self.store.list(&dir.state_prefix()).await?;

        let mut files = 0;
        for key in &state_keys {
            if is_directory_marker(key) {
                continue;
            }
            let Some(relative) = dir.relative_state_path(key) else {
                continue;
            };
            let destination = dir.backup_key(id, relative);
            self.store.copy(key, &destination).await?;
            debug!(key, destination, "backed up");
            files += 1;
        }

        info!(id, files, "snapshot complete");
        Ok(BackupSnapshot {
            id,
            state_keys,
            files,
        })
    }

    async fn free_backup_id(&self, dir: &StateDirectory) -> Result<i64, StorageError> {
        let mut id = self.clock.now_epoch();
        while !self.store.list(&dir.backup_prefix(id)).await?.is_empty() {
            debug!(id, "backup prefix taken");
            id += 1;
        }
        Ok(id)
    }

    /// Delete the keys captured by `snapshot` in one batched call.
    ///
    /// Keys that appeared after the snapshot was listed are not touched, so
    /// nothing is deleted without a backup.
    #[instrument(skip(self, snapshot), fields(dir = dir.name(), keys = snapshot.state_keys.len()))]
    pub async fn delete_state(
        &self,
        dir: &StateDirectory,
        snapshot: &BackupSnapshot,
    ) -> Result<(), StorageError> {
        if snapshot.state_keys.is_empty() {
            debug!("state prefix empty, nothing to delete");
            return Ok(());
        }
        self.store.delete_many(&snapshot.state_keys).await?;
        info!(keys = snapshot.state_keys.len(), "old state deleted");
        Ok(())
    }
}
