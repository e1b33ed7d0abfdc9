//! Backup, replace and unlock as one command.
//!
//! Steps run strictly in order and each must fully succeed before the next
//! starts:
//!
//! 1. snapshot `state/` into `backups/{t}/`
//! 2. delete the snapshotted `state/` keys
//! 3. upload the local tree into `state/`
//! 4. delete the lock record
//!
//! Nothing is rolled back. A failure at step 3 can leave `state/` empty or
//! partial; re-running the commit is safe because the previous state is
//! already in a backup.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, instrument};

use crate::backup::BackupManager;
use crate::clock::Clock;
use crate::error::{CommitError, CommitStep};
use crate::layout::StateDirectory;
use crate::lock::LockManager;
use crate::store::ObjectStore;
use crate::sync::{ensure_local_dir, DirectorySync};

/// Summary of a successful commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitReport {
    pub snapshot_id: i64,
    pub backed_up: usize,
    pub uploaded: usize,
    pub uploaded_bytes: u64,
}

pub struct CommitOrchestrator {
    backups: BackupManager,
    sync: DirectorySync,
    locks: LockManager,
}

impl CommitOrchestrator {
    pub fn new(store: Arc<dyn ObjectStore>, clock: Arc<dyn Clock>, concurrency: usize) -> Self {
        Self {
            backups: BackupManager::new(store.clone(), clock.clone()),
            sync: DirectorySync::new(store.clone(), concurrency),
            locks: LockManager::new(store, clock),
        }
    }

    #[instrument(skip(self, local_root), fields(dir = dir.name()))]
    pub async fn commit(
        &self,
        dir: &StateDirectory,
        local_root: &Path,
    ) -> Result<CommitReport, CommitError> {
        ensure_local_dir(&dir.local_state_root(local_root))
            .await
            .map_err(CommitError::at(CommitStep::Preflight))?;

        let snapshot = self
            .backups
            .snapshot(dir)
            .await
            .map_err(CommitError::at(CommitStep::Snapshot))?;

        self.backups
            .delete_state(dir, &snapshot)
            .await
            .map_err(CommitError::at(CommitStep::DeleteState))?;

        let uploaded = self
            .sync
            .upload(dir, local_root)
            .await
            .map_err(CommitError::at(CommitStep::Upload))?;

        self.locks
            .release(dir)
            .await
            .map_err(CommitError::at(CommitStep::Release))?;

        info!(
            snapshot = snapshot.id,
            backed_up = snapshot.files,
            uploaded = uploaded.files,
            "commit complete"
        );
        Ok(CommitReport {
            snapshot_id: snapshot.id,
            backed_up: snapshot.files,
            uploaded: uploaded.files,
            uploaded_bytes: uploaded.bytes,
        })
    }
}
