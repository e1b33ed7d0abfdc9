use std::path::PathBuf;

/// Errors raised by object store access and local tree handling.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Precondition failed writing {0}")]
    PreconditionFailed(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Local filesystem error at {}: {source}", path.display())]
    LocalFilesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Transfer worker failed: {0}")]
    Worker(String),
}

impl StorageError {
    pub(crate) fn local(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::LocalFilesystem {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised while inspecting or acquiring a lock record.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Could not unlock remote state: locked until {expiry}")]
    Contention { expiry: i64 },

    #[error("Timeout exceeded for unlocking remote state after {waited_secs}s: locked until {expiry}")]
    Timeout { waited_secs: i64, expiry: i64 },

    #[error("Lock record at {key} was modified concurrently")]
    Conflict { key: String },

    #[error("Malformed lock record at {key}: {reason}")]
    MalformedRecord { key: String, reason: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Step of a commit that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStep {
    Preflight,
    Snapshot,
    DeleteState,
    Upload,
    Release,
}

impl std::fmt::Display for CommitStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Preflight => "preflight",
            Self::Snapshot => "snapshot",
            Self::DeleteState => "delete state",
            Self::Upload => "upload",
            Self::Release => "release lock",
        };
        f.write_str(name)
    }
}

/// A commit step failed; later steps were not started.
#[derive(Debug, thiserror::Error)]
#[error("Commit failed during {step}: {source}")]
pub struct CommitError {
    pub step: CommitStep,
    #[source]
    pub source: StorageError,
}

impl CommitError {
    pub(crate) fn at(step: CommitStep) -> impl FnOnce(StorageError) -> Self {
        move |source| Self { step, source }
    }
}
