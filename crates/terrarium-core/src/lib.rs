//! Core protocol for terrarium: an advisory mutex over a directory of state
//! files kept in an object store that has no native locking.
//!
//! - `ObjectStore`: list/get/put/delete/copy over keyed blobs
//! - `LockManager`: expiry-marker lock with blocking and non-blocking modes
//! - `DirectorySync`: streaming mirror of `state/` to and from a local tree
//! - `BackupManager`: timestamped snapshots of `state/`
//! - `CommitOrchestrator`: backup, replace and unlock in strict order

mod backup;
mod clock;
mod commit;
mod error;
mod layout;
mod lock;
mod memory;
mod store;
mod sync;

pub use backup::{BackupManager, BackupSnapshot};
pub use clock::{Clock, ManualClock, SystemClock};
pub use commit::{CommitOrchestrator, CommitReport};
pub use error::{CommitError, CommitStep, LockError, StorageError};
pub use layout::{is_directory_marker, safe_relative_path, StateDirectory};
pub use lock::{parse_lock_record, LockAcquireResult, LockManager, LockMode, LockStatus};
pub use memory::{MemoryStore, Operation};
pub use store::{ObjectStore, StoredObject, WriteCondition};
pub use sync::{walk_local_tree, DirectorySync, SyncReport, UploadItem, DEFAULT_CONCURRENCY};
