use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::StorageError;
use crate::store::{ObjectStore, StoredObject, WriteCondition};

/// Store operations, used to count calls and schedule injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    List,
    Get,
    Download,
    Put,
    PutFile,
    Delete,
    DeleteMany,
    Copy,
}

#[derive(Debug, Clone)]
struct MemoryObject {
    data: Vec<u8>,
    version: String,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<String, MemoryObject>,
    calls: HashMap<Operation, usize>,
    /// Absolute call numbers (per operation) that fail.
    failures: HashMap<Operation, Vec<usize>>,
    /// Writes applied right after the next `get` of a key returns.
    races: HashMap<String, Vec<u8>>,
    /// Keys whose conditional writes always fail their precondition.
    contested: HashSet<String>,
}

/// In-process [`ObjectStore`] keeping objects in a sorted map.
///
/// Versions are monotonically increasing counters, so conditional writes
/// behave like S3 ETags. Failures can be scheduled per operation and a
/// concurrent writer can be simulated with [`MemoryStore::race_after_get`].
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    next_version: AtomicU64,
    conditional_writes: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            next_version: AtomicU64::new(1),
            conditional_writes: true,
        }
    }

    /// A store that ignores write conditions, like plain blob storage.
    pub fn without_conditional_writes() -> Self {
        Self {
            conditional_writes: false,
            ..Self::new()
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn version(&self) -> String {
        format!("\"v{}\"", self.next_version.fetch_add(1, Ordering::SeqCst))
    }

    /// Seed an object directly, bypassing call accounting.
    pub fn insert(&self, key: &str, data: impl Into<Vec<u8>>) {
        let object = MemoryObject {
            data: data.into(),
            version: self.version(),
        };
        self.lock().objects.insert(key.to_string(), object);
    }

    pub fn read(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().objects.get(key).map(|o| o.data.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().objects.contains_key(key)
    }

    /// All keys under `prefix`, sorted.
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        self.lock()
            .objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Make the `nth` upcoming call (1-based) of `op` fail with an I/O error.
    pub fn fail_on(&self, op: Operation, nth: usize) {
        let mut inner = self.lock();
        let at = inner.calls.get(&op).copied().unwrap_or(0) + nth;
        inner.failures.entry(op).or_default().push(at);
    }

    pub fn call_count(&self, op: Operation) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Simulate another client writing `data` to `key` between this
    /// client's next read of `key` and its following write.
    pub fn race_after_get(&self, key: &str, data: impl Into<Vec<u8>>) {
        self.lock().races.insert(key.to_string(), data.into());
    }

    /// Make every conditional put to `key` fail its precondition, as if
    /// another writer always got there first.
    pub fn contest_conditional_writes(&self, key: &str) {
        self.lock().contested.insert(key.to_string());
    }

    fn record(&self, op: Operation, key: &str) -> Result<(), StorageError> {
        let mut inner = self.lock();
        let count = inner.calls.entry(op).or_insert(0);
        *count += 1;
        let current = *count;
        if let Some(planned) = inner.failures.get_mut(&op) {
            if let Some(pos) = planned.iter().position(|&n| n == current) {
                planned.remove(pos);
                return Err(StorageError::Io(format!(
                    "injected {:?} failure for {}",
                    op, key
                )));
            }
        }
        Ok(())
    }

    fn apply_race(&self, key: &str) {
        let pending = self.lock().races.remove(key);
        if let Some(data) = pending {
            debug!(key, "applying simulated concurrent write");
            self.insert(key, data);
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn supports_conditional_writes(&self) -> bool {
        self.conditional_writes
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.record(Operation::List, prefix)?;
        Ok(self.keys(prefix))
    }

    async fn get(&self, key: &str) -> Result<Option<StoredObject>, StorageError> {
        self.record(Operation::Get, key)?;
        let object = self.lock().objects.get(key).map(|o| StoredObject {
            data: o.data.clone(),
            version: Some(o.version.clone()),
        });
        self.apply_race(key);
        Ok(object)
    }

    async fn download_to(
        &self,
        key: &str,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, StorageError> {
        self.record(Operation::Download, key)?;
        let data = self
            .read(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        writer
            .write_all(&data)
            .await
            .map_err(|e| StorageError::Io(format!("Failed to write body of {}: {}", key, e)))?;
        Ok(data.len() as u64)
    }

    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        condition: WriteCondition,
    ) -> Result<(), StorageError> {
        self.record(Operation::Put, key)?;
        let version = self.version();
        let mut inner = self.lock();
        if self.conditional_writes {
            let current = inner.objects.get(key).map(|o| o.version.as_str());
            let allowed = match (&condition, current) {
                (WriteCondition::None, _) => true,
                (WriteCondition::IfAbsent, None) => true,
                (WriteCondition::IfAbsent, Some(_)) => false,
                (WriteCondition::IfMatch(expected), Some(actual)) => expected == actual,
                (WriteCondition::IfMatch(_), None) => false,
            };
            let contested =
                condition != WriteCondition::None && inner.contested.contains(key);
            if !allowed || contested {
                return Err(StorageError::PreconditionFailed(key.to_string()));
            }
        }
        inner
            .objects
            .insert(key.to_string(), MemoryObject { data, version });
        Ok(())
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<u64, StorageError> {
        self.record(Operation::PutFile, key)?;
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| StorageError::local(path, e))?;
        let len = data.len() as u64;
        let version = self.version();
        self.lock()
            .objects
            .insert(key.to_string(), MemoryObject { data, version });
        Ok(len)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.record(Operation::Delete, key)?;
        self.lock().objects.remove(key);
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<(), StorageError> {
        self.record(Operation::DeleteMany, &format!("{} keys", keys.len()))?;
        let mut inner = self.lock();
        for key in keys {
            inner.objects.remove(key);
        }
        Ok(())
    }

    async fn copy(&self, source: &str, destination: &str) -> Result<(), StorageError> {
        self.record(Operation::Copy, source)?;
        let data = self
            .read(source)
            .ok_or_else(|| StorageError::NotFound(source.to_string()))?;
        self.insert(destination, data);
        Ok(())
    }
}
