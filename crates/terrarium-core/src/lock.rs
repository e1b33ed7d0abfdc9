//! Advisory lock over a single expiry marker object.
//!
//! The record at `{dir}/.lock` holds the UNIX epoch second at which the lock
//! expires. A missing record and an expired one both mean "unlocked".
//!
//! When the store supports conditional writes, a new record is written with
//! `If-None-Match: *` over a missing record and `If-Match: {etag}` over an
//! expired one, so two clients racing on the same observation cannot both
//! win. Without conditional writes, acquisition is check-then-write: two
//! clients can both observe "unlocked" and both write, and the later write
//! silently wins.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::error::{LockError, StorageError};
use crate::layout::StateDirectory;
use crate::store::{ObjectStore, WriteCondition};

/// Observed state of a lock record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    /// No record exists.
    Unlocked,
    /// A record exists but `expiry <= now`.
    Expired { expiry: i64 },
    /// A live record exists.
    Held { expiry: i64 },
}

impl LockStatus {
    pub fn is_unlocked(&self) -> bool {
        !matches!(self, Self::Held { .. })
    }
}

/// How `acquire` reacts to a live lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Poll every `retry_wait` until unlocked or `timeout` elapses.
    /// A zero timeout fails on the first contended check.
    Blocking {
        retry_wait: Duration,
        timeout: Duration,
    },
    /// Check once and report the current holder's expiry without writing.
    NonBlocking,
}

/// Outcome of a lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAcquireResult {
    /// A new record was written with this expiry.
    Acquired { expiry: i64 },
    /// Another client holds the lock until `expiry`. Only returned in
    /// [`LockMode::NonBlocking`].
    Held { expiry: i64 },
}

struct Observation {
    status: LockStatus,
    condition: WriteCondition,
}

enum Attempt {
    Acquired(i64),
    Held(i64),
    /// The conditional write lost against a concurrent writer.
    Lost,
}

/// Parse a lock record payload as a base-10 epoch.
pub fn parse_lock_record(key: &str, data: &[u8]) -> Result<i64, LockError> {
    let text = std::str::from_utf8(data).map_err(|e| LockError::MalformedRecord {
        key: key.to_string(),
        reason: format!("not UTF-8: {}", e),
    })?;
    text.trim()
        .parse::<i64>()
        .map_err(|e| LockError::MalformedRecord {
            key: key.to_string(),
            reason: format!("'{}' is not an integer epoch: {}", text.trim(), e),
        })
}

/// Lock manager for state directories in one object store.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
}

impl LockManager {
    pub fn new(store: Arc<dyn ObjectStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    async fn observe(&self, dir: &StateDirectory) -> Result<Observation, LockError> {
        let key = dir.lock_key();
        let Some(object) = self.store.get(&key).await? else {
            return Ok(Observation {
                status: LockStatus::Unlocked,
                condition: WriteCondition::IfAbsent,
            });
        };

        let expiry = parse_lock_record(&key, &object.data)?;
        let status = if expiry <= self.clock.now_epoch() {
            LockStatus::Expired { expiry }
        } else {
            LockStatus::Held { expiry }
        };
        let condition = match object.version {
            Some(version) => WriteCondition::IfMatch(version),
            None => WriteCondition::None,
        };
        Ok(Observation { status, condition })
    }

    /// Current state of the lock record.
    #[instrument(skip(self), fields(dir = dir.name()), level = "debug")]
    pub async fn inspect(&self, dir: &StateDirectory) -> Result<LockStatus, LockError> {
        Ok(self.observe(dir).await?.status)
    }

    /// `true` if no record exists or the record has expired.
    pub async fn check_unlocked(&self, dir: &StateDirectory) -> Result<bool, LockError> {
        Ok(self.inspect(dir).await?.is_unlocked())
    }

    /// One check followed, if unlocked, by one write.
    async fn attempt(&self, dir: &StateDirectory, ttl: Duration) -> Result<Attempt, LockError> {
        let observation = self.observe(dir).await?;
        if let LockStatus::Held { expiry } = observation.status {
            return Ok(Attempt::Held(expiry));
        }

        let condition = if self.store.supports_conditional_writes() {
            observation.condition
        } else {
            WriteCondition::None
        };
        if condition == WriteCondition::None {
            debug!(
                backend = self.store.backend_name(),
                "writing lock without a precondition"
            );
        }

        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let expiry = self.clock.now_epoch().saturating_add(ttl_secs);
        let key = dir.lock_key();
        match self
            .store
            .put(&key, expiry.to_string().into_bytes(), condition)
            .await
        {
            Ok(()) => Ok(Attempt::Acquired(expiry)),
            Err(StorageError::PreconditionFailed(_)) => {
                warn!(key, "lock write lost a concurrent race");
                Ok(Attempt::Lost)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// After a lost race, find out whom we lost against.
    async fn holder_after_race(&self, dir: &StateDirectory) -> Result<Option<i64>, LockError> {
        match self.inspect(dir).await? {
            LockStatus::Held { expiry } => Ok(Some(expiry)),
            _ => Ok(None),
        }
    }

    /// Acquire the lock for `ttl`.
    ///
    /// # Errors
    ///
    /// In blocking mode, [`LockError::Contention`] when the lock is held and
    /// the timeout is zero, and [`LockError::Timeout`] once the wait budget is
    /// exhausted. Store failures and malformed records are propagated in both
    /// modes.
    #[instrument(skip(self), fields(dir = dir.name()))]
    pub async fn acquire(
        &self,
        dir: &StateDirectory,
        ttl: Duration,
        mode: LockMode,
    ) -> Result<LockAcquireResult, LockError> {
        match mode {
            LockMode::NonBlocking => self.try_acquire(dir, ttl).await,
            LockMode::Blocking {
                retry_wait,
                timeout,
            } => self.acquire_blocking(dir, ttl, retry_wait, timeout).await,
        }
    }

    /// Single check: write a new record if unlocked, otherwise report the
    /// current holder's expiry.
    pub async fn try_acquire(
        &self,
        dir: &StateDirectory,
        ttl: Duration,
    ) -> Result<LockAcquireResult, LockError> {
        match self.attempt(dir, ttl).await? {
            Attempt::Acquired(expiry) => {
                info!(expiry, "lock acquired");
                Ok(LockAcquireResult::Acquired { expiry })
            }
            Attempt::Held(expiry) => Ok(LockAcquireResult::Held { expiry }),
            Attempt::Lost => match self.holder_after_race(dir).await? {
                Some(expiry) => Ok(LockAcquireResult::Held { expiry }),
                None => Err(LockError::Conflict {
                    key: dir.lock_key(),
                }),
            },
        }
    }

    async fn acquire_blocking(
        &self,
        dir: &StateDirectory,
        ttl: Duration,
        retry_wait: Duration,
        timeout: Duration,
    ) -> Result<LockAcquireResult, LockError> {
        let start = self.clock.now_epoch();
        let deadline = start.saturating_add(i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX));

        loop {
            // `None` when a write lost its precondition and no live holder
            // showed up afterwards.
            let holder = match self.attempt(dir, ttl).await? {
                Attempt::Acquired(expiry) => {
                    info!(expiry, "lock acquired");
                    return Ok(LockAcquireResult::Acquired { expiry });
                }
                Attempt::Held(expiry) => Some(expiry),
                Attempt::Lost => self.holder_after_race(dir).await?,
            };

            let now = self.clock.now_epoch();
            if timeout.is_zero() || now > deadline {
                return Err(match holder {
                    Some(expiry) if timeout.is_zero() => LockError::Contention { expiry },
                    Some(expiry) => LockError::Timeout {
                        waited_secs: now - start,
                        expiry,
                    },
                    None => LockError::Conflict {
                        key: dir.lock_key(),
                    },
                });
            }

            debug!(?holder, retry_wait_secs = retry_wait.as_secs(), "lock contended, waiting");
            self.clock.sleep(retry_wait).await;
        }
    }

    /// Delete the lock record. A missing record is not an error.
    #[instrument(skip(self), fields(dir = dir.name()))]
    pub async fn release(&self, dir: &StateDirectory) -> Result<(), StorageError> {
        self.store.delete(&dir.lock_key()).await?;
        info!("lock released");
        Ok(())
    }
}
