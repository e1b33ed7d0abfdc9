//! Mirror `{dir}/state/` to and from a local tree.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::error::StorageError;
use crate::layout::{is_directory_marker, safe_relative_path, StateDirectory};
use crate::store::ObjectStore;

/// Default number of concurrent upload workers.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Suffix of the hidden temp file a download writes before renaming.
const TEMP_SUFFIX: &str = ".terrarium-tmp";

/// Files and bytes moved by one sync operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub files: usize,
    pub bytes: u64,
}

impl SyncReport {
    fn add(&mut self, bytes: u64) {
        self.files += 1;
        self.bytes += bytes;
    }
}

/// One file to upload: its key relative to `state/` and where to read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadItem {
    pub key: String,
    pub path: PathBuf,
}

/// Lazy walk of a local tree yielding [`UploadItem`]s in name order.
///
/// Only regular files are yielded; symlinks are not followed. Download temp
/// files left by an interrupted run are skipped. Restarting means walking
/// again from the root.
pub fn walk_local_tree(root: &Path) -> impl Iterator<Item = Result<UploadItem, StorageError>> {
    let root = root.to_path_buf();
    WalkDir::new(&root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(move |entry| match entry {
            Ok(entry) if entry.file_type().is_file() => {
                if is_download_temp(&entry.file_name().to_string_lossy()) {
                    warn!(path = %entry.path().display(), "skipping leftover download temp file");
                    return None;
                }
                Some(upload_item(&root, entry.into_path()))
            }
            Ok(_) => None,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                Some(Err(StorageError::local(path, e.into())))
            }
        })
}

fn is_download_temp(file_name: &str) -> bool {
    file_name.starts_with('.') && file_name.ends_with(TEMP_SUFFIX)
}

fn upload_item(root: &Path, path: PathBuf) -> Result<UploadItem, StorageError> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| StorageError::InvalidKey(format!("{} is outside {}", path.display(), root.display())))?;
    let mut segments = Vec::new();
    for component in relative.components() {
        let segment = component.as_os_str().to_str().ok_or_else(|| {
            StorageError::InvalidKey(format!("{} is not valid UTF-8", path.display()))
        })?;
        segments.push(segment);
    }
    Ok(UploadItem {
        key: segments.join("/"),
        path,
    })
}

/// Download and upload of a state directory's files.
#[derive(Clone)]
pub struct DirectorySync {
    store: Arc<dyn ObjectStore>,
    concurrency: usize,
}

impl DirectorySync {
    pub fn new(store: Arc<dyn ObjectStore>, concurrency: usize) -> Self {
        Self {
            store,
            concurrency: concurrency.max(1),
        }
    }

    /// Write every file under `state/` into `{local_root}/{dir}/state/`.
    ///
    /// Files are transferred one at a time. The first failure aborts the
    /// operation; files already written stay in place.
    #[instrument(skip(self, local_root), fields(dir = dir.name()))]
    pub async fn download(
        &self,
        dir: &StateDirectory,
        local_root: &Path,
    ) -> Result<SyncReport, StorageError> {
        let prefix = dir.state_prefix();
        let keys = self.store.list(&prefix).await?;
        let target_root = dir.local_state_root(local_root);
        fs::create_dir_all(&target_root)
            .await
            .map_err(|e| StorageError::local(&target_root, e))?;

        let mut report = SyncReport::default();
        for key in keys {
            if is_directory_marker(&key) {
                continue;
            }
            let Some(relative) = dir.relative_state_path(&key) else {
                warn!(key, "listed key outside state prefix, skipping");
                continue;
            };
            let target = target_root.join(safe_relative_path(relative)?);
            let bytes = self.download_file(&key, &target).await?;
            debug!(key, bytes, "downloaded");
            report.add(bytes);
        }

        info!(files = report.files, bytes = report.bytes, "download complete");
        Ok(report)
    }

    async fn download_file(&self, key: &str, target: &Path) -> Result<u64, StorageError> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::local(parent, e))?;
        }

        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = target.with_file_name(format!(".{}{}", file_name, TEMP_SUFFIX));

        let result = async {
            let mut file = fs::File::create(&temp)
                .await
                .map_err(|e| StorageError::local(&temp, e))?;
            let bytes = self.store.download_to(key, &mut file).await?;
            file.flush().await.map_err(|e| StorageError::local(&temp, e))?;
            file.sync_all()
                .await
                .map_err(|e| StorageError::local(&temp, e))?;
            Ok::<_, StorageError>(bytes)
        }
        .await;

        match result {
            Ok(bytes) => {
                fs::rename(&temp, target)
                    .await
                    .map_err(|e| StorageError::local(target, e))?;
                Ok(bytes)
            }
            Err(e) => {
                let _ = fs::remove_file(&temp).await;
                Err(e)
            }
        }
    }

    /// Upload `{local_root}/{dir}/state/` into `state/`.
    ///
    /// Remote keys with no local counterpart are left alone; callers replace
    /// the prefix wholesale by deleting it first.
    #[instrument(skip(self, local_root), fields(dir = dir.name()))]
    pub async fn upload(
        &self,
        dir: &StateDirectory,
        local_root: &Path,
    ) -> Result<SyncReport, StorageError> {
        let root = dir.local_state_root(local_root);
        ensure_local_dir(&root).await?;
        let report = self.upload_items(dir, walk_local_tree(&root)).await?;
        info!(files = report.files, bytes = report.bytes, "upload complete");
        Ok(report)
    }

    /// Feed `items` to a pool of at most `concurrency` upload tasks.
    ///
    /// Items are pulled only when a worker slot is free, so the walk is never
    /// materialized. The first error aborts in-flight uploads and is returned;
    /// objects already uploaded are not removed.
    pub async fn upload_items<I>(
        &self,
        dir: &StateDirectory,
        items: I,
    ) -> Result<SyncReport, StorageError>
    where
        I: IntoIterator<Item = Result<UploadItem, StorageError>>,
    {
        let mut workers: JoinSet<Result<u64, StorageError>> = JoinSet::new();
        let mut report = SyncReport::default();

        for item in items {
            let item = match item {
                Ok(item) => item,
                Err(e) => {
                    workers.abort_all();
                    return Err(e);
                }
            };

            if workers.len() >= self.concurrency {
                if let Some(joined) = workers.join_next().await {
                    match flatten(joined) {
                        Ok(bytes) => report.add(bytes),
                        Err(e) => {
                            workers.abort_all();
                            return Err(e);
                        }
                    }
                }
            }

            let store = Arc::clone(&self.store);
            let key = dir.state_key(&item.key);
            workers.spawn(async move {
                let bytes = store.put_file(&key, &item.path).await?;
                debug!(key, bytes, "uploaded");
                Ok(bytes)
            });
        }

        while let Some(joined) = workers.join_next().await {
            match flatten(joined) {
                Ok(bytes) => report.add(bytes),
                Err(e) => {
                    workers.abort_all();
                    return Err(e);
                }
            }
        }

        Ok(report)
    }
}

fn flatten(
    joined: Result<Result<u64, StorageError>, tokio::task::JoinError>,
) -> Result<u64, StorageError> {
    joined.map_err(|e| StorageError::Worker(e.to_string()))?
}

/// Fail unless `path` is an existing directory.
pub async fn ensure_local_dir(path: &Path) -> Result<(), StorageError> {
    let metadata = fs::metadata(path)
        .await
        .map_err(|e| StorageError::local(path, e))?;
    if !metadata.is_dir() {
        return Err(StorageError::local(
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a directory"),
        ));
    }
    Ok(())
}
