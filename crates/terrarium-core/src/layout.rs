use std::path::{Component, Path, PathBuf};

use crate::error::StorageError;

const LOCK_NAME: &str = ".lock";
const STATE_DIR: &str = "state";
const BACKUPS_DIR: &str = "backups";

/// A shared state directory and the keys derived from it.
///
/// Remote layout:
/// ```text
/// {dir}/
///   .lock                    # expiry epoch, base-10
///   state/{path}             # current files
///   backups/{epoch}/{path}   # one snapshot per commit
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateDirectory {
    name: String,
}

impl StateDirectory {
    /// Build from a user supplied directory, trimming leading and trailing `/`.
    pub fn new(dir: &str) -> Result<Self, StorageError> {
        let name = dir.trim_matches('/');
        if name.is_empty() {
            return Err(StorageError::InvalidKey(format!(
                "directory '{}' is empty after trimming",
                dir
            )));
        }
        if name.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..") {
            return Err(StorageError::InvalidKey(format!(
                "directory '{}' contains an empty, '.' or '..' segment",
                dir
            )));
        }
        Ok(Self {
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock_key(&self) -> String {
        format!("{}/{}", self.name, LOCK_NAME)
    }

    pub fn state_prefix(&self) -> String {
        format!("{}/{}/", self.name, STATE_DIR)
    }

    pub fn state_key(&self, relative: &str) -> String {
        format!("{}{}", self.state_prefix(), relative)
    }

    pub fn backup_prefix(&self, epoch: i64) -> String {
        format!("{}/{}/{}/", self.name, BACKUPS_DIR, epoch)
    }

    pub fn backup_key(&self, epoch: i64, relative: &str) -> String {
        format!("{}{}", self.backup_prefix(epoch), relative)
    }

    /// Strip the state prefix from a listed key.
    pub fn relative_state_path<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.state_prefix())
    }

    /// Local mirror of `state/`: `{local_root}/{dir}/state`.
    pub fn local_state_root(&self, local_root: &Path) -> PathBuf {
        let mut path = local_root.to_path_buf();
        for segment in self.name.split('/') {
            path.push(segment);
        }
        path.push(STATE_DIR);
        path
    }
}

/// Keys ending with `/` are folder placeholders, not files.
pub fn is_directory_marker(key: &str) -> bool {
    key.ends_with('/')
}

/// Convert a relative key into a local path that cannot escape its root.
pub fn safe_relative_path(relative: &str) -> Result<PathBuf, StorageError> {
    let path = Path::new(relative);
    if relative.is_empty() {
        return Err(StorageError::InvalidKey("empty relative path".to_string()));
    }
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => {
                return Err(StorageError::InvalidKey(format!(
                    "'{}' escapes the state directory",
                    relative
                )))
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(StorageError::InvalidKey(format!(
            "'{}' has no file component",
            relative
        )));
    }
    Ok(out)
}
