//! Errors surfaced by commands.

use terrarium_core::{CommitError, LockError, StorageError};

use crate::config::ConfigError;

/// Exit codes.
pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_USAGE: u8 = 2;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// No command given; global usage is printed.
    #[error("No command given")]
    NoCommand,

    #[error("Invalid command '{0}'.")]
    UnknownCommand(String),

    #[error("{0}")]
    Usage(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CommandError {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => EXIT_USAGE,
            _ => EXIT_FAILURE,
        }
    }
}

pub type Result<T> = std::result::Result<T, CommandError>;
