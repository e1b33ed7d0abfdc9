use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use terrarium_core::{LockMode, DEFAULT_CONCURRENCY};

/// Environment variables holding the access key, in lookup order.
pub const ACCESS_KEY_VARS: &[&str] = &["AWS_ACCESS_KEY", "AWS_ACCESS_KEY_ID"];
/// Environment variables holding the secret key, in lookup order.
pub const SECRET_KEY_VARS: &[&str] = &["AWS_SECRET_KEY", "AWS_SECRET_ACCESS_KEY"];

/// Command line for terrarium. Flags come before the command.
#[derive(Parser, Debug, Clone)]
#[command(name = "terrarium")]
#[command(about = "Lock, download and commit shared state directories stored in S3")]
#[command(disable_help_subcommand = true)]
pub struct Config {
    /// Maximum time in seconds to lock the remote state
    #[arg(long, default_value_t = 600, env = "TERRARIUM_EXPIRES")]
    pub expires: u64,

    /// S3 bucket
    #[arg(long = "s3-bucket", env = "TERRARIUM_S3_BUCKET")]
    pub s3_bucket: Option<String>,

    /// S3 region
    #[arg(long = "s3-region", env = "TERRARIUM_S3_REGION")]
    pub s3_region: Option<String>,

    /// Custom S3-compatible endpoint URL (path-style addressing)
    #[arg(long = "s3-endpoint", env = "TERRARIUM_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    /// Seconds between lock checks while waiting
    #[arg(long = "retry-wait", default_value_t = 5, env = "TERRARIUM_RETRY_WAIT")]
    pub retry_wait: u64,

    /// Seconds to wait for a held lock; 0 fails immediately
    #[arg(long, default_value_t = 0, env = "TERRARIUM_TIMEOUT")]
    pub timeout: u64,

    /// Report a held lock instead of waiting for it
    #[arg(long = "no-wait")]
    pub no_wait: bool,

    /// Number of concurrent uploads
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY, env = "TERRARIUM_CONCURRENCY")]
    pub concurrency: usize,

    /// Local directory that holds `<directory>/state/`
    #[arg(long = "local-root", default_value = ".", env = "TERRARIUM_LOCAL_ROOT")]
    pub local_root: PathBuf,

    /// Write the lock without If-None-Match / If-Match preconditions
    #[arg(long = "no-conditional-writes")]
    pub no_conditional_writes: bool,

    /// Command to run (see `terrarium help`)
    pub command: Option<String>,

    /// Command arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// Invalid or missing configuration, detected before any network access.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("The value of the '--expires' flag must be non-zero.")]
    InvalidExpires,

    #[error("A value is required for the '--s3-bucket' flag.")]
    MissingBucket,

    #[error("A value is required for the '--s3-region' flag.")]
    MissingRegion,

    #[error("A value is required for the '{}' environment variable.", ACCESS_KEY_VARS[0])]
    MissingAccessKey,

    #[error("A value is required for the '{}' environment variable.", SECRET_KEY_VARS[0])]
    MissingSecretKey,

    #[error("The value of the '--concurrency' flag must be non-zero.")]
    InvalidConcurrency,

    #[error("The value of the '--retry-wait' flag must be non-zero when '--timeout' is set.")]
    InvalidRetryWait,
}

/// Connection settings for the S3 store.
#[derive(Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key: String,
    pub secret_key: String,
    pub conditional_writes: bool,
}

impl std::fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Settings")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key", &"<redacted>")
            .field("secret_key", &"<redacted>")
            .field("conditional_writes", &self.conditional_writes)
            .finish()
    }
}

/// Validated settings for commands that touch storage.
#[derive(Debug, Clone)]
pub struct Settings {
    pub s3: S3Settings,
    pub ttl: Duration,
    pub lock_mode: LockMode,
    pub concurrency: usize,
    pub local_root: PathBuf,
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn first_env(lookup: &dyn Fn(&str) -> Option<String>, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| non_empty(lookup(name).as_deref()))
}

impl Config {
    /// Validate flags and read credentials through `lookup`.
    ///
    /// Checks run in a fixed order and stop at the first failure.
    pub fn settings(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Settings, ConfigError> {
        if self.expires == 0 {
            return Err(ConfigError::InvalidExpires);
        }
        let bucket = non_empty(self.s3_bucket.as_deref()).ok_or(ConfigError::MissingBucket)?;
        let region = non_empty(self.s3_region.as_deref()).ok_or(ConfigError::MissingRegion)?;
        let access_key = first_env(&lookup, ACCESS_KEY_VARS).ok_or(ConfigError::MissingAccessKey)?;
        let secret_key = first_env(&lookup, SECRET_KEY_VARS).ok_or(ConfigError::MissingSecretKey)?;
        if self.concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency);
        }
        if self.timeout > 0 && self.retry_wait == 0 {
            return Err(ConfigError::InvalidRetryWait);
        }

        let lock_mode = if self.no_wait {
            LockMode::NonBlocking
        } else {
            LockMode::Blocking {
                retry_wait: Duration::from_secs(self.retry_wait),
                timeout: Duration::from_secs(self.timeout),
            }
        };

        Ok(Settings {
            s3: S3Settings {
                bucket,
                region,
                endpoint: non_empty(self.s3_endpoint.as_deref()),
                access_key,
                secret_key,
                conditional_writes: !self.no_conditional_writes,
            },
            ttl: Duration::from_secs(self.expires),
            lock_mode,
            concurrency: self.concurrency,
            local_root: self.local_root.clone(),
        })
    }
}
