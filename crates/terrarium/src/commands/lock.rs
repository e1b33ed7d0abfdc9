use async_trait::async_trait;
use terrarium_core::{DirectorySync, LockAcquireResult, LockManager};
use tracing::debug;

use super::{directory_arg, Command, CommandContext};
use crate::error::Result;

/// Acquire the lock, then download `state/`.
pub struct LockCommand;

#[async_trait]
impl Command for LockCommand {
    fn name(&self) -> &'static str {
        "lock"
    }

    fn summary(&self) -> &'static str {
        "Download and lock remote state"
    }

    fn usage(&self) -> &'static str {
        "Usage: terrarium [--expires] [--retry-wait] [--timeout] [--no-wait] [--s3-bucket] [--s3-region] lock <directory>"
    }

    async fn run(&self, ctx: &CommandContext<'_>, args: &[String]) -> Result<()> {
        let dir = directory_arg(self, args)?;
        let services = ctx.services()?;
        let settings = &services.settings;

        let locks = LockManager::new(services.store.clone(), services.clock.clone());
        let expiry = match locks.acquire(&dir, settings.ttl, settings.lock_mode).await? {
            LockAcquireResult::Acquired { expiry } => expiry,
            LockAcquireResult::Held { expiry } => {
                ctx.emit(format!("Remote state locked until: {}", expiry));
                return Ok(());
            }
        };
        ctx.emit(format!("Locked to: {}", expiry));

        let sync = DirectorySync::new(services.store.clone(), settings.concurrency);
        let report = sync.download(&dir, &settings.local_root).await?;
        debug!(files = report.files, bytes = report.bytes, "state downloaded");
        ctx.emit(format!(
            "Downloaded {} files ({} bytes) into {}",
            report.files,
            report.bytes,
            dir.local_state_root(&settings.local_root).display()
        ));
        Ok(())
    }
}
