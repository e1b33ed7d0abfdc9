use async_trait::async_trait;
use terrarium_core::DirectorySync;

use super::{directory_arg, Command, CommandContext};
use crate::error::Result;

/// Mirror `state/` locally without touching the lock.
pub struct DownloadCommand;

#[async_trait]
impl Command for DownloadCommand {
    fn name(&self) -> &'static str {
        "download"
    }

    fn summary(&self) -> &'static str {
        "Download remote state without locking"
    }

    fn usage(&self) -> &'static str {
        "Usage: terrarium [--local-root] [--s3-bucket] [--s3-region] download <directory>"
    }

    async fn run(&self, ctx: &CommandContext<'_>, args: &[String]) -> Result<()> {
        let dir = directory_arg(self, args)?;
        let services = ctx.services()?;
        let settings = &services.settings;
        let report = DirectorySync::new(services.store.clone(), settings.concurrency)
            .download(&dir, &settings.local_root)
            .await?;
        ctx.emit(format!(
            "Downloaded {} files ({} bytes) into {}",
            report.files,
            report.bytes,
            dir.local_state_root(&settings.local_root).display()
        ));
        Ok(())
    }
}
