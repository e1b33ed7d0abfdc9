use async_trait::async_trait;
use terrarium_core::{CommitOrchestrator, CommitStep};
use tracing::warn;

use super::{directory_arg, Command, CommandContext};
use crate::error::{CommandError, Result};

/// Back up remote state, replace it with the local tree and unlock.
pub struct CommitCommand;

#[async_trait]
impl Command for CommitCommand {
    fn name(&self) -> &'static str {
        "commit"
    }

    fn summary(&self) -> &'static str {
        "Upload local state, then unlock remote state"
    }

    fn usage(&self) -> &'static str {
        "Usage: terrarium [--concurrency] [--s3-bucket] [--s3-region] commit <directory>"
    }

    async fn run(&self, ctx: &CommandContext<'_>, args: &[String]) -> Result<()> {
        let dir = directory_arg(self, args)?;
        let services = ctx.services()?;
        let settings = &services.settings;

        let orchestrator = CommitOrchestrator::new(
            services.store.clone(),
            services.clock.clone(),
            settings.concurrency,
        );
        let report = match orchestrator.commit(&dir, &settings.local_root).await {
            Ok(report) => report,
            Err(e) => {
                if matches!(e.step, CommitStep::Upload | CommitStep::Release) {
                    warn!(
                        dir = dir.name(),
                        "previous state is backed up; re-run commit to finish"
                    );
                }
                return Err(CommandError::Commit(e));
            }
        };

        ctx.emit(format!(
            "Committed {} files ({} bytes); {} previous files backed up to {}",
            report.uploaded,
            report.uploaded_bytes,
            report.backed_up,
            dir.backup_prefix(report.snapshot_id)
        ));
        Ok(())
    }
}
