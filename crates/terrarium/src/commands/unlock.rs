use async_trait::async_trait;
use terrarium_core::LockManager;

use super::{directory_arg, Command, CommandContext};
use crate::error::Result;

/// Force-delete the lock record.
pub struct UnlockCommand;

#[async_trait]
impl Command for UnlockCommand {
    fn name(&self) -> &'static str {
        "unlock"
    }

    fn summary(&self) -> &'static str {
        "Force unlock remote state"
    }

    fn usage(&self) -> &'static str {
        "Usage: terrarium [--s3-bucket] [--s3-region] unlock <directory>"
    }

    async fn run(&self, ctx: &CommandContext<'_>, args: &[String]) -> Result<()> {
        let dir = directory_arg(self, args)?;
        let services = ctx.services()?;
        LockManager::new(services.store.clone(), services.clock.clone())
            .release(&dir)
            .await?;
        ctx.emit(format!("Unlocked {}", dir.name()));
        Ok(())
    }
}
