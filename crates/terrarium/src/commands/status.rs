use async_trait::async_trait;
use terrarium_core::{LockManager, LockStatus};

use super::{directory_arg, Command, CommandContext};
use crate::error::Result;

/// Report the lock state without changing it.
pub struct StatusCommand;

#[async_trait]
impl Command for StatusCommand {
    fn name(&self) -> &'static str {
        "status"
    }

    fn summary(&self) -> &'static str {
        "Show whether remote state is locked"
    }

    fn usage(&self) -> &'static str {
        "Usage: terrarium [--s3-bucket] [--s3-region] status <directory>"
    }

    async fn run(&self, ctx: &CommandContext<'_>, args: &[String]) -> Result<()> {
        let dir = directory_arg(self, args)?;
        let services = ctx.services()?;
        let status = LockManager::new(services.store.clone(), services.clock.clone())
            .inspect(&dir)
            .await?;
        let line = match status {
            LockStatus::Unlocked => "Unlocked".to_string(),
            LockStatus::Expired { expiry } => format!("Unlocked (lock expired at {})", expiry),
            LockStatus::Held { expiry } => format!(
                "Locked until: {} ({}s remaining)",
                expiry,
                expiry - services.clock.now_epoch()
            ),
        };
        ctx.emit(line);
        Ok(())
    }
}
