use async_trait::async_trait;

use super::{Command, CommandContext};
use crate::error::Result;

pub struct VersionCommand;

#[async_trait]
impl Command for VersionCommand {
    fn name(&self) -> &'static str {
        "version"
    }

    fn summary(&self) -> &'static str {
        "Prints the terrarium version"
    }

    fn usage(&self) -> &'static str {
        "Usage: terrarium version"
    }

    fn uses_storage(&self) -> bool {
        false
    }

    async fn run(&self, ctx: &CommandContext<'_>, _args: &[String]) -> Result<()> {
        ctx.emit(format!("terrarium {}", env!("CARGO_PKG_VERSION")));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandRegistry;

    #[tokio::test]
    async fn test_version_runs_without_storage() {
        let registry = CommandRegistry::standard();
        let ctx = CommandContext::capturing(&registry, None);
        VersionCommand.run(&ctx, &[]).await.unwrap();
        assert_eq!(ctx.output(), vec![format!("terrarium {}", env!("CARGO_PKG_VERSION"))]);
    }
}
