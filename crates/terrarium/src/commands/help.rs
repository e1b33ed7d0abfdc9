use async_trait::async_trait;

use super::{Command, CommandContext};
use crate::error::{CommandError, Result};

/// Print usage for one command, or for all of them.
pub struct HelpCommand;

#[async_trait]
impl Command for HelpCommand {
    fn name(&self) -> &'static str {
        "help"
    }

    fn summary(&self) -> &'static str {
        "Prints helpful information about other commands"
    }

    fn usage(&self) -> &'static str {
        "Usage: terrarium help [command]"
    }

    fn uses_storage(&self) -> bool {
        false
    }

    async fn run(&self, ctx: &CommandContext<'_>, args: &[String]) -> Result<()> {
        match args {
            [] => {
                ctx.emit(ctx.registry.global_usage().trim_end());
                Ok(())
            }
            [name] => {
                let command = ctx
                    .registry
                    .get(name)
                    .ok_or_else(|| CommandError::UnknownCommand(name.clone()))?;
                ctx.emit(command.usage());
                Ok(())
            }
            _ => Err(CommandError::Usage(
                "Expected no more than one positional argument for 'help' command: <command>"
                    .to_string(),
            )),
        }
    }
}
