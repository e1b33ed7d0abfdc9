//! Command registry and the handlers it dispatches to.
//!
//! Each command implements [`Command`]. The registry is built once in
//! `main` and is the closed, enumerable set the help command reports on.

mod commit;
mod download;
mod help;
mod lock;
mod status;
mod unlock;
mod version;

use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use clap::CommandFactory;
use terrarium_core::{Clock, ObjectStore, StateDirectory};

use crate::config::{Config, Settings};
use crate::error::{CommandError, Result};

pub use commit::CommitCommand;
pub use download::DownloadCommand;
pub use help::HelpCommand;
pub use lock::LockCommand;
pub use status::StatusCommand;
pub use unlock::UnlockCommand;
pub use version::VersionCommand;

/// A named command with usage text and a handler.
#[async_trait]
pub trait Command: Send + Sync {
    fn name(&self) -> &'static str;

    /// One line for the command list.
    fn summary(&self) -> &'static str;

    /// Full usage line, printed by `help <command>` and on bad arguments.
    fn usage(&self) -> &'static str;

    /// Commands that return `false` run without validated settings.
    fn uses_storage(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &CommandContext<'_>, args: &[String]) -> Result<()>;
}

/// Store, clock and settings shared by storage commands.
pub struct Services {
    pub store: Arc<dyn ObjectStore>,
    pub clock: Arc<dyn Clock>,
    pub settings: Settings,
}

/// What a command sees while it runs.
pub struct CommandContext<'a> {
    pub registry: &'a CommandRegistry,
    services: Option<Services>,
    captured: Option<Mutex<Vec<String>>>,
}

impl<'a> CommandContext<'a> {
    pub fn new(registry: &'a CommandRegistry, services: Option<Services>) -> Self {
        Self {
            registry,
            services,
            captured: None,
        }
    }

    /// A context that records output lines instead of printing them.
    #[cfg(test)]
    pub fn capturing(registry: &'a CommandRegistry, services: Option<Services>) -> Self {
        Self {
            registry,
            services,
            captured: Some(Mutex::new(Vec::new())),
        }
    }

    pub fn services(&self) -> Result<&Services> {
        self.services
            .as_ref()
            .ok_or_else(|| CommandError::Internal("storage services not initialized".to_string()))
    }

    /// Print a line of command output to stdout.
    pub fn emit(&self, line: impl Display) {
        match &self.captured {
            Some(lines) => lines
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(line.to_string()),
            None => println!("{}", line),
        }
    }

    #[cfg(test)]
    pub fn output(&self) -> Vec<String> {
        self.captured
            .as_ref()
            .map(|lines| {
                lines
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .clone()
            })
            .unwrap_or_default()
    }
}

/// Name-to-handler map built at process start.
pub struct CommandRegistry {
    commands: BTreeMap<&'static str, Box<dyn Command>>,
}

impl CommandRegistry {
    pub fn empty() -> Self {
        Self {
            commands: BTreeMap::new(),
        }
    }

    /// Every command terrarium ships.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(CommitCommand);
        registry.register(DownloadCommand);
        registry.register(HelpCommand);
        registry.register(LockCommand);
        registry.register(StatusCommand);
        registry.register(UnlockCommand);
        registry.register(VersionCommand);
        registry
    }

    pub fn register(&mut self, command: impl Command + 'static) {
        self.commands.insert(command.name(), Box::new(command));
    }

    pub fn get(&self, name: &str) -> Option<&dyn Command> {
        self.commands.get(name).map(|c| c.as_ref())
    }

    /// Commands in name order.
    pub fn iter(&self) -> impl Iterator<Item = &dyn Command> {
        self.commands.values().map(|c| c.as_ref())
    }

    /// Flag help followed by the command list.
    pub fn global_usage(&self) -> String {
        let mut usage = Config::command().render_help().to_string();
        usage.push_str("\nCommands:\n");
        for command in self.iter() {
            usage.push_str(&format!("  {:<15} {}\n", command.name(), command.summary()));
        }
        usage
    }
}

/// Parse the single `<directory>` argument of a command.
pub(crate) fn directory_arg(command: &dyn Command, args: &[String]) -> Result<StateDirectory> {
    let [dir] = args else {
        return Err(CommandError::Usage(format!(
            "Expected one positional argument for '{}' command: <directory>\n{}",
            command.name(),
            command.usage()
        )));
    };
    StateDirectory::new(dir).map_err(|e| CommandError::Usage(e.to_string()))
}
