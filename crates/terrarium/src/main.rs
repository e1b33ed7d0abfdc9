mod commands;
mod config;
mod error;
mod storage;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use terrarium_core::{Clock, ObjectStore, SystemClock};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use commands::{CommandContext, CommandRegistry, Services};
use config::Config;
use error::{CommandError, EXIT_FAILURE, EXIT_SUCCESS};
use storage::S3Store;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Logs go to stderr; stdout carries command output only.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))?;

    let config = Config::parse();
    let registry = CommandRegistry::standard();

    let code = match dispatch(&config, &registry).await {
        Ok(()) => EXIT_SUCCESS,
        Err(CommandError::NoCommand) => {
            print!("{}", registry.global_usage());
            EXIT_FAILURE
        }
        Err(e @ CommandError::UnknownCommand(_)) => {
            eprintln!("Error: {}", e);
            eprint!("{}", registry.global_usage());
            e.exit_code()
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };
    Ok(ExitCode::from(code))
}

async fn dispatch(config: &Config, registry: &CommandRegistry) -> error::Result<()> {
    let name = config.command.as_deref().ok_or(CommandError::NoCommand)?;
    let command = registry
        .get(name)
        .ok_or_else(|| CommandError::UnknownCommand(name.to_string()))?;

    let services = if command.uses_storage() {
        let settings = config.settings(|var| std::env::var(var).ok())?;
        debug!(?settings, "validated settings");
        info!(bucket = %settings.s3.bucket, region = %settings.s3.region, "using S3 backend");
        let store: Arc<dyn ObjectStore> = Arc::new(S3Store::connect(&settings.s3));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Some(Services {
            store,
            clock,
            settings,
        })
    } else {
        None
    };

    let ctx = CommandContext::new(registry, services);
    command.run(&ctx, &config.args).await
}
