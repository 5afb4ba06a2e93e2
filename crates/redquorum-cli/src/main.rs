//! Entry point for the redquorum command line client.

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use redquorum_cli::commands::{self, EXIT_ERROR};
use redquorum_cli::config::{Cli, Settings};
use redquorum_cli::logging;
use redquorum_core::LockCoordinator;
use tracing::{debug, info};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("redquorum: {:#}", e);
            ExitCode::from(EXIT_ERROR)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    let settings = Settings::load(&cli)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;
    let _logging_guard = logging::init_logging(&settings.logging_config())?;
    debug!(
        stores = settings.stores.len(),
        retry_count = settings.retry_count,
        "configuration loaded"
    );

    let coordinator = LockCoordinator::new(settings.stores.clone(), settings.coordinator_config())
        .context("invalid store configuration")?;

    if settings.preload_scripts {
        let loaded = coordinator.preload_scripts().await;
        info!(loaded, stores = coordinator.store_count(), "lock scripts preloaded");
    }

    let mut stdout = std::io::stdout();
    commands::execute(&coordinator, cli.command, &mut stdout).await
}
