//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod env;
mod run;

pub use env::EnvCommands;
pub use run::RunCommands;

use anyhow::Result;
use clap::Subcommand;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Deployment runs
    Run {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Environments and their leases
    Env {
        #[command(subcommand)]
        command: EnvCommands,
    },
}

/// Route a command to its handler module
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Run { command } => run::handle_run_command(command, config).await,
        Commands::Env { command } => env::handle_env_command(command, config).await,
    }
}
