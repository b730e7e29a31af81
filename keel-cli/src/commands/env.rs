//! Environment command handlers

use anyhow::Result;
use chrono::Utc;
use clap::Subcommand;
use colored::*;
use keel_core::domain::lease::Lease;

use crate::config::Config;

/// Environment subcommands
#[derive(Subcommand)]
pub enum EnvCommands {
    /// Show the lease holder and unfinished runs of an environment
    Status {
        /// Environment name
        name: String,
    },
    /// Show who currently holds the environment lease
    Lease {
        /// Environment name
        name: String,
    },
}

pub async fn handle_env_command(command: EnvCommands, config: &Config) -> Result<()> {
    let client = config.client();

    match command {
        EnvCommands::Status { name } => {
            let status = client.get_environment(&name).await?;
            println!("{}", format!("Environment {}:", status.environment).bold());
            print_lease(status.lease.as_ref());
            if status.in_flight.is_empty() {
                println!("  In flight: {}", "none".dimmed());
            } else {
                println!("  In flight:");
                for run_id in status.in_flight {
                    println!("    {} {}", "▸".cyan(), run_id);
                }
            }
            Ok(())
        }
        EnvCommands::Lease { name } => {
            let lease = client.get_lease(&name).await?;
            println!("{}", format!("Environment {}:", name).bold());
            print_lease(lease.as_ref());
            Ok(())
        }
    }
}

fn print_lease(lease: Option<&Lease>) {
    let Some(lease) = lease else {
        println!("  Lease:     {}", "free".green());
        return;
    };

    let now = Utc::now();
    if lease.is_expired(now) {
        println!(
            "  Lease:     {} (held by {}, lapsed)",
            "expired".yellow(),
            lease.holder.to_string().dimmed()
        );
        return;
    }

    println!("  Lease:     held by {}", lease.holder.to_string().cyan());
    println!(
        "  Acquired:  {}",
        lease.acquired_at.format("%Y-%m-%d %H:%M:%S")
    );
    println!(
        "  Expires:   {} (in {}s)",
        lease.expires_at.format("%Y-%m-%d %H:%M:%S"),
        (lease.expires_at - now).num_seconds()
    );
}
