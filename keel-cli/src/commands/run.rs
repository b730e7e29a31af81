//! Run command handlers
//!
//! Submitting, listing, inspecting, cancelling and watching deployment Runs.

use std::time::Duration;

use anyhow::{Result, bail};
use clap::Subcommand;
use colored::*;
use keel_client::OrchestratorClient;
use keel_core::domain::run::{Run, RunStatus};
use keel_core::domain::stage::{StageOutcome, StageRecord};
use keel_core::domain::trigger::{EventType, TriggerEvent};
use keel_core::dto::run::{CancelOutcome, RunSummary, SubmitRun};

use crate::config::Config;
use crate::id_resolver::resolve_run_id;
use crate::types::IdOrPrefix;

/// Run subcommands
#[derive(Subcommand)]
pub enum RunCommands {
    /// Submit a push/merge event and start its run
    Submit {
        /// Repository the commit belongs to (e.g. acme/shop)
        #[arg(long)]
        repository: String,

        /// Commit SHA to deploy
        #[arg(long)]
        sha: String,

        /// Branch the commit was pushed or merged to
        #[arg(long)]
        branch: String,

        /// Who triggered the deployment
        #[arg(long, env = "USER")]
        actor: String,

        /// Event type: push or merge
        #[arg(long, default_value = "push")]
        event: String,

        /// Target environment; resolved from the branch when omitted
        #[arg(long)]
        environment: Option<String>,

        /// Delivery id used to deduplicate resubmissions
        #[arg(long)]
        delivery: Option<String>,

        /// Keep polling until the run finishes
        #[arg(short, long)]
        watch: bool,
    },
    /// List recent runs
    List {
        /// Only runs targeting this environment
        #[arg(long)]
        environment: Option<String>,

        /// Maximum number of runs to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show a run and its stage history
    Status {
        /// Run ID or unambiguous prefix
        id: String,

        /// Print the full run record as JSON
        #[arg(long)]
        json: bool,
    },
    /// Cancel a run; it stops at the next checkpoint and rolls back
    Cancel {
        /// Run ID or unambiguous prefix
        id: String,
    },
    /// Follow a run until it reaches a terminal state
    Watch {
        /// Run ID or unambiguous prefix
        id: String,

        /// Poll interval in milliseconds
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
}

pub async fn handle_run_command(command: RunCommands, config: &Config) -> Result<()> {
    let client = config.client();

    match command {
        RunCommands::Submit {
            repository,
            sha,
            branch,
            actor,
            event,
            environment,
            delivery,
            watch,
        } => {
            let req = SubmitRun {
                trigger: TriggerEvent {
                    repository,
                    commit_sha: sha,
                    branch,
                    actor,
                    event_type: EventType::parse(&event),
                    delivery_id: delivery,
                },
                environment,
            };
            submit_run(&client, req, watch).await
        }
        RunCommands::List { environment, limit } => {
            list_runs(&client, environment.as_deref(), limit).await
        }
        RunCommands::Status { id, json } => show_run(&client, &id, json).await,
        RunCommands::Cancel { id } => cancel_run(&client, &id).await,
        RunCommands::Watch { id, interval_ms } => {
            let run_id = resolve_run_id(&client, &IdOrPrefix::parse(&id)).await?;
            watch_run(&client, run_id, Duration::from_millis(interval_ms)).await
        }
    }
}

async fn submit_run(client: &OrchestratorClient, req: SubmitRun, watch: bool) -> Result<()> {
    let response = client.submit_run(&req).await?;

    if response.created {
        println!("{} Run {} created", "✓".green(), response.run_id.to_string().cyan());
    } else {
        println!(
            "{} Trigger already submitted as run {}",
            "•".yellow(),
            response.run_id.to_string().cyan()
        );
    }

    if watch {
        watch_run(client, response.run_id, Duration::from_secs(1)).await?;
    }
    Ok(())
}

async fn list_runs(client: &OrchestratorClient, environment: Option<&str>, limit: usize) -> Result<()> {
    let runs = client.list_runs(environment, Some(limit)).await?;

    if runs.is_empty() {
        println!("{}", "No runs found.".yellow());
        return Ok(());
    }

    println!("{}", format!("Found {} run(s):", runs.len()).bold());
    println!();
    for run in &runs {
        print_run_summary(run);
    }
    Ok(())
}

async fn show_run(client: &OrchestratorClient, id: &str, json: bool) -> Result<()> {
    let run_id = resolve_run_id(client, &IdOrPrefix::parse(id)).await?;
    let run = client.get_run(run_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(());
    }

    print_run_details(&run);
    println!("\n{}", "History:".bold());
    for record in &run.records {
        print_record(record);
    }
    Ok(())
}

async fn cancel_run(client: &OrchestratorClient, id: &str) -> Result<()> {
    let run_id = resolve_run_id(client, &IdOrPrefix::parse(id)).await?;
    let response = client.cancel_run(run_id).await?;

    match response.outcome {
        CancelOutcome::Accepted => println!(
            "{} Cancellation of {} requested; the run will roll back",
            "✓".green(),
            run_id.to_string().cyan()
        ),
        CancelOutcome::AlreadyTerminal => println!(
            "{} Run {} already finished ({})",
            "•".yellow(),
            run_id.to_string().cyan(),
            colorize_status(response.status)
        ),
    }
    Ok(())
}

/// Poll a Run, printing each new history record, until it is terminal
async fn watch_run(client: &OrchestratorClient, run_id: uuid::Uuid, interval: Duration) -> Result<()> {
    let mut printed = 0;

    loop {
        let run = client.get_run(run_id).await?;
        for record in run.records.iter().skip(printed) {
            print_record(record);
        }
        printed = printed.max(run.records.len());

        if run.status.is_terminal() {
            println!();
            print_run_details(&run);
            if run.status == RunStatus::Failed {
                bail!("Run {} failed", run_id);
            }
            return Ok(());
        }

        tokio::time::sleep(interval).await;
    }
}

fn print_run_summary(run: &RunSummary) {
    println!("  {} Run {}", "▸".cyan(), run.id.to_string().dimmed());
    println!("    Environment: {}", run.environment);
    println!(
        "    Commit:      {}@{} ({})",
        run.repository,
        short_sha(&run.commit_sha),
        run.branch
    );
    println!("    Status:      {} [{}]", colorize_status(run.status), run.phase);
    println!(
        "    Created:     {}",
        run.created_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    if let Some(error) = &run.error {
        println!("    Error:       {}", error.red());
    }
    println!();
}

fn print_run_details(run: &Run) {
    println!("{}", "Run Details:".bold());
    println!("  ID:          {}", run.id.to_string().cyan());
    println!("  Environment: {}", run.environment);
    println!(
        "  Trigger:     {} of {}@{} on {} by {}",
        run.trigger.event_type,
        run.trigger.repository,
        short_sha(&run.trigger.commit_sha),
        run.trigger.branch,
        run.trigger.actor
    );
    println!("  Phase:       {}", run.phase);
    println!("  Status:      {}", colorize_status(run.status));
    println!(
        "  Created:     {}",
        run.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    println!(
        "  Updated:     {}",
        run.updated_at.format("%Y-%m-%d %H:%M:%S")
    );
    if run.cancel_requested {
        println!("  Cancel:      {}", "requested".yellow());
    }
    if let Some(error) = &run.error {
        println!("  Error:       {}", error.red());
    }
    if run.manual_intervention_required {
        println!(
            "  {}",
            "Rollback did not complete; manual intervention required"
                .red()
                .bold()
        );
    }
}

fn print_record(record: &StageRecord) {
    let stage = match record.inverse_of {
        Some(target) => format!("{} ({})", record.stage, target),
        None => record.stage.to_string(),
    };
    let outcome = match record.outcome {
        StageOutcome::Started => "started".cyan(),
        StageOutcome::Succeeded => "succeeded".green(),
        StageOutcome::Failed => "failed".red(),
        StageOutcome::CancelRequested => "cancel requested".yellow(),
    };
    let at = record.finished_at.unwrap_or(record.started_at);

    print!(
        "  {} {:<32} #{} {}",
        at.format("%H:%M:%S").to_string().dimmed(),
        stage,
        record.attempt,
        outcome
    );
    match &record.error {
        Some(error) => println!(" {}", error.to_string().red()),
        None => println!(),
    }
}

fn colorize_status(status: RunStatus) -> ColoredString {
    let status_str = status.to_string();
    match status {
        RunStatus::Pending => status_str.yellow(),
        RunStatus::Running => status_str.cyan(),
        RunStatus::Succeeded => status_str.green(),
        RunStatus::Failed => status_str.red(),
        RunStatus::RolledBack => status_str.dimmed(),
    }
}

fn short_sha(sha: &str) -> &str {
    sha.get(..7).unwrap_or(sha)
}
