//! ID resolver module
//!
//! Resolves Run ID prefixes to full UUIDs by querying the run list, so users
//! can type short, unambiguous prefixes instead of full UUIDs.

use anyhow::{Context, Result, anyhow};
use keel_client::OrchestratorClient;
use uuid::Uuid;

use crate::types::IdOrPrefix;

/// How many recent Runs are searched for a prefix
const RESOLVE_WINDOW: usize = 500;

/// Resolve a Run ID or prefix to a full UUID
///
/// A full UUID is returned as-is. Otherwise the most recent Runs are fetched
/// and exactly one of them must start with the prefix.
pub async fn resolve_run_id(client: &OrchestratorClient, id_or_prefix: &IdOrPrefix) -> Result<Uuid> {
    if let Some(uuid) = id_or_prefix.as_uuid() {
        return Ok(uuid);
    }

    let runs = client
        .list_runs(None, Some(RESOLVE_WINDOW))
        .await
        .context("Failed to fetch runs for ID resolution")?;

    match_prefix(runs.iter().map(|r| r.id), &id_or_prefix.as_str())
}

fn match_prefix(ids: impl Iterator<Item = Uuid>, prefix: &str) -> Result<Uuid> {
    let prefix = prefix.to_lowercase();
    let matches: Vec<Uuid> = ids
        .filter(|id| id.to_string().starts_with(&prefix))
        .collect();

    match matches.as_slice() {
        [] => Err(anyhow!("No run found with ID starting with '{}'", prefix)),
        [id] => Ok(*id),
        _ => {
            let ids: Vec<String> = matches.iter().map(Uuid::to_string).collect();
            Err(anyhow!(
                "Ambiguous prefix '{}' matches multiple runs: {}",
                prefix,
                ids.join(", ")
            ))
        }
    }
}
