//! Workspace documents
//!
//! Reads desired-state documents and workload manifests from the deployment
//! checkout and derives their content hashes. Resolves secret plaintext from
//! the process environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use keel_core::digest;
use keel_core::domain::deployment::{ManifestDocument, ManifestSet};
use keel_core::domain::infra::DesiredState;
use keel_core::domain::secret::SecretPayload;
use thiserror::Error;

use crate::config::Target;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} contains no documents")]
    Empty(PathBuf),

    #[error("{0} is not valid UTF-8")]
    NotUtf8(PathBuf),
}

/// Read every visible regular file of `path` (or `path` itself if it is a
/// file), sorted by name
///
/// The scan runs on the blocking pool.
pub async fn read_documents(path: &Path) -> Result<Vec<ManifestDocument>, WorkspaceError> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || scan_documents(&owned))
        .await
        .map_err(|e| WorkspaceError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::other(e),
        })?
}

fn scan_documents(path: &Path) -> Result<Vec<ManifestDocument>, WorkspaceError> {
    let io = |source| WorkspaceError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut files: Vec<PathBuf> = if path.is_file() {
        vec![path.to_path_buf()]
    } else {
        std::fs::read_dir(path)
            .map_err(io)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| !n.starts_with('.'))
            })
            .collect()
    };
    files.sort();

    if files.is_empty() {
        return Err(WorkspaceError::Empty(path.to_path_buf()));
    }

    files
        .into_iter()
        .map(|file| {
            let bytes = std::fs::read(&file).map_err(|source| WorkspaceError::Io {
                path: file.clone(),
                source,
            })?;
            let content =
                String::from_utf8(bytes).map_err(|_| WorkspaceError::NotUtf8(file.clone()))?;
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            Ok(ManifestDocument { name, content })
        })
        .collect()
}

/// Content hash over document names and contents
pub fn documents_hash(documents: &[ManifestDocument]) -> String {
    digest::hash_parts(
        documents
            .iter()
            .map(|d| (d.name.as_str(), d.content.as_bytes())),
    )
}

/// The deployment checkout the engine reads from
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub async fn desired_state(&self, target: &Target) -> Result<DesiredState, WorkspaceError> {
        let location = self.root.join(&target.infrastructure);
        let documents = read_documents(&location).await?;
        Ok(DesiredState {
            environment: target.name.clone(),
            location: location.to_string_lossy().into_owned(),
            content_hash: documents_hash(&documents),
        })
    }

    pub async fn manifests(&self, target: &Target) -> Result<ManifestSet, WorkspaceError> {
        let documents = read_documents(&self.root.join(&target.manifests)).await?;
        Ok(ManifestSet {
            environment: target.name.clone(),
            cluster: target.cluster_key.clone(),
            namespace: target.namespace.clone(),
            content_hash: documents_hash(&documents),
            documents,
        })
    }
}

/// Looks up the value of a named variable
pub type VariableLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Resolves the plaintext of a target's secrets
#[derive(Clone)]
pub struct SecretResolver {
    lookup: VariableLookup,
}

impl SecretResolver {
    /// Reads values from the orchestrator's environment variables
    pub fn from_env() -> Self {
        Self::new(Arc::new(|name| std::env::var(name).ok()))
    }

    pub fn new(lookup: VariableLookup) -> Self {
        Self { lookup }
    }

    /// Build one payload per configured secret
    ///
    /// Fails naming the first missing variable. Values never appear in errors.
    pub fn resolve(&self, target: &Target) -> Result<Vec<SecretPayload>, String> {
        target
            .secrets
            .iter()
            .map(|secret| {
                let mut data = BTreeMap::new();
                for (key, variable) in &secret.keys {
                    let value = (self.lookup)(variable).ok_or_else(|| {
                        format!(
                            "secret '{}' key '{}': environment variable {} is not set",
                            secret.name, key, variable
                        )
                    })?;
                    data.insert(key.clone(), value);
                }
                Ok(SecretPayload {
                    name: secret.name.clone(),
                    namespace: secret
                        .namespace
                        .clone()
                        .unwrap_or_else(|| target.namespace.clone()),
                    data,
                })
            })
            .collect()
    }
}
