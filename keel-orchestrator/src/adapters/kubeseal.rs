//! Sealed Secrets adapter
//!
//! Seals with `kubeseal` against a certificate fetched from the target cluster
//! and publishes the resulting SealedSecret with `kubectl`. Plaintext only
//! ever travels over the child's stdin.

use std::io::Write;

use async_trait::async_trait;
use chrono::Utc;
use keel_core::digest::sha256_hex;
use keel_core::domain::secret::{BundleRef, SecretBundle, SecretPayload, TargetKey};
use keel_core::domain::stage::IdempotencyKey;
use tracing::info;

use super::command::{Invocation, classify};
use super::{AdapterError, AdapterResult, SecretSealer};

const KEY_ANNOTATION: &str = "keel.dev/idempotency-key";
const VERSION_ANNOTATION: &str = "keel.dev/bundle-version";

pub struct KubesealSealer {
    kubeseal: String,
    kubectl: String,
}

impl Default for KubesealSealer {
    fn default() -> Self {
        Self::new("kubeseal", "kubectl")
    }
}

impl KubesealSealer {
    pub fn new(kubeseal: impl Into<String>, kubectl: impl Into<String>) -> Self {
        Self {
            kubeseal: kubeseal.into(),
            kubectl: kubectl.into(),
        }
    }

    fn kubectl(&self, cluster: &str, namespace: &str) -> Invocation {
        Invocation::new(&self.kubectl)
            .arg(format!("--context={}", cluster))
            .arg(format!("--namespace={}", namespace))
    }

    /// Idempotency key recorded on the published SealedSecret, if any
    async fn published_key(&self, bundle: &SecretBundle) -> AdapterResult<Option<String>> {
        let output = self
            .kubectl(&bundle.cluster, &bundle.namespace)
            .args(["get", "sealedsecret", bundle.name.as_str()])
            .arg(format!(
                "-o=jsonpath={{.metadata.annotations.{}}}",
                KEY_ANNOTATION.replace('.', "\\.")
            ))
            .run()
            .await?;

        if output.success {
            let value = output.stdout.trim();
            return Ok((!value.is_empty()).then(|| value.to_string()));
        }
        if output.stderr.contains("NotFound") || output.stderr.contains("not found") {
            return Ok(None);
        }
        Err(classify("kubectl get sealedsecret", &output))
    }
}

/// Secret document fed to kubeseal
fn secret_document(payload: &SecretPayload, version: u32) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {
            "name": payload.name,
            "namespace": payload.namespace,
            "annotations": { VERSION_ANNOTATION: version.to_string() },
        },
        "type": "Opaque",
        "stringData": payload.data,
    })
}

#[async_trait]
impl SecretSealer for KubesealSealer {
    async fn fetch_public_key(&self, cluster: &str) -> AdapterResult<TargetKey> {
        let output = Invocation::new(&self.kubeseal)
            .arg(format!("--context={}", cluster))
            .arg("--fetch-cert")
            .run()
            .await
            .map_err(|e| AdapterError::KeyFetch(e.to_string()))?;

        if !output.success {
            return Err(AdapterError::KeyFetch(format!(
                "kubeseal --fetch-cert for {} failed: {}",
                cluster,
                output.stderr.trim()
            )));
        }

        let certificate = output.stdout.trim().to_string();
        if !certificate.contains("BEGIN CERTIFICATE") {
            return Err(AdapterError::KeyFetch(format!(
                "cluster {} returned no certificate",
                cluster
            )));
        }

        Ok(TargetKey {
            key_id: cluster.to_string(),
            fingerprint: sha256_hex(certificate.as_bytes()),
            certificate,
            fetched_at: Utc::now(),
            expires_at: None,
        })
    }

    async fn seal(
        &self,
        payload: &SecretPayload,
        version: u32,
        key: &TargetKey,
    ) -> AdapterResult<SecretBundle> {
        let mut cert = tempfile::NamedTempFile::new()
            .map_err(|e| AdapterError::Transient(format!("failed to create cert file: {}", e)))?;
        cert.write_all(key.certificate.as_bytes())
            .map_err(|e| AdapterError::Transient(format!("failed to write cert file: {}", e)))?;

        let document = serde_json::to_vec(&secret_document(payload, version))
            .map_err(|e| AdapterError::Rejected(format!("failed to encode secret: {}", e)))?;

        let output = Invocation::new(&self.kubeseal)
            .arg(format!("--cert={}", cert.path().display()))
            .arg("--format=yaml")
            .stdin(document)
            .quiet()
            .run_checked()
            .await?;

        Ok(SecretBundle {
            name: payload.name.clone(),
            namespace: payload.namespace.clone(),
            cluster: key.key_id.clone(),
            version,
            ciphertext: output.stdout,
            key_fingerprint: key.fingerprint.clone(),
            created_at: Utc::now(),
        })
    }

    async fn publish(&self, bundle: &SecretBundle, key: &IdempotencyKey) -> AdapterResult<()> {
        let key_value = key.to_string();
        if self.published_key(bundle).await?.as_deref() == Some(key_value.as_str()) {
            info!("Bundle {} already published under {}", bundle.reference(), key);
            return Ok(());
        }

        self.kubectl(&bundle.cluster, &bundle.namespace)
            .args(["apply", "-f", "-"])
            .stdin(bundle.ciphertext.clone())
            .quiet()
            .run_checked()
            .await?;

        self.kubectl(&bundle.cluster, &bundle.namespace)
            .args(["annotate", "sealedsecret", bundle.name.as_str(), "--overwrite"])
            .arg(format!("{}={}", KEY_ANNOTATION, key_value))
            .run_checked()
            .await?;

        info!("Published bundle {}", bundle.reference());
        Ok(())
    }

    async fn withdraw(
        &self,
        cluster: &str,
        bundle: &BundleRef,
        key: &IdempotencyKey,
    ) -> AdapterResult<()> {
        self.kubectl(cluster, &bundle.namespace)
            .args([
                "delete",
                "sealedsecret",
                bundle.name.as_str(),
                "--ignore-not-found",
            ])
            .run_checked()
            .await?;

        info!("Withdrew bundle {} ({})", bundle, key);
        Ok(())
    }
}
