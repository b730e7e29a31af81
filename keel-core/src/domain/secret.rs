//! Secret domain types
//!
//! Plaintext only ever lives in [`SecretPayload`], which refuses to print its
//! values. Everything that is persisted or sent over the wire is sealed.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Public key of a target cluster's sealing controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetKey {
    /// Identifier the key was fetched by (e.g. `kube-system/sealed-secrets`)
    pub key_id: String,
    /// SHA-256 fingerprint of the certificate
    pub fingerprint: String,
    /// PEM encoded certificate
    pub certificate: String,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TargetKey {
    /// A key is stale when it has expired or was fetched longer ago than `max_age`
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        if let Some(expires_at) = self.expires_at {
            if expires_at <= now {
                return true;
            }
        }
        now - self.fetched_at > max_age
    }
}

/// Plaintext secret data awaiting sealing
#[derive(Clone, PartialEq, Eq)]
pub struct SecretPayload {
    pub name: String,
    pub namespace: String,
    pub data: BTreeMap<String, String>,
}

impl std::fmt::Debug for SecretPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretPayload")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Reference to one exact bundle version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BundleRef {
    pub name: String,
    pub namespace: String,
    pub version: u32,
}

impl std::fmt::Display for BundleRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@v{}", self.namespace, self.name, self.version)
    }
}

/// A named, versioned, sealed payload
///
/// Immutable once created: a change produces a new version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretBundle {
    pub name: String,
    pub namespace: String,
    /// Cluster context whose key sealed the payload
    pub cluster: String,
    pub version: u32,
    /// Opaque sealed document produced by the sealer
    pub ciphertext: String,
    /// Fingerprint of the key the payload was sealed against
    pub key_fingerprint: String,
    pub created_at: DateTime<Utc>,
}

impl SecretBundle {
    pub fn reference(&self) -> BundleRef {
        BundleRef {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            version: self.version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(fetched_at: DateTime<Utc>, expires_at: Option<DateTime<Utc>>) -> TargetKey {
        TargetKey {
            key_id: "kube-system/sealed-secrets".to_string(),
            fingerprint: "ff".to_string(),
            certificate: "-----BEGIN CERTIFICATE-----".to_string(),
            fetched_at,
            expires_at,
        }
    }

    #[test]
    fn test_fresh_key_is_not_stale() {
        let now = Utc::now();
        assert!(!key(now, None).is_stale(now, Duration::minutes(5)));
    }

    #[test]
    fn test_old_key_is_stale() {
        let now = Utc::now();
        let fetched = now - Duration::minutes(10);
        assert!(key(fetched, None).is_stale(now, Duration::minutes(5)));
    }

    #[test]
    fn test_expired_key_is_stale() {
        let now = Utc::now();
        let expired = now - Duration::seconds(1);
        assert!(key(now, Some(expired)).is_stale(now, Duration::minutes(5)));
    }

    #[test]
    fn test_payload_debug_hides_values() {
        let mut data = BTreeMap::new();
        data.insert("DB_PASSWORD".to_string(), "hunter2".to_string());
        let payload = SecretPayload {
            name: "db".to_string(),
            namespace: "shop".to_string(),
            data,
        };
        let printed = format!("{:?}", payload);
        assert!(printed.contains("DB_PASSWORD"));
        assert!(!printed.contains("hunter2"));
    }
}
