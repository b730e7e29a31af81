//! Content hashing
//!
//! SHA-256 helpers for content hashes (desired state, manifests, secrets)
//! and trigger deduplication keys.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of a byte slice
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Hash a sequence of named parts
///
/// Each part is length-prefixed so that `("ab", "c")` and `("a", "bc")`
/// never collide. Callers are responsible for passing parts in a stable order.
pub fn hash_parts<'a, I>(parts: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut hasher = Sha256::new();
    for (name, content) in parts {
        hasher.update((name.len() as u64).to_be_bytes());
        hasher.update(name.as_bytes());
        hasher.update((content.len() as u64).to_be_bytes());
        hasher.update(content);
    }
    format!("{:x}", hasher.finalize())
}
