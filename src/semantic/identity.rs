//! Embedding-space fingerprints.
//!
//! Every persisted corpus lives in a directory named after the fingerprint
//! of the embedder configuration that produced it, so two configurations
//! never read or overwrite each other's vectors.

use sha2::{Digest, Sha256};

/// Length of the fingerprint in hex characters
pub const FINGERPRINT_LEN: usize = 8;

/// Derive a short, stable identifier from the backend kind and model names.
pub fn fingerprint(backend_kind: &str, model_identifiers: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(backend_kind.as_bytes());
    for model in model_identifiers {
        // unit separator keeps ("ab", "c") and ("a", "bc") apart
        hasher.update([0x1f]);
        hasher.update(model.as_bytes());
    }
    let digest = hasher.finalize();

    digest
        .iter()
        .take(FINGERPRINT_LEN / 2)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}
