//! Content fingerprints.
//!
//! A fingerprint is the lowercase hex SHA-256 digest of a record's text. It is
//! the deduplication key and the primary key of every table the pipeline
//! writes, so two comments with identical bodies are the same logical record
//! no matter what id the source assigned them.

use sha2::{Digest, Sha256};

/// Length of a fingerprint in hex characters.
pub const FINGERPRINT_LEN: usize = 64;

/// Compute the fingerprint of `text`.
pub fn fingerprint(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Fingerprint of a parent post: title followed directly by its body.
pub fn parent_fingerprint(title: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(body.as_bytes());
    hex::encode(hasher.finalize())
}
