//! Namespace-to-identifier encoding.
//!
//! Pools map logical namespaces onto storage identifiers (table-name
//! fragments, directory names). The encoding must be deterministic,
//! collision-free and safe for both uses.

use sha2::{Digest, Sha256};

const SEPARATOR: char = '_';
const HASH_SUFFIX_BYTES: usize = 4;

/// Derives a storage-safe identifier fragment from a namespace.
///
/// Alphanumerics are lowercased, separator-like characters collapse to
/// `_`. Any other character is dropped; when that happens a short
/// content hash of the full namespace is appended so distinct
/// namespaces stay distinct.
pub fn encode_namespace(namespace: &str) -> String {
    let mut encoded = String::with_capacity(namespace.len());
    let mut lossy = false;

    for ch in namespace.chars() {
        if ch.is_ascii_alphanumeric() {
            encoded.push(ch.to_ascii_lowercase());
        } else if matches!(ch, '\\' | '/' | ':' | '.' | '-' | ' ' | '_') {
            encoded.push(SEPARATOR);
        } else {
            lossy = true;
        }
    }

    if lossy {
        let digest = Sha256::digest(namespace.as_bytes());
        encoded.push(SEPARATOR);
        encoded.push_str(&hex::encode(&digest[..HASH_SUFFIX_BYTES]));
    }

    encoded
}
