//! Change detection over the inbox.
//!
//! The signature covers entry identity (relative path) and content only.
//! Modification times are ignored so a fresh checkout of the same tree never
//! produces a new packet.

use sha2::{Digest, Sha256};

use crate::core::types::{InboxEntry, InboxSignature};

/// Hex SHA-256 of a single entry's content.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compute the order-independent signature of a set of inbox entries.
pub fn signature(entries: &[InboxEntry]) -> InboxSignature {
    let mut lines: Vec<String> = entries
        .iter()
        .map(|entry| format!("{}\0{}\n", entry.path, content_hash(&entry.content)))
        .collect();
    lines.sort();

    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
    }
    InboxSignature::from_hex(hex::encode(hasher.finalize()))
}

/// True when `current` differs from the signature of the previous packet.
///
/// With no previous packet every inbox (including an empty one) is a change.
pub fn has_changed(previous: Option<&InboxSignature>, current: &InboxSignature) -> bool {
    previous != Some(current)
}
