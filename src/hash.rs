//! Content fingerprints used for change detection
//!
//! SHA-256 over the raw bytes, rendered as 64 lowercase hex characters.
//! Only used to tell real edits from no-op touches; not a security boundary.

/// Hex-encode bytes as a lowercase string
fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// SHA-256 hash of `content`, returned as a lowercase hex string
pub fn content_hash(content: &[u8]) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, content);
    hex_lower(digest.as_ref())
}
