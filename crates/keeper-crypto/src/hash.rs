//! BLAKE3 content digests, used for backup integrity checks.

/// Compute the BLAKE3 hex digest of `data`.
pub fn content_hex(data: &[u8]) -> String {
    hex::encode(blake3::hash(data).as_bytes())
}
