//! Capture fingerprints and idempotency keys.

use blake3::Hasher;

const SEP: u8 = 0x1f;

/// Hash a list of parts with a separator so `["ab","c"]` and `["a","bc"]`
/// cannot collide.
pub fn hash_parts(parts: &[&str]) -> String {
    let mut hasher = Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(&[SEP]);
    }
    hasher.finalize().to_hex().to_string()
}

/// Cheap fingerprint over the first 4 KiB of a capture, used for ingress
/// deduplication. Exact-once is not guaranteed here; the job lease is the
/// real enforcement.
pub fn capture_fingerprint(prefix: &[u8]) -> String {
    blake3::hash(prefix).to_hex().to_string()
}

/// Stable idempotency key for an ingestion event.
pub fn ingest_key(path: &str, size: u64, mtime_ms: i64) -> String {
    hash_parts(&[path, &size.to_string(), &mtime_ms.to_string()])
}
