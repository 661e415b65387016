//! Cache keying of credential checks.

use sha2::{Digest, Sha224};

/// Compute SHA224 hash and return as lowercase hex string.
#[inline]
pub fn sha224_hex(input: &str) -> String {
    let mut hasher = Sha224::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Stable key of a `(stored hash, candidate password)` pair.
///
/// Folding the stored hash in means a password change yields new keys even
/// before the old entries are invalidated. The key is only ever used to
/// look up cached verdicts.
#[inline]
pub fn credential_key(password: &str, stored_hash: &str) -> String {
    let mut hasher = Sha224::new();
    hasher.update(password.as_bytes());
    hasher.update(stored_hash.as_bytes());
    hex::encode(hasher.finalize())
}
