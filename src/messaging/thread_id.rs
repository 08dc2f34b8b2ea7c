//! Deterministic thread-identity derivation.

use sha2::{Digest, Sha256};

/// Derive the canonical thread id for an unordered pair of user ids.
///
/// Symmetric: `derive_thread_id(a, b) == derive_thread_id(b, a)`. The pair
/// is ordered before hashing, and the first id is length-prefixed so that
/// e.g. `("ab", "c")` and `("a", "bc")` cannot collide.
pub fn derive_thread_id(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };

    let mut hasher = Sha256::new();
    hasher.update((lo.len() as u64).to_be_bytes());
    hasher.update(lo.as_bytes());
    hasher.update(hi.as_bytes());
    hex::encode(hasher.finalize())
}
