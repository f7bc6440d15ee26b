//! Constant-time comparison of secrets.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use subtle::ConstantTimeEq;

/// Fixed-size digest of a secret, suitable for constant-time comparison.
pub fn secret_digest(secret: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(b"keylock-secret-compare");
    hasher.update(secret);
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

/// Compare two secrets without data-dependent timing.
///
/// Both sides are hashed to a fixed width first so that a length mismatch
/// does not short-circuit the comparison.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    secret_digest(a).ct_eq(&secret_digest(b)).into()
}
