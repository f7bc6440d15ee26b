//! Cryptographic primitives for Keylock.
//!
//! This module provides:
//! - Key derivation using Argon2id
//! - Authenticated encryption using XChaCha20-Poly1305
//! - Key types with automatic zeroization
//! - Constant-time comparison of secrets
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Authentication failures surface as `Error::AuthFailure`, never as a
//!   generic error

pub mod aead;
pub mod compare;
pub mod kdf;
pub mod keys;

pub use aead::{decrypt, decrypt_with_aad, encrypt, encrypt_with_aad, Nonce, NONCE_SIZE, TAG_SIZE};
pub use compare::{constant_time_eq, secret_digest};
pub use kdf::{derive_key, KdfParams, MAX_PARALLELISM, MAX_TIME_COST};
pub use keys::{MasterKey, Salt, KEY_LENGTH, SALT_LENGTH};
