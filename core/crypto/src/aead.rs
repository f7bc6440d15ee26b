//! Authenticated encryption using XChaCha20-Poly1305.
//!
//! XChaCha20-Poly1305 provides both confidentiality and authenticity,
//! with a 24-byte nonce that is safe for random generation.

use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, AeadCore, KeyInit, OsRng, Payload},
    XChaCha20Poly1305,
};

use crate::keys::KEY_LENGTH;
use keylock_common::{Error, Result};

/// Nonce size for XChaCha20-Poly1305 (24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Authentication tag size (16 bytes).
pub const TAG_SIZE: usize = 16;

/// Raw nonce bytes.
pub type Nonce = [u8; NONCE_SIZE];

fn cipher(key: &[u8]) -> Result<XChaCha20Poly1305> {
    if key.len() != KEY_LENGTH {
        return Err(Error::Crypto(format!(
            "Invalid key length: expected {}, got {}",
            KEY_LENGTH,
            key.len()
        )));
    }
    Ok(XChaCha20Poly1305::new(GenericArray::from_slice(key)))
}

/// Encrypt plaintext using XChaCha20-Poly1305.
///
/// # Postconditions
/// - Returns `(ciphertext || tag, nonce)`
/// - The nonce is freshly random for every call
///
/// # Errors
/// - Returns `Crypto` if key length is incorrect
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<(Vec<u8>, Nonce)> {
    encrypt_with_aad(key, plaintext, &[])
}

/// Encrypt plaintext and bind `aad` into the authentication tag.
///
/// The same `aad` must be supplied to [`decrypt_with_aad`].
pub fn encrypt_with_aad(key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<(Vec<u8>, Nonce)> {
    let cipher = cipher(key)?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    nonce_bytes.copy_from_slice(&nonce);
    Ok((ciphertext, nonce_bytes))
}

/// Decrypt ciphertext using XChaCha20-Poly1305.
///
/// # Errors
/// - Returns `Crypto` if key length is incorrect
/// - Returns `AuthFailure` if the ciphertext is too short or the tag does
///   not verify (wrong key or tampered data)
pub fn decrypt(key: &[u8], ciphertext: &[u8], nonce: &Nonce) -> Result<Vec<u8>> {
    decrypt_with_aad(key, ciphertext, nonce, &[])
}

/// Decrypt ciphertext that was sealed with associated data.
pub fn decrypt_with_aad(key: &[u8], ciphertext: &[u8], nonce: &Nonce, aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher(key)?;

    if ciphertext.len() < TAG_SIZE {
        return Err(Error::AuthFailure);
    }

    cipher
        .decrypt(GenericArray::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| Error::AuthFailure)
}
