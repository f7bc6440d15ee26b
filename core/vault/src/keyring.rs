//! Keyring header for the vault master key.
//!
//! The master key is derived from the operator password and never stored.
//! The keyring keeps what is needed to derive it again after a restart and
//! to check that the password still matches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use keylock_common::{Error, Result};
use keylock_crypto::{
    constant_time_eq, decrypt, derive_key, encrypt, KdfParams, MasterKey, Nonce, Salt,
};

/// Known plaintext sealed under the key-check subkey.
const KEY_CHECK_PLAINTEXT: &[u8] = b"KEYLOCK_KEY_VERIFICATION_V1";

/// Context for the subkey that seals the key-check blob.
const KEY_CHECK_CONTEXT: &[u8] = b"key-check";

/// Parameters and verification data for the vault master key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Keyring {
    /// Salt for master key derivation.
    pub salt: Salt,
    /// KDF parameters.
    pub kdf_params: KdfParams,
    /// Encrypted known plaintext used to verify the password.
    #[serde(with = "keylock_common::encoding")]
    pub key_check: Vec<u8>,
    /// Nonce for `key_check`.
    #[serde(with = "keylock_common::encoding::array")]
    pub key_check_nonce: Nonce,
    /// When the keyring was first created.
    pub created_at: DateTime<Utc>,
}

impl Keyring {
    /// Create a fresh keyring for `password`.
    ///
    /// # Postconditions
    /// - Salt is randomly generated
    /// - Returns the derived master key alongside the keyring
    ///
    /// # Errors
    /// - Password empty
    /// - KDF failure
    pub fn create(password: &[u8], kdf_params: KdfParams) -> Result<(Self, MasterKey)> {
        let salt = Salt::generate();
        let master_key = derive_key(password, &salt, &kdf_params)?;

        let check_key = master_key.derive_subkey(KEY_CHECK_CONTEXT);
        let (key_check, key_check_nonce) = encrypt(check_key.as_bytes(), KEY_CHECK_PLAINTEXT)?;

        let keyring = Self {
            salt,
            kdf_params,
            key_check,
            key_check_nonce,
            created_at: Utc::now(),
        };
        Ok((keyring, master_key))
    }

    /// Derive the master key for `password` and verify it.
    ///
    /// # Errors
    /// - `AuthFailure` if the password does not match this keyring
    pub fn unlock(&self, password: &[u8]) -> Result<MasterKey> {
        let master_key = derive_key(password, &self.salt, &self.kdf_params)?;
        let check_key = master_key.derive_subkey(KEY_CHECK_CONTEXT);

        match decrypt(check_key.as_bytes(), &self.key_check, &self.key_check_nonce) {
            Ok(plaintext) if constant_time_eq(&plaintext, KEY_CHECK_PLAINTEXT) => Ok(master_key),
            Ok(_) | Err(Error::AuthFailure) => {
                warn!("Vault password does not match keyring");
                Err(Error::AuthFailure)
            }
            Err(e) => Err(e),
        }
    }
}
