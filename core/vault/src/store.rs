//! In-memory key store.
//!
//! Records are encrypted with a subkey of the vault master key before they
//! enter the map. The map lock is only ever held around the map operation
//! itself; encryption and decryption happen outside of it.

use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, error, info};
use zeroize::Zeroizing;

use crate::keyring::Keyring;
use crate::record::{KeyInfo, KeyRecord, Metadata, Snapshot, VaultState};
use keylock_common::{Error, KeyId, Result};
use keylock_crypto::{decrypt_with_aad, encrypt_with_aad, KdfParams, MasterKey};

/// Context for the subkey that seals key records.
const RECORD_KEY_CONTEXT: &[u8] = b"records";

/// The vault: a map of encrypted key records plus the key to open them.
pub struct KeyVault {
    /// Keyring header, written into every dump.
    keyring: Keyring,
    /// Record encryption key (zeroized on drop).
    record_key: MasterKey,
    /// Encrypted records.
    records: RwLock<HashMap<KeyId, KeyRecord>>,
}

impl KeyVault {
    /// Open the vault with the operator password.
    ///
    /// # Preconditions
    /// - `password` must not be empty
    ///
    /// # Postconditions
    /// - Without a snapshot, a new keyring is created with `kdf_params`
    /// - With a snapshot, the master key is re-derived from the snapshot's
    ///   keyring and all its records are loaded
    ///
    /// # Errors
    /// - `AuthFailure` if `password` does not match the snapshot's keyring
    /// - KDF failure
    pub fn open(password: &[u8], kdf_params: KdfParams, snapshot: Option<Snapshot>) -> Result<Self> {
        let (keyring, master_key, state) = match snapshot {
            Some(Snapshot { keyring, state }) => {
                let master_key = keyring.unlock(password)?;
                info!(records = state.len(), "Opening vault from snapshot");
                (keyring, master_key, state)
            }
            None => {
                let (keyring, master_key) = Keyring::create(password, kdf_params)?;
                info!("Opening new empty vault");
                (keyring, master_key, VaultState::new())
            }
        };

        Ok(Self {
            keyring,
            record_key: master_key.derive_subkey(RECORD_KEY_CONTEXT),
            records: RwLock::new(state.into_map()),
        })
    }

    /// Store key material under `id`, replacing any existing record.
    ///
    /// # Postconditions
    /// - The plaintext is encrypted before the map is touched
    /// - A replaced record is swapped out in a single map operation
    ///
    /// # Returns
    /// `true` if an existing record was replaced.
    ///
    /// # Errors
    /// - `InvalidInput` if `plaintext` is empty
    pub async fn put(&self, id: KeyId, plaintext: &[u8], metadata: Metadata) -> Result<bool> {
        if plaintext.is_empty() {
            return Err(Error::InvalidInput("Key material cannot be empty".to_string()));
        }

        let (ciphertext, nonce) =
            encrypt_with_aad(self.record_key.as_bytes(), plaintext, id.as_bytes())?;
        let record = KeyRecord {
            id: id.clone(),
            ciphertext,
            nonce,
            created_at: Utc::now(),
            metadata,
        };

        let replaced = {
            let mut records = self.records.write().await;
            records.insert(id.clone(), record).is_some()
        };

        info!(id = %id, size = plaintext.len(), replaced, "Key stored");
        Ok(replaced)
    }

    /// Decrypt and return the key material stored under `id`.
    ///
    /// # Errors
    /// - `NotFound` if there is no such record
    /// - `Internal` if the record fails to decrypt (store corruption)
    pub async fn get(&self, id: &KeyId) -> Result<Zeroizing<Vec<u8>>> {
        let record = {
            let records = self.records.read().await;
            records.get(id).cloned()
        };
        let record = record.ok_or_else(|| Error::NotFound(format!("Key not found: {}", id)))?;

        match decrypt_with_aad(
            self.record_key.as_bytes(),
            &record.ciphertext,
            &record.nonce,
            id.as_bytes(),
        ) {
            Ok(plaintext) => {
                debug!(id = %id, "Key retrieved");
                Ok(Zeroizing::new(plaintext))
            }
            Err(e) => {
                error!(id = %id, error = %e, "Stored record failed to decrypt");
                Err(Error::Internal(format!("Record '{}' is corrupted", id)))
            }
        }
    }

    /// Remove the record under `id`.
    ///
    /// # Returns
    /// `true` if a record was removed.
    pub async fn delete(&self, id: &KeyId) -> bool {
        let removed = self.records.write().await.remove(id).is_some();
        if removed {
            info!(id = %id, "Key deleted");
        } else {
            debug!(id = %id, "Delete of missing key");
        }
        removed
    }

    /// List ids and metadata of all records, sorted by id.
    pub async fn list(&self) -> Vec<KeyInfo> {
        let mut infos: Vec<KeyInfo> = {
            let records = self.records.read().await;
            records.values().map(KeyRecord::info).collect()
        };
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Whether a record exists under `id`.
    pub async fn exists(&self, id: &KeyId) -> bool {
        self.records.read().await.contains_key(id)
    }

    /// Number of stored records.
    pub async fn count(&self) -> usize {
        self.records.read().await.len()
    }

    /// Remove every record.
    ///
    /// # Returns
    /// The number of records removed.
    pub async fn clear(&self) -> usize {
        let removed = {
            let mut records = self.records.write().await;
            let removed = records.len();
            records.clear();
            removed
        };
        info!(removed, "Vault cleared");
        removed
    }

    /// Copy the current state for dumping.
    ///
    /// Holds the read lock only while cloning the map.
    pub async fn snapshot(&self) -> Snapshot {
        let records = self.records.read().await.clone();
        Snapshot {
            keyring: self.keyring.clone(),
            state: VaultState::from_map(records),
        }
    }

    /// The keyring this vault was opened with.
    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }
}
