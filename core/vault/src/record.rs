//! Key records and the serializable vault state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::keyring::Keyring;
use keylock_common::{Error, KeyId, Result};
use keylock_crypto::Nonce;

/// Unencrypted, caller-supplied labels attached to a record.
pub type Metadata = BTreeMap<String, String>;

/// A single encrypted key held by the vault.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Record identifier, also bound into the ciphertext as associated data.
    pub id: KeyId,
    /// Encrypted key material including the authentication tag.
    #[serde(with = "keylock_common::encoding")]
    pub ciphertext: Vec<u8>,
    /// Nonce used for this record.
    #[serde(with = "keylock_common::encoding::array")]
    pub nonce: Nonce,
    /// When the record was stored.
    pub created_at: DateTime<Utc>,
    /// Labels stored in the clear.
    #[serde(default)]
    pub metadata: Metadata,
}

impl KeyRecord {
    /// Public view of this record without any key material.
    pub fn info(&self) -> KeyInfo {
        KeyInfo {
            id: self.id.clone(),
            metadata: self.metadata.clone(),
            created_at: self.created_at,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.ciphertext.is_empty() {
            return Err(Error::CorruptFormat(format!(
                "record '{}' has empty ciphertext",
                self.id
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRecord")
            .field("id", &self.id)
            .field("ciphertext_len", &self.ciphertext.len())
            .field("created_at", &self.created_at)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// What `LIST` exposes about a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub id: KeyId,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

/// Mapping from key id to encrypted record.
///
/// Serialized as a list of records; duplicate ids or empty ciphertext
/// are rejected when loading.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<KeyRecord>", into = "Vec<KeyRecord>")]
pub struct VaultState {
    records: HashMap<KeyId, KeyRecord>,
}

impl VaultState {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the state holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Look up a record by id.
    pub fn get(&self, id: &KeyId) -> Option<&KeyRecord> {
        self.records.get(id)
    }

    /// Iterate over all records in unspecified order.
    pub fn records(&self) -> impl Iterator<Item = &KeyRecord> {
        self.records.values()
    }

    pub(crate) fn from_map(records: HashMap<KeyId, KeyRecord>) -> Self {
        Self { records }
    }

    pub(crate) fn into_map(self) -> HashMap<KeyId, KeyRecord> {
        self.records
    }
}

impl TryFrom<Vec<KeyRecord>> for VaultState {
    type Error = Error;

    fn try_from(list: Vec<KeyRecord>) -> Result<Self> {
        let mut records = HashMap::with_capacity(list.len());
        for record in list {
            record.validate()?;
            let id = record.id.clone();
            if records.insert(id.clone(), record).is_some() {
                return Err(Error::CorruptFormat(format!("duplicate record '{}'", id)));
            }
        }
        Ok(Self { records })
    }
}

impl From<VaultState> for Vec<KeyRecord> {
    fn from(state: VaultState) -> Self {
        state.records.into_values().collect()
    }
}

/// Everything a dump file encrypts: the keyring and the records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub keyring: Keyring,
    pub state: VaultState,
}
