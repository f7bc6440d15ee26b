//! Common types used throughout Keylock.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroize;

/// Maximum length of a key identifier in bytes.
pub const MAX_KEY_ID_LEN: usize = 1024;

/// Identifier of a key record in the vault.
///
/// Identifiers are immutable once a record is created and are never
/// encrypted; they show up in logs and in `LIST` responses.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyId(String);

impl KeyId {
    /// Create a new KeyId from a string.
    ///
    /// # Preconditions
    /// - `id` must be non-empty
    /// - `id` must be at most MAX_KEY_ID_LEN bytes
    /// - `id` must not contain control characters
    ///
    /// # Errors
    /// - Returns `InvalidInput` if any precondition is violated
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "KeyId cannot be empty".to_string(),
            ));
        }
        if id.len() > MAX_KEY_ID_LEN {
            return Err(crate::Error::InvalidInput(format!(
                "KeyId exceeds {} bytes",
                MAX_KEY_ID_LEN
            )));
        }
        if id.chars().any(char::is_control) {
            return Err(crate::Error::InvalidInput(
                "KeyId cannot contain control characters".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the identifier as bytes, e.g. for use as associated data.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl TryFrom<String> for KeyId {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<KeyId> for String {
    fn from(id: KeyId) -> Self {
        id.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sensitive data wrapper that zeroizes on drop.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SensitiveBytes(Vec<u8>);

impl SensitiveBytes {
    /// Create new sensitive bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    /// Get a reference to the inner bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Get the length.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for SensitiveBytes {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl<'de> Deserialize<'de> for SensitiveBytes {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        String::deserialize(deserializer).map(Self::from)
    }
}

impl fmt::Debug for SensitiveBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensitiveBytes([REDACTED; {} bytes])", self.0.len())
    }
}
