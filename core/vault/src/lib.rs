//! Key vault engine for Keylock.
//!
//! This module provides:
//! - The in-memory key store with per-record encryption
//! - The keyring header used to re-derive the vault master key
//! - Encrypted, crash-safe dump files and their restoration
//!
//! # Architecture
//! The vault sits between the protocol server and the disk. Plaintext key
//! material only exists for the duration of a `put` or `get` call; the map
//! itself holds ciphertext.

pub mod dump;
pub mod keyring;
pub mod record;
pub mod store;

pub use dump::{dump, restore, DUMP_FORMAT_VERSION};
pub use keyring::Keyring;
pub use record::{KeyInfo, KeyRecord, Metadata, Snapshot, VaultState};
pub use store::KeyVault;
