//! Common utilities and types shared across Keylock crates.
//!
//! This module provides the error taxonomy used by every layer, the key
//! identifier type and a few serialization helpers.

pub mod encoding;
pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{KeyId, SensitiveBytes};
