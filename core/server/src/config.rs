//! Server configuration.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use keylock_common::{Error, Result, SensitiveBytes};
use keylock_crypto::KdfParams;
use keylock_proto::DEFAULT_MAX_FRAME_LEN;

/// Configuration for a keylock server, usually loaded from a TOML file.
///
/// ```toml
/// bind = "127.0.0.1:7878"
/// password = "helloworld"
/// dump_path = "/var/lib/keylock/vault.dump"
/// dump_password = "dump-secret"
/// kdf = "moderate"
/// dump_interval_secs = 300
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen address, e.g. `127.0.0.1:7878`.
    pub bind: String,
    /// Shared secret clients must present, also the vault master password.
    pub password: SensitiveBytes,
    /// Location of the encrypted dump file.
    pub dump_path: PathBuf,
    /// Password protecting dump files.
    pub dump_password: SensitiveBytes,
    /// KDF strength preset: "interactive", "moderate" or "sensitive".
    #[serde(default = "default_kdf")]
    pub kdf: String,
    /// Largest accepted frame in bytes.
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    /// Dump after every successful mutation.
    #[serde(default)]
    pub dump_on_write: bool,
    /// Dump periodically.
    #[serde(default)]
    pub dump_interval_secs: Option<u64>,
    /// Dump once more when the server shuts down.
    #[serde(default = "default_true")]
    pub dump_on_shutdown: bool,
    /// Close connections that stay silent this long.
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
}

fn default_kdf() -> String {
    "moderate".to_string()
}

fn default_max_frame_len() -> usize {
    DEFAULT_MAX_FRAME_LEN
}

fn default_true() -> bool {
    true
}

impl ServerConfig {
    /// Configuration with the required fields set and defaults elsewhere.
    pub fn new(
        bind: impl Into<String>,
        password: impl Into<String>,
        dump_path: impl Into<PathBuf>,
        dump_password: impl Into<String>,
    ) -> Self {
        Self {
            bind: bind.into(),
            password: SensitiveBytes::from(password.into()),
            dump_path: dump_path.into(),
            dump_password: SensitiveBytes::from(dump_password.into()),
            kdf: default_kdf(),
            max_frame_len: default_max_frame_len(),
            dump_on_write: false,
            dump_interval_secs: None,
            dump_on_shutdown: true,
            idle_timeout_secs: None,
        }
    }

    /// Read, parse and validate a configuration file.
    ///
    /// # Errors
    /// - `Io` if the file cannot be read
    /// - `Config` if it is not valid TOML, misses a required field, or
    ///   fails validation
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration can be used to start a server.
    pub fn validate(&self) -> Result<()> {
        if self.bind.trim().is_empty() {
            return Err(Error::Config("bind must not be empty".to_string()));
        }
        if self.password.is_empty() {
            return Err(Error::Config("password must not be empty".to_string()));
        }
        if self.dump_path.as_os_str().is_empty() {
            return Err(Error::Config("dump_path must not be empty".to_string()));
        }
        if self.dump_password.is_empty() {
            return Err(Error::Config("dump_password must not be empty".to_string()));
        }
        if self.max_frame_len == 0 || self.max_frame_len > u32::MAX as usize {
            return Err(Error::Config(format!(
                "max_frame_len must be between 1 and {}",
                u32::MAX
            )));
        }
        if self.dump_interval_secs == Some(0) {
            return Err(Error::Config("dump_interval_secs must be positive".to_string()));
        }
        if self.idle_timeout_secs == Some(0) {
            return Err(Error::Config("idle_timeout_secs must be positive".to_string()));
        }
        self.kdf_params()?;
        Ok(())
    }

    /// KDF parameters for the configured strength preset.
    pub fn kdf_params(&self) -> Result<KdfParams> {
        KdfParams::from_name(&self.kdf).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn dump_interval(&self) -> Option<Duration> {
        self.dump_interval_secs.map(Duration::from_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}
