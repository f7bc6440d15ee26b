//! Dump scheduling for the running server.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use keylock_common::{Error, Result, SensitiveBytes};
use keylock_crypto::KdfParams;
use keylock_vault::{dump, restore, KeyVault, Snapshot};

use crate::config::ServerConfig;

/// Writes vault dumps to a fixed path.
///
/// Dumps are serialized with an async mutex. The vault is only read-locked
/// while its records are copied; encryption and file I/O run on the
/// blocking pool with no vault lock held.
pub struct Dumper {
    path: PathBuf,
    password: SensitiveBytes,
    kdf_params: KdfParams,
    guard: Mutex<()>,
}

impl Dumper {
    pub fn new(path: PathBuf, password: SensitiveBytes, kdf_params: KdfParams) -> Self {
        Self {
            path,
            password,
            kdf_params,
            guard: Mutex::new(()),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        Ok(Self::new(
            config.dump_path.clone(),
            config.dump_password.clone(),
            config.kdf_params()?,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Dump the current contents of `vault`.
    ///
    /// # Returns
    /// The number of records written.
    ///
    /// # Errors
    /// - `Io` if the file cannot be written; the previous dump survives
    pub async fn dump(&self, vault: &KeyVault) -> Result<usize> {
        let _guard = self.guard.lock().await;
        let snapshot = vault.snapshot().await;
        let records = snapshot.state.len();

        let path = self.path.clone();
        let password = self.password.clone();
        let params = self.kdf_params;
        tokio::task::spawn_blocking(move || dump(&snapshot, &path, password.as_bytes(), &params))
            .await
            .map_err(|e| Error::Internal(format!("Dump task failed: {}", e)))??;

        Ok(records)
    }

    /// Load the dump at the configured path, if there is one.
    pub async fn restore(&self) -> Result<Option<Snapshot>> {
        let path = self.path.clone();
        let password = self.password.clone();
        tokio::task::spawn_blocking(move || restore(&path, password.as_bytes()))
            .await
            .map_err(|e| Error::Internal(format!("Restore task failed: {}", e)))?
    }

    /// Dump `vault` every `period` until the returned task is aborted.
    ///
    /// Failures are logged and retried on the next tick.
    pub fn spawn_periodic(self: &Arc<Self>, vault: Arc<KeyVault>, period: Duration) -> JoinHandle<()> {
        let dumper = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match dumper.dump(&vault).await {
                    Ok(records) => debug!(records, "Periodic dump complete"),
                    Err(e) => error!(error = %e, path = %dumper.path.display(), "Periodic dump failed"),
                }
            }
        })
    }
}

impl std::fmt::Debug for Dumper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dumper")
            .field("path", &self.path)
            .field("kdf_params", &self.kdf_params)
            .finish()
    }
}
