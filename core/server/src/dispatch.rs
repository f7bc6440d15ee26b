//! Executes authorized requests against the vault.

use std::sync::Arc;
use tracing::{debug, error, warn};
use zeroize::Zeroizing;

use keylock_common::{Error, Result};
use keylock_proto::{KeyEntry, Request, Response};
use keylock_vault::KeyVault;

use crate::persist::Dumper;

/// Maps protocol verbs onto vault operations.
pub struct Dispatcher {
    vault: Arc<KeyVault>,
    dumper: Arc<Dumper>,
    dump_on_write: bool,
}

impl Dispatcher {
    pub fn new(vault: Arc<KeyVault>, dumper: Arc<Dumper>, dump_on_write: bool) -> Self {
        Self {
            vault,
            dumper,
            dump_on_write,
        }
    }

    /// Run `request` and build the response.
    ///
    /// The caller must have authorized the session. Errors are turned into
    /// error responses; internal details are logged here, not sent.
    pub async fn handle(&self, request: Request) -> Response {
        let verb = request.verb();
        match self.execute(request).await {
            Ok(response) => response,
            Err(e) => {
                match &e {
                    Error::Internal(_) | Error::Io(_) | Error::Crypto(_) => {
                        error!(verb, error = %e, "Request failed")
                    }
                    _ => debug!(verb, error = %e, "Request rejected"),
                }
                Response::from_error(&e)
            }
        }
    }

    async fn execute(&self, request: Request) -> Result<Response> {
        match request {
            Request::Auth { .. } => Err(Error::InvalidInput(
                "AUTH is only valid as the first request".to_string(),
            )),
            Request::Put { id, key, metadata } => {
                let key = Zeroizing::new(key);
                let replaced = self.vault.put(id, &key, metadata).await?;
                self.after_write().await;
                Ok(Response::Stored { replaced })
            }
            Request::Get { id } => {
                let key = self.vault.get(&id).await?;
                Ok(Response::Key { key: key.to_vec() })
            }
            Request::Delete { id } => {
                let existed = self.vault.delete(&id).await;
                if existed {
                    self.after_write().await;
                }
                Ok(Response::Deleted { existed })
            }
            Request::List => {
                let keys = self
                    .vault
                    .list()
                    .await
                    .into_iter()
                    .map(|info| KeyEntry {
                        id: info.id,
                        metadata: info.metadata,
                        created_at: info.created_at,
                    })
                    .collect();
                Ok(Response::Keys { keys })
            }
            Request::Exists { id } => Ok(Response::Exists {
                exists: self.vault.exists(&id).await,
            }),
            Request::Count => Ok(Response::Count {
                count: self.vault.count().await,
            }),
            Request::Clear => {
                let removed = self.vault.clear().await;
                if removed > 0 {
                    self.after_write().await;
                }
                Ok(Response::Cleared { removed })
            }
            Request::Dump => {
                let records = self.dumper.dump(&self.vault).await?;
                Ok(Response::Dumped { records })
            }
            Request::Ping => Ok(Response::Pong),
        }
    }

    /// Dump after a mutation when configured to.
    ///
    /// The mutation has already been applied, so a failed dump is logged
    /// rather than reported to the client.
    async fn after_write(&self) {
        if !self.dump_on_write {
            return;
        }
        if let Err(e) = self.dumper.dump(&self.vault).await {
            warn!(error = %e, path = %self.dumper.path().display(), "Dump after write failed");
        }
    }
}
