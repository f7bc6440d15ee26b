//! TCP listener and per-connection request loop.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use keylock_common::{Error, Result};
use keylock_proto::{MessageStream, Request, RequestFrame, Response, ResponseFrame};
use keylock_vault::KeyVault;

use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::gateway::{AuthGateway, Session, SessionState};
use crate::persist::Dumper;

/// Frame limit for connections that have not authenticated yet.
pub const UNAUTHENTICATED_MAX_FRAME_LEN: usize = 64 * 1024;

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Shared state handed to every connection task.
struct ConnectionContext {
    gateway: AuthGateway,
    dispatcher: Dispatcher,
    max_frame_len: usize,
    idle_timeout: Option<Duration>,
}

/// A bound keylock server.
pub struct Server {
    listener: TcpListener,
    context: Arc<ConnectionContext>,
    vault: Arc<KeyVault>,
    dumper: Arc<Dumper>,
    dump_interval: Option<Duration>,
    dump_on_shutdown: bool,
}

impl Server {
    /// Bind the listen socket.
    ///
    /// # Errors
    /// - `Config` if the configuration is invalid
    /// - `Io` if the address cannot be bound
    pub async fn bind(config: &ServerConfig, vault: Arc<KeyVault>, dumper: Arc<Dumper>) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(&config.bind).await?;
        info!(addr = %listener.local_addr()?, "Listening");

        let context = ConnectionContext {
            gateway: AuthGateway::new(config.password.as_bytes()),
            dispatcher: Dispatcher::new(vault.clone(), dumper.clone(), config.dump_on_write),
            max_frame_len: config.max_frame_len,
            idle_timeout: config.idle_timeout(),
        };

        Ok(Self {
            listener,
            context: Arc::new(context),
            vault,
            dumper,
            dump_interval: config.dump_interval(),
            dump_on_shutdown: config.dump_on_shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` completes.
    ///
    /// On shutdown the listener is closed, connection tasks are told to stop
    /// and awaited, then a final dump is written if configured.
    ///
    /// # Errors
    /// - The final dump failed
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Server {
            listener,
            context,
            vault,
            dumper,
            dump_interval,
            dump_on_shutdown,
        } = self;

        let periodic = dump_interval.map(|period| dumper.spawn_periodic(vault.clone(), period));
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        connections.spawn(serve_connection(
                            stream,
                            peer,
                            context.clone(),
                            stop_rx.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Connection task panicked");
                    }
                }
            }
        }

        info!(open = connections.len(), "Shutting down");
        drop(listener);
        let _ = stop_tx.send(true);
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Connection task panicked");
            }
        }

        if let Some(task) = periodic {
            task.abort();
        }

        if dump_on_shutdown {
            let records = dumper.dump(&vault).await?;
            info!(records, path = %dumper.path().display(), "Final dump written");
        }
        Ok(())
    }
}

/// Wait for the next request, honouring the idle timeout.
///
/// `None` means the connection was idle for too long.
async fn next_request(
    messages: &mut MessageStream<TcpStream>,
    idle_timeout: Option<Duration>,
) -> Option<Result<Option<RequestFrame>>> {
    match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, messages.recv()).await.ok(),
        None => Some(messages.recv().await),
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    context: Arc<ConnectionContext>,
    mut stop: watch::Receiver<bool>,
) {
    let mut session = Session::new(peer);
    info!(peer = %peer, session = %session.handle(), "Connection accepted");
    let mut messages = MessageStream::new(
        stream,
        context.max_frame_len.min(UNAUTHENTICATED_MAX_FRAME_LEN),
    );

    loop {
        let next = tokio::select! {
            _ = stop.changed() => {
                debug!(peer = %peer, "Stopping connection for shutdown");
                break;
            }
            next = next_request(&mut messages, context.idle_timeout) => next,
        };

        let frame = match next {
            None => {
                info!(peer = %peer, session = %session.handle(), "Idle timeout, closing connection");
                break;
            }
            Some(Ok(Some(frame))) => frame,
            Some(Ok(None)) => {
                debug!(peer = %peer, "Peer closed connection");
                break;
            }
            Some(Err(e @ Error::Protocol(_))) => {
                warn!(peer = %peer, error = %e, "Malformed request");
                let reply = ResponseFrame {
                    id: 0,
                    response: Response::from_error(&e),
                };
                if messages.send(&reply).await.is_err() {
                    break;
                }
                continue;
            }
            Some(Err(e)) => {
                error!(peer = %peer, error = %e, "Connection error");
                break;
            }
        };

        let RequestFrame { id, request } = frame;
        debug!(peer = %peer, id, verb = request.verb(), "Request");
        let response = match request {
            Request::Auth { password } => {
                let password = Zeroizing::new(password);
                match session.authenticate(&context.gateway, password.as_bytes()) {
                    Ok(()) => {
                        messages.set_max_frame_len(context.max_frame_len);
                        Response::Authenticated {
                            session: session.handle().to_string(),
                        }
                    }
                    Err(e) => Response::from_error(&e),
                }
            }
            other => match session.authorize() {
                Ok(()) => context.dispatcher.handle(other).await,
                Err(e) => {
                    warn!(peer = %peer, verb = other.verb(), "Request before authentication");
                    Response::from_error(&e)
                }
            },
        };

        if let Err(e) = messages.send(&ResponseFrame { id, response }).await {
            warn!(peer = %peer, error = %e, "Failed to send response");
            break;
        }
        if session.state() == SessionState::Closed {
            break;
        }
    }

    session.close();
    let _ = messages.close().await;
    info!(peer = %peer, session = %session.handle(), "Connection closed");
}
