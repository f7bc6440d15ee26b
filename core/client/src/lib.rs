//! Client for the keylock protocol.
//!
//! A [`Connection`] owns one authenticated TCP connection. Each call sends a
//! request and waits for its response; there are no background tasks.
//!
//! ```no_run
//! # async fn example() -> keylock_common::Result<()> {
//! use keylock_client::Connection;
//!
//! let mut conn = Connection::connect("127.0.0.1:7878", "helloworld").await?;
//! conn.put("signing/primary", &[0u8; 32], Default::default()).await?;
//! let key = conn.get("signing/primary").await?;
//! assert_eq!(key.len(), 32);
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```

use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;
use zeroize::Zeroizing;

use keylock_common::{Error, KeyId, Result};
use keylock_proto::{
    KeyEntry, Metadata, MessageStream, Request, RequestFrame, Response, ResponseFrame,
    DEFAULT_MAX_FRAME_LEN,
};

/// An authenticated connection to a keylock server.
pub struct Connection {
    messages: MessageStream<TcpStream>,
    next_id: u64,
    session: String,
}

impl Connection {
    /// Connect to `addr` and authenticate with `password`.
    ///
    /// # Errors
    /// - `Io` if the server cannot be reached
    /// - `AuthFailure` if the password is rejected; the server has closed
    ///   the connection
    pub async fn connect<A: ToSocketAddrs>(addr: A, password: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        let mut messages = MessageStream::new(stream, DEFAULT_MAX_FRAME_LEN);
        let request = Request::Auth {
            password: password.to_string(),
        };
        let session = match call(&mut messages, 1, request).await? {
            Response::Authenticated { session } => session,
            other => return Err(unexpected(&other)),
        };
        debug!(session = %session, "Authenticated");

        Ok(Self {
            messages,
            next_id: 2,
            session,
        })
    }

    /// Session id assigned by the server.
    pub fn session(&self) -> &str {
        &self.session
    }

    /// Store `key` under `id`.
    ///
    /// # Returns
    /// `true` if an existing key was replaced.
    pub async fn put(&mut self, id: &str, key: &[u8], metadata: Metadata) -> Result<bool> {
        let request = Request::Put {
            id: KeyId::new(id)?,
            key: key.to_vec(),
            metadata,
        };
        match self.request(request).await? {
            Response::Stored { replaced } => Ok(replaced),
            other => Err(unexpected(&other)),
        }
    }

    /// Fetch the key stored under `id`.
    ///
    /// # Errors
    /// - `NotFound` if there is no such key
    pub async fn get(&mut self, id: &str) -> Result<Zeroizing<Vec<u8>>> {
        let request = Request::Get { id: KeyId::new(id)? };
        match self.request(request).await? {
            Response::Key { key } => Ok(Zeroizing::new(key)),
            other => Err(unexpected(&other)),
        }
    }

    /// Delete the key stored under `id`.
    ///
    /// # Returns
    /// `true` if a key was removed.
    pub async fn delete(&mut self, id: &str) -> Result<bool> {
        let request = Request::Delete { id: KeyId::new(id)? };
        match self.request(request).await? {
            Response::Deleted { existed } => Ok(existed),
            other => Err(unexpected(&other)),
        }
    }

    /// Ids, metadata and creation times of all keys, sorted by id.
    pub async fn list(&mut self) -> Result<Vec<KeyEntry>> {
        match self.request(Request::List).await? {
            Response::Keys { keys } => Ok(keys),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn exists(&mut self, id: &str) -> Result<bool> {
        let request = Request::Exists { id: KeyId::new(id)? };
        match self.request(request).await? {
            Response::Exists { exists } => Ok(exists),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn count(&mut self) -> Result<usize> {
        match self.request(Request::Count).await? {
            Response::Count { count } => Ok(count),
            other => Err(unexpected(&other)),
        }
    }

    /// Remove every key. Returns the number removed.
    pub async fn clear(&mut self) -> Result<usize> {
        match self.request(Request::Clear).await? {
            Response::Cleared { removed } => Ok(removed),
            other => Err(unexpected(&other)),
        }
    }

    /// Ask the server to write a dump. Returns the number of records dumped.
    pub async fn dump(&mut self) -> Result<usize> {
        match self.request(Request::Dump).await? {
            Response::Dumped { records } => Ok(records),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn ping(&mut self) -> Result<()> {
        match self.request(Request::Ping).await? {
            Response::Pong => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Close the connection.
    pub async fn close(mut self) -> Result<()> {
        self.messages.close().await
    }

    async fn request(&mut self, request: Request) -> Result<Response> {
        let id = self.next_id;
        self.next_id += 1;
        call(&mut self.messages, id, request).await
    }
}

/// Send one request and wait for the matching response.
///
/// Passwords and key material in the request are wiped once it is sent.
async fn call(
    messages: &mut MessageStream<TcpStream>,
    id: u64,
    request: Request,
) -> Result<Response> {
    let mut frame = RequestFrame { id, request };
    let sent = messages.send(&frame).await;
    frame.request.zeroize_secrets();
    sent?;

    let frame: ResponseFrame = match messages.recv().await? {
        Some(frame) => frame,
        None => {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            )))
        }
    };

    // Id 0 answers a frame the server could not parse.
    if frame.id != id && frame.id != 0 {
        return Err(Error::Protocol(format!(
            "response id {} does not match request id {}",
            frame.id, id
        )));
    }

    match frame.response {
        Response::Error { kind, message } => Err(kind.into_error(message)),
        response => Ok(response),
    }
}

fn unexpected(response: &Response) -> Error {
    Error::Protocol(format!("unexpected response: {:?}", response))
}
