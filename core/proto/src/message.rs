//! Request and response messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use zeroize::Zeroize;

use keylock_common::{Error, KeyId};

/// Unencrypted labels attached to a key.
pub type Metadata = BTreeMap<String, String>;

/// A request with its correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    pub request: Request,
}

/// A response echoing the id of the request it answers.
///
/// Responses to frames that could not be parsed carry id 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    pub response: Response,
}

/// Protocol verbs.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "verb", content = "args", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    /// Authenticate the connection. Must be the first request.
    Auth { password: String },
    /// Store key material, replacing any existing key with the same id.
    Put {
        id: KeyId,
        #[serde(with = "keylock_common::encoding")]
        key: Vec<u8>,
        #[serde(default)]
        metadata: Metadata,
    },
    Get { id: KeyId },
    Delete { id: KeyId },
    List,
    Exists { id: KeyId },
    Count,
    Clear,
    /// Write an encrypted dump of the vault to disk.
    Dump,
    Ping,
}

impl Request {
    /// Verb name for logging.
    pub fn verb(&self) -> &'static str {
        match self {
            Request::Auth { .. } => "AUTH",
            Request::Put { .. } => "PUT",
            Request::Get { .. } => "GET",
            Request::Delete { .. } => "DELETE",
            Request::List => "LIST",
            Request::Exists { .. } => "EXISTS",
            Request::Count => "COUNT",
            Request::Clear => "CLEAR",
            Request::Dump => "DUMP",
            Request::Ping => "PING",
        }
    }
}

impl Request {
    /// Wipe the password or key material carried by this request.
    pub fn zeroize_secrets(&mut self) {
        match self {
            Request::Auth { password } => password.zeroize(),
            Request::Put { key, .. } => key.zeroize(),
            _ => {}
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Auth { .. } => write!(f, "Auth {{ password: [REDACTED] }}"),
            Request::Put { id, key, metadata } => f
                .debug_struct("Put")
                .field("id", id)
                .field("key", &format_args!("[REDACTED; {} bytes]", key.len()))
                .field("metadata", metadata)
                .finish(),
            Request::Get { id } => f.debug_struct("Get").field("id", id).finish(),
            Request::Delete { id } => f.debug_struct("Delete").field("id", id).finish(),
            Request::Exists { id } => f.debug_struct("Exists").field("id", id).finish(),
            other => write!(f, "{}", other.verb()),
        }
    }
}

/// Public description of a stored key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEntry {
    pub id: KeyId,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

/// Server responses.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum Response {
    Authenticated { session: String },
    Stored { replaced: bool },
    Key {
        #[serde(with = "keylock_common::encoding")]
        key: Vec<u8>,
    },
    Deleted { existed: bool },
    Keys { keys: Vec<KeyEntry> },
    Exists { exists: bool },
    Count { count: usize },
    Cleared { removed: usize },
    Dumped { records: usize },
    Pong,
    Error { kind: ErrorKind, message: String },
}

impl Response {
    /// Build an error response from a server-side error.
    ///
    /// Details of internal and I/O failures stay on the server.
    pub fn from_error(error: &Error) -> Self {
        let kind = ErrorKind::from(error);
        let message = match kind {
            ErrorKind::Internal => "internal error".to_string(),
            ErrorKind::Io => "I/O error, retry later".to_string(),
            _ => error.to_string(),
        };
        Response::Error { kind, message }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Key { key } => write!(f, "Key {{ key: [REDACTED; {} bytes] }}", key.len()),
            Response::Authenticated { session } => {
                f.debug_struct("Authenticated").field("session", session).finish()
            }
            Response::Stored { replaced } => {
                f.debug_struct("Stored").field("replaced", replaced).finish()
            }
            Response::Deleted { existed } => {
                f.debug_struct("Deleted").field("existed", existed).finish()
            }
            Response::Keys { keys } => f.debug_struct("Keys").field("keys", keys).finish(),
            Response::Exists { exists } => {
                f.debug_struct("Exists").field("exists", exists).finish()
            }
            Response::Count { count } => f.debug_struct("Count").field("count", count).finish(),
            Response::Cleared { removed } => {
                f.debug_struct("Cleared").field("removed", removed).finish()
            }
            Response::Dumped { records } => {
                f.debug_struct("Dumped").field("records", records).finish()
            }
            Response::Pong => write!(f, "Pong"),
            Response::Error { kind, message } => f
                .debug_struct("Error")
                .field("kind", kind)
                .field("message", message)
                .finish(),
        }
    }
}

/// Error kinds visible to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthFailure,
    NotFound,
    CorruptFormat,
    Unauthorized,
    Io,
    Internal,
    InvalidRequest,
}

impl From<&Error> for ErrorKind {
    fn from(error: &Error) -> Self {
        match error {
            Error::AuthFailure => ErrorKind::AuthFailure,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::CorruptFormat(_) => ErrorKind::CorruptFormat,
            Error::Unauthorized => ErrorKind::Unauthorized,
            Error::Io(_) => ErrorKind::Io,
            Error::InvalidInput(_) | Error::Protocol(_) | Error::Serialization(_) => {
                ErrorKind::InvalidRequest
            }
            Error::Internal(_) | Error::Crypto(_) | Error::Config(_) => ErrorKind::Internal,
        }
    }
}

impl ErrorKind {
    /// Rebuild a client-side error from a server error response.
    pub fn into_error(self, message: String) -> Error {
        match self {
            ErrorKind::AuthFailure => Error::AuthFailure,
            ErrorKind::NotFound => Error::NotFound(message),
            ErrorKind::CorruptFormat => Error::CorruptFormat(message),
            ErrorKind::Unauthorized => Error::Unauthorized,
            ErrorKind::Io => Error::Io(std::io::Error::new(std::io::ErrorKind::Other, message)),
            ErrorKind::Internal => Error::Internal(message),
            ErrorKind::InvalidRequest => Error::InvalidInput(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let frame = RequestFrame {
            id: 7,
            request: Request::Put {
                id: KeyId::new("k1").unwrap(),
                key: vec![0, 1, 2],
                metadata: Metadata::new(),
            },
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({
                "id": 7,
                "request": {"verb": "PUT", "args": {"id": "k1", "key": "AAEC", "metadata": {}}}
            })
        );
    }

    #[test]
    fn test_unit_verbs_parse_without_args() {
        let frame: RequestFrame =
            serde_json::from_str(r#"{"id":1,"request":{"verb":"LIST"}}"#).unwrap();
        assert!(matches!(frame.request, Request::List));
    }

    #[test]
    fn test_put_metadata_is_optional() {
        let frame: RequestFrame = serde_json::from_str(
            r#"{"id":1,"request":{"verb":"PUT","args":{"id":"k","key":"AQ=="}}}"#,
        )
        .unwrap();
        match frame.request {
            Request::Put { key, metadata, .. } => {
                assert_eq!(key, vec![1]);
                assert!(metadata.is_empty());
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_invalid_key_id_rejected_at_parse() {
        let result =
            serde_json::from_str::<RequestFrame>(r#"{"id":1,"request":{"verb":"GET","args":{"id":""}}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let auth = Request::Auth {
            password: "helloworld".to_string(),
        };
        assert!(!format!("{:?}", auth).contains("helloworld"));

        let key = Response::Key {
            key: b"topsecret".to_vec(),
        };
        assert_eq!(format!("{:?}", key), "Key { key: [REDACTED; 9 bytes] }");
    }

    #[test]
    fn test_zeroize_secrets() {
        let mut auth = Request::Auth {
            password: "helloworld".to_string(),
        };
        auth.zeroize_secrets();
        assert!(matches!(&auth, Request::Auth { password } if password.is_empty()));

        let mut put = Request::Put {
            id: KeyId::new("k").unwrap(),
            key: vec![9; 16],
            metadata: Metadata::new(),
        };
        put.zeroize_secrets();
        assert!(matches!(&put, Request::Put { key, .. } if key.is_empty()));

        let mut get = Request::Get {
            id: KeyId::new("k").unwrap(),
        };
        get.zeroize_secrets();
        assert!(matches!(&get, Request::Get { id } if id.as_str() == "k"));
    }

    #[test]
    fn test_internal_error_details_stay_on_server() {
        let response = Response::from_error(&Error::Internal("record 'k' is corrupted".into()));
        match response {
            Response::Error { kind, message } => {
                assert_eq!(kind, ErrorKind::Internal);
                assert!(!message.contains("record"));
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_error_kind_roundtrip_to_client_error() {
        assert!(matches!(
            ErrorKind::Unauthorized.into_error(String::new()),
            Error::Unauthorized
        ));
        assert!(matches!(
            ErrorKind::NotFound.into_error("Key not found: k".into()),
            Error::NotFound(_)
        ));
        assert_eq!(ErrorKind::from(&Error::AuthFailure), ErrorKind::AuthFailure);
    }
}
