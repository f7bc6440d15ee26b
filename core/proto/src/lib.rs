//! Wire protocol shared by the Keylock server and client.
//!
//! Every message is a JSON document in a length-prefixed frame:
//! a 4-byte big-endian length followed by that many bytes of JSON.
//! Binary fields are base64 strings.

pub mod codec;
pub mod message;

pub use codec::{MessageStream, DEFAULT_MAX_FRAME_LEN};
pub use message::{ErrorKind, KeyEntry, Metadata, Request, RequestFrame, Response, ResponseFrame};
