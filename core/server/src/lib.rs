//! Keylock network server.
//!
//! Accepts TCP connections speaking the keylock protocol, authenticates
//! each one with the shared password, and executes requests against a
//! shared [`KeyVault`](keylock_vault::KeyVault).

pub mod config;
pub mod dispatch;
pub mod gateway;
pub mod listener;
pub mod persist;

pub use config::ServerConfig;
pub use dispatch::Dispatcher;
pub use gateway::{AuthGateway, Session, SessionHandle, SessionState};
pub use listener::{Server, UNAUTHENTICATED_MAX_FRAME_LEN};
pub use persist::Dumper;
