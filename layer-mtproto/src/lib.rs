//! MTProto session and transport abstractions.
//!
//! This crate handles:
//! * Message framing (sequence numbers, message IDs, containers)
//! * Plaintext and MTProto 2.0 encrypted envelopes
//! * Sans-IO DH key exchange for permanent and temporary keys
//! * Temporary key binding
//! * Service-message parsing (`rpc_result`, `bad_server_salt`, ...)
//!
//! It is intentionally transport-agnostic: bring your own TCP/WebSocket.

#![deny(unsafe_code)]

pub mod authentication;
pub mod bind;
pub mod encrypted;
pub mod envelope;
pub mod message;
pub mod session;
pub mod tl;
pub mod transport;

pub use encrypted::EncryptedSession;
pub use envelope::{Envelope, Incoming};
pub use message::{Message, MessageId};
pub use session::Session;
