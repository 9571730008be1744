//! Wire protocol shared between the MonoMux client and server.
//!
//! Control traffic is a stream of kind-tagged, length-prefixed frames
//! ([`framing`]); frame bodies are MessagePack-encoded structures
//! ([`messages`]). Data traffic (PTY bytes) never passes through this
//! crate: it is an opaque byte stream on a separate connection.

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use framing::{encode_message, try_decode, RawFrame};
pub use messages::{MessageKind, WireMessage};
