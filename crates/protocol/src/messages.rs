//! Control-channel message types for client/server communication.
//!
//! Message kinds partition into three spaces: requests (client to server),
//! responses (server to client, correlated to the immediately preceding
//! request on the same channel), and notifications (server to client,
//! unsolicited). Bodies are MessagePack maps keyed by field name, so a
//! frame is decodable without out-of-band schema knowledge.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Numeric tag identifying a message's type on the wire.
///
/// The high nibble encodes the direction space: `0x0` for requests,
/// `0x1` for responses, `0x2` for notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageKind {
    /// Client asks for its identity and a fresh nonce.
    ClientIdRequest = 0x0001,
    /// Client offers a second connection as its data channel.
    DataSocketRequest = 0x0002,
    /// Client asks for the list of running sessions.
    SessionListRequest = 0x0003,
    /// Client asks for a new session to be spawned.
    MakeSessionRequest = 0x0004,
    /// Client asks to attach to a session.
    AttachRequest = 0x0005,
    /// Client asks for clients to be detached from its session.
    DetachRequest = 0x0006,

    /// Identity and nonce for the requesting client.
    ClientIdResponse = 0x1001,
    /// Outcome of a data-channel binding attempt.
    DataSocketResponse = 0x1002,
    /// The list of running sessions.
    SessionListResponse = 0x1003,
    /// Outcome of a session creation attempt.
    MakeSessionResponse = 0x1004,
    /// Outcome of an attach attempt.
    AttachResponse = 0x1005,
    /// Acknowledgement of a detach request.
    DetachResponse = 0x1006,

    /// Pushed by the server when a control connection is accepted.
    ConnectionNotification = 0x2001,
    /// Pushed to a client that is being forcibly detached.
    DetachedNotification = 0x2002,
}

impl MessageKind {
    /// Returns the raw wire tag for this kind.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Whether this kind travels client to server.
    pub fn is_request(self) -> bool {
        self.as_u16() & 0xF000 == 0x0000
    }

    /// Whether this kind is a correlated server reply.
    pub fn is_response(self) -> bool {
        self.as_u16() & 0xF000 == 0x1000
    }

    /// Whether this kind is an unsolicited server push.
    pub fn is_notification(self) -> bool {
        self.as_u16() & 0xF000 == 0x2000
    }

    /// Parses a raw wire tag, returning `None` for unknown kinds.
    pub fn from_u16(value: u16) -> Option<Self> {
        use MessageKind::*;
        let kind = match value {
            0x0001 => ClientIdRequest,
            0x0002 => DataSocketRequest,
            0x0003 => SessionListRequest,
            0x0004 => MakeSessionRequest,
            0x0005 => AttachRequest,
            0x0006 => DetachRequest,
            0x1001 => ClientIdResponse,
            0x1002 => DataSocketResponse,
            0x1003 => SessionListResponse,
            0x1004 => MakeSessionResponse,
            0x1005 => AttachResponse,
            0x1006 => DetachResponse,
            0x2001 => ConnectionNotification,
            0x2002 => DetachedNotification,
            _ => return None,
        };
        Some(kind)
    }
}

/// A message body that knows its own wire kind.
///
/// Encoding never silently drops data; decoding is tolerant: a malformed
/// body yields `None` and the receiver is expected to ignore the frame.
pub trait WireMessage: Serialize + DeserializeOwned {
    /// The kind tag this body travels under.
    const KIND: MessageKind;

    /// Serializes the body into MessagePack bytes.
    fn encode_body(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserializes a body, returning `None` if the bytes are malformed.
    fn decode_body(bytes: &[u8]) -> Option<Self> {
        rmp_serde::from_slice(bytes).ok()
    }
}

macro_rules! wire_message {
    ($ty:ty, $kind:ident) => {
        impl WireMessage for $ty {
            const KIND: MessageKind = MessageKind::$kind;
        }
    };
}

/// Which attached clients a detach request targets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DetachMode {
    /// Only the most recently attached client of the session.
    Latest,
    /// Every client attached to the session.
    All,
}

/// Why a client is being detached from its session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DetachReason {
    /// A client requested the detach.
    Detach,
    /// The session's child process exited.
    Exit,
    /// The server is shutting down.
    ServerShutdown,
}

impl std::fmt::Display for DetachReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetachReason::Detach => write!(f, "detached by request"),
            DetachReason::Exit => write!(f, "session process exited"),
            DetachReason::ServerShutdown => write!(f, "server shut down"),
        }
    }
}

/// How to spawn the child process of a new session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SpawnRequest {
    /// Path or name of the program to execute.
    pub program: String,
    /// Argument vector, not including the program name.
    pub args: Vec<String>,
    /// Environment variables to set on top of the inherited environment.
    pub set_env: Vec<(String, String)>,
    /// Environment variable names to remove from the inherited environment.
    pub unset_env: Vec<String>,
}

/// A session as reported in listings and attach responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSummary {
    /// The session's name.
    pub name: String,
    /// Creation time as seconds since the Unix epoch.
    pub created_unix: u64,
}

/// Requests sent from the client to the server.
pub mod request {
    use super::*;

    /// Asks the server for the client's identity and a one-shot nonce.
    ///
    /// Sent as the first message after a control connection is accepted.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
    pub struct ClientId {}
    wire_message!(ClientId, ClientIdRequest);

    /// Offers the connection this request arrives on as the data channel
    /// of the client identified by `id`, proving ownership with `nonce`.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    pub struct DataSocket {
        /// The main client's identity.
        pub id: u64,
        /// The nonce the main client received with its identity.
        pub nonce: u64,
    }
    wire_message!(DataSocket, DataSocketRequest);

    /// Asks for the list of sessions running on the server.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
    pub struct SessionList {}
    wire_message!(SessionList, SessionListRequest);

    /// Asks the server to create a session running the given program.
    ///
    /// An empty `name` asks the server to pick the smallest positive
    /// integer name not currently taken.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    pub struct MakeSession {
        /// Requested session name, or empty for server-assigned.
        pub name: String,
        /// How to spawn the session's child process.
        pub spawn: SpawnRequest,
    }
    wire_message!(MakeSession, MakeSessionRequest);

    /// Asks to attach the requesting client to a named session.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    pub struct Attach {
        /// Name of the session to attach to.
        pub name: String,
    }
    wire_message!(Attach, AttachRequest);

    /// Asks for clients to be detached from the requester's session.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    pub struct Detach {
        /// Which attached clients to detach.
        pub mode: DetachMode,
    }
    wire_message!(Detach, DetachRequest);
}

/// Responses sent from the server to the client.
pub mod response {
    use super::*;

    /// Identity assigned to the requesting client.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    pub struct ClientId {
        /// The client's identity on this server.
        pub id: u64,
        /// A one-shot nonce for binding a data channel.
        pub nonce: u64,
    }
    wire_message!(ClientId, ClientIdResponse);

    /// Outcome of a data-channel binding attempt.
    ///
    /// On success this travels on the promoted connection; on failure,
    /// on the connection the request arrived on.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    pub struct DataSocket {
        /// Whether the connection was bound as the data channel.
        pub success: bool,
    }
    wire_message!(DataSocket, DataSocketResponse);

    /// The sessions currently running on the server.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
    pub struct SessionList {
        /// One entry per running session.
        pub sessions: Vec<SessionSummary>,
    }
    wire_message!(SessionList, SessionListResponse);

    /// Outcome of a session creation attempt.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    pub struct MakeSession {
        /// The session's final name (server-assigned if requested empty).
        pub name: String,
        /// Whether the session was created and its process spawned.
        pub success: bool,
    }
    wire_message!(MakeSession, MakeSessionResponse);

    /// Outcome of an attach attempt.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    pub struct Attach {
        /// Whether the client is now attached.
        pub success: bool,
        /// The attached session, present on success.
        pub session: Option<SessionSummary>,
    }
    wire_message!(Attach, AttachResponse);

    /// Acknowledgement of a detach request.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
    pub struct Detach {}
    wire_message!(Detach, DetachResponse);
}

/// Unsolicited notifications pushed by the server.
pub mod notification {
    use super::*;

    /// Emitted on a freshly accepted control connection.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    pub struct Connection {
        /// Whether the server accepted the connection.
        pub accepted: bool,
        /// Human-readable rejection reason, present when not accepted.
        pub reason: Option<String>,
    }
    wire_message!(Connection, ConnectionNotification);

    /// Pushed to a client that is being forcibly detached.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    pub struct Detached {
        /// Why the detach happened.
        pub mode: DetachReason,
    }
    wire_message!(Detached, DetachedNotification);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<M: WireMessage + PartialEq + std::fmt::Debug>(msg: &M) {
        let bytes = msg.encode_body().unwrap();
        let decoded = M::decode_body(&bytes).unwrap();
        assert_eq!(&decoded, msg);
    }

    #[test]
    fn test_kind_tag_roundtrip() {
        for kind in [
            MessageKind::ClientIdRequest,
            MessageKind::DataSocketRequest,
            MessageKind::SessionListRequest,
            MessageKind::MakeSessionRequest,
            MessageKind::AttachRequest,
            MessageKind::DetachRequest,
            MessageKind::ClientIdResponse,
            MessageKind::DataSocketResponse,
            MessageKind::SessionListResponse,
            MessageKind::MakeSessionResponse,
            MessageKind::AttachResponse,
            MessageKind::DetachResponse,
            MessageKind::ConnectionNotification,
            MessageKind::DetachedNotification,
        ] {
            assert_eq!(MessageKind::from_u16(kind.as_u16()), Some(kind));
        }
    }

    #[test]
    fn test_kind_direction_spaces() {
        assert!(MessageKind::AttachRequest.is_request());
        assert!(!MessageKind::AttachRequest.is_response());
        assert!(MessageKind::AttachResponse.is_response());
        assert!(MessageKind::DetachedNotification.is_notification());
        assert!(!MessageKind::DetachedNotification.is_request());
    }

    #[test]
    fn test_unknown_kind_tag() {
        assert_eq!(MessageKind::from_u16(0x0F00), None);
        assert_eq!(MessageKind::from_u16(0xFFFF), None);
    }

    #[test]
    fn test_request_roundtrips() {
        roundtrip(&request::ClientId {});
        roundtrip(&request::DataSocket {
            id: 42,
            nonce: 0xDEAD_BEEF_CAFE_F00D,
        });
        roundtrip(&request::SessionList {});
        roundtrip(&request::MakeSession {
            name: "work".to_string(),
            spawn: SpawnRequest {
                program: "/bin/sh".to_string(),
                args: vec!["-l".to_string()],
                set_env: vec![("TERM".to_string(), "xterm-256color".to_string())],
                unset_env: vec!["OLDPWD".to_string()],
            },
        });
        roundtrip(&request::Attach {
            name: "1".to_string(),
        });
        roundtrip(&request::Detach {
            mode: DetachMode::All,
        });
        roundtrip(&request::Detach {
            mode: DetachMode::Latest,
        });
    }

    #[test]
    fn test_response_roundtrips() {
        roundtrip(&response::ClientId { id: 1, nonce: 99 });
        roundtrip(&response::DataSocket { success: false });
        roundtrip(&response::SessionList {
            sessions: vec![
                SessionSummary {
                    name: "1".to_string(),
                    created_unix: 1_700_000_000,
                },
                SessionSummary {
                    name: "editor".to_string(),
                    created_unix: 1_700_000_100,
                },
            ],
        });
        roundtrip(&response::MakeSession {
            name: "1".to_string(),
            success: true,
        });
        roundtrip(&response::Attach {
            success: true,
            session: Some(SessionSummary {
                name: "1".to_string(),
                created_unix: 1_700_000_000,
            }),
        });
        roundtrip(&response::Attach {
            success: false,
            session: None,
        });
        roundtrip(&response::Detach {});
    }

    #[test]
    fn test_notification_roundtrips() {
        roundtrip(&notification::Connection {
            accepted: true,
            reason: None,
        });
        roundtrip(&notification::Connection {
            accepted: false,
            reason: Some("server is shutting down".to_string()),
        });
        roundtrip(&notification::Detached {
            mode: DetachReason::Exit,
        });
        roundtrip(&notification::Detached {
            mode: DetachReason::ServerShutdown,
        });
    }

    #[test]
    fn test_malformed_body_decodes_to_none() {
        // A lone 0xC1 byte is never valid MessagePack.
        assert!(response::ClientId::decode_body(&[0xC1]).is_none());
        // A body of the wrong shape is also rejected.
        let bytes = request::SessionList {}.encode_body().unwrap();
        assert!(response::ClientId::decode_body(&bytes).is_none());
    }

    #[test]
    fn test_body_is_self_describing() {
        // Field names travel with the payload, so a map shows up on the
        // wire rather than a bare positional array.
        let bytes = response::ClientId { id: 7, nonce: 13 }.encode_body().unwrap();
        assert!(rmp_serde::from_slice::<Vec<u64>>(&bytes).is_err());
    }

    #[test]
    fn test_detach_reason_display() {
        assert_eq!(DetachReason::Detach.to_string(), "detached by request");
        assert_eq!(DetachReason::Exit.to_string(), "session process exited");
        assert_eq!(
            DetachReason::ServerShutdown.to_string(),
            "server shut down"
        );
    }
}
