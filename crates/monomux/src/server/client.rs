//! Per-connected-client state.
//!
//! A [`ClientData`] exists from the moment a control connection is
//! accepted until the connection dies. The record starts without a data
//! channel; the channel appears exactly once, when a second connection
//! authenticates with the client's nonce and is promoted (turnover).

use protocol::messages::{notification, DetachReason};
use protocol::{framing, WireMessage};
use tokio::sync::mpsc;

/// Opaque server-assigned client identity.
pub type ClientId = u64;

/// Commands consumed by a connection task while in control mode.
#[derive(Debug)]
pub enum ControlCommand {
    /// Transmit an already-encoded frame.
    Frame(Vec<u8>),
    /// Become the raw data channel of `owner`: transmit `response` (the
    /// successful handshake reply), then relay bytes via `data_rx`.
    TurnIntoData {
        /// The main client this connection now belongs to.
        owner: ClientId,
        /// Encoded `response::DataSocket { success: true }` frame.
        response: Vec<u8>,
        /// Outbound byte stream for the data relay.
        data_rx: mpsc::Receiver<DataCommand>,
    },
    /// Close the connection.
    Close,
}

/// Commands consumed by a connection task while in data mode.
#[derive(Debug)]
pub enum DataCommand {
    /// Relay these bytes to the peer.
    Bytes(Vec<u8>),
    /// Close the connection.
    Close,
}

/// Sending half of a promoted data channel.
#[derive(Debug, Clone)]
pub struct DataChannel {
    tx: mpsc::Sender<DataCommand>,
}

impl DataChannel {
    /// Wraps the sender side of a data relay.
    pub fn new(tx: mpsc::Sender<DataCommand>) -> Self {
        Self { tx }
    }

    /// Queues bytes for the client without blocking.
    ///
    /// Returns `false` when the bytes were dropped: either the client's
    /// queue is full (slow consumer) or the connection is gone.
    pub fn try_send(&self, bytes: Vec<u8>) -> bool {
        match self.tx.try_send(DataCommand::Bytes(bytes)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => false,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Asks the connection task to close.
    pub fn close(&self) {
        let _ = self.tx.try_send(DataCommand::Close);
    }
}

/// State the server tracks for one connected client.
pub struct ClientData {
    id: ClientId,
    ctrl_tx: mpsc::UnboundedSender<ControlCommand>,
    data: Option<DataChannel>,
    attached: Option<String>,
    pending_nonce: Option<u64>,
    messages_seen: u64,
}

impl ClientData {
    /// Creates the record for a freshly accepted control connection.
    pub fn new(id: ClientId, ctrl_tx: mpsc::UnboundedSender<ControlCommand>) -> Self {
        Self {
            id,
            ctrl_tx,
            data: None,
            attached: None,
            pending_nonce: None,
            messages_seen: 0,
        }
    }

    /// The client's identity.
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Generates a fresh non-zero nonce, replacing any pending one.
    pub fn make_new_nonce(&mut self) -> u64 {
        let nonce = loop {
            let candidate: u64 = rand::random();
            if candidate != 0 {
                break candidate;
            }
        };
        self.pending_nonce = Some(nonce);
        nonce
    }

    /// Takes the pending nonce, leaving none behind.
    ///
    /// A nonce can be consumed at most once; whether the consumer's
    /// comparison succeeds or not, the value is gone.
    pub fn consume_nonce(&mut self) -> Option<u64> {
        self.pending_nonce.take()
    }

    /// Counts a dispatched message and returns the new total.
    pub fn note_message(&mut self) -> u64 {
        self.messages_seen += 1;
        self.messages_seen
    }

    /// Whether this connection may still be promoted to a data channel.
    ///
    /// Promotion requires the handshake request to be the connection's
    /// very first message; anything else makes it a normal client for
    /// the rest of its life.
    pub fn promotion_candidate(&self) -> bool {
        self.messages_seen <= 1 && self.data.is_none() && self.attached.is_none()
    }

    /// Whether a data channel has been bound.
    pub fn has_data_channel(&self) -> bool {
        self.data.is_some()
    }

    /// The bound data channel, if any.
    pub fn data_channel(&self) -> Option<&DataChannel> {
        self.data.as_ref()
    }

    /// Binds the promoted connection as this client's data channel.
    pub fn set_data_channel(&mut self, channel: DataChannel) {
        debug_assert!(self.data.is_none(), "data channel bound twice");
        self.data = Some(channel);
    }

    /// Name of the session this client is attached to, if any.
    pub fn attached_session(&self) -> Option<&str> {
        self.attached.as_deref()
    }

    /// Records an attachment.
    pub fn set_attached(&mut self, session: String) {
        self.attached = Some(session);
    }

    /// Clears the attachment, returning the previous session name.
    pub fn clear_attached(&mut self) -> Option<String> {
        self.attached.take()
    }

    /// Queues an encoded frame on the control connection.
    ///
    /// A send to a dying connection is not an error here: the reader
    /// side reports the disconnect and the record is torn down.
    pub fn send_frame(&self, frame: Vec<u8>) {
        let _ = self.ctrl_tx.send(ControlCommand::Frame(frame));
    }

    /// Encodes and queues a message on the control connection.
    pub fn send_message<M: WireMessage>(&self, message: &M) {
        match framing::encode_message(message) {
            Ok(frame) => self.send_frame(frame),
            Err(e) => {
                tracing::error!(client_id = self.id, error = %e, "failed to encode message");
            }
        }
    }

    /// Pushes the forced-detach notification with the given reason.
    pub fn send_detach_reason(&self, mode: DetachReason) {
        self.send_message(&notification::Detached { mode });
    }

    /// Hands the turnover command to the promoted connection's task.
    pub fn send_turn_into_data(
        &self,
        owner: ClientId,
        response: Vec<u8>,
        data_rx: mpsc::Receiver<DataCommand>,
    ) -> bool {
        self.ctrl_tx
            .send(ControlCommand::TurnIntoData {
                owner,
                response,
                data_rx,
            })
            .is_ok()
    }

    /// Asks the connection task to close.
    pub fn close(&self) {
        let _ = self.ctrl_tx.send(ControlCommand::Close);
    }
}
