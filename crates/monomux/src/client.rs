//! Client-side protocol driver.
//!
//! A client holds two connections to the server: a framed control
//! connection and, after the nonce handshake, a raw data connection.
//! [`handshake`] performs the two-socket dance; [`SessionClient`] then
//! exposes the request/response surface and the stdio relay.

use std::path::Path;

use protocol::framing::{self, RawFrame};
use protocol::messages::{
    notification, request, response, DetachMode, DetachReason, SessionSummary, SpawnRequest,
    WireMessage,
};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

/// Errors surfaced by the client-side protocol driver.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Could not reach the server socket at all.
    #[error("failed to connect to server: {0}")]
    Connect(#[source] std::io::Error),

    /// The server closed the connection.
    #[error("connection closed by server")]
    Disconnected,

    /// The server refused the connection outright.
    #[error("server rejected the connection: {0}")]
    Rejected(String),

    /// The two-socket handshake did not complete.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Wire-format failure.
    #[error(transparent)]
    Protocol(#[from] protocol::ProtocolError),

    /// I/O failure on an established connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A framed control connection to the server.
pub struct ControlClient {
    stream: UnixStream,
    buffer: Vec<u8>,
    /// Notifications that arrived while a response was being awaited.
    stashed: std::collections::VecDeque<RawFrame>,
}

impl ControlClient {
    /// Connects and consumes the server's connection notification.
    pub async fn connect(path: &Path) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(ClientError::Connect)?;
        let mut client = Self {
            stream,
            buffer: Vec::new(),
            stashed: std::collections::VecDeque::new(),
        };

        let frame = client.read_frame().await?;
        match frame.decode::<notification::Connection>() {
            Some(greeting) if greeting.accepted => Ok(client),
            Some(greeting) => Err(ClientError::Rejected(
                greeting.reason.unwrap_or_else(|| "unspecified".to_string()),
            )),
            None => Err(ClientError::Handshake(
                "expected a connection notification".to_string(),
            )),
        }
    }

    /// Sends one message as a frame.
    pub async fn send<M: WireMessage>(&mut self, message: &M) -> Result<(), ClientError> {
        let frame = framing::encode_message(message)?;
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    /// Reads the next complete frame, serving notifications stashed by
    /// [`read_response`](Self::read_response) before touching the wire.
    ///
    /// Cancellation-safe: partially received bytes stay in the internal
    /// buffer across calls.
    pub async fn read_frame(&mut self) -> Result<RawFrame, ClientError> {
        if let Some(frame) = self.stashed.pop_front() {
            return Ok(frame);
        }
        self.read_wire_frame().await
    }

    async fn read_wire_frame(&mut self) -> Result<RawFrame, ClientError> {
        loop {
            if let Some((frame, consumed)) = framing::try_decode(&self.buffer)? {
                self.buffer.drain(..consumed);
                return Ok(frame);
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(ClientError::Disconnected);
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    /// Reads the response to the request just sent.
    ///
    /// Notifications may arrive interleaved; they are stashed for later
    /// [`read_frame`](Self::read_frame) calls rather than lost. Any
    /// other unexpected kind is a protocol violation.
    pub async fn read_response<M: WireMessage>(&mut self) -> Result<M, ClientError> {
        loop {
            let frame = self.read_wire_frame().await?;
            if frame.kind == M::KIND.as_u16() {
                return frame.decode::<M>().ok_or_else(|| {
                    ClientError::Handshake("malformed response body".to_string())
                });
            }
            if frame.message_kind().is_some_and(|k| k.is_notification()) {
                tracing::debug!(kind = frame.kind, "notification while awaiting response");
                self.stashed.push_back(frame);
                continue;
            }
            return Err(ClientError::Handshake(format!(
                "unexpected message kind {:#06x}",
                frame.kind
            )));
        }
    }

    /// Sends a request and reads its response.
    pub async fn round_trip<Req, Resp>(&mut self, request: &Req) -> Result<Resp, ClientError>
    where
        Req: WireMessage,
        Resp: WireMessage,
    {
        self.send(request).await?;
        self.read_response().await
    }

    /// Releases the stream and any unconsumed bytes.
    pub fn into_parts(self) -> (UnixStream, Vec<u8>) {
        (self.stream, self.buffer)
    }
}

/// How a stdio relay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// The server pushed a detach notification.
    Detached(DetachReason),
    /// The data connection reached end-of-stream.
    SessionClosed,
    /// Local standard input reached end-of-stream.
    InputClosed,
}

/// A fully handshaken client: control plus bound data connection.
pub struct SessionClient {
    ctrl: ControlClient,
    id: u64,
    data: UnixStream,
    /// Raw bytes that arrived on the data connection right behind the
    /// handshake response.
    data_leftover: Vec<u8>,
}

/// Performs the two-socket handshake against the server at `path`.
///
/// The first connection becomes the control channel and yields the
/// client identity and nonce; the second proves the nonce and is
/// promoted into the data channel.
pub async fn handshake(path: &Path) -> Result<SessionClient, ClientError> {
    let mut ctrl = ControlClient::connect(path).await?;
    let identity: response::ClientId = ctrl.round_trip(&request::ClientId {}).await?;
    tracing::debug!(client_id = identity.id, "identity received");

    let mut candidate = ControlClient::connect(path).await?;
    let bound: response::DataSocket = candidate
        .round_trip(&request::DataSocket {
            id: identity.id,
            nonce: identity.nonce,
        })
        .await?;
    if !bound.success {
        return Err(ClientError::Handshake(
            "server refused the data socket".to_string(),
        ));
    }

    let (data, data_leftover) = candidate.into_parts();
    Ok(SessionClient {
        ctrl,
        id: identity.id,
        data,
        data_leftover,
    })
}

impl SessionClient {
    /// The identity the server assigned to this client.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The running sessions, as the server reports them.
    pub async fn list_sessions(&mut self) -> Result<Vec<SessionSummary>, ClientError> {
        let listing: response::SessionList =
            self.ctrl.round_trip(&request::SessionList {}).await?;
        Ok(listing.sessions)
    }

    /// Asks the server to create a session. An empty name requests a
    /// server-assigned integer name.
    pub async fn make_session(
        &mut self,
        name: &str,
        spawn: SpawnRequest,
    ) -> Result<response::MakeSession, ClientError> {
        self.ctrl
            .round_trip(&request::MakeSession {
                name: name.to_string(),
                spawn,
            })
            .await
    }

    /// Attaches this client to a named session.
    pub async fn attach(&mut self, name: &str) -> Result<response::Attach, ClientError> {
        self.ctrl
            .round_trip(&request::Attach {
                name: name.to_string(),
            })
            .await
    }

    /// Requests a detach and waits for the acknowledgement.
    pub async fn detach(&mut self, mode: DetachMode) -> Result<(), ClientError> {
        let _ack: response::Detach = self.ctrl.round_trip(&request::Detach { mode }).await?;
        Ok(())
    }

    /// Blocks until the server pushes a detach notification.
    pub async fn wait_detached(&mut self) -> Result<DetachReason, ClientError> {
        loop {
            let frame = self.ctrl.read_frame().await?;
            if let Some(detached) = frame.decode::<notification::Detached>() {
                return Ok(detached.mode);
            }
        }
    }

    /// Reads session output from the data channel, serving bytes that
    /// arrived behind the handshake response first.
    pub async fn read_data(&mut self, buf: &mut [u8]) -> Result<usize, ClientError> {
        if !self.data_leftover.is_empty() {
            let n = buf.len().min(self.data_leftover.len());
            buf[..n].copy_from_slice(&self.data_leftover[..n]);
            self.data_leftover.drain(..n);
            return Ok(n);
        }
        Ok(self.data.read(buf).await?)
    }

    /// Writes terminal input to the attached session.
    pub async fn write_data(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        self.data.write_all(bytes).await?;
        Ok(())
    }

    /// Relays standard input/output against the attached session until
    /// the session ends, the server detaches us, or stdin closes.
    pub async fn relay_stdio(&mut self) -> Result<RelayEnd, ClientError> {
        let mut stdout = tokio::io::stdout();
        let mut stdin = tokio::io::stdin();

        if !self.data_leftover.is_empty() {
            stdout.write_all(&self.data_leftover).await?;
            stdout.flush().await?;
            self.data_leftover.clear();
        }

        enum Wake {
            FromServer(std::io::Result<usize>),
            FromStdin(std::io::Result<usize>),
            Control(Result<RawFrame, ClientError>),
        }

        let mut to_server = [0u8; 4096];
        let mut from_server = [0u8; 4096];
        loop {
            let wake = tokio::select! {
                read = self.data.read(&mut from_server) => Wake::FromServer(read),
                read = stdin.read(&mut to_server) => Wake::FromStdin(read),
                frame = self.ctrl.read_frame() => Wake::Control(frame),
            };

            match wake {
                Wake::FromServer(read) => match read? {
                    0 => return Ok(RelayEnd::SessionClosed),
                    n => {
                        stdout.write_all(&from_server[..n]).await?;
                        stdout.flush().await?;
                    }
                },
                Wake::FromStdin(read) => match read? {
                    0 => return Ok(RelayEnd::InputClosed),
                    n => self.data.write_all(&to_server[..n]).await?,
                },
                Wake::Control(frame) => {
                    if let Some(detached) = frame?.decode::<notification::Detached>() {
                        return Ok(RelayEnd::Detached(detached.mode));
                    }
                }
            }
        }
    }
}
