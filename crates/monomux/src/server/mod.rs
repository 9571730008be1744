//! The MonoMux server: session ownership and client coordination.
//!
//! One task owns all server state and consumes a single event stream
//! fed by per-connection reader tasks, per-session PTY pumps, and the
//! process signal listeners. Handlers never block: outbound traffic
//! goes through per-connection queues whose write-behind buffering
//! absorbs back-pressure, so state mutation stays strictly sequential.

pub mod client;
mod dispatch;
pub mod session;

use std::collections::HashMap;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use protocol::framing::RawFrame;
use protocol::messages::{notification, DetachReason};
use tokio::io::Interest;
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use crate::channel::{Channel, ChannelError, CHUNK_SIZE};
use crate::config;
use crate::server::client::{ClientData, ClientId, ControlCommand, DataCommand};
use crate::server::dispatch::DispatchTable;
use crate::server::session::SessionData;

/// Capacity of the central event queue.
const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Capacity of each client's outbound data queue. When a slow client
/// falls this far behind, further output to it is dropped.
const DATA_QUEUE_CAPACITY: usize = 256;

/// Everything that can wake the server's state machine.
#[derive(Debug)]
pub enum ServerEvent {
    /// A complete frame arrived on a client's control connection.
    ControlFrame {
        /// The client the frame arrived from.
        client: ClientId,
        /// The undecoded frame.
        frame: RawFrame,
    },
    /// A control connection hit EOF or failed.
    ControlClosed {
        /// The client whose connection died.
        client: ClientId,
    },
    /// Raw bytes arrived on a client's data connection.
    DataIn {
        /// The client that owns the data connection.
        owner: ClientId,
        /// The bytes to forward to the attached session's PTY.
        bytes: Vec<u8>,
    },
    /// A data connection hit EOF or failed.
    DataClosed {
        /// The client that owned the data connection.
        owner: ClientId,
    },
    /// A session's PTY produced output.
    PtyOutput {
        /// The producing session.
        session: String,
        /// The bytes to fan out to attached clients.
        bytes: Vec<u8>,
    },
    /// A session's PTY reached end-of-stream.
    PtyEof {
        /// The session whose PTY closed.
        session: String,
    },
    /// Stop serving.
    Shutdown,
}

/// Cloneable handle for nudging a running server from outside.
#[derive(Clone)]
pub struct ServerHandle {
    tx: mpsc::Sender<ServerEvent>,
}

impl ServerHandle {
    /// Requests a graceful shutdown. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(ServerEvent::Shutdown).await;
    }
}

/// The server: listening socket, client table, session table, dispatch.
pub struct Server {
    pub(in crate::server) socket_path: PathBuf,
    listener: UnixListener,
    pub(in crate::server) clients: HashMap<ClientId, ClientData>,
    pub(in crate::server) sessions: HashMap<String, SessionData>,
    next_client_id: ClientId,
    dispatch: DispatchTable,
    pub(in crate::server) event_tx: mpsc::Sender<ServerEvent>,
    event_rx: mpsc::Receiver<ServerEvent>,
    shut_down: bool,
}

impl Server {
    /// Binds the listening socket and prepares the server to run.
    ///
    /// The socket's parent directory is created user-private and any
    /// stale socket file is replaced. Must be called from within a
    /// tokio runtime.
    pub fn bind(socket_path: PathBuf) -> anyhow::Result<Self> {
        config::prepare_socket_dir(&socket_path)
            .with_context(|| format!("preparing directory for {}", socket_path.display()))?;
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)
                .with_context(|| format!("removing stale socket {}", socket_path.display()))?;
        }

        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("binding {}", socket_path.display()))?;
        config::restrict_socket_file(&socket_path)
            .with_context(|| format!("restricting {}", socket_path.display()))?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        tracing::info!(socket = %socket_path.display(), "server listening");

        Ok(Self {
            socket_path,
            listener,
            clients: HashMap::new(),
            sessions: HashMap::new(),
            next_client_id: 1,
            dispatch: DispatchTable::new(),
            event_tx,
            event_rx,
            shut_down: false,
        })
    }

    /// A handle for requesting shutdown from other tasks.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            tx: self.event_tx.clone(),
        }
    }

    /// Serves until shutdown is requested or a fatal error occurs.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let mut sigchld = signal(SignalKind::child()).context("installing SIGCHLD listener")?;
        let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT listener")?;
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM listener")?;

        enum Tick {
            Accepted(io::Result<UnixStream>),
            Event(Option<ServerEvent>),
            ChildSignal,
            Terminate,
        }

        loop {
            let tick = tokio::select! {
                accepted = self.listener.accept() => Tick::Accepted(accepted.map(|(stream, _)| stream)),
                event = self.event_rx.recv() => Tick::Event(event),
                _ = sigchld.recv() => Tick::ChildSignal,
                _ = sigint.recv() => Tick::Terminate,
                _ = sigterm.recv() => Tick::Terminate,
            };

            match tick {
                Tick::Accepted(Ok(stream)) => self.accept_client(stream),
                Tick::Accepted(Err(e)) => {
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::Interrupted
                            | io::ErrorKind::WouldBlock
                    ) {
                        tracing::warn!(error = %e, "transient accept failure");
                        continue;
                    }
                    tracing::error!(error = %e, "listening socket failed, terminating");
                    break;
                }
                Tick::Event(Some(event)) => {
                    if !self.handle_event(event) {
                        break;
                    }
                }
                Tick::Event(None) => break,
                Tick::ChildSignal => self.reap_sessions(),
                Tick::Terminate => {
                    tracing::info!("termination signal received");
                    break;
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Notifies every client, drops all state, and unlinks the socket.
    ///
    /// Idempotent; also invoked by [`run`](Self::run) on exit.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        tracing::info!(
            clients = self.clients.len(),
            sessions = self.sessions.len(),
            "server shutting down"
        );

        for client in self.clients.values() {
            client.send_detach_reason(DetachReason::ServerShutdown);
            client.close();
        }
        self.clients.clear();
        // Dropping a session closes its PTY master; the child sees a
        // hangup on its controlling terminal.
        self.sessions.clear();

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            tracing::debug!(error = %e, "socket file already gone");
        }
    }

    /// Registers a fresh control connection as a new client.
    fn accept_client(&mut self, stream: UnixStream) {
        let id = self.next_client_id;
        self.next_client_id += 1;

        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let record = ClientData::new(id, ctrl_tx);
        record.send_message(&notification::Connection {
            accepted: true,
            reason: None,
        });
        self.clients.insert(id, record);

        tokio::spawn(connection_task(id, stream, self.event_tx.clone(), ctrl_rx));
        tracing::info!(client_id = id, "client connected");
    }

    /// Applies one event to the state machine. Returns `false` when the
    /// server should stop serving.
    fn handle_event(&mut self, event: ServerEvent) -> bool {
        match event {
            ServerEvent::ControlFrame { client, frame } => self.dispatch_frame(client, frame),
            ServerEvent::ControlClosed { client } => self.destroy_client(client),
            ServerEvent::DataIn { owner, bytes } => self.forward_to_pty(owner, &bytes),
            ServerEvent::DataClosed { owner } => self.destroy_client(owner),
            ServerEvent::PtyOutput { session, bytes } => self.fan_out(&session, bytes),
            ServerEvent::PtyEof { session } => self.observe_pty_eof(&session),
            ServerEvent::Shutdown => return false,
        }
        true
    }

    /// Routes a control frame through the dispatch table.
    fn dispatch_frame(&mut self, client: ClientId, frame: RawFrame) {
        let Some(record) = self.clients.get_mut(&client) else {
            // The connection raced its own teardown.
            return;
        };
        record.note_message();

        let Some(kind) = frame.message_kind() else {
            tracing::debug!(client_id = client, kind = frame.kind, "unknown message kind");
            return;
        };

        match self.dispatch.lookup(kind) {
            Some(handler) => handler(self, client, &frame.body),
            None => {
                tracing::debug!(client_id = client, ?kind, "no handler for message kind");
            }
        }
    }

    /// Writes data-channel bytes into the attached session's PTY.
    fn forward_to_pty(&mut self, owner: ClientId, bytes: &[u8]) {
        let attached = self
            .clients
            .get(&owner)
            .and_then(|c| c.attached_session().map(str::to_owned));
        let Some(name) = attached else {
            tracing::debug!(
                client_id = owner,
                dropped = bytes.len(),
                "data from unattached client dropped"
            );
            return;
        };

        let Some(session) = self.sessions.get_mut(&name) else {
            tracing::debug!(client_id = owner, session = %name, "data for missing session dropped");
            return;
        };

        if let Err(e) = session.process_mut().write_input(bytes) {
            tracing::warn!(session = %name, error = %e, "failed to write to session PTY");
        }
    }

    /// Delivers PTY output to every attached client's data channel.
    fn fan_out(&mut self, name: &str, bytes: Vec<u8>) {
        let Some(session) = self.sessions.get(name) else {
            return;
        };

        let targets: Vec<ClientId> = session.attached_clients().to_vec();
        for id in targets {
            let Some(client) = self.clients.get(&id) else {
                continue;
            };
            let Some(data) = client.data_channel() else {
                continue;
            };
            if !data.try_send(bytes.clone()) {
                tracing::warn!(
                    client_id = id,
                    session = %name,
                    "client data queue full, dropping session output"
                );
            }
        }
    }

    /// Reacts to a session's PTY closing. The session itself lives on
    /// until the child's exit is observed.
    fn observe_pty_eof(&mut self, name: &str) {
        let Some(session) = self.sessions.get_mut(name) else {
            return;
        };
        match session.process_mut().try_wait() {
            Ok(Some(status)) => {
                tracing::info!(session = %name, code = status.exit_code(), "session process exited");
                self.teardown_session(name, DetachReason::Exit);
            }
            Ok(None) => {
                tracing::debug!(session = %name, "PTY closed but child still running");
            }
            Err(e) => {
                tracing::warn!(session = %name, error = %e, "failed to query session child");
                self.teardown_session(name, DetachReason::Exit);
            }
        }
    }

    /// Collects exit statuses after SIGCHLD and tears down what exited.
    fn reap_sessions(&mut self) {
        let mut exited = Vec::new();
        for (name, session) in self.sessions.iter_mut() {
            match session.process_mut().try_wait() {
                Ok(Some(status)) => {
                    tracing::info!(session = %name, code = status.exit_code(), "session process exited");
                    exited.push(name.clone());
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(session = %name, error = %e, "failed to query session child");
                    exited.push(name.clone());
                }
            }
        }
        for name in exited {
            self.teardown_session(&name, DetachReason::Exit);
        }
    }

    /// Destroys a session, notifying every attached client.
    pub(in crate::server) fn teardown_session(&mut self, name: &str, reason: DetachReason) {
        let Some(session) = self.sessions.remove(name) else {
            return;
        };
        for &id in session.attached_clients() {
            if let Some(client) = self.clients.get_mut(&id) {
                client.clear_attached();
                client.send_detach_reason(reason);
                self.client_detached(id, name);
            }
        }
        tracing::info!(session = %name, "session destroyed");
    }

    /// Removes a client record; implicitly detaches it from its session.
    fn destroy_client(&mut self, id: ClientId) {
        let Some(client) = self.clients.remove(&id) else {
            return;
        };

        if let Some(name) = client.attached_session() {
            if let Some(session) = self.sessions.get_mut(name) {
                session.detach(id);
                self.client_detached(id, name);
            }
        }
        if let Some(data) = client.data_channel() {
            data.close();
        }
        client.close();
        tracing::info!(client_id = id, "client disconnected");
    }

    /// Detaches one client from a session and tells it why.
    pub(in crate::server) fn detach_client_from(
        &mut self,
        id: ClientId,
        session_name: &str,
        reason: DetachReason,
    ) {
        if let Some(session) = self.sessions.get_mut(session_name) {
            session.detach(id);
        }
        if let Some(client) = self.clients.get_mut(&id) {
            client.clear_attached();
            client.send_detach_reason(reason);
            self.client_detached(id, session_name);
        }
    }

    /// Transfers the candidate's connection into `main`'s data channel
    /// and retires the candidate's client record.
    pub(in crate::server) fn turn_client_into_data_of(
        &mut self,
        main: ClientId,
        candidate: ClientId,
        response: Vec<u8>,
    ) -> bool {
        if !self.clients.contains_key(&main) {
            return false;
        }
        let Some(candidate_record) = self.clients.remove(&candidate) else {
            return false;
        };

        let (data_tx, data_rx) = mpsc::channel(DATA_QUEUE_CAPACITY);
        if !candidate_record.send_turn_into_data(main, response, data_rx) {
            // The candidate connection died under us; main keeps waiting
            // for a data channel.
            return false;
        }

        if let Some(main_record) = self.clients.get_mut(&main) {
            main_record.set_data_channel(client::DataChannel::new(data_tx));
        }

        tracing::info!(
            client_id = main,
            donor = candidate,
            "data channel bound via turnover"
        );
        true
    }

    /// Picks the smallest positive integer name not currently taken.
    pub(in crate::server) fn allocate_session_name(&self) -> String {
        smallest_integer_name(|name| self.sessions.contains_key(name))
    }

    /// Announces a freshly created session.
    pub(in crate::server) fn create_callback(&self, session: &SessionData) {
        tracing::info!(
            session = %session.name(),
            pid = ?session.process().pid(),
            "session created"
        );
    }

    /// Announces a fresh attachment.
    pub(in crate::server) fn client_attached(&self, client: ClientId, session: &SessionData) {
        tracing::info!(
            client_id = client,
            session = %session.name(),
            attached = session.attached_clients().len(),
            "client attached"
        );
    }

    /// Announces a detachment.
    pub(in crate::server) fn client_detached(&self, client: ClientId, session_name: &str) {
        tracing::info!(client_id = client, session = %session_name, "client detached");
    }
}

/// Smallest positive integer, as a string, for which `taken` is false.
fn smallest_integer_name<F: Fn(&str) -> bool>(taken: F) -> String {
    let mut i: u64 = 1;
    loop {
        let name = i.to_string();
        if !taken(&name) {
            return name;
        }
        i += 1;
    }
}

/// Starts the blocking pump that feeds one session's PTY output into
/// the server's event stream.
pub(in crate::server) fn spawn_pty_reader(
    session: String,
    reader: Box<dyn Read + Send>,
    event_tx: mpsc::Sender<ServerEvent>,
) {
    tokio::spawn(async move {
        let reader = Arc::new(std::sync::Mutex::new(reader));
        loop {
            let shared = Arc::clone(&reader);
            let read = tokio::task::spawn_blocking(move || {
                let mut buf = vec![0u8; CHUNK_SIZE];
                let mut reader = shared
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                match reader.read(&mut buf) {
                    Ok(0) => Ok(None),
                    Ok(n) => {
                        buf.truncate(n);
                        Ok(Some(buf))
                    }
                    Err(e) => Err(e),
                }
            })
            .await;

            match read {
                Ok(Ok(Some(bytes))) => {
                    let event = ServerEvent::PtyOutput {
                        session: session.clone(),
                        bytes,
                    };
                    if event_tx.send(event).await.is_err() {
                        return;
                    }
                }
                Ok(Ok(None)) => {
                    let _ = event_tx.send(ServerEvent::PtyEof { session }).await;
                    return;
                }
                Ok(Err(e)) => {
                    // EIO here is the normal Linux signal that the child
                    // side of the PTY is gone.
                    tracing::debug!(session = %session, error = %e, "PTY read ended");
                    let _ = event_tx.send(ServerEvent::PtyEof { session }).await;
                    return;
                }
                Err(e) => {
                    tracing::error!(session = %session, error = %e, "PTY reader panicked");
                    let _ = event_tx.send(ServerEvent::PtyEof { session }).await;
                    return;
                }
            }
        }
    });
}

/// What woke a connection task: a command from the server, or socket
/// readiness.
enum Wake<C> {
    Command(Option<C>),
    Io(io::Result<tokio::io::Ready>),
}

/// Serves one client connection in control mode; switches itself into
/// data mode when the server promotes it.
async fn connection_task(
    id: ClientId,
    stream: UnixStream,
    event_tx: mpsc::Sender<ServerEvent>,
    mut ctrl_rx: mpsc::UnboundedReceiver<ControlCommand>,
) {
    let mut chan = Channel::new(stream);
    let mut frame_buf: Vec<u8> = Vec::new();

    loop {
        let interest = if chan.has_pending_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };

        let wake = tokio::select! {
            command = ctrl_rx.recv() => Wake::Command(command),
            ready = chan.backend().ready(interest) => Wake::Io(ready),
        };

        match wake {
            Wake::Command(Some(ControlCommand::Frame(frame))) => {
                if chan.write(&frame).is_err() {
                    let _ = event_tx.send(ServerEvent::ControlClosed { client: id }).await;
                    return;
                }
            }
            Wake::Command(Some(ControlCommand::TurnIntoData {
                owner,
                response,
                data_rx,
            })) => {
                if chan.write(&response).is_err() {
                    let _ = event_tx.send(ServerEvent::DataClosed { owner }).await;
                    return;
                }
                data_relay(owner, chan, event_tx, data_rx).await;
                return;
            }
            Wake::Command(Some(ControlCommand::Close)) | Wake::Command(None) => {
                let _ = chan.flush_writes();
                return;
            }
            Wake::Io(Err(e)) => {
                tracing::debug!(client_id = id, error = %e, "control connection poll failed");
                let _ = event_tx.send(ServerEvent::ControlClosed { client: id }).await;
                return;
            }
            Wake::Io(Ok(ready)) => {
                if ready.is_writable() && chan.has_pending_write() {
                    if chan.flush_writes().is_err() {
                        let _ = event_tx.send(ServerEvent::ControlClosed { client: id }).await;
                        return;
                    }
                }
                if ready.is_readable()
                    && pump_control_frames(id, &mut chan, &mut frame_buf, &event_tx)
                        .await
                        .is_err()
                {
                    let _ = event_tx.send(ServerEvent::ControlClosed { client: id }).await;
                    return;
                }
            }
        }
    }
}

/// Reads everything currently available and forwards complete frames.
async fn pump_control_frames(
    id: ClientId,
    chan: &mut Channel<UnixStream>,
    frame_buf: &mut Vec<u8>,
    event_tx: &mpsc::Sender<ServerEvent>,
) -> Result<(), ()> {
    loop {
        let bytes = match chan.read(CHUNK_SIZE) {
            Ok(bytes) if bytes.is_empty() => return Ok(()),
            Ok(bytes) => bytes,
            Err(ChannelError::Closed) => {
                tracing::debug!(client_id = id, "control connection closed by peer");
                return Err(());
            }
            Err(e) => {
                tracing::debug!(client_id = id, error = %e, "control connection read failed");
                return Err(());
            }
        };

        frame_buf.extend_from_slice(&bytes);
        loop {
            match protocol::try_decode(frame_buf) {
                Ok(Some((frame, consumed))) => {
                    frame_buf.drain(..consumed);
                    let event = ServerEvent::ControlFrame { client: id, frame };
                    if event_tx.send(event).await.is_err() {
                        return Err(());
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(client_id = id, error = %e, "unframeable control stream");
                    return Err(());
                }
            }
        }
    }
}

/// Serves a promoted connection: raw bytes in both directions.
async fn data_relay(
    owner: ClientId,
    mut chan: Channel<UnixStream>,
    event_tx: mpsc::Sender<ServerEvent>,
    mut data_rx: mpsc::Receiver<DataCommand>,
) {
    loop {
        let interest = if chan.has_pending_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };

        let wake = tokio::select! {
            command = data_rx.recv() => Wake::Command(command),
            ready = chan.backend().ready(interest) => Wake::Io(ready),
        };

        match wake {
            Wake::Command(Some(DataCommand::Bytes(bytes))) => {
                if chan.write(&bytes).is_err() {
                    let _ = event_tx.send(ServerEvent::DataClosed { owner }).await;
                    return;
                }
            }
            Wake::Command(Some(DataCommand::Close)) | Wake::Command(None) => {
                let _ = chan.flush_writes();
                return;
            }
            Wake::Io(Err(e)) => {
                tracing::debug!(client_id = owner, error = %e, "data connection poll failed");
                let _ = event_tx.send(ServerEvent::DataClosed { owner }).await;
                return;
            }
            Wake::Io(Ok(ready)) => {
                if ready.is_writable() && chan.has_pending_write() {
                    if chan.flush_writes().is_err() {
                        let _ = event_tx.send(ServerEvent::DataClosed { owner }).await;
                        return;
                    }
                }
                if ready.is_readable() {
                    loop {
                        match chan.read(CHUNK_SIZE) {
                            Ok(bytes) if bytes.is_empty() => break,
                            Ok(bytes) => {
                                let event = ServerEvent::DataIn { owner, bytes };
                                if event_tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                            Err(_) => {
                                let _ =
                                    event_tx.send(ServerEvent::DataClosed { owner }).await;
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}
