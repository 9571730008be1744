//! Request dispatch: message kind to handler, bound once at startup.
//!
//! Handlers decode their own body; a malformed body makes the handler
//! return without responding, and the peer times out at its own level.
//! Semantic failures always produce a `success = false` response.

use std::collections::HashMap;

use protocol::framing;
use protocol::messages::{request, response, DetachMode, DetachReason, MessageKind, WireMessage};

use crate::pty::{PtyProcess, SpawnOptions};
use crate::server::client::ClientId;
use crate::server::session::SessionData;
use crate::server::{spawn_pty_reader, Server};

/// A request handler bound to the server.
pub(in crate::server) type Handler = fn(&mut Server, ClientId, &[u8]);

/// Maps request kinds to their handlers. Built once per server.
pub(in crate::server) struct DispatchTable {
    handlers: HashMap<MessageKind, Handler>,
}

impl DispatchTable {
    /// Registers every request handler.
    pub fn new() -> Self {
        let mut handlers: HashMap<MessageKind, Handler> = HashMap::new();
        handlers.insert(MessageKind::ClientIdRequest, handle_client_id);
        handlers.insert(MessageKind::DataSocketRequest, handle_data_socket);
        handlers.insert(MessageKind::SessionListRequest, handle_session_list);
        handlers.insert(MessageKind::MakeSessionRequest, handle_make_session);
        handlers.insert(MessageKind::AttachRequest, handle_attach);
        handlers.insert(MessageKind::DetachRequest, handle_detach);
        Self { handlers }
    }

    /// Looks up the handler for a message kind, if one is registered.
    pub fn lookup(&self, kind: MessageKind) -> Option<Handler> {
        self.handlers.get(&kind).copied()
    }
}

/// `request::ClientID`: hand out the identity and a fresh nonce.
fn handle_client_id(server: &mut Server, client: ClientId, body: &[u8]) {
    let Some(_msg) = request::ClientId::decode_body(body) else {
        return;
    };
    let Some(record) = server.clients.get_mut(&client) else {
        return;
    };

    let nonce = record.make_new_nonce();
    tracing::debug!(client_id = client, "client identity requested");
    record.send_message(&response::ClientId { id: client, nonce });
}

/// `request::DataSocket`: try to promote this connection into the data
/// channel of the named main client.
fn handle_data_socket(server: &mut Server, candidate: ClientId, body: &[u8]) {
    let Some(msg) = request::DataSocket::decode_body(body) else {
        return;
    };

    let eligible = server
        .clients
        .get(&candidate)
        .map(|c| c.promotion_candidate())
        .unwrap_or(false)
        && msg.id != candidate;

    // The nonce is one-shot: a comparison, successful or not, spends it.
    let nonce_ok = eligible
        && server
            .clients
            .get_mut(&msg.id)
            .map(|main| !main.has_data_channel() && main.consume_nonce() == Some(msg.nonce))
            .unwrap_or(false);

    if nonce_ok {
        let frame = match framing::encode_message(&response::DataSocket { success: true }) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode handshake response");
                return;
            }
        };
        if server.turn_client_into_data_of(msg.id, candidate, frame) {
            return;
        }
    }

    tracing::debug!(
        client_id = candidate,
        claimed_id = msg.id,
        "data socket handshake rejected"
    );
    if let Some(record) = server.clients.get(&candidate) {
        record.send_message(&response::DataSocket { success: false });
    }
}

/// `request::SessionList`: report every running session.
fn handle_session_list(server: &mut Server, client: ClientId, body: &[u8]) {
    let Some(_msg) = request::SessionList::decode_body(body) else {
        return;
    };
    let Some(record) = server.clients.get(&client) else {
        return;
    };

    let mut sessions: Vec<_> = server.sessions.values().map(SessionData::summary).collect();
    sessions.sort_by(|a, b| a.created_unix.cmp(&b.created_unix).then(a.name.cmp(&b.name)));
    record.send_message(&response::SessionList { sessions });
}

/// `request::MakeSession`: spawn a child under a fresh PTY and record
/// the session. Name collisions and spawn failures are reported, not
/// recorded.
fn handle_make_session(server: &mut Server, client: ClientId, body: &[u8]) {
    let Some(msg) = request::MakeSession::decode_body(body) else {
        return;
    };

    let name = if msg.name.is_empty() {
        server.allocate_session_name()
    } else {
        msg.name.clone()
    };

    if server.sessions.contains_key(&name) {
        tracing::debug!(session = %name, "session name already taken");
        respond_make_session(server, client, name, false);
        return;
    }

    let opts = SpawnOptions::from(msg.spawn);
    let socket_path = server.socket_path.display().to_string();
    let process = match PtyProcess::spawn(&opts, &name, &socket_path) {
        Ok(process) => process,
        Err(e) => {
            tracing::warn!(session = %name, error = %e, "failed to spawn session process");
            respond_make_session(server, client, name, false);
            return;
        }
    };

    let session = SessionData::new(name.clone(), process);
    let reader = match session.process().take_reader() {
        Ok(reader) => reader,
        Err(e) => {
            tracing::warn!(session = %name, error = %e, "failed to open session output");
            respond_make_session(server, client, name, false);
            return;
        }
    };

    spawn_pty_reader(name.clone(), reader, server.event_tx.clone());
    server.create_callback(&session);
    server.sessions.insert(name.clone(), session);
    respond_make_session(server, client, name, true);
}

fn respond_make_session(server: &Server, client: ClientId, name: String, success: bool) {
    if let Some(record) = server.clients.get(&client) {
        record.send_message(&response::MakeSession { name, success });
    }
}

/// `request::Attach`: associate the client's data channel with a
/// session's PTY. A client without a bound data channel cannot attach.
fn handle_attach(server: &mut Server, client: ClientId, body: &[u8]) {
    let Some(msg) = request::Attach::decode_body(body) else {
        return;
    };

    let has_data = server
        .clients
        .get(&client)
        .map(|c| c.has_data_channel())
        .unwrap_or(false);
    if !has_data || !server.sessions.contains_key(&msg.name) {
        tracing::debug!(
            client_id = client,
            session = %msg.name,
            has_data,
            "attach rejected"
        );
        if let Some(record) = server.clients.get(&client) {
            record.send_message(&response::Attach {
                success: false,
                session: None,
            });
        }
        return;
    }

    // A client is attached to at most one session; switching detaches
    // from the previous one without a notification to the requester.
    let previous = server
        .clients
        .get(&client)
        .and_then(|c| c.attached_session().map(str::to_owned));
    if let Some(prev) = previous {
        if prev != msg.name {
            if let Some(session) = server.sessions.get_mut(&prev) {
                session.detach(client);
                server.client_detached(client, &prev);
            }
        }
    }

    let summary = {
        let Some(session) = server.sessions.get_mut(&msg.name) else {
            return;
        };
        session.attach(client);
        session.summary()
    };

    if let Some(record) = server.clients.get_mut(&client) {
        record.set_attached(msg.name.clone());
        record.send_message(&response::Attach {
            success: true,
            session: Some(summary),
        });
    }
    if let Some(session) = server.sessions.get(&msg.name) {
        server.client_attached(client, session);
    }
}

/// `request::Detach`: detach the latest or all clients of the
/// requester's session, then acknowledge.
///
/// `Latest` detaches the session's most recently attached client,
/// which is not necessarily the requester.
fn handle_detach(server: &mut Server, client: ClientId, body: &[u8]) {
    let Some(msg) = request::Detach::decode_body(body) else {
        return;
    };

    let attached = server
        .clients
        .get(&client)
        .and_then(|c| c.attached_session().map(str::to_owned));

    if let Some(name) = attached {
        let targets: Vec<ClientId> = match (msg.mode, server.sessions.get(&name)) {
            (DetachMode::All, Some(session)) => session.attached_clients().to_vec(),
            (DetachMode::Latest, Some(session)) => {
                session.latest_client().into_iter().collect()
            }
            (_, None) => Vec::new(),
        };
        for target in targets {
            server.detach_client_from(target, &name, DetachReason::Detach);
        }
    } else {
        tracing::debug!(client_id = client, "detach requested while unattached");
    }

    if let Some(record) = server.clients.get(&client) {
        record.send_message(&response::Detach {});
    }
}
