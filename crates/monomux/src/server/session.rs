//! Per-running-session state.
//!
//! A session is a named child process under a PTY. It is created by a
//! `MakeSession` request and destroyed only when its child exits; the
//! set of attached clients shrinking to zero does not end the session.

use std::time::{SystemTime, UNIX_EPOCH};

use protocol::messages::SessionSummary;

use crate::pty::PtyProcess;
use crate::server::client::ClientId;

/// State the server tracks for one running session.
pub struct SessionData {
    name: String,
    created: SystemTime,
    process: PtyProcess,
    /// Attached clients in attachment order; the last entry is the
    /// "latest" client.
    attachments: Vec<ClientId>,
}

impl SessionData {
    /// Creates the record for a freshly spawned session.
    pub fn new(name: String, process: PtyProcess) -> Self {
        Self {
            name,
            created: SystemTime::now(),
            process,
            attachments: Vec::new(),
        }
    }

    /// The session's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// When the session was created.
    pub fn when_created(&self) -> SystemTime {
        self.created
    }

    /// Creation time as seconds since the Unix epoch.
    pub fn created_unix(&self) -> u64 {
        self.created
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// The session's child process.
    pub fn process_mut(&mut self) -> &mut PtyProcess {
        &mut self.process
    }

    /// Immutable access to the child process.
    pub fn process(&self) -> &PtyProcess {
        &self.process
    }

    /// Records `client` as attached. Re-attaching is a no-op; the
    /// original position in the order is kept.
    pub fn attach(&mut self, client: ClientId) {
        if !self.attachments.contains(&client) {
            self.attachments.push(client);
        }
    }

    /// Removes `client` from the attachment list.
    ///
    /// Returns whether the client had been attached.
    pub fn detach(&mut self, client: ClientId) -> bool {
        let before = self.attachments.len();
        self.attachments.retain(|&id| id != client);
        self.attachments.len() != before
    }

    /// Attached clients in attachment order.
    pub fn attached_clients(&self) -> &[ClientId] {
        &self.attachments
    }

    /// The most recently attached client still present.
    pub fn latest_client(&self) -> Option<ClientId> {
        self.attachments.last().copied()
    }

    /// The session as reported to clients.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            name: self.name.clone(),
            created_unix: self.created_unix(),
        }
    }
}
