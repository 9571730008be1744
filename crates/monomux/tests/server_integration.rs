//! End-to-end tests over a real server on a temporary socket.
//!
//! Each test binds its own server in-process, connects real clients
//! through the Unix socket, and drives the wire protocol the way the
//! CLI does. Sessions run /bin/sh; dropping the server at the end of a
//! test closes every PTY master, which hangs up the children.

use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use monomux::client::{self, ControlClient, SessionClient};
use monomux::server::{Server, ServerHandle};
use protocol::messages::{request, response, DetachMode, DetachReason, SpawnRequest};

const WAIT: Duration = Duration::from_secs(10);

struct TestServer {
    /// Keeps the socket directory alive for the duration of the test.
    _dir: TempDir,
    socket: PathBuf,
    handle: ServerHandle,
    join: JoinHandle<()>,
}

async fn start_server() -> TestServer {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("server.sock");
    let mut server = Server::bind(socket.clone()).unwrap();
    let handle = server.handle();
    let join = tokio::spawn(async move {
        let _ = server.run().await;
    });
    TestServer {
        _dir: dir,
        socket,
        handle,
        join,
    }
}

fn shell_spawn() -> SpawnRequest {
    SpawnRequest {
        program: "/bin/sh".to_string(),
        ..Default::default()
    }
}

async fn connect(server: &TestServer) -> SessionClient {
    timeout(WAIT, client::handshake(&server.socket))
        .await
        .expect("handshake timed out")
        .expect("handshake failed")
}

#[tokio::test]
async fn test_cold_start_create_and_list() {
    let server = start_server().await;

    // Two-socket handshake: identity, nonce, data channel binding.
    let mut mux = connect(&server).await;
    assert_eq!(mux.id(), 1);

    // Empty name: the server assigns the smallest free integer.
    let made = mux.make_session("", shell_spawn()).await.unwrap();
    assert!(made.success);
    assert_eq!(made.name, "1");

    let sessions = mux.list_sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].name, "1");
    assert!(sessions[0].created_unix > 0);

    server.handle.shutdown().await;
    let _ = timeout(WAIT, server.join).await;
}

#[tokio::test]
async fn test_duplicate_session_name_rejected() {
    let server = start_server().await;

    let mut first = connect(&server).await;
    let made = first.make_session("", shell_spawn()).await.unwrap();
    assert!(made.success);
    assert_eq!(made.name, "1");

    let mut second = connect(&server).await;
    let duplicate = second.make_session("1", shell_spawn()).await.unwrap();
    assert!(!duplicate.success);
    assert_eq!(duplicate.name, "1");

    // The failed creation recorded nothing.
    let sessions = second.list_sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);

    server.handle.shutdown().await;
    let _ = timeout(WAIT, server.join).await;
}

#[tokio::test]
async fn test_nonce_misuse_rejected() {
    let server = start_server().await;

    // Client A obtains an identity and nonce but does not use them yet.
    let mut ctrl_a = ControlClient::connect(&server.socket).await.unwrap();
    let identity: response::ClientId = ctrl_a
        .round_trip(&request::ClientId {})
        .await
        .unwrap();

    // Client B tries to steal the data channel with a wrong nonce.
    let mut thief = ControlClient::connect(&server.socket).await.unwrap();
    let stolen: response::DataSocket = thief
        .round_trip(&request::DataSocket {
            id: identity.id,
            nonce: identity.nonce.wrapping_add(1),
        })
        .await
        .unwrap();
    assert!(!stolen.success);

    // A still has no data channel, so attaching must fail.
    let mut maker = connect(&server).await;
    let made = maker.make_session("target", shell_spawn()).await.unwrap();
    assert!(made.success);

    let refused: response::Attach = ctrl_a
        .round_trip(&request::Attach {
            name: "target".to_string(),
        })
        .await
        .unwrap();
    assert!(!refused.success);

    // The failed attempt spent the nonce; a fresh identity request
    // yields a new one that binds successfully.
    let renewed: response::ClientId = ctrl_a
        .round_trip(&request::ClientId {})
        .await
        .unwrap();
    assert_eq!(renewed.id, identity.id);
    assert_ne!(renewed.nonce, identity.nonce);

    let mut candidate = ControlClient::connect(&server.socket).await.unwrap();
    let bound: response::DataSocket = candidate
        .round_trip(&request::DataSocket {
            id: renewed.id,
            nonce: renewed.nonce,
        })
        .await
        .unwrap();
    assert!(bound.success);

    server.handle.shutdown().await;
    let _ = timeout(WAIT, server.join).await;
}

#[tokio::test]
async fn test_detach_all_empties_session_but_keeps_it() {
    let server = start_server().await;

    let mut a = connect(&server).await;
    let made = a.make_session("shared", shell_spawn()).await.unwrap();
    assert!(made.success);
    assert!(a.attach("shared").await.unwrap().success);

    let mut b = connect(&server).await;
    assert!(b.attach("shared").await.unwrap().success);
    let mut c = connect(&server).await;
    assert!(c.attach("shared").await.unwrap().success);

    a.detach(DetachMode::All).await.unwrap();

    // Every attached client is pushed a detach notification.
    let reason_b = timeout(WAIT, b.wait_detached()).await.unwrap().unwrap();
    assert_eq!(reason_b, DetachReason::Detach);
    let reason_c = timeout(WAIT, c.wait_detached()).await.unwrap().unwrap();
    assert_eq!(reason_c, DetachReason::Detach);

    // The session survives with no attachments; re-attaching works.
    let sessions = a.list_sessions().await.unwrap();
    assert!(sessions.iter().any(|s| s.name == "shared"));
    assert!(b.attach("shared").await.unwrap().success);

    server.handle.shutdown().await;
    let _ = timeout(WAIT, server.join).await;
}

#[tokio::test]
async fn test_detach_latest_targets_most_recent_attachment() {
    let server = start_server().await;

    let mut a = connect(&server).await;
    assert!(a.make_session("s", shell_spawn()).await.unwrap().success);
    assert!(a.attach("s").await.unwrap().success);

    let mut b = connect(&server).await;
    assert!(b.attach("s").await.unwrap().success);

    // B is the latest attachment, so A's request detaches B, not A.
    a.detach(DetachMode::Latest).await.unwrap();
    let reason = timeout(WAIT, b.wait_detached()).await.unwrap().unwrap();
    assert_eq!(reason, DetachReason::Detach);

    // A remains attached: a second Latest detach now targets A itself.
    a.detach(DetachMode::Latest).await.unwrap();
    let reason = timeout(WAIT, a.wait_detached()).await.unwrap().unwrap();
    assert_eq!(reason, DetachReason::Detach);

    server.handle.shutdown().await;
    let _ = timeout(WAIT, server.join).await;
}

#[tokio::test]
async fn test_session_outlives_disconnected_client() {
    let server = start_server().await;

    {
        let mut ephemeral = connect(&server).await;
        let made = ephemeral
            .make_session("durable", shell_spawn())
            .await
            .unwrap();
        assert!(made.success);
        assert!(ephemeral.attach("durable").await.unwrap().success);
        // Both connections drop here without any detach request.
    }

    // A later client finds the session intact and attaches.
    let mut revenant = connect(&server).await;
    let sessions = revenant.list_sessions().await.unwrap();
    assert!(sessions.iter().any(|s| s.name == "durable"));
    assert!(revenant.attach("durable").await.unwrap().success);

    server.handle.shutdown().await;
    let _ = timeout(WAIT, server.join).await;
}

#[tokio::test]
async fn test_data_relay_round_trip() {
    let server = start_server().await;

    let mut mux = connect(&server).await;
    assert!(mux.make_session("io", shell_spawn()).await.unwrap().success);
    assert!(mux.attach("io").await.unwrap().success);

    // Terminal input travels data socket -> PTY; the shell's output
    // travels PTY -> data socket.
    mux.write_data(b"echo mux_relay_marker\n").await.unwrap();

    let mut seen = Vec::new();
    let found = timeout(WAIT, async {
        let mut buf = [0u8; 1024];
        loop {
            let n = mux.read_data(&mut buf).await.unwrap();
            if n == 0 {
                return false;
            }
            seen.extend_from_slice(&buf[..n]);
            if String::from_utf8_lossy(&seen).contains("mux_relay_marker") {
                return true;
            }
        }
    })
    .await
    .expect("no session output before timeout");
    assert!(found, "output was: {}", String::from_utf8_lossy(&seen));

    server.handle.shutdown().await;
    let _ = timeout(WAIT, server.join).await;
}

#[tokio::test]
async fn test_session_exit_detaches_clients() {
    let server = start_server().await;

    let mut mux = connect(&server).await;
    let spawn = SpawnRequest {
        program: "/bin/sh".to_string(),
        args: vec!["-c".to_string(), "sleep 0.2; exit 0".to_string()],
        ..Default::default()
    };
    assert!(mux.make_session("brief", spawn).await.unwrap().success);
    assert!(mux.attach("brief").await.unwrap().success);

    // The child exits on its own; the server observes it and pushes
    // the exit detach.
    let reason = timeout(WAIT, mux.wait_detached()).await.unwrap().unwrap();
    assert_eq!(reason, DetachReason::Exit);

    // The dead session is gone from the listing.
    let sessions = mux.list_sessions().await.unwrap();
    assert!(!sessions.iter().any(|s| s.name == "brief"));

    server.handle.shutdown().await;
    let _ = timeout(WAIT, server.join).await;
}

#[tokio::test]
async fn test_attach_without_data_channel_rejected() {
    let server = start_server().await;

    let mut maker = connect(&server).await;
    assert!(maker.make_session("s", shell_spawn()).await.unwrap().success);

    // A control-only client (no data channel bound) cannot attach.
    let mut bare = ControlClient::connect(&server.socket).await.unwrap();
    let refused: response::Attach = bare
        .round_trip(&request::Attach {
            name: "s".to_string(),
        })
        .await
        .unwrap();
    assert!(!refused.success);
    assert!(refused.session.is_none());

    server.handle.shutdown().await;
    let _ = timeout(WAIT, server.join).await;
}

#[tokio::test]
async fn test_attach_missing_session_rejected() {
    let server = start_server().await;

    let mut mux = connect(&server).await;
    let refused = mux.attach("no-such-session").await.unwrap();
    assert!(!refused.success);
    assert!(refused.session.is_none());

    server.handle.shutdown().await;
    let _ = timeout(WAIT, server.join).await;
}

#[tokio::test]
async fn test_shutdown_notifies_clients_and_unlinks_socket() {
    let server = start_server().await;

    let mut mux = connect(&server).await;
    assert!(mux.make_session("s", shell_spawn()).await.unwrap().success);
    assert!(mux.attach("s").await.unwrap().success);

    server.handle.shutdown().await;

    let reason = timeout(WAIT, mux.wait_detached()).await.unwrap().unwrap();
    assert_eq!(reason, DetachReason::ServerShutdown);

    timeout(WAIT, server.join)
        .await
        .expect("server did not stop")
        .unwrap();
    assert!(!server.socket.exists());
}

#[tokio::test]
async fn test_stillborn_candidate_never_promoted() {
    let server = start_server().await;

    let mut ctrl = ControlClient::connect(&server.socket).await.unwrap();
    let identity: response::ClientId = ctrl
        .round_trip(&request::ClientId {})
        .await
        .unwrap();

    // The would-be data connection speaks first about something else,
    // which permanently disqualifies it from promotion.
    let mut candidate = ControlClient::connect(&server.socket).await.unwrap();
    let _listing: response::SessionList = candidate
        .round_trip(&request::SessionList {})
        .await
        .unwrap();

    let refused: response::DataSocket = candidate
        .round_trip(&request::DataSocket {
            id: identity.id,
            nonce: identity.nonce,
        })
        .await
        .unwrap();
    assert!(!refused.success);

    server.handle.shutdown().await;
    let _ = timeout(WAIT, server.join).await;
}
