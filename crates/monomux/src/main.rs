//! MonoMux command-line entry point.
//!
//! With `--server`, serves sessions in the foreground. Without it, runs
//! as a client: connects to the per-user server (starting one in the
//! background if none is listening), picks or creates a session, and
//! relays the terminal until detach or session end.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use monomux::client::{self, ClientError, RelayEnd, SessionClient};
use monomux::config;
use monomux::pty;
use monomux::server::Server;
use protocol::messages::SpawnRequest;

/// Bound on client retries, both for reaching a just-spawned server's
/// socket and for re-running a transiently failed handshake.
const HANDSHAKE_RETRIES: u32 = 5;

/// Terminal session multiplexer. Sessions keep running when every
/// client has disconnected; reconnect at any time.
#[derive(Parser, Debug)]
#[command(name = "monomux")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Run the server in the foreground of this process
    #[arg(long)]
    server: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Program (and arguments) to run in a new session
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    program: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if cli.server {
        run_server().await
    } else {
        run_client(cli.program).await
    }
}

/// Serves in the foreground until a termination signal.
async fn run_server() -> anyhow::Result<()> {
    let socket_path = config::server_socket_path();
    let mut server = Server::bind(socket_path)?;
    server.run().await
}

/// Connects, selects a session, and relays the terminal.
async fn run_client(program: Vec<String>) -> anyhow::Result<()> {
    let socket_path = config::server_socket_path();
    if config::inside_session() {
        tracing::warn!("already running inside a MonoMux session");
    }

    let mut session_client = connect_or_spawn_server(&socket_path).await?;

    let target = select_session(&mut session_client, &program).await?;
    let attached = session_client.attach(&target).await?;
    anyhow::ensure!(attached.success, "failed to attach to session '{}'", target);

    match session_client.relay_stdio().await? {
        RelayEnd::Detached(reason) => println!("\r\n[monomux: {}]", reason),
        RelayEnd::SessionClosed => println!("\r\n[monomux: session ended]"),
        RelayEnd::InputClosed => println!("\r\n[monomux: input closed, detaching]"),
    }
    Ok(())
}

/// Picks the session to attach to, creating one when needed.
///
/// With program arguments, a new session runs that program. Without
/// them: the most recently created existing session, or a fresh
/// default-shell session when none exist.
async fn select_session(
    session_client: &mut SessionClient,
    program: &[String],
) -> anyhow::Result<String> {
    if let Some((cmd, args)) = program.split_first() {
        let spawn = SpawnRequest {
            program: cmd.clone(),
            args: args.to_vec(),
            ..Default::default()
        };
        let made = session_client.make_session("", spawn).await?;
        anyhow::ensure!(made.success, "server could not create session '{}'", made.name);
        return Ok(made.name);
    }

    let sessions = session_client.list_sessions().await?;
    if let Some(latest) = sessions.iter().max_by_key(|s| s.created_unix) {
        if sessions.len() > 1 {
            println!("Sessions on this server:");
            for session in &sessions {
                println!("    {}", session.name);
            }
        }
        println!("Attaching to session '{}'.", latest.name);
        return Ok(latest.name.clone());
    }

    let spawn = SpawnRequest {
        program: config::default_shell(),
        ..Default::default()
    };
    let made = session_client.make_session("", spawn).await?;
    anyhow::ensure!(made.success, "server could not create session '{}'", made.name);
    Ok(made.name)
}

/// Runs the two-socket handshake, retrying post-connect failures with
/// the same bounded backoff used for server startup.
///
/// A connect failure is returned immediately: it means no server is
/// listening, and the caller decides whether to spawn one.
async fn handshake_with_retry(socket_path: &Path) -> Result<SessionClient, ClientError> {
    let mut attempt = 1;
    loop {
        match client::handshake(socket_path).await {
            Ok(session_client) => return Ok(session_client),
            Err(e @ ClientError::Connect(_)) => return Err(e),
            Err(e) if attempt < HANDSHAKE_RETRIES => {
                tracing::debug!(attempt, error = %e, "handshake failed, retrying");
                attempt += 1;
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Handshakes with the server, starting one in the background first if
/// nothing is listening on the socket.
async fn connect_or_spawn_server(socket_path: &Path) -> anyhow::Result<SessionClient> {
    match handshake_with_retry(socket_path).await {
        Ok(session_client) => return Ok(session_client),
        Err(ClientError::Connect(e)) => {
            tracing::info!(error = %e, "no server reachable, starting one");
        }
        Err(e) => return Err(e.into()),
    }

    let exe = std::env::current_exe().context("locating own executable")?;
    pty::spawn_detached(&exe.to_string_lossy(), &["--server".to_string()])
        .context("starting background server")?;

    // The fresh server needs a moment to bind its socket.
    let mut last_error: Option<ClientError> = None;
    for attempt in 1..=HANDSHAKE_RETRIES {
        tokio::time::sleep(Duration::from_secs(1)).await;
        match handshake_with_retry(socket_path).await {
            Ok(session_client) => return Ok(session_client),
            Err(e @ ClientError::Connect(_)) => {
                tracing::debug!(attempt, error = %e, "server not ready yet");
                last_error = Some(e);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(anyhow::Error::from(
        last_error.unwrap_or(ClientError::Disconnected),
    ))
    .context("connection failed after enough retries")
}
