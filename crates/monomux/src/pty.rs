//! Process launching, with or without a pseudo-terminal.
//!
//! Sessions run their child under a fresh PTY whose master stays with
//! the server for the session's lifetime. The environment the child
//! sees is the server's, overlaid with the caller's set/unset lists and
//! the MonoMux injection variables.

use std::io::{Read, Write};
use std::process::{Command, Stdio};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;

use crate::config;

/// Default terminal geometry for a fresh session.
const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 80;

/// Errors from spawning a session process.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// No program was given to execute.
    #[error("empty program name")]
    EmptyProgram,

    /// Opening the PTY pair failed.
    #[error("failed to open PTY: {0}")]
    OpenPty(String),

    /// Forking or executing the child failed.
    #[error("failed to spawn {program}: {reason}")]
    Spawn {
        /// The program that could not be started.
        program: String,
        /// Underlying failure description.
        reason: String,
    },

    /// I/O error while wiring up the PTY.
    #[error("PTY I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How to launch a child process.
///
/// Whether the child runs under a PTY is the choice of entry point:
/// [`PtyProcess::spawn`] for session children, [`spawn_detached`] for
/// plain background processes.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Path or name of the program to execute.
    pub program: String,
    /// Argument vector, not including the program name.
    pub args: Vec<String>,
    /// Environment variables to set on top of the inherited environment.
    pub set_env: Vec<(String, String)>,
    /// Environment variable names to remove.
    pub unset_env: Vec<String>,
}

impl From<protocol::messages::SpawnRequest> for SpawnOptions {
    fn from(req: protocol::messages::SpawnRequest) -> Self {
        Self {
            program: req.program,
            args: req.args,
            set_env: req.set_env,
            unset_env: req.unset_env,
        }
    }
}

/// A child process running under a PTY the caller owns.
///
/// Dropping the value closes the master, which delivers SIGHUP to the
/// child's foreground process group.
pub struct PtyProcess {
    child: Box<dyn Child + Send + Sync>,
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    pid: Option<u32>,
}

impl PtyProcess {
    /// Opens a PTY, spawns `opts.program` on its slave side, and returns
    /// the running process with the master retained.
    ///
    /// `session_name` and `socket_path` are injected into the child's
    /// environment as [`config::SESSION_ENV_VAR`] and
    /// [`config::SOCKET_ENV_VAR`].
    pub fn spawn(
        opts: &SpawnOptions,
        session_name: &str,
        socket_path: &str,
    ) -> Result<Self, SpawnError> {
        if opts.program.is_empty() {
            return Err(SpawnError::EmptyProgram);
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: DEFAULT_ROWS,
                cols: DEFAULT_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SpawnError::OpenPty(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&opts.program);
        cmd.args(&opts.args);
        for (key, value) in &opts.set_env {
            cmd.env(key, value);
        }
        for key in &opts.unset_env {
            cmd.env_remove(key);
        }
        cmd.env(config::SESSION_ENV_VAR, session_name);
        cmd.env(config::SOCKET_ENV_VAR, socket_path);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SpawnError::Spawn {
                program: opts.program.clone(),
                reason: e.to_string(),
            })?;
        // The slave end lives on inside the child.
        drop(pair.slave);

        let pid = child.process_id();
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SpawnError::OpenPty(e.to_string()))?;

        tracing::debug!(program = %opts.program, pid = ?pid, "spawned session process");

        Ok(Self {
            child,
            master: pair.master,
            writer,
            pid,
        })
    }

    /// The child's process id, if the platform reported one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Clones a reader over the PTY master for the output pump.
    pub fn take_reader(&self) -> Result<Box<dyn Read + Send>, SpawnError> {
        self.master
            .try_clone_reader()
            .map_err(|e| SpawnError::OpenPty(e.to_string()))
    }

    /// Writes client bytes into the PTY (the child's terminal input).
    pub fn write_input(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()
    }

    /// Checks whether the child has exited, without blocking.
    pub fn try_wait(&mut self) -> std::io::Result<Option<portable_pty::ExitStatus>> {
        self.child.try_wait()
    }
}

/// Spawns a program detached from the current terminal and session.
///
/// Used to launch the background server from a client that found no
/// server listening. The child owns no descriptor of ours; the parent
/// only learns the pid.
pub fn spawn_detached(program: &str, args: &[String]) -> std::io::Result<u32> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    Ok(child.id())
}
