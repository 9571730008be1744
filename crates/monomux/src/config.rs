//! Environment-derived configuration: socket location, injected
//! variables, default shell.
//!
//! There is one server per user; the socket path is derived from the
//! invoking user's identity and can be overridden through
//! `MONOMUX_SOCKET`, which is also how a process running inside a
//! session finds its host server.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Environment variable naming the session a child process runs in.
///
/// Injected into every session's child. Part of the compatibility
/// surface: nested tooling keys off the exact name.
pub const SESSION_ENV_VAR: &str = "MONOMUX_SESSION";

/// Environment variable carrying the server socket path.
///
/// Injected into every session's child, and honored as an override when
/// deriving the socket path.
pub const SOCKET_ENV_VAR: &str = "MONOMUX_SOCKET";

/// Returns the path of the server's listening socket for this user.
///
/// Resolution order: `$MONOMUX_SOCKET`, then
/// `$XDG_RUNTIME_DIR/monomux/server.sock`, then
/// `/tmp/monomux-<uid>/server.sock`.
pub fn server_socket_path() -> PathBuf {
    if let Ok(path) = std::env::var(SOCKET_ENV_VAR) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        if !runtime_dir.is_empty() {
            return PathBuf::from(runtime_dir).join("monomux").join("server.sock");
        }
    }

    let uid = nix::unistd::Uid::current();
    PathBuf::from(format!("/tmp/monomux-{}", uid)).join("server.sock")
}

/// Creates the socket's parent directory with user-only permissions.
///
/// Socket access control is filesystem permissions; the directory is the
/// enforcement point.
pub fn prepare_socket_dir(socket_path: &Path) -> io::Result<()> {
    let Some(parent) = socket_path.parent() else {
        return Ok(());
    };
    if !parent.exists() {
        fs::create_dir_all(parent)?;
    }
    fs::set_permissions(parent, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

/// Restricts a bound socket file to the owning user.
pub fn restrict_socket_file(socket_path: &Path) -> io::Result<()> {
    fs::set_permissions(socket_path, fs::Permissions::from_mode(0o600))
}

/// Returns the user's shell, falling back to `/bin/sh`.
pub fn default_shell() -> String {
    match std::env::var("SHELL") {
        Ok(shell) if !shell.is_empty() => shell,
        _ => "/bin/sh".to_string(),
    }
}

/// Whether the current process already runs inside a MonoMux session.
pub fn inside_session() -> bool {
    std::env::var(SESSION_ENV_VAR).map_or(false, |v| !v.is_empty())
}
