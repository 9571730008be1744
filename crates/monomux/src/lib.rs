//! MonoMux: a terminal session multiplexer.
//!
//! A background server owns long-lived child processes running under
//! pseudo-terminals; short-lived clients attach to those sessions and
//! relay the user's terminal bytes. The byte stream is opaque: no escape
//! sequence is ever parsed. Sessions outlive their clients; disconnecting
//! leaves the child process and its PTY intact for later re-attachment.

pub mod channel;
pub mod client;
pub mod config;
pub mod pty;
pub mod server;
