//! Error types for zfs-unlocker.
//!
//! Only conditions the program cannot recover from on its own become errors.
//! Connection failures, read timeouts and unclassifiable output are handled
//! inside the session state machine by reconnecting, and never surface here.

use std::io;
use thiserror::Error;

/// Main error type for zfs-unlocker operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Destination string parse errors, fatal at startup
    #[error("Destination error: {0}")]
    Destination(#[from] DestinationError),

    /// Per-target session errors the machine cannot retry
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Passphrase intake errors
    #[error("Passphrase error: {0}")]
    Passphrase(#[from] PassphraseError),
}

/// Errors parsing a `[user@]host[:port]` destination string.
#[derive(Error, Debug)]
pub enum DestinationError {
    /// The string matches none of the accepted forms
    #[error("invalid ssh destination {input:?}")]
    InvalidSyntax { input: String },

    /// A port suffix was present but out of range
    #[error("invalid port in ssh destination {input:?}")]
    InvalidPort { input: String },

    /// No user in the string, no default given, and the current OS user
    /// could not be resolved
    #[error("could not determine a user for ssh destination {input:?}")]
    UnknownUser { input: String },

    /// A target group needs at least one destination
    #[error("a target needs at least one destination")]
    EmptyGroup,
}

/// Fatal session errors, reserved for conditions the state machine cannot
/// map to a reconnect (like a missing client binary).
#[derive(Error, Debug)]
pub enum SessionError {
    /// The remote-login client process could not be started at all
    #[error("failed to spawn {program:?}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The child was spawned without one of its piped streams
    #[error("child process spawned without a piped {0} stream")]
    MissingStream(&'static str),

    /// The task running a session machine was cancelled or panicked
    #[error("session task aborted: {0}")]
    Aborted(#[from] tokio::task::JoinError),
}

/// Errors reading the passphrase from standard input.
#[derive(Error, Debug)]
pub enum PassphraseError {
    /// Standard input closed before a first line arrived
    #[error("no passphrase line on standard input")]
    MissingFirstLine,

    /// I/O error while reading standard input
    #[error("failed to read passphrase: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias using zfs-unlocker's Error.
pub type Result<T> = std::result::Result<T, Error>;
