//! Error types for the elevate library

use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort a supervised execution before an outcome exists.
///
/// Exec failures and wait statuses are not errors: they travel in the
/// [`Outcome`](crate::Outcome) record.
#[derive(Error, Debug)]
pub enum ElevateError {
    // Setup errors
    #[error("Unable to create {what}: {source}")]
    Channel {
        what: &'static str,
        source: nix::Error,
    },

    #[error("Unable to fork: {0}")]
    Fork(nix::Error),

    #[error("Unable to change signal mask: {0}")]
    SignalMask(nix::Error),

    #[error("Unable to install handler for {signal}: {source}")]
    SignalHandler {
        signal: &'static str,
        source: nix::Error,
    },

    #[error("Error in event loop: {0}")]
    EventLoop(nix::Error),

    #[error("Cannot prepare command for execution: {0}")]
    ExecPrepare(String),

    // Command errors
    #[error("No command specified")]
    NoCommand,

    #[error("Command not found: {program}: {reason}")]
    CommandNotFound { program: String, reason: String },

    // Configuration errors
    #[error("Failed to read config at {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Configuration parse error: {0}")]
    ConfigParse(String),

    // Supervisor socket errors
    #[error("Rendezvous socket error: {0}")]
    Socket(String),
}

/// Result type alias for elevate operations
pub type Result<T> = std::result::Result<T, ElevateError>;
