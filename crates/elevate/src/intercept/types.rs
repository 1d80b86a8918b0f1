//! Interception IPC types
//!
//! Messages exchanged between the supervisor and a helper running inside the
//! supervised command over the rendezvous socket.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A command started by the supervised command or one of its descendants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subcommand {
    /// Process that is about to exec
    pub pid: i32,
    /// Path passed to `execve`
    pub path: PathBuf,
    /// Argument vector, lossily decoded
    pub argv: Vec<String>,
}

/// IPC message sent from the helper to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterceptMessage {
    /// The sender is about to execute a new program.
    Exec {
        pid: i32,
        path: PathBuf,
        argv: Vec<String>,
    },
}

impl InterceptMessage {
    pub fn into_subcommand(self) -> Subcommand {
        match self {
            InterceptMessage::Exec { pid, path, argv } => Subcommand { pid, path, argv },
        }
    }
}

/// IPC message sent from the supervisor to the helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterceptResponse {
    /// The exec was recorded; the helper may proceed.
    Ack,
}
