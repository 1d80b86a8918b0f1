//! elevate - command supervision without a pseudo-terminal
//!
//! This library runs a command as a child process and stays in the
//! foreground until it is gone: it forwards signals, mirrors job-control
//! stops, enforces an optional timeout and reports whether the command
//! could not be executed, exited, or was killed.
//!
//! # Overview
//!
//! The engine is policy-free. Session setup, the final exec step,
//! termination and terminal handling are delegated to an [`ExecHooks`]
//! implementation; [`SystemHooks`] is the default one.
//!
//! # Example
//!
//! ```no_run
//! use elevate::{run_command, CommandSpec, Outcome, SystemHooks};
//!
//! fn main() -> elevate::Result<()> {
//!     let mut spec = CommandSpec::new("/bin/ls", vec!["ls".into(), "-l".into()]);
//!     let mut hooks = SystemHooks::new();
//!     let mut outcome = Outcome::new();
//!
//!     run_command(&mut spec, &mut hooks, &mut outcome)?;
//!     std::process::exit(outcome.exit_code());
//! }
//! ```
//!
//! # Platform Support
//!
//! - **Linux**: everything, including ptrace interception on x86_64 and
//!   aarch64 when seccomp supports the `trace` action
//! - **macOS / BSD**: everything except ptrace interception

pub mod command;
pub mod error;
pub mod errpipe;
pub mod event;
pub mod exec;
pub mod fd;
pub mod hooks;
pub mod intercept;
pub mod outcome;
pub mod reaper;
pub mod signals;
pub mod supervisor;

// Re-exports for convenience
pub use command::{CommandSpec, ExecFlags};
pub use error::{ElevateError, Result};
pub use event::EventBase;
pub use hooks::{install_early_handlers, ExecHooks, SystemHooks, DEFAULT_KILL_GRACE};
pub use intercept::normalize_flags;
pub use intercept::types::Subcommand;
pub use outcome::{CommandStatus, Outcome, RawStatus};
pub use supervisor::run_command;
