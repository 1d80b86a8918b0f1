//! CLI argument definitions for elevate
//!
//! Uses clap for argument parsing. Everything after the options is the
//! command to run.

use clap::{ArgAction, Parser};
use std::ffi::OsString;
use std::path::PathBuf;

/// elevate - run a command and stay in charge of it
///
/// Forwards signals, mirrors job-control stops and enforces a timeout
/// while the command runs.
#[derive(Parser, Debug)]
#[command(name = "elevate")]
#[command(author, version, about, long_about = None)]
#[command(trailing_var_arg = true)]
#[command(after_help = "EXAMPLES:
    # Run a command
    elevate -- id -u

    # Give up after 30 seconds
    elevate --timeout 30 -- make check

    # Log every program the command starts
    elevate --log-subcommands -v -- ./build.sh

    # Observe sub-commands through ptrace instead of a helper
    elevate --intercept --ptrace -- ./install.sh
")]
pub struct Cli {
    /// Terminate the command after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Observe programs started by the command
    #[arg(long)]
    pub intercept: bool,

    /// Log programs started by the command
    #[arg(long)]
    pub log_subcommands: bool,

    /// Use ptrace for interception when the kernel supports it
    #[arg(long)]
    pub ptrace: bool,

    /// Configuration file (default: ~/.config/elevate/config.toml)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Milliseconds between asking the command to stop and killing it
    #[arg(long, value_name = "MS")]
    pub kill_grace_ms: Option<u64>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(long, short = 'v', action = ArgAction::Count)]
    pub verbose: u8,

    /// Silent mode - suppress elevate's own diagnostics
    #[arg(long, short = 's')]
    pub silent: bool,

    /// Command to run, followed by its arguments
    #[arg(required = true, value_name = "COMMAND", allow_hyphen_values = true)]
    pub command: Vec<OsString>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_and_command() {
        let cli = Cli::try_parse_from([
            "elevate",
            "--timeout",
            "5",
            "--intercept",
            "-vv",
            "--",
            "ls",
            "-l",
        ])
        .expect("parse");
        assert_eq!(cli.timeout, Some(5));
        assert!(cli.intercept);
        assert!(!cli.ptrace);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.command, vec![OsString::from("ls"), OsString::from("-l")]);
    }

    #[test]
    fn test_command_flags_are_not_ours() {
        let cli = Cli::try_parse_from(["elevate", "grep", "-s", "--timeout", "x"]).expect("parse");
        assert!(!cli.silent);
        assert_eq!(cli.timeout, None);
        assert_eq!(cli.command.len(), 4);
    }

    #[test]
    fn test_command_required() {
        assert!(Cli::try_parse_from(["elevate", "--ptrace"]).is_err());
    }

    #[test]
    fn test_config_and_grace() {
        let cli = Cli::try_parse_from([
            "elevate",
            "--config",
            "/tmp/e.toml",
            "--kill-grace-ms",
            "250",
            "-s",
            "true",
        ])
        .expect("parse");
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/e.toml")));
        assert_eq!(cli.kill_grace_ms, Some(250));
        assert!(cli.silent);
    }
}
