//! User configuration
//!
//! An optional TOML file with defaults for the command-line options:
//!
//! ```toml
//! [exec]
//! timeout = 600
//! log_subcommands = true
//! kill_grace_ms = 500
//!
//! [log]
//! level = "info"
//! ```
//!
//! Precedence: built-in defaults < config file < command-line flags.

use crate::cli::Cli;
use elevate::{ElevateError, ExecFlags, Result, DEFAULT_KILL_GRACE};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_LOG_LEVEL: &str = "warn";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub exec: ExecConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecConfig {
    /// Seconds
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub intercept: bool,
    #[serde(default)]
    pub log_subcommands: bool,
    #[serde(default)]
    pub use_ptrace: bool,
    #[serde(default)]
    pub kill_grace_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// A tracing filter directive such as `debug` or `elevate=trace`.
    #[serde(default)]
    pub level: Option<String>,
}

/// Effective settings after merging all sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub flags: ExecFlags,
    pub timeout: Option<Duration>,
    pub kill_grace: Duration,
    pub log_level: String,
}

/// `~/.config/elevate/config.toml` (platform config dir).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("elevate").join("config.toml"))
}

/// Load the configuration.
///
/// An explicit path must exist. The default location is optional: if it
/// is missing, built-in defaults apply.
pub fn load(explicit: Option<&Path>) -> Result<Config> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match default_config_path() {
            Some(path) if path.exists() => path,
            _ => return Ok(Config::default()),
        },
    };

    tracing::debug!("Loading configuration from: {}", path.display());
    let text = std::fs::read_to_string(&path)
        .map_err(|source| ElevateError::ConfigRead { path: path.clone(), source })?;
    parse(&text).map_err(|e| match e {
        ElevateError::ConfigParse(msg) => {
            ElevateError::ConfigParse(format!("{}: {}", path.display(), msg))
        }
        other => other,
    })
}

pub fn parse(text: &str) -> Result<Config> {
    toml::from_str(text).map_err(|e| ElevateError::ConfigParse(e.to_string()))
}

/// Apply command-line flags on top of the file configuration.
pub fn merge(config: &Config, cli: &Cli) -> Settings {
    let flags = ExecFlags {
        intercept: cli.intercept || config.exec.intercept,
        log_subcmds: cli.log_subcommands || config.exec.log_subcommands,
        use_ptrace: cli.ptrace || config.exec.use_ptrace,
        ..ExecFlags::default()
    };

    let timeout = cli
        .timeout
        .or(config.exec.timeout)
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs);

    let kill_grace = cli
        .kill_grace_ms
        .or(config.exec.kill_grace_ms)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_KILL_GRACE);

    let log_level = match cli.verbose {
        0 => config
            .log
            .level
            .clone()
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
        1 => "info".to_string(),
        2 => "debug".to_string(),
        _ => "trace".to_string(),
    };

    Settings {
        flags,
        timeout,
        kill_grace,
        log_level,
    }
}
