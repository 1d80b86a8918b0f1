//! elevate CLI - run a command under the elevate supervisor
//!
//! This is the CLI binary that uses the elevate library to fork, supervise
//! and reap a single command.

mod cli;
mod config;
mod output;

use clap::Parser;
use cli::Cli;
use config::Settings;
use elevate::{
    install_early_handlers, normalize_flags, run_command, CommandSpec, CommandStatus,
    ElevateError, Outcome, Result, SystemHooks,
};
use std::ffi::OsStr;
use std::path::PathBuf;
use tracing::{debug, error, warn};
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    // Nothing is logged before the subscriber exists, so configuration
    // errors go straight to the user.
    let settings = match load_settings(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            output::print_error(&e);
            std::process::exit(1);
        }
    };
    init_logging(&settings.log_level);

    match run(&cli, &settings) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{}", e);
            output::print_error(&e);
            std::process::exit(1);
        }
    }
}

/// Configuration file merged with the command line.
fn load_settings(cli: &Cli) -> Result<Settings> {
    let config = config::load(cli.config.as_deref())?;
    Ok(config::merge(&config, cli))
}

/// `RUST_LOG` wins over the configured level.
fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Resolve `program` through `PATH`.
fn resolve_program(program: &OsStr) -> Result<PathBuf> {
    which::which(program).map_err(|e| ElevateError::CommandNotFound {
        program: program.to_string_lossy().into_owned(),
        reason: e.to_string(),
    })
}

fn run(cli: &Cli, settings: &Settings) -> Result<i32> {
    install_early_handlers()?;

    let program_name = cli.command.first().ok_or(ElevateError::NoCommand)?;
    let program = resolve_program(program_name)?;

    let mut flags = settings.flags;
    normalize_flags(&mut flags);

    let mut spec = CommandSpec::new(&program, cli.command.clone()).with_flags(flags);
    if let Some(timeout) = settings.timeout {
        spec = spec.with_timeout(timeout);
    }

    let mut hooks = SystemHooks::new().with_kill_grace(settings.kill_grace);
    let mut outcome = Outcome::new();
    run_command(&mut spec, &mut hooks, &mut outcome)?;

    match outcome.status() {
        CommandStatus::ExecError(errno) => {
            output::print_exec_error(&program, errno, cli.silent);
        }
        CommandStatus::WaitStatus(raw) => debug!("{} {}", program.display(), raw),
        CommandStatus::Unset => warn!("unable to determine what became of {}", program.display()),
    }
    Ok(outcome.exit_code())
}
