//! CLI output styling for elevate

use colored::Colorize;
use elevate::ElevateError;
use nix::errno::Errno;
use std::io::IsTerminal;
use std::path::Path;

fn prefix() -> String {
    if std::io::stderr().is_terminal() {
        "elevate:".red().bold().to_string()
    } else {
        "elevate:".to_string()
    }
}

/// Report a fatal error.
pub fn print_error(err: &ElevateError) {
    eprintln!("{} {}", prefix(), err);
}

/// The exec-failure line, without styling.
pub fn exec_error_message(program: &Path, errno: Errno) -> String {
    format!("unable to execute {}: {}", program.display(), errno.desc())
}

/// Report that the command could not be started.
pub fn print_exec_error(program: &Path, errno: Errno, silent: bool) {
    if silent {
        return;
    }
    eprintln!("{} {}", prefix(), exec_error_message(program, errno));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_error_message() {
        let msg = exec_error_message(Path::new("/no/such"), Errno::ENOENT);
        assert_eq!(msg, "unable to execute /no/such: No such file or directory");
    }
}
