//! The single result value a supervised execution produces.

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use std::fmt;
use tracing::warn;

/// A raw encoded wait status as returned by `waitpid(2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawStatus(pub i32);

impl RawStatus {
    /// Status of a process that exited normally with `code`.
    pub fn from_exit(code: u8) -> Self {
        RawStatus(i32::from(code) << 8)
    }

    /// Status of a process that was terminated by `signal`.
    pub fn from_signal(signal: Signal) -> Self {
        RawStatus(signal as i32 & 0x7f)
    }

    pub fn exited(self) -> bool {
        libc::WIFEXITED(self.0)
    }

    pub fn signaled(self) -> bool {
        libc::WIFSIGNALED(self.0)
    }

    pub fn stopped(self) -> bool {
        libc::WIFSTOPPED(self.0)
    }

    /// Exit code if the process exited normally.
    pub fn exit_code(self) -> Option<i32> {
        self.exited().then(|| libc::WEXITSTATUS(self.0))
    }

    /// Signal number if the process was terminated by a signal.
    pub fn term_signal(self) -> Option<i32> {
        self.signaled().then(|| libc::WTERMSIG(self.0))
    }

    /// Signal number if the process is stopped.
    pub fn stop_signal(self) -> Option<i32> {
        self.stopped().then(|| libc::WSTOPSIG(self.0))
    }

    pub fn core_dumped(self) -> bool {
        self.signaled() && libc::WCOREDUMP(self.0)
    }

    /// Decode into nix's structured representation for `pid`.
    pub fn to_wait_status(self, pid: Pid) -> nix::Result<WaitStatus> {
        WaitStatus::from_raw(pid, self.0)
    }
}

impl fmt::Display for RawStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.exit_code() {
            write!(f, "exited with status {}", code)
        } else if let Some(sig) = self.term_signal() {
            write!(f, "killed by {}", crate::signals::signal_name(sig))?;
            if self.core_dumped() {
                write!(f, " (core dumped)")?;
            }
            Ok(())
        } else if let Some(sig) = self.stop_signal() {
            write!(f, "stopped by {}", crate::signals::signal_name(sig))
        } else {
            write!(f, "unknown status {:#x}", self.0)
        }
    }
}

/// What is currently known about the command's fate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandStatus {
    #[default]
    Unset,
    /// The exec attempt failed in the child with this errno.
    ExecError(Errno),
    /// The main child changed state (exited or was killed).
    WaitStatus(RawStatus),
}

/// The outcome record shared between the error-channel monitor and the
/// reaper.
///
/// Writes follow a priority rule: an `ExecError` is never replaced, and a
/// `WaitStatus` is only written over `Unset`.
#[derive(Debug, Default)]
pub struct Outcome {
    status: CommandStatus,
}

impl Outcome {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> CommandStatus {
        self.status
    }

    pub fn is_unset(&self) -> bool {
        self.status == CommandStatus::Unset
    }

    /// Record a failed exec attempt. Returns false if an earlier exec
    /// error is kept instead.
    pub fn record_exec_error(&mut self, errno: Errno) -> bool {
        if let CommandStatus::ExecError(existing) = self.status {
            warn!(
                "not overwriting command status {} with exec error {}",
                existing, errno
            );
            return false;
        }
        self.status = CommandStatus::ExecError(errno);
        true
    }

    /// Record the main child's wait status if nothing else has been.
    pub fn record_wait_status(&mut self, raw: RawStatus) -> bool {
        if !self.is_unset() {
            warn!(
                "not overwriting command status {:?} with wait status {}",
                self.status, raw
            );
            return false;
        }
        self.status = CommandStatus::WaitStatus(raw);
        true
    }

    /// Map the outcome to a shell-style process exit code.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            CommandStatus::WaitStatus(raw) => {
                if let Some(code) = raw.exit_code() {
                    code
                } else if let Some(sig) = raw.term_signal() {
                    128 + sig
                } else {
                    1
                }
            }
            CommandStatus::ExecError(_) | CommandStatus::Unset => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_status_decoding() {
        let exited = RawStatus::from_exit(3);
        assert!(exited.exited());
        assert_eq!(exited.exit_code(), Some(3));
        assert_eq!(exited.term_signal(), None);

        let killed = RawStatus::from_signal(Signal::SIGTERM);
        assert!(killed.signaled());
        assert_eq!(killed.term_signal(), Some(libc::SIGTERM));
        assert!(!killed.core_dumped());

        let stopped = RawStatus((libc::SIGTSTP << 8) | 0x7f);
        assert!(stopped.stopped());
        assert_eq!(stopped.stop_signal(), Some(libc::SIGTSTP));
    }

    #[test]
    fn test_raw_status_to_wait_status() {
        let pid = Pid::from_raw(42);
        let status = RawStatus::from_exit(7).to_wait_status(pid);
        assert!(matches!(status, Ok(WaitStatus::Exited(p, 7)) if p == pid));

        let status = RawStatus::from_signal(Signal::SIGKILL).to_wait_status(pid);
        assert!(matches!(
            status,
            Ok(WaitStatus::Signaled(_, Signal::SIGKILL, false))
        ));
    }

    #[test]
    fn test_exec_error_is_never_overwritten() {
        let mut outcome = Outcome::new();
        assert!(outcome.record_exec_error(Errno::ENOENT));
        assert!(!outcome.record_wait_status(RawStatus::from_exit(0)));
        assert!(!outcome.record_exec_error(Errno::EACCES));
        assert_eq!(outcome.status(), CommandStatus::ExecError(Errno::ENOENT));
    }

    #[test]
    fn test_exec_error_replaces_wait_status() {
        let mut outcome = Outcome::new();
        assert!(outcome.record_wait_status(RawStatus::from_exit(0)));
        assert!(outcome.record_exec_error(Errno::EPERM));
        assert_eq!(outcome.status(), CommandStatus::ExecError(Errno::EPERM));
    }

    #[test]
    fn test_wait_status_written_once() {
        let mut outcome = Outcome::new();
        assert!(outcome.record_wait_status(RawStatus::from_exit(1)));
        assert!(!outcome.record_wait_status(RawStatus::from_exit(2)));
        assert_eq!(outcome.exit_code(), 1);
    }

    #[test]
    fn test_exit_code_mapping() {
        let mut outcome = Outcome::new();
        assert_eq!(outcome.exit_code(), 1);

        outcome.record_wait_status(RawStatus::from_signal(Signal::SIGINT));
        assert_eq!(outcome.exit_code(), 128 + libc::SIGINT);

        let mut outcome = Outcome::new();
        outcome.record_exec_error(Errno::ENOENT);
        assert_eq!(outcome.exit_code(), 1);
    }

    #[test]
    fn test_display_names_signal() {
        let text = RawStatus::from_signal(Signal::SIGTERM).to_string();
        assert_eq!(text, "killed by SIGTERM");
        assert_eq!(RawStatus::from_exit(0).to_string(), "exited with status 0");
    }
}
