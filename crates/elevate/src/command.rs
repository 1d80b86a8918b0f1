//! Description of the command to supervise.

use crate::event::EventBase;
use std::ffi::OsString;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::time::Duration;

/// Behaviour switches for one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecFlags {
    /// A timeout is armed; see [`CommandSpec::timeout`].
    pub set_timeout: bool,
    /// Observe sub-commands started by the command.
    pub intercept: bool,
    /// Log sub-commands started by the command.
    pub log_subcmds: bool,
    /// Intercept with ptrace + seccomp instead of the rendezvous socket.
    pub use_ptrace: bool,
    /// Carried for collaborators that apply a role-based security context.
    pub rbac_enabled: bool,
}

impl ExecFlags {
    pub fn wants_interception(&self) -> bool {
        self.intercept || self.log_subcmds
    }

    /// Interception through the rendezvous socket.
    pub fn wants_socket(&self) -> bool {
        self.wants_interception() && !self.use_ptrace
    }

    /// Interception through ptrace.
    pub fn wants_trace(&self) -> bool {
        self.wants_interception() && self.use_ptrace
    }

    pub fn clear_interception(&mut self) {
        self.intercept = false;
        self.log_subcmds = false;
        self.use_ptrace = false;
    }
}

/// Everything the supervisor needs to launch one command.
#[derive(Debug)]
pub struct CommandSpec {
    /// Resolved path of the executable.
    pub program: PathBuf,
    /// Full argument vector, including `argv[0]`.
    pub argv: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
    pub flags: ExecFlags,
    pub timeout: Option<Duration>,
    /// Controlling terminal, `/dev/tty` when unset.
    pub tty: Option<PathBuf>,
    /// Descriptor of the already opened executable. Used with `fexecve`
    /// where available and closed in the supervisor after fork.
    pub exec_fd: Option<OwnedFd>,
    /// Dispatcher to run on; the supervisor creates one when absent.
    pub event_base: Option<EventBase>,
}

impl CommandSpec {
    /// A command inheriting the current environment.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, argv: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            argv,
            env: std::env::vars_os().collect(),
            flags: ExecFlags::default(),
            timeout: None,
            tty: None,
            exec_fd: None,
            event_base: None,
        }
    }

    #[must_use]
    pub fn with_env(mut self, env: Vec<(OsString, OsString)>) -> Self {
        self.env = env;
        self
    }

    #[must_use]
    pub fn with_flags(mut self, flags: ExecFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Terminate the command once `timeout` expires.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self.flags.set_timeout = true;
        self
    }

    #[must_use]
    pub fn with_tty(mut self, tty: impl Into<PathBuf>) -> Self {
        self.tty = Some(tty.into());
        self
    }

    #[must_use]
    pub fn with_exec_fd(mut self, fd: OwnedFd) -> Self {
        self.exec_fd = Some(fd);
        self
    }

    #[must_use]
    pub fn with_event_base(mut self, base: EventBase) -> Self {
        self.event_base = Some(base);
        self
    }

    /// Timeout to arm, if one was requested.
    pub fn armed_timeout(&self) -> Option<Duration> {
        if self.flags.set_timeout {
            self.timeout.filter(|t| !t.is_zero())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interception_modes() {
        let mut flags = ExecFlags {
            log_subcmds: true,
            ..Default::default()
        };
        assert!(flags.wants_socket());
        assert!(!flags.wants_trace());

        flags.use_ptrace = true;
        assert!(flags.wants_trace());
        assert!(!flags.wants_socket());

        flags.clear_interception();
        assert!(!flags.wants_interception());
        assert!(!flags.use_ptrace);
    }

    #[test]
    fn test_timeout_requires_flag() {
        let mut spec = CommandSpec::new("/bin/true", vec!["true".into()]);
        spec.timeout = Some(Duration::from_secs(5));
        assert_eq!(spec.armed_timeout(), None);

        let spec = spec.with_timeout(Duration::from_secs(5));
        assert_eq!(spec.armed_timeout(), Some(Duration::from_secs(5)));

        let spec = CommandSpec::new("/bin/true", vec![]).with_timeout(Duration::ZERO);
        assert_eq!(spec.armed_timeout(), None);
    }

    #[test]
    fn test_builders_chain() {
        let flags = ExecFlags {
            intercept: true,
            ..Default::default()
        };
        let spec = CommandSpec::new("/bin/true", vec!["true".into()])
            .with_env(vec![("PATH".into(), "/bin".into())])
            .with_flags(flags)
            .with_tty("/dev/null")
            .with_timeout(Duration::from_secs(2));

        assert_eq!(spec.env.len(), 1);
        assert!(spec.flags.intercept);
        assert!(spec.flags.set_timeout);
        assert_eq!(spec.tty, Some(PathBuf::from("/dev/null")));
        assert_eq!(spec.armed_timeout(), Some(Duration::from_secs(2)));
    }
}
