//! Collaborators the supervisor calls out to.
//!
//! [`ExecHooks`] groups everything the engine treats as policy: session
//! setup, the child's final exec step, termination, job-control mirroring
//! and sub-command reporting. [`SystemHooks`] is the production
//! implementation.

use crate::command::CommandSpec;
use crate::error::{ElevateError, Result};
use crate::exec::{ChildContext, PreparedCommand};
use crate::intercept::types::Subcommand;
use crate::intercept::{ptrace, SeizeOutcome};
use crate::outcome::{Outcome, RawStatus};
use crate::signals::signal_name;
use nix::errno::Errno;
use nix::sys::signal::{
    kill, killpg, pthread_sigmask, sigaction, SaFlags, SigAction, SigHandler, SigSet,
    SigmaskHow, Signal,
};
use nix::unistd::{getpgid, getpid, tcgetpgrp, tcsetpgrp, Pid};
use std::fs::OpenOptions;
use std::os::fd::{AsFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default pause between the polite and the final signal of a forced
/// termination.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(2000);

const DEFAULT_TTY: &str = "/dev/tty";

/// Policy hooks used by [`run_command`](crate::run_command).
pub trait ExecHooks {
    /// Set up session state before fork. Failure aborts the execution.
    fn init_session(&mut self) -> Result<()> {
        Ok(())
    }

    /// Parent-side preparation right before fork, after the channels
    /// exist. `intercept_fd` is the helper end of the rendezvous socket.
    fn prepare(&mut self, _spec: &CommandSpec, _intercept_fd: Option<RawFd>) -> Result<()> {
        Ok(())
    }

    /// Final step in the child. Returns only if the exec failed.
    ///
    /// Runs between fork and exec: implementations must stick to
    /// async-signal-safe operations.
    fn exec_command(&mut self, spec: &CommandSpec, ctx: &ChildContext<'_>) -> Errno;

    /// The child exists; called before any handler is installed.
    fn spawned(&mut self, _pid: Pid) {}

    /// Take trace control of a child started in trace mode.
    fn seize(&mut self, child: Pid) -> SeizeOutcome {
        ptrace::seize(child)
    }

    /// Ask `pid` to terminate, escalating to a kill when `force` is set.
    fn terminate(&mut self, pid: Pid, force: bool);

    /// How long a graceful termination may take before it is forced.
    fn kill_grace(&self) -> Duration {
        DEFAULT_KILL_GRACE
    }

    /// The command stopped with `signal`: mirror the stop in the
    /// supervisor.
    fn suspend(&mut self, signal: i32, ppgrp: Pid, child: Pid);

    /// Whether termination was requested before a child existed. May
    /// record an outcome.
    fn terminated(&mut self, _outcome: &mut Outcome) -> bool {
        false
    }

    /// A sub-command was intercepted.
    fn subcommand(&mut self, _sub: &Subcommand) {}
}

/// Signal received before the supervisor took over signal handling.
static EARLY_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn record_early_signal(signo: libc::c_int) {
    EARLY_SIGNAL.store(signo, Ordering::SeqCst);
}

/// Signals that end the execution if they arrive before fork.
const EARLY_SIGNALS: &[Signal] = &[
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTERM,
    Signal::SIGHUP,
];

/// Record terminating signals that arrive before the command is forked so
/// [`SystemHooks::terminated`] can report them.
pub fn install_early_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(record_early_signal),
        SaFlags::SA_RESTART,
        SigSet::all(),
    );
    for &signal in EARLY_SIGNALS {
        // SAFETY: record_early_signal only stores to an atomic.
        unsafe { sigaction(signal, &action) }.map_err(|source| ElevateError::SignalHandler {
            signal: signal.as_str(),
            source,
        })?;
    }
    Ok(())
}

/// Production collaborators.
#[derive(Debug)]
pub struct SystemHooks {
    prepared: Option<PreparedCommand>,
    kill_grace: Duration,
    log_subcmds: bool,
    tty: PathBuf,
}

impl Default for SystemHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemHooks {
    pub fn new() -> Self {
        Self {
            prepared: None,
            kill_grace: DEFAULT_KILL_GRACE,
            log_subcmds: false,
            tty: PathBuf::from(DEFAULT_TTY),
        }
    }

    #[must_use]
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }
}

/// Open the controlling terminal without making it ours.
fn open_tty(path: &Path) -> Option<std::fs::File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
        .open(path)
        .ok()
}

/// `tcsetpgrp` that does not stop a background caller with `SIGTTOU`.
fn tcsetpgrp_nobg<F: AsFd>(fd: F, pgrp: Pid) -> nix::Result<()> {
    let mut ttou = SigSet::empty();
    ttou.add(Signal::SIGTTOU);
    let mut old = SigSet::empty();
    pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&ttou), Some(&mut old))?;
    let result = tcsetpgrp(fd, pgrp);
    pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&old), None)?;
    result
}

impl ExecHooks for SystemHooks {
    fn prepare(&mut self, spec: &CommandSpec, intercept_fd: Option<RawFd>) -> Result<()> {
        self.prepared = Some(PreparedCommand::new(spec, intercept_fd)?);
        self.log_subcmds = spec.flags.log_subcmds;
        if let Some(tty) = &spec.tty {
            self.tty = tty.clone();
        }
        Ok(())
    }

    fn exec_command(&mut self, _spec: &CommandSpec, ctx: &ChildContext<'_>) -> Errno {
        match &self.prepared {
            Some(prepared) => prepared.exec(ctx),
            None => Errno::EINVAL,
        }
    }

    fn terminate(&mut self, pid: Pid, force: bool) {
        let send = |sig: Signal| {
            if let Err(e) = kill(pid, sig) {
                if e != Errno::ESRCH {
                    warn!("kill({}, {}) failed: {}", pid, sig, e);
                }
            }
        };
        if !force {
            debug!("asking process {} to terminate", pid);
            send(Signal::SIGTERM);
            return;
        }
        debug!("terminating process {}", pid);
        send(Signal::SIGHUP);
        send(Signal::SIGTERM);
        std::thread::sleep(self.kill_grace);
        send(Signal::SIGKILL);
    }

    fn kill_grace(&self) -> Duration {
        self.kill_grace
    }

    fn suspend(&mut self, signal: i32, ppgrp: Pid, child: Pid) {
        let Ok(sig) = Signal::try_from(signal) else {
            warn!("cannot mirror stop by unknown signal {}", signal);
            return;
        };
        let child_pgrp = getpgid(Some(child)).unwrap_or(child);

        // Only touch the terminal when one of us owns the foreground.
        let mut saved_pgrp = None;
        let mut tty = open_tty(&self.tty);
        if let Some(file) = &tty {
            saved_pgrp = tcgetpgrp(file).ok().filter(|pgrp| pgrp.as_raw() > 0);
            if saved_pgrp != Some(ppgrp) && saved_pgrp != Some(child_pgrp) {
                tty = None;
            }
        }

        if saved_pgrp == Some(ppgrp) && matches!(sig, Signal::SIGTTIN | Signal::SIGTTOU) {
            // We already own the terminal; resume the command in the
            // foreground instead of stopping.
            if child_pgrp != ppgrp {
                if let Some(file) = &tty {
                    if tcsetpgrp_nobg(file, child_pgrp).is_ok() {
                        if let Err(e) = killpg(child_pgrp, Signal::SIGCONT) {
                            warn!("killpg({}, SIGCONT) failed: {}", child_pgrp, e);
                        }
                        return;
                    }
                }
            }
        }

        debug!("suspending supervisor with {}", signal_name(signal));
        let previous = if sig == Signal::SIGTSTP {
            let dfl = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
            // SAFETY: installing the default disposition.
            unsafe { sigaction(Signal::SIGTSTP, &dfl) }.ok()
        } else {
            None
        };
        if let Err(e) = kill(getpid(), sig) {
            warn!("kill(self, {}) failed: {}", sig, e);
        }
        if let Some(previous) = previous {
            // SAFETY: reinstalling the handler replaced above.
            if let Err(e) = unsafe { sigaction(Signal::SIGTSTP, &previous) } {
                warn!("unable to restore SIGTSTP handler: {}", e);
            }
        }

        if let (Some(file), Some(pgrp)) = (&tty, saved_pgrp) {
            // Give the terminal back to the command; some shells cannot
            // resume otherwise.
            if pgrp != ppgrp {
                let _ = tcsetpgrp_nobg(file, pgrp);
            }
        }
    }

    fn terminated(&mut self, outcome: &mut Outcome) -> bool {
        let signo = EARLY_SIGNAL.swap(0, Ordering::SeqCst);
        if signo == 0 {
            return false;
        }
        debug!("received {} before the command started", signal_name(signo));
        if let Ok(sig) = Signal::try_from(signo) {
            outcome.record_wait_status(RawStatus::from_signal(sig));
        }
        true
    }

    fn subcommand(&mut self, sub: &Subcommand) {
        if self.log_subcmds {
            info!(
                "{}: executing {} {}",
                sub.pid,
                sub.path.display(),
                sub.argv.join(" ")
            );
        } else {
            debug!("{}: executing {}", sub.pid, sub.path.display());
        }
    }
}
