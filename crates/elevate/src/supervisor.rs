//! Supervised execution without a pseudo-terminal.
//!
//! [`run_command`] forks the command and stays in the foreground until it
//! is gone. Every signal is blocked from before the fork until all event
//! subscriptions exist, so a child that exits immediately is still
//! observed: its `SIGCHLD` stays pending and is delivered through the
//! dispatcher once the mask is restored.
//!
//! All state lives in one [`Supervision`] value that only dispatcher
//! callbacks mutate.

use crate::command::{CommandSpec, ExecFlags};
use crate::error::{ElevateError, Result};
use crate::errpipe::{read_errpipe, send_errno, ErrpipeRead};
use crate::event::{Event, EventBase, EventHandler, EventId, SignalInfo};
use crate::exec::ChildContext;
use crate::fd;
use crate::hooks::ExecHooks;
use crate::intercept::socket::InterceptSocket;
use crate::intercept::{Interception, SeizeOutcome};
use crate::outcome::Outcome;
use crate::reaper::{ChildWaiter, SystemWaiter};
use crate::signals::{
    classify, process_group_of, signal_name, Disposition, SignalClass, FORWARDED_SIGNALS,
};
use nix::sys::signal::{kill, pthread_sigmask, SigSet, SigmaskHow, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{alarm, fork, getpgrp, ForkResult, Pid};
use std::os::fd::{AsRawFd, OwnedFd};
use std::time::Duration;
use tracing::{debug, error, warn};

/// What a registered subscription is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriptionKind {
    ErrorChannel,
    Signal(SignalClass),
}

#[derive(Debug, Clone, Copy)]
struct Subscription {
    id: EventId,
    kind: SubscriptionKind,
}

/// Per-invocation supervision state.
pub(crate) struct Supervision<'a> {
    pub(crate) hooks: &'a mut dyn ExecHooks,
    pub(crate) outcome: &'a mut Outcome,
    /// The tracked command; `None` once it has exited or been killed.
    pub(crate) child: Option<Pid>,
    /// Our own process group at start.
    pub(crate) ppgrp: Pid,
    pub(crate) interception: Interception,
    pub(crate) waiter: Box<dyn ChildWaiter>,
    errpipe: Option<OwnedFd>,
    subscriptions: Vec<Subscription>,
    timeout_fired: bool,
}

impl<'a> Supervision<'a> {
    pub(crate) fn new(
        hooks: &'a mut dyn ExecHooks,
        outcome: &'a mut Outcome,
        child: Pid,
        ppgrp: Pid,
        interception: Interception,
        waiter: Box<dyn ChildWaiter>,
    ) -> Self {
        Self {
            hooks,
            outcome,
            child: Some(child),
            ppgrp,
            interception,
            waiter,
            errpipe: None,
            subscriptions: Vec::new(),
            timeout_fired: false,
        }
    }

    /// Watch the error channel and every forwarded signal.
    fn register(&mut self, base: &mut EventBase) -> Result<()> {
        if let Some(errpipe) = &self.errpipe {
            let id = base.add_read(errpipe.as_raw_fd());
            self.subscriptions.push(Subscription {
                id,
                kind: SubscriptionKind::ErrorChannel,
            });
        }
        for &(signal, class) in FORWARDED_SIGNALS {
            let id = base
                .add_signal(signal)
                .map_err(|source| ElevateError::SignalHandler {
                    signal: signal.as_str(),
                    source,
                })?;
            self.subscriptions.push(Subscription {
                id,
                kind: SubscriptionKind::Signal(class),
            });
        }
        Ok(())
    }

    fn kind_of(&self, id: EventId) -> Option<SubscriptionKind> {
        self.subscriptions
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.kind)
    }

    /// Stop watching the error channel and close it.
    fn close_errpipe(&mut self, base: &mut EventBase) {
        if let Some(pos) = self
            .subscriptions
            .iter()
            .position(|s| s.kind == SubscriptionKind::ErrorChannel)
        {
            base.remove(self.subscriptions.remove(pos).id);
        }
        self.errpipe = None;
    }

    fn errpipe_registered(&self) -> bool {
        self.subscriptions
            .iter()
            .any(|s| s.kind == SubscriptionKind::ErrorChannel)
    }

    fn on_errpipe(&mut self, base: &mut EventBase) {
        let Some(errpipe) = &self.errpipe else {
            return;
        };
        match read_errpipe(errpipe.as_raw_fd()) {
            ErrpipeRead::Transient => {}
            ErrpipeRead::Failed(e) => {
                warn!("error reading error pipe: {}", e);
                if self.outcome.is_unset() {
                    self.outcome.record_exec_error(e);
                }
                base.loop_break();
            }
            ErrpipeRead::Eof => {
                debug!("EOF on error pipe");
                self.close_errpipe(base);
            }
            ErrpipeRead::ExecFailed(e) => {
                debug!("command failed to execute: {}", e);
                self.outcome.record_exec_error(e);
                self.close_errpipe(base);
            }
            ErrpipeRead::Short(n) => {
                warn!("error pipe: read {} bytes, expected an errno", n);
                self.close_errpipe(base);
            }
        }
    }

    fn on_signal(&mut self, base: &mut EventBase, class: SignalClass, info: SignalInfo) {
        let Some(child) = self.child else {
            return;
        };
        debug!(
            "received {} (code {}, sender {:?})",
            signal_name(info.signo),
            info.code,
            info.sender
        );

        match classify(class, &info, child, self.ppgrp, process_group_of) {
            Disposition::Ignore => {}
            Disposition::Reap => {
                self.reap();
                if self.child.is_none() {
                    base.loop_exit();
                }
            }
            Disposition::Terminate => self.on_timeout(child),
            Disposition::Forward(signal) => {
                debug!("forwarding {} to process {}", signal_name(signal as i32), child);
                if let Err(e) = kill(child, signal) {
                    warn!("kill({}, {}) failed: {}", child, signal_name(signal as i32), e);
                }
            }
        }
    }

    /// The deadline passed: ask nicely first, then force once the grace
    /// period has also run out.
    fn on_timeout(&mut self, child: Pid) {
        if self.timeout_fired {
            debug!("process {} ignored the timeout, killing it", child);
            self.hooks.terminate(child, true);
            return;
        }
        debug!("command timed out, terminating process {}", child);
        self.timeout_fired = true;
        self.hooks.terminate(child, false);
        alarm::set(whole_seconds(self.hooks.kill_grace()));
    }

    /// Hook up the interception the flags ask for. A child that is
    /// already traced by someone else runs without interception.
    fn start_interception(
        &mut self,
        base: &mut EventBase,
        flags: &mut ExecFlags,
        socket: Option<InterceptSocket>,
    ) {
        let Some(child) = self.child else {
            return;
        };
        if let Some(socket) = socket {
            self.interception = Interception::attach_socket(socket, base);
            return;
        }
        if !flags.wants_trace() {
            return;
        }
        self.interception = Interception::Trace;
        match self.interception.seize(child, &mut *self.hooks) {
            SeizeOutcome::Seized => debug!("tracing process {}", child),
            SeizeOutcome::AlreadyTraced => {
                debug!("process {} is already traced, running without interception", child);
                flags.clear_interception();
                self.interception.release(base);
            }
            SeizeOutcome::Failed(e) => {
                error!("unable to trace process {}: {}", child, e);
                self.outcome.record_exec_error(e);
                self.hooks.terminate(child, true);
            }
        }
    }

    /// Settle state after the dispatcher returned, then tear down.
    fn finish(&mut self, base: &mut EventBase, dispatched: nix::Result<()>) -> Result<()> {
        let result = if dispatched.is_err() || base.got_break() {
            error!("event loop exited prematurely");
            if let Some(child) = self.child.take() {
                self.hooks.terminate(child, true);
            }
            dispatched.map_err(ElevateError::EventLoop)
        } else {
            if self.child.is_none() && self.errpipe_registered() {
                // The reaper can finish the loop before the error channel
                // was polled. The child is gone, so this read cannot block.
                self.on_errpipe(base);
            }
            Ok(())
        };
        self.teardown(base);
        result
    }

    /// Remove every subscription and release interception. Safe to call
    /// more than once.
    fn teardown(&mut self, base: &mut EventBase) {
        for sub in self.subscriptions.drain(..) {
            base.remove(sub.id);
        }
        self.errpipe = None;
        self.interception.release(base);
    }
}

impl EventHandler for Supervision<'_> {
    fn on_event(&mut self, base: &mut EventBase, event: Event) {
        match event {
            Event::Readable(id, _) if self.interception.owns_event(id) => {
                self.interception.handle_readable(base, &mut *self.hooks);
            }
            Event::Readable(id, _) => {
                if self.kind_of(id) == Some(SubscriptionKind::ErrorChannel) {
                    self.on_errpipe(base);
                }
            }
            Event::Signal(id, info) => {
                if let Some(SubscriptionKind::Signal(class)) = self.kind_of(id) {
                    self.on_signal(base, class, info);
                }
            }
        }
    }
}

/// Restores the signal mask in effect before [`MaskGuard::block_all`].
struct MaskGuard {
    original: SigSet,
}

impl MaskGuard {
    fn block_all() -> Result<Self> {
        let mut original = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&SigSet::all()), Some(&mut original))
            .map_err(ElevateError::SignalMask)?;
        Ok(Self { original })
    }

    fn original(&self) -> &SigSet {
        &self.original
    }
}

impl Drop for MaskGuard {
    fn drop(&mut self) {
        if let Err(e) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.original), None) {
            warn!("unable to restore signal mask: {}", e);
        }
    }
}

/// Round up to whole seconds for `alarm(2)`, at least one.
fn whole_seconds(duration: Duration) -> u32 {
    let secs = duration
        .as_secs()
        .saturating_add(u64::from(duration.subsec_nanos() > 0));
    u32::try_from(secs.max(1)).unwrap_or(u32::MAX)
}

/// Execute `spec` and supervise it until it exits or is killed.
///
/// On `Ok`, `outcome` holds what became of the command; it may still be
/// [`Unset`](crate::CommandStatus::Unset) if a callback broke the loop.
/// An `Err` means setup or the dispatcher itself failed; any child that
/// was started has been killed by then.
pub fn run_command(
    spec: &mut CommandSpec,
    hooks: &mut dyn ExecHooks,
    outcome: &mut Outcome,
) -> Result<()> {
    hooks.init_session()?;

    let mut base = match spec.event_base.take() {
        Some(base) => base,
        None => EventBase::new().map_err(|source| ElevateError::Channel {
            what: "event base",
            source,
        })?,
    };

    let (err_read, err_write) = fd::cloexec_pipe().map_err(|source| ElevateError::Channel {
        what: "error pipe",
        source,
    })?;

    let (supervisor_sock, helper_sock) = if spec.flags.wants_socket() {
        let (supervisor, helper) = InterceptSocket::pair()?;
        supervisor.set_nonblocking()?;
        (Some(supervisor), Some(helper))
    } else {
        (None, None)
    };
    let helper_fd = helper_sock.as_ref().map(InterceptSocket::as_raw_fd);

    hooks.prepare(spec, helper_fd)?;

    let mask = MaskGuard::block_all()?;

    if hooks.terminated(outcome) {
        debug!("termination requested before the command started");
        return Ok(());
    }

    let ppgrp = getpgrp();

    // SAFETY: the child runs only async-signal-safe code until exec or
    // _exit; argv, envp and the fd list were prepared above.
    let child = match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(err_read);
            drop(supervisor_sock);
            if let Some(fd) = helper_fd {
                let _ = fd::clear_cloexec(fd);
            }
            let ctx = ChildContext {
                original_mask: mask.original(),
                intercept_fd: helper_fd,
                errfd: err_write.as_raw_fd(),
                exec_fd: spec.exec_fd.as_ref().map(AsRawFd::as_raw_fd),
                trace: spec.flags.wants_trace(),
            };
            let errno = hooks.exec_command(spec, &ctx);
            send_errno(err_write.as_raw_fd(), errno);
            // SAFETY: _exit skips atexit handlers and destructors that
            // belong to the parent.
            unsafe { libc::_exit(127) }
        }
        Ok(ForkResult::Parent { child }) => child,
        Err(e) => return Err(ElevateError::Fork(e)),
    };

    drop(err_write);
    drop(helper_sock);
    drop(spec.exec_fd.take());
    debug!("executed {} as process {}", spec.program.display(), child);
    hooks.spawned(child);

    let timeout = spec.armed_timeout();
    if let Some(timeout) = timeout {
        alarm::set(whole_seconds(timeout));
    }

    let mut sup = Supervision::new(
        hooks,
        outcome,
        child,
        ppgrp,
        Interception::Disabled,
        Box::new(SystemWaiter),
    );
    sup.errpipe = Some(err_read);

    if let Err(e) = sup.register(&mut base) {
        sup.teardown(&mut base);
        sup.hooks.terminate(child, true);
        let _ = waitpid(child, None);
        if timeout.is_some() {
            alarm::cancel();
        }
        return Err(e);
    }

    sup.start_interception(&mut base, &mut spec.flags, supervisor_sock);

    drop(mask);

    // A child that exited before the handlers existed left only a pending
    // SIGCHLD; make sure the reaper runs at least once.
    base.activate_signal(Signal::SIGCHLD);

    let dispatched = base.dispatch(&mut sup);
    let finished = sup.finish(&mut base, dispatched);
    if timeout.is_some() || sup.timeout_fired {
        alarm::cancel();
    }
    finished
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::tests::RecordingHooks;
    use crate::outcome::{CommandStatus, RawStatus};
    use crate::reaper::WaitResult;
    use nix::errno::Errno;
    use serial_test::serial;
    use std::collections::VecDeque;

    struct NoChildren;

    impl ChildWaiter for NoChildren {
        fn wait_any(&mut self) -> WaitResult {
            WaitResult::Empty
        }
    }

    struct Once(VecDeque<WaitResult>);

    impl ChildWaiter for Once {
        fn wait_any(&mut self) -> WaitResult {
            self.0.pop_front().unwrap_or(WaitResult::Empty)
        }
    }

    fn user_signal(signal: Signal, sender: i32) -> SignalInfo {
        SignalInfo::new(signal as i32, crate::event::SI_USER, sender)
    }

    #[test]
    fn test_whole_seconds_rounds_up() {
        assert_eq!(whole_seconds(Duration::from_millis(0)), 1);
        assert_eq!(whole_seconds(Duration::from_millis(1500)), 2);
        assert_eq!(whole_seconds(Duration::from_secs(3)), 3);
    }

    #[test]
    #[serial]
    fn test_timeout_escalates() {
        let child = Pid::from_raw(i32::MAX - 1);
        let mut hooks = RecordingHooks::default();
        let mut outcome = Outcome::new();
        let mut sup = Supervision::new(
            &mut hooks,
            &mut outcome,
            child,
            Pid::from_raw(1),
            Interception::Disabled,
            Box::new(NoChildren),
        );
        sup.on_timeout(child);
        sup.on_timeout(child);
        alarm::cancel();
        drop(sup);
        assert_eq!(hooks.terminations, vec![(child, false), (child, true)]);
    }

    #[test]
    fn test_signals_ignored_without_child() {
        let mut base = EventBase::new().ok().expect("event base");
        let mut hooks = RecordingHooks::default();
        let mut outcome = Outcome::new();
        let mut sup = Supervision::new(
            &mut hooks,
            &mut outcome,
            Pid::from_raw(1),
            Pid::from_raw(1),
            Interception::Disabled,
            Box::new(NoChildren),
        );
        sup.child = None;
        sup.on_signal(
            &mut base,
            SignalClass::Timeout,
            user_signal(Signal::SIGALRM, 1),
        );
        drop(sup);
        assert!(hooks.terminations.is_empty());
    }

    #[test]
    fn test_child_status_exits_loop() {
        let child = Pid::from_raw(i32::MAX - 1);
        let mut base = EventBase::new().ok().expect("event base");
        let mut hooks = RecordingHooks::default();
        let mut outcome = Outcome::new();
        let mut sup = Supervision::new(
            &mut hooks,
            &mut outcome,
            child,
            Pid::from_raw(1),
            Interception::Disabled,
            Box::new(Once(
                vec![WaitResult::Changed(child, RawStatus::from_exit(2))].into(),
            )),
        );
        sup.on_signal(
            &mut base,
            SignalClass::ChildStatus,
            SignalInfo::new(libc::SIGCHLD, 1, child.as_raw()),
        );
        assert!(sup.child.is_none());
        drop(sup);
        match outcome.status() {
            CommandStatus::WaitStatus(raw) => assert_eq!(raw.exit_code(), Some(2)),
            other => panic!("unexpected status: {:?}", other),
        }
    }

    #[test]
    fn test_errpipe_reports_exec_failure() {
        let (read, write) = fd::cloexec_pipe().ok().expect("pipe");
        send_errno(write.as_raw_fd(), Errno::EACCES);
        drop(write);

        let mut base = EventBase::new().ok().expect("event base");
        let mut hooks = RecordingHooks::default();
        let mut outcome = Outcome::new();
        let mut sup = Supervision::new(
            &mut hooks,
            &mut outcome,
            Pid::from_raw(1),
            Pid::from_raw(1),
            Interception::Disabled,
            Box::new(NoChildren),
        );
        sup.errpipe = Some(read);
        let id = base.add_read(sup.errpipe.as_ref().map_or(-1, |f| f.as_raw_fd()));
        sup.subscriptions.push(Subscription {
            id,
            kind: SubscriptionKind::ErrorChannel,
        });

        sup.on_event(&mut base, Event::Readable(id, -1));
        assert!(!sup.errpipe_registered());
        assert!(sup.errpipe.is_none());
        assert!(!base.is_registered(id));
        drop(sup);
        assert_eq!(outcome.status(), CommandStatus::ExecError(Errno::EACCES));
    }

    fn trace_flags() -> ExecFlags {
        ExecFlags {
            log_subcmds: true,
            use_ptrace: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_already_traced_runs_without_interception() {
        let child = Pid::from_raw(i32::MAX - 1);
        let mut base = EventBase::new().ok().expect("event base");
        let mut hooks = RecordingHooks {
            seize_outcome: Some(SeizeOutcome::AlreadyTraced),
            ..Default::default()
        };
        let mut outcome = Outcome::new();
        let mut flags = trace_flags();
        let mut sup = Supervision::new(
            &mut hooks,
            &mut outcome,
            child,
            Pid::from_raw(1),
            Interception::Disabled,
            Box::new(NoChildren),
        );

        sup.start_interception(&mut base, &mut flags, None);
        assert!(matches!(sup.interception, Interception::Disabled));
        assert_eq!(sup.child, Some(child));
        drop(sup);

        assert!(!flags.wants_interception());
        assert!(!flags.use_ptrace);
        assert_eq!(hooks.seized, vec![child]);
        assert!(hooks.terminations.is_empty());
        assert!(outcome.is_unset());
    }

    #[test]
    fn test_seize_failure_is_exec_error() {
        let child = Pid::from_raw(i32::MAX - 1);
        let mut base = EventBase::new().ok().expect("event base");
        let mut hooks = RecordingHooks {
            seize_outcome: Some(SeizeOutcome::Failed(Errno::ESRCH)),
            ..Default::default()
        };
        let mut outcome = Outcome::new();
        let mut flags = trace_flags();
        let mut sup = Supervision::new(
            &mut hooks,
            &mut outcome,
            child,
            Pid::from_raw(1),
            Interception::Disabled,
            Box::new(NoChildren),
        );

        sup.start_interception(&mut base, &mut flags, None);
        sup.teardown(&mut base);
        drop(sup);

        assert!(flags.wants_trace());
        assert_eq!(hooks.terminations, vec![(child, true)]);
        assert_eq!(outcome.status(), CommandStatus::ExecError(Errno::ESRCH));
    }

    #[test]
    fn test_seized_child_is_traced() {
        let child = Pid::from_raw(i32::MAX - 1);
        let mut base = EventBase::new().ok().expect("event base");
        let mut hooks = RecordingHooks::default();
        let mut outcome = Outcome::new();
        let mut flags = trace_flags();
        let mut sup = Supervision::new(
            &mut hooks,
            &mut outcome,
            child,
            Pid::from_raw(1),
            Interception::Disabled,
            Box::new(NoChildren),
        );

        sup.start_interception(&mut base, &mut flags, None);
        assert!(sup.interception.is_trace());
        sup.teardown(&mut base);
        drop(sup);
        assert!(hooks.terminations.is_empty());
        assert!(flags.wants_trace());
    }

    #[test]
    fn test_errpipe_read_failure_breaks_loop_and_kills() {
        let child = Pid::from_raw(i32::MAX - 1);
        // Reading a directory fails with EISDIR.
        let dir = std::fs::File::open("/").ok().expect("open /");
        let mut base = EventBase::new().ok().expect("event base");
        let mut hooks = RecordingHooks::default();
        let mut outcome = Outcome::new();
        let mut sup = Supervision::new(
            &mut hooks,
            &mut outcome,
            child,
            Pid::from_raw(1),
            Interception::Disabled,
            Box::new(NoChildren),
        );
        let id = base.add_read(dir.as_raw_fd());
        sup.errpipe = Some(OwnedFd::from(dir));
        sup.subscriptions.push(Subscription {
            id,
            kind: SubscriptionKind::ErrorChannel,
        });

        sup.on_event(&mut base, Event::Readable(id, -1));
        assert!(base.got_break());

        sup.finish(&mut base, Ok(())).ok().expect("finish");
        assert!(sup.child.is_none());
        assert!(sup.subscriptions.is_empty());
        drop(sup);

        assert_eq!(hooks.terminations, vec![(child, true)]);
        assert_eq!(outcome.status(), CommandStatus::ExecError(Errno::EISDIR));
    }

    #[test]
    fn test_loop_break_leaves_outcome_unset() {
        let child = Pid::from_raw(i32::MAX - 1);
        let mut base = EventBase::new().ok().expect("event base");
        let mut hooks = RecordingHooks::default();
        let mut outcome = Outcome::new();
        let mut sup = Supervision::new(
            &mut hooks,
            &mut outcome,
            child,
            Pid::from_raw(1),
            Interception::Disabled,
            Box::new(NoChildren),
        );

        base.loop_break();
        sup.finish(&mut base, Ok(())).ok().expect("finish");
        assert!(sup.child.is_none());
        drop(sup);

        assert_eq!(hooks.terminations, vec![(child, true)]);
        assert_eq!(outcome.status(), CommandStatus::Unset);
    }

    #[test]
    fn test_dispatch_failure_is_returned() {
        let child = Pid::from_raw(i32::MAX - 1);
        let mut base = EventBase::new().ok().expect("event base");
        let mut hooks = RecordingHooks::default();
        let mut outcome = Outcome::new();
        let mut sup = Supervision::new(
            &mut hooks,
            &mut outcome,
            child,
            Pid::from_raw(1),
            Interception::Disabled,
            Box::new(NoChildren),
        );

        let result = sup.finish(&mut base, Err(Errno::EINVAL));
        assert!(matches!(result, Err(ElevateError::EventLoop(Errno::EINVAL))));
        assert!(sup.child.is_none());
        drop(sup);
        assert_eq!(hooks.terminations, vec![(child, true)]);
    }
}
