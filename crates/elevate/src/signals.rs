//! Signal forwarding policy.
//!
//! Decides per delivered signal whether the supervisor relays it to the
//! child, drops it, reaps, or turns it into a termination request. The
//! decision is a pure function of the delivery metadata so it can be
//! tested without sending real signals.

use crate::event::SignalInfo;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

/// How the supervisor treats a subscribed signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalClass {
    /// Child state changed; drain it with the reaper.
    ChildStatus,
    /// Keyboard-generated job control and status signals.
    Interactive,
    /// The timeout deadline fired.
    Timeout,
    Default,
}

/// Every signal the supervisor subscribes to, with its class.
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
pub const FORWARDED_SIGNALS: &[(Signal, SignalClass)] = &[
    (Signal::SIGINT, SignalClass::Interactive),
    (Signal::SIGQUIT, SignalClass::Interactive),
    (Signal::SIGTSTP, SignalClass::Interactive),
    (Signal::SIGINFO, SignalClass::Interactive),
    (Signal::SIGTERM, SignalClass::Default),
    (Signal::SIGHUP, SignalClass::Default),
    (Signal::SIGALRM, SignalClass::Timeout),
    (Signal::SIGPIPE, SignalClass::Default),
    (Signal::SIGUSR1, SignalClass::Default),
    (Signal::SIGUSR2, SignalClass::Default),
    (Signal::SIGCHLD, SignalClass::ChildStatus),
    (Signal::SIGCONT, SignalClass::Default),
];

/// Every signal the supervisor subscribes to, with its class.
#[cfg(not(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
)))]
pub const FORWARDED_SIGNALS: &[(Signal, SignalClass)] = &[
    (Signal::SIGINT, SignalClass::Interactive),
    (Signal::SIGQUIT, SignalClass::Interactive),
    (Signal::SIGTSTP, SignalClass::Interactive),
    (Signal::SIGTERM, SignalClass::Default),
    (Signal::SIGHUP, SignalClass::Default),
    (Signal::SIGALRM, SignalClass::Timeout),
    (Signal::SIGPIPE, SignalClass::Default),
    (Signal::SIGUSR1, SignalClass::Default),
    (Signal::SIGUSR2, SignalClass::Default),
    (Signal::SIGCHLD, SignalClass::ChildStatus),
    (Signal::SIGCONT, SignalClass::Default),
];

/// Class of a subscribed signal number.
pub fn class_of(signo: i32) -> Option<SignalClass> {
    FORWARDED_SIGNALS
        .iter()
        .find(|(sig, _)| *sig as i32 == signo)
        .map(|&(_, class)| class)
}

/// What to do with one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ignore,
    Reap,
    Forward(Signal),
    /// Ask the child to terminate gracefully.
    Terminate,
}

/// Whether the sender belongs to the supervisor's own process group or to
/// the child's (the child leads its own group id, which equals its pid).
fn sent_by_session(
    sender: Pid,
    child: Pid,
    ppgrp: Pid,
    pgid_of: &impl Fn(Pid) -> Option<Pid>,
) -> bool {
    match pgid_of(sender) {
        Some(pgrp) => pgrp == ppgrp || pgrp == child,
        // Sender already gone; only the child itself is known to be ours.
        None => sender == child,
    }
}

/// Decide what to do with `info`, a delivery of a signal in `class`, while
/// `child` is the tracked command and `ppgrp` the supervisor's original
/// process group. `pgid_of` looks up a process group, `None` if the
/// process no longer exists.
pub fn classify(
    class: SignalClass,
    info: &SignalInfo,
    child: Pid,
    ppgrp: Pid,
    pgid_of: impl Fn(Pid) -> Option<Pid>,
) -> Disposition {
    let Some(signal) = info.signal() else {
        return Disposition::Ignore;
    };

    let from_session = |sender: Option<Pid>| {
        sender.is_some_and(|sender| sent_by_session(sender, child, ppgrp, &pgid_of))
    };

    match class {
        SignalClass::ChildStatus => Disposition::Reap,
        SignalClass::Interactive => {
            // Terminal-generated copies already reached the child's group.
            if !info.user_sent() {
                return Disposition::Ignore;
            }
            if from_session(info.sender) {
                return Disposition::Ignore;
            }
            Disposition::Forward(signal)
        }
        // The command must not be able to kill itself through us.
        SignalClass::Default | SignalClass::Timeout => {
            if info.user_sent() && from_session(info.sender) {
                return Disposition::Ignore;
            }
            if class == SignalClass::Timeout {
                Disposition::Terminate
            } else {
                Disposition::Forward(signal)
            }
        }
    }
}

/// Process group of `pid`, `None` if it cannot be determined.
pub fn process_group_of(pid: Pid) -> Option<Pid> {
    nix::unistd::getpgid(Some(pid)).ok()
}

/// Signal name for log messages, falling back to the number.
pub fn signal_name(signo: i32) -> String {
    match Signal::try_from(signo) {
        Ok(sig) => sig.as_str().to_string(),
        Err(_) => signo.to_string(),
    }
}
