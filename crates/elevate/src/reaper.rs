//! Child status collection.
//!
//! `SIGCHLD` notifications coalesce, so every notification drains all
//! pending state changes. Only changes of the tracked command affect the
//! outcome; traced descendants may also show up here and are handed to
//! the interception controller.

use crate::outcome::RawStatus;
use crate::signals::signal_name;
use crate::supervisor::Supervision;
use nix::errno::Errno;
use nix::unistd::Pid;
use tracing::{debug, warn};

#[cfg(target_os = "linux")]
const WAIT_ALL: libc::c_int = libc::__WALL;
#[cfg(not(target_os = "linux"))]
const WAIT_ALL: libc::c_int = 0;

/// One non-blocking wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// Nothing left to report right now.
    Empty,
    Failed(Errno),
    Changed(Pid, RawStatus),
}

/// Source of child state changes.
pub trait ChildWaiter {
    fn wait_any(&mut self) -> WaitResult;
}

/// `waitpid(-1, ..., WNOHANG)` including stopped and traced children.
#[derive(Debug, Default)]
pub struct SystemWaiter;

impl ChildWaiter for SystemWaiter {
    fn wait_any(&mut self) -> WaitResult {
        loop {
            let mut status: libc::c_int = 0;
            // SAFETY: status is a valid out-pointer.
            let pid = unsafe {
                libc::waitpid(-1, &mut status, WAIT_ALL | libc::WUNTRACED | libc::WNOHANG)
            };
            match pid {
                -1 => match Errno::last() {
                    Errno::EINTR => continue,
                    Errno::ECHILD => return WaitResult::Empty,
                    e => return WaitResult::Failed(e),
                },
                0 => return WaitResult::Empty,
                pid => return WaitResult::Changed(Pid::from_raw(pid), RawStatus(status)),
            }
        }
    }
}

impl Supervision<'_> {
    /// Drain every pending state change.
    pub(crate) fn reap(&mut self) {
        loop {
            let (pid, status) = match self.waiter.wait_any() {
                WaitResult::Empty => return,
                WaitResult::Failed(e) => {
                    warn!("waitpid failed: {}", e);
                    return;
                }
                WaitResult::Changed(pid, status) => (pid, status),
            };

            if let Some(sig) = status.stop_signal() {
                debug!("process {} stopped by {}", pid, signal_name(sig));
                if self.interception.is_trace()
                    && !self
                        .interception
                        .stop_is_actionable(pid, status, &mut *self.hooks)
                {
                    continue;
                }
                if Some(pid) == self.child {
                    self.hooks.suspend(sig, self.ppgrp, pid);
                }
                continue;
            }

            debug!("process {} {}", pid, status);
            if Some(pid) != self.child {
                continue;
            }
            self.outcome.record_wait_status(status);
            self.child = None;
        }
    }
}
