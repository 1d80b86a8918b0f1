//! Sub-command interception
//!
//! One capability with three variants: disabled, ptrace (Linux with the
//! seccomp `trace` action), and the rendezvous socket shared with a helper
//! loaded into the command. The supervisor drives whichever variant is
//! active through [`Interception`] without checking flags itself.

#[cfg(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
pub mod ptrace;

#[cfg(not(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
pub mod ptrace {
    //! ptrace interception is unavailable on this platform.

    use super::SeizeOutcome;
    use crate::hooks::ExecHooks;
    use nix::errno::Errno;
    use nix::unistd::Pid;

    pub fn supported() -> bool {
        false
    }

    pub fn install_exec_filter() -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    pub fn wait_for_tracer() {}

    pub fn seize(_child: Pid) -> SeizeOutcome {
        SeizeOutcome::Seized
    }

    pub fn stopped(_pid: Pid, _status: i32, _hooks: &mut dyn ExecHooks) -> bool {
        true
    }
}

pub mod socket;
pub mod types;

use crate::command::ExecFlags;
use crate::event::{EventBase, EventId};
use crate::hooks::ExecHooks;
use crate::outcome::RawStatus;
use nix::errno::Errno;
use nix::unistd::Pid;
use socket::{Fill, InterceptSocket};
use tracing::{debug, warn};
use types::InterceptResponse;

/// Result of trying to take trace control of the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeizeOutcome {
    Seized,
    /// Another tracer got there first; run without interception.
    AlreadyTraced,
    Failed(Errno),
}

/// Drop trace mode when the kernel cannot support it.
///
/// Interception takes precedence over sub-command logging when deciding
/// which support check applies; both use the seccomp `trace` action.
pub fn normalize_flags(flags: &mut ExecFlags) {
    normalize_flags_with(flags, ptrace::supported);
}

fn normalize_flags_with(flags: &mut ExecFlags, supported: impl Fn() -> bool) {
    if !flags.use_ptrace {
        return;
    }
    let keep = if flags.intercept || flags.log_subcmds {
        supported()
    } else {
        false
    };
    if !keep {
        debug!("ptrace interception unavailable, falling back");
        flags.use_ptrace = false;
    }
}

/// The active interception mechanism.
#[derive(Debug, Default)]
pub enum Interception {
    #[default]
    Disabled,
    /// The child is (to be) seized with ptrace.
    Trace,
    /// Supervisor end of the rendezvous socket, watched for readability
    /// while `event` is set.
    Socket {
        socket: InterceptSocket,
        event: Option<EventId>,
    },
}

impl Interception {
    /// Attach the supervisor end of the rendezvous socket to `base`.
    pub fn attach_socket(socket: InterceptSocket, base: &mut EventBase) -> Self {
        let event = base.add_read(socket.as_raw_fd());
        Interception::Socket {
            socket,
            event: Some(event),
        }
    }

    pub fn is_trace(&self) -> bool {
        matches!(self, Interception::Trace)
    }

    /// Take control of the freshly forked child through `hooks`. Only the
    /// trace variant has anything to do; the others always succeed.
    pub fn seize(&self, child: Pid, hooks: &mut dyn ExecHooks) -> SeizeOutcome {
        match self {
            Interception::Trace => hooks.seize(child),
            _ => SeizeOutcome::Seized,
        }
    }

    /// Whether a stop of `pid` needs the supervisor's attention. Under
    /// trace interception this also resumes tracees from stops that are
    /// an artifact of tracing.
    pub fn stop_is_actionable(
        &mut self,
        pid: Pid,
        status: RawStatus,
        hooks: &mut dyn ExecHooks,
    ) -> bool {
        match self {
            Interception::Trace => ptrace::stopped(pid, status.0, hooks),
            _ => true,
        }
    }

    /// Whether `id` is the controller's own subscription.
    pub fn owns_event(&self, id: EventId) -> bool {
        matches!(self, Interception::Socket { event: Some(ev), .. } if *ev == id)
    }

    /// Buffer what the helper sent and serve every complete request.
    ///
    /// Never blocks: a partial frame stays buffered until the rest arrives.
    pub fn handle_readable(&mut self, base: &mut EventBase, hooks: &mut dyn ExecHooks) {
        let Interception::Socket { socket, event } = self else {
            return;
        };
        let result = socket.fill().and_then(|fill| {
            while let Some(msg) = socket.next_message()? {
                hooks.subcommand(&msg.into_subcommand());
                socket.send_response(&InterceptResponse::Ack)?;
            }
            Ok(fill)
        });
        let closed = match result {
            Ok(Fill::Closed) => {
                // Every holder of the helper end has gone.
                if socket.buffered() > 0 {
                    warn!("intercept socket closed mid-frame ({} bytes)", socket.buffered());
                } else {
                    debug!("intercept socket closed");
                }
                true
            }
            Ok(Fill::Data | Fill::Empty) => false,
            Err(e) => {
                warn!("dropping intercept socket: {}", e);
                true
            }
        };
        if closed {
            if let Some(id) = event.take() {
                base.remove(id);
            }
        }
    }

    /// Unregister from `base` and close descriptors.
    pub fn release(&mut self, base: &mut EventBase) {
        if let Interception::Socket { event, .. } = self {
            if let Some(id) = event.take() {
                base.remove(id);
            }
        }
        if self.is_trace() {
            debug!("releasing trace interception");
        }
        *self = Interception::Disabled;
    }
}

impl Drop for Interception {
    fn drop(&mut self) {
        if let Interception::Socket { event: Some(_), .. } = self {
            warn!("interception dropped without release");
        }
    }
}
