//! Single-threaded readiness dispatcher.
//!
//! [`EventBase`] multiplexes descriptor readiness and signal delivery with
//! `poll(2)`. Signals are caught by an `SA_SIGINFO` handler that only writes
//! a fixed-size record into a self-pipe; the records are turned into
//! ordinary, serialized callbacks on the dispatching thread, so handlers
//! never run logic in interrupt context.

use crate::fd;
use nix::errno::Errno;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
use std::collections::VecDeque;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use tracing::{debug, trace};

/// `si_code` of a signal sent by `kill(2)` from a real process.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) const SI_USER: i32 = 0;
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
pub(crate) const SI_USER: i32 = 0x10001;
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd"
)))]
pub(crate) const SI_USER: i32 = 0;

/// Write end of the self-pipe of the base that currently owns signal
/// subscriptions, or -1.
static SIGNAL_PIPE: AtomicI32 = AtomicI32::new(-1);

/// One signal record on the self-pipe: signo, si_code, sender pid.
const RECORD_WORDS: usize = 3;
const RECORD_SIZE: usize = RECORD_WORDS * std::mem::size_of::<i32>();

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__errno_location()
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__error()
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn sender_pid(info: *const libc::siginfo_t) -> libc::pid_t {
    (*info).si_pid()
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
unsafe fn sender_pid(info: *const libc::siginfo_t) -> libc::pid_t {
    (*info).si_pid
}

extern "C" fn record_signal(
    signo: libc::c_int,
    info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    let fd = SIGNAL_PIPE.load(Ordering::SeqCst);
    if fd < 0 {
        return;
    }
    // SAFETY: errno is thread-local; only async-signal-safe calls follow
    // (write), and errno is restored before returning.
    unsafe {
        let saved = *errno_location();
        let (code, pid) = if info.is_null() {
            (0, 0)
        } else {
            ((*info).si_code, sender_pid(info))
        };
        let record: [i32; RECORD_WORDS] = [signo, code, pid];
        // A full pipe drops the record. The pipe holds thousands of
        // records, far more than distinct pending signals.
        libc::write(fd, record.as_ptr().cast(), RECORD_SIZE);
        *errno_location() = saved;
    }
}

/// Handle for a registered subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(u64);

/// Metadata of a delivered signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalInfo {
    pub signo: i32,
    pub code: i32,
    /// Sending process, when the kernel reported one.
    pub sender: Option<Pid>,
    /// Queued with [`EventBase::activate_signal`] rather than delivered.
    pub synthetic: bool,
}

impl SignalInfo {
    /// A delivery as reported by `siginfo_t`.
    pub fn new(signo: i32, code: i32, sender: libc::pid_t) -> Self {
        Self {
            signo,
            code,
            sender: (sender > 0).then(|| Pid::from_raw(sender)),
            synthetic: false,
        }
    }

    pub fn signal(&self) -> Option<Signal> {
        Signal::try_from(self.signo).ok()
    }

    /// Whether the signal was sent by a process via `kill(2)` rather than
    /// generated by the kernel.
    pub fn user_sent(&self) -> bool {
        !self.synthetic && self.code == SI_USER
    }
}

/// A ready event handed to an [`EventHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Readable(EventId, RawFd),
    Signal(EventId, SignalInfo),
}

/// Receives events from [`EventBase::dispatch`].
pub trait EventHandler {
    fn on_event(&mut self, base: &mut EventBase, event: Event);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Running,
    Exit,
    Break,
}

struct ReadSubscription {
    id: EventId,
    fd: RawFd,
}

struct SignalSubscription {
    id: EventId,
    signal: Signal,
    previous: SigAction,
}

/// The dispatcher itself.
pub struct EventBase {
    reads: Vec<ReadSubscription>,
    signals: Vec<SignalSubscription>,
    pending: VecDeque<SignalInfo>,
    pipe_read: OwnedFd,
    pipe_write: OwnedFd,
    next_id: u64,
    state: LoopState,
    got_break: bool,
}

impl std::fmt::Debug for EventBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBase")
            .field("reads", &self.reads.len())
            .field("signals", &self.signals.len())
            .field("pending", &self.pending.len())
            .field("state", &self.state)
            .finish()
    }
}

impl EventBase {
    pub fn new() -> nix::Result<Self> {
        let (pipe_read, pipe_write) = fd::cloexec_pipe()?;
        fd::set_nonblock(pipe_read.as_raw_fd())?;
        fd::set_nonblock(pipe_write.as_raw_fd())?;

        Ok(Self {
            reads: Vec::new(),
            signals: Vec::new(),
            pending: VecDeque::new(),
            pipe_read,
            pipe_write,
            next_id: 1,
            state: LoopState::Running,
            got_break: false,
        })
    }

    fn alloc_id(&mut self) -> EventId {
        let id = EventId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Watch `fd` for readability until removed. The caller keeps
    /// ownership of the descriptor.
    pub fn add_read(&mut self, fd: RawFd) -> EventId {
        let id = self.alloc_id();
        self.reads.push(ReadSubscription { id, fd });
        id
    }

    /// Catch `signal` and deliver it as an [`Event::Signal`].
    ///
    /// Only one base at a time may own signal subscriptions, and each
    /// signal may be subscribed once.
    pub fn add_signal(&mut self, signal: Signal) -> nix::Result<EventId> {
        if self.signals.iter().any(|s| s.signal == signal) {
            return Err(Errno::EEXIST);
        }
        let ours = self.pipe_write.as_raw_fd();
        match SIGNAL_PIPE.compare_exchange(-1, ours, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => {}
            Err(current) if current == ours => {}
            Err(_) => return Err(Errno::EBUSY),
        }

        let action = SigAction::new(
            SigHandler::SigAction(record_signal),
            SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
            SigSet::all(),
        );
        // SAFETY: record_signal only performs async-signal-safe operations.
        let previous = match unsafe { sigaction(signal, &action) } {
            Ok(previous) => previous,
            Err(e) => {
                if self.signals.is_empty() {
                    SIGNAL_PIPE.store(-1, Ordering::SeqCst);
                }
                return Err(e);
            }
        };

        let id = self.alloc_id();
        self.signals.push(SignalSubscription {
            id,
            signal,
            previous,
        });
        Ok(id)
    }

    /// Remove a subscription. Signal subscriptions get their previous
    /// disposition back. Unknown ids are ignored.
    pub fn remove(&mut self, id: EventId) {
        if let Some(pos) = self.reads.iter().position(|r| r.id == id) {
            self.reads.remove(pos);
            return;
        }
        if let Some(pos) = self.signals.iter().position(|s| s.id == id) {
            let sub = self.signals.remove(pos);
            // SAFETY: reinstalling the disposition that was active before
            // add_signal replaced it.
            if let Err(e) = unsafe { sigaction(sub.signal, &sub.previous) } {
                debug!("unable to restore handler for {}: {}", sub.signal, e);
            }
            if self.signals.is_empty() {
                let _ = SIGNAL_PIPE.compare_exchange(
                    self.pipe_write.as_raw_fd(),
                    -1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
            }
        }
    }

    pub fn is_registered(&self, id: EventId) -> bool {
        self.reads.iter().any(|r| r.id == id) || self.signals.iter().any(|s| s.id == id)
    }

    /// Queue a delivery of `signal` for the next loop iteration.
    pub fn activate_signal(&mut self, signal: Signal) {
        self.pending.push_back(SignalInfo {
            signo: signal as i32,
            code: 0,
            sender: None,
            synthetic: true,
        });
    }

    /// Finish the current batch of events, then return from `dispatch`.
    pub fn loop_exit(&mut self) {
        if self.state == LoopState::Running {
            self.state = LoopState::Exit;
        }
    }

    /// Return from `dispatch` right after the current callback.
    pub fn loop_break(&mut self) {
        self.state = LoopState::Break;
        self.got_break = true;
    }

    /// Whether the last `dispatch` ended through `loop_break`.
    pub fn got_break(&self) -> bool {
        self.got_break
    }

    fn signal_subscription(&self, signo: i32) -> Option<EventId> {
        self.signals
            .iter()
            .find(|s| s.signal as i32 == signo)
            .map(|s| s.id)
    }

    /// Read all signal records currently in the self-pipe.
    fn drain_signal_pipe(&mut self) -> Vec<SignalInfo> {
        let mut out = Vec::new();
        let mut buf = [0i32; RECORD_WORDS * 32];
        loop {
            // SAFETY: buf is a valid writable buffer of the given size.
            let n = unsafe {
                libc::read(
                    self.pipe_read.as_raw_fd(),
                    buf.as_mut_ptr().cast(),
                    std::mem::size_of_val(&buf),
                )
            };
            if n <= 0 {
                // EAGAIN once drained; EINTR is retried on the next poll.
                break;
            }
            let words = n as usize / std::mem::size_of::<i32>();
            for rec in buf[..words].chunks_exact(RECORD_WORDS) {
                out.push(SignalInfo::new(rec[0], rec[1], rec[2]));
            }
        }
        out
    }

    fn deliver(&mut self, handler: &mut dyn EventHandler, event: Event) -> bool {
        handler.on_event(self, event);
        self.state != LoopState::Break
    }

    /// Run until [`loop_exit`](Self::loop_exit) or
    /// [`loop_break`](Self::loop_break) is called, or nothing is left to
    /// wait for.
    pub fn dispatch(&mut self, handler: &mut dyn EventHandler) -> nix::Result<()> {
        self.state = LoopState::Running;
        self.got_break = false;

        loop {
            while let Some(info) = self.pending.pop_front() {
                if let Some(id) = self.signal_subscription(info.signo) {
                    if !self.deliver(handler, Event::Signal(id, info)) {
                        return Ok(());
                    }
                }
            }
            if self.state != LoopState::Running {
                return Ok(());
            }
            if self.reads.is_empty() && self.signals.is_empty() {
                debug!("event loop has nothing left to wait for");
                return Ok(());
            }

            let mut pfds: Vec<libc::pollfd> = Vec::with_capacity(self.reads.len() + 1);
            pfds.push(libc::pollfd {
                fd: self.pipe_read.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
            let watched: Vec<(EventId, RawFd)> =
                self.reads.iter().map(|r| (r.id, r.fd)).collect();
            for &(_, fd) in &watched {
                pfds.push(libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                });
            }

            // SAFETY: pfds is a valid array of pollfd structs.
            let ret = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, -1) };
            if ret < 0 {
                let err = Errno::last();
                if err == Errno::EINTR {
                    continue;
                }
                return Err(err);
            }

            if pfds[0].revents & libc::POLLIN != 0 {
                for info in self.drain_signal_pipe() {
                    trace!("signal {} from {:?} (code {})", info.signo, info.sender, info.code);
                    if let Some(id) = self.signal_subscription(info.signo) {
                        if !self.deliver(handler, Event::Signal(id, info)) {
                            return Ok(());
                        }
                    }
                }
            }

            let ready = libc::POLLIN | libc::POLLHUP | libc::POLLERR;
            for (pfd, &(id, fd)) in pfds[1..].iter().zip(&watched) {
                // An earlier callback in this batch may have removed it.
                if pfd.revents & ready == 0 || !self.is_registered(id) {
                    continue;
                }
                if !self.deliver(handler, Event::Readable(id, fd)) {
                    return Ok(());
                }
            }

            if self.state != LoopState::Running {
                return Ok(());
            }
        }
    }
}

impl Drop for EventBase {
    fn drop(&mut self) {
        let ids: Vec<EventId> = self.signals.iter().map(|s| s.id).collect();
        for id in ids {
            self.remove(id);
        }
    }
}
