//! The exec error channel.
//!
//! A close-on-exec pipe from child to supervisor. A successful `execve`
//! closes the write end and the supervisor reads EOF; a failed one leaves
//! the child to write its errno before exiting.

use nix::errno::Errno;
use std::os::fd::RawFd;

const ERRNO_SIZE: usize = std::mem::size_of::<libc::c_int>();

/// Result of one read on the supervisor's end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrpipeRead {
    /// Interrupted or not ready yet; wait for the next readiness event.
    Transient,
    /// The read itself failed.
    Failed(Errno),
    /// Write end closed without data: the exec succeeded.
    Eof,
    /// The child reported this exec errno.
    ExecFailed(Errno),
    /// Fewer bytes than an errno arrived.
    Short(usize),
}

/// Read once from the supervisor's end of the channel.
pub fn read_errpipe(fd: RawFd) -> ErrpipeRead {
    let mut errval: libc::c_int = 0;
    // SAFETY: errval is a valid buffer of ERRNO_SIZE bytes.
    let n = unsafe { libc::read(fd, (&mut errval as *mut libc::c_int).cast(), ERRNO_SIZE) };
    match n {
        -1 => match Errno::last() {
            Errno::EINTR | Errno::EAGAIN => ErrpipeRead::Transient,
            e => ErrpipeRead::Failed(e),
        },
        0 => ErrpipeRead::Eof,
        n if n as usize == ERRNO_SIZE => ErrpipeRead::ExecFailed(Errno::from_raw(errval)),
        n => ErrpipeRead::Short(n as usize),
    }
}

/// Report `errno` from the child side, retrying on interruption.
///
/// Async-signal-safe; called between fork and `_exit`.
pub fn send_errno(fd: RawFd, errno: Errno) {
    let errval: libc::c_int = errno as libc::c_int;
    loop {
        // SAFETY: errval outlives the call; write is async-signal-safe.
        let n = unsafe { libc::write(fd, (&errval as *const libc::c_int).cast(), ERRNO_SIZE) };
        if n != -1 || Errno::last() != Errno::EINTR {
            break;
        }
    }
}
