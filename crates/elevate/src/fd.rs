//! Descriptor flag helpers.

use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use std::os::fd::{OwnedFd, RawFd};

fn update_fd_flags(fd: RawFd, f: impl FnOnce(FdFlag) -> FdFlag) -> nix::Result<()> {
    let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
    fcntl(fd, FcntlArg::F_SETFD(f(flags)))?;
    Ok(())
}

pub fn set_cloexec(fd: RawFd) -> nix::Result<()> {
    update_fd_flags(fd, |flags| flags | FdFlag::FD_CLOEXEC)
}

/// Let `fd` survive `execve(2)`.
pub fn clear_cloexec(fd: RawFd) -> nix::Result<()> {
    update_fd_flags(fd, |flags| flags - FdFlag::FD_CLOEXEC)
}

pub fn set_nonblock(fd: RawFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// A pipe with both ends close-on-exec, returned as (read, write).
#[cfg(not(any(target_os = "macos", target_os = "ios")))]
pub fn cloexec_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(OFlag::O_CLOEXEC)
}

/// A pipe with both ends close-on-exec, returned as (read, write).
///
/// Darwin has no `pipe2`; the flag is set right after creation.
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub fn cloexec_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    use std::os::fd::AsRawFd;

    let (read, write) = nix::unistd::pipe()?;
    set_cloexec(read.as_raw_fd())?;
    set_cloexec(write.as_raw_fd())?;
    Ok((read, write))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    fn fd_flags(fd: RawFd) -> FdFlag {
        FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD).ok().expect("F_GETFD"))
    }

    fn status_flags(fd: RawFd) -> OFlag {
        OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL).ok().expect("F_GETFL"))
    }

    #[test]
    fn test_cloexec_pipe_and_clear() {
        let (read, write) = cloexec_pipe().ok().expect("pipe");
        assert!(fd_flags(read.as_raw_fd()).contains(FdFlag::FD_CLOEXEC));
        assert!(fd_flags(write.as_raw_fd()).contains(FdFlag::FD_CLOEXEC));

        clear_cloexec(write.as_raw_fd()).ok().expect("clear");
        assert!(!fd_flags(write.as_raw_fd()).contains(FdFlag::FD_CLOEXEC));
        assert!(fd_flags(read.as_raw_fd()).contains(FdFlag::FD_CLOEXEC));

        set_cloexec(write.as_raw_fd()).ok().expect("set");
        assert!(fd_flags(write.as_raw_fd()).contains(FdFlag::FD_CLOEXEC));
    }

    #[test]
    fn test_set_nonblock() {
        let (read, _write) = cloexec_pipe().ok().expect("pipe");
        assert!(!status_flags(read.as_raw_fd()).contains(OFlag::O_NONBLOCK));
        set_nonblock(read.as_raw_fd()).ok().expect("nonblock");
        assert!(status_flags(read.as_raw_fd()).contains(OFlag::O_NONBLOCK));
    }
}
