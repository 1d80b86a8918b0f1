//! Child-side command execution.
//!
//! Everything the child needs is prepared in the parent ([`PreparedCommand`])
//! so that nothing between fork and exec allocates or takes locks.

use crate::command::CommandSpec;
use crate::error::{ElevateError, Result};
use crate::intercept::ptrace;
use crate::intercept::socket::INTERCEPT_FD_ENV;
use nix::errno::Errno;
use nix::sys::signal::SigSet;
use std::ffi::{CString, OsStr};
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;

/// What the child knows besides the command itself.
#[derive(Debug)]
pub struct ChildContext<'a> {
    /// Signal mask to restore right before exec.
    pub original_mask: &'a SigSet,
    /// Helper end of the rendezvous socket, kept open across exec.
    pub intercept_fd: Option<RawFd>,
    /// Write end of the error channel (close-on-exec).
    pub errfd: RawFd,
    /// Open executable to run with `fexecve`.
    pub exec_fd: Option<RawFd>,
    /// Install the exec filter and wait to be seized first.
    pub trace: bool,
}

/// NUL-terminated program, argv and envp arrays ready for `execve`.
#[derive(Debug)]
pub struct PreparedCommand {
    program: CString,
    // Owners of the pointer arrays below.
    _argv: Vec<CString>,
    _envp: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    envp_ptrs: Vec<*const libc::c_char>,
    max_fd: i32,
}

fn to_cstring(s: &OsStr, what: &str) -> Result<CString> {
    CString::new(s.as_bytes()).map_err(|_| {
        ElevateError::ExecPrepare(format!("{} contains null byte: {}", what, s.to_string_lossy()))
    })
}

impl PreparedCommand {
    /// Convert `spec` for exec. `intercept_fd` is published to the command
    /// through the environment.
    pub fn new(spec: &CommandSpec, intercept_fd: Option<RawFd>) -> Result<Self> {
        let program = to_cstring(spec.program.as_os_str(), "Program path")?;

        let mut argv = Vec::with_capacity(spec.argv.len().max(1));
        for arg in &spec.argv {
            argv.push(to_cstring(arg, "Argument")?);
        }
        if argv.is_empty() {
            argv.push(program.clone());
        }

        let mut envp = Vec::with_capacity(spec.env.len() + 1);
        for (key, value) in &spec.env {
            if key == INTERCEPT_FD_ENV {
                continue;
            }
            let mut kv = Vec::with_capacity(key.len() + 1 + value.len());
            kv.extend_from_slice(key.as_bytes());
            kv.push(b'=');
            kv.extend_from_slice(value.as_bytes());
            envp.push(CString::new(kv).map_err(|_| {
                ElevateError::ExecPrepare(format!(
                    "Environment variable contains null byte: {}",
                    key.to_string_lossy()
                ))
            })?);
        }
        if let Some(fd) = intercept_fd {
            if let Ok(cstr) = CString::new(format!("{}={}", INTERCEPT_FD_ENV, fd)) {
                envp.push(cstr);
            }
        }

        let argv_ptrs = argv
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        let envp_ptrs = envp
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        Ok(Self {
            program,
            _argv: argv,
            _envp: envp,
            argv_ptrs,
            envp_ptrs,
            max_fd: get_max_fd(),
        })
    }

    /// Replace the child's image. Only returns on failure, with the errno.
    ///
    /// Async-signal-safe: runs between fork and exec.
    pub fn exec(&self, ctx: &ChildContext<'_>) -> Errno {
        if ctx.trace {
            if let Err(e) = ptrace::install_exec_filter() {
                return e;
            }
            ptrace::wait_for_tracer();
        }

        // SAFETY: resetting a disposition is async-signal-safe.
        unsafe { libc::signal(libc::SIGPIPE, libc::SIG_DFL) };

        let keep = [
            ctx.errfd,
            ctx.intercept_fd.unwrap_or(-1),
            ctx.exec_fd.unwrap_or(-1),
        ];
        close_inherited_fds(self.max_fd, &keep);

        // SAFETY: the mask is a valid sigset_t owned by the caller.
        unsafe {
            libc::pthread_sigmask(
                libc::SIG_SETMASK,
                ctx.original_mask.as_ref(),
                std::ptr::null_mut(),
            )
        };

        if let Some(fd) = ctx.exec_fd {
            fexec(fd, &self.argv_ptrs, &self.envp_ptrs);
        }
        // SAFETY: program, argv and envp are NUL-terminated and outlive the
        // call; execve only returns on failure.
        unsafe {
            libc::execve(
                self.program.as_ptr(),
                self.argv_ptrs.as_ptr(),
                self.envp_ptrs.as_ptr(),
            )
        };
        Errno::last()
    }
}

#[cfg(any(target_os = "linux", target_os = "freebsd"))]
fn fexec(fd: RawFd, argv: &[*const libc::c_char], envp: &[*const libc::c_char]) {
    // SAFETY: argv and envp are NULL-terminated arrays of valid C strings.
    unsafe { libc::fexecve(fd, argv.as_ptr(), envp.as_ptr()) };
}

#[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
fn fexec(_fd: RawFd, _argv: &[*const libc::c_char], _envp: &[*const libc::c_char]) {}

/// Close every descriptor above stdio up to `max_fd` except `keep`.
fn close_inherited_fds(max_fd: i32, keep: &[i32]) {
    for fd in 3..=max_fd {
        if !keep.contains(&fd) {
            // SAFETY: close is async-signal-safe; closing an unused number
            // just fails with EBADF.
            unsafe { libc::close(fd) };
        }
    }
}

/// Get the maximum file descriptor number to iterate over.
fn get_max_fd() -> i32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(entries) = std::fs::read_dir("/proc/self/fd") {
            return entries
                .filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().to_str().and_then(|s| s.parse::<i32>().ok()))
                .max()
                .unwrap_or(1024);
        }
    }

    // SAFETY: sysconf has no preconditions.
    let max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    if max > 0 {
        std::cmp::min(max as i32, 65536)
    } else {
        1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::{CStr, OsString};
    use std::os::fd::AsRawFd;

    fn env_strings(prepared: &PreparedCommand) -> Vec<String> {
        prepared
            ._envp
            .iter()
            .map(|c| c.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_prepare_publishes_intercept_fd() {
        let spec = CommandSpec::new("/bin/echo", vec!["echo".into(), "hi".into()]).with_env(vec![
            (OsString::from("PATH"), OsString::from("/bin")),
            (OsString::from(INTERCEPT_FD_ENV), OsString::from("99")),
        ]);
        let prepared = PreparedCommand::new(&spec, Some(7)).expect("prepare");

        let env = env_strings(&prepared);
        assert!(env.contains(&"PATH=/bin".to_string()));
        assert!(env.contains(&format!("{}=7", INTERCEPT_FD_ENV)));
        assert!(!env.contains(&format!("{}=99", INTERCEPT_FD_ENV)));

        assert_eq!(prepared.argv_ptrs.len(), 3);
        assert!(prepared.argv_ptrs[2].is_null());
        assert!(prepared.envp_ptrs.last().is_some_and(|p| p.is_null()));
        // SAFETY: argv_ptrs[1] points into prepared._argv.
        let arg1 = unsafe { CStr::from_ptr(prepared.argv_ptrs[1]) };
        assert_eq!(arg1.to_bytes(), b"hi");
    }

    #[test]
    fn test_prepare_rejects_nul() {
        let spec = CommandSpec::new("/bin/echo", vec![OsString::from("a\0b")]);
        assert!(matches!(
            PreparedCommand::new(&spec, None),
            Err(ElevateError::ExecPrepare(_))
        ));
    }

    #[test]
    fn test_empty_argv_uses_program() {
        let spec = CommandSpec::new("/bin/true", vec![]).with_env(vec![]);
        let prepared = PreparedCommand::new(&spec, None).expect("prepare");
        assert_eq!(prepared._argv.len(), 1);
        assert_eq!(prepared._argv[0].as_bytes(), b"/bin/true");
        assert!(env_strings(&prepared).is_empty());
    }

    #[test]
    fn test_max_fd_covers_open_descriptors() {
        let file = tempfile::tempfile().expect("tempfile");
        assert!(get_max_fd() >= file.as_raw_fd());
    }
}
