//! ptrace + seccomp based sub-command interception (Linux).
//!
//! The child installs a seccomp filter that returns `SECCOMP_RET_TRACE` for
//! `execve`/`execveat` and parks until the supervisor has seized it. Every
//! exec attempt of the command or its descendants then produces a seccomp
//! event stop in the supervisor, which reads the program and argument
//! vector out of the tracee before resuming it.

use super::types::Subcommand;
use super::SeizeOutcome;
use crate::hooks::ExecHooks;
use crate::signals::signal_name;
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use tracing::{debug, info, warn};

// Seccomp constants not in libc crate
const SECCOMP_MODE_FILTER: libc::c_ulong = 2;
const SECCOMP_RET_TRACE: u32 = 0x7ff0_0000;
const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;

// BPF constants
const BPF_LD: u16 = 0x00;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JMP: u16 = 0x05;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;
const BPF_RET: u16 = 0x06;

// Offsets of `nr` and `arch` in seccomp_data
const SECCOMP_DATA_NR_OFFSET: u32 = 0;
const SECCOMP_DATA_ARCH_OFFSET: u32 = 4;

#[cfg(target_arch = "x86_64")]
const AUDIT_ARCH_NATIVE: u32 = 0xc000_003e;
#[cfg(target_arch = "aarch64")]
const AUDIT_ARCH_NATIVE: u32 = 0xc000_00b7;

const SYS_EXECVE: i64 = libc::SYS_execve as i64;
const SYS_EXECVEAT: i64 = libc::SYS_execveat as i64;

/// Longest string read out of a tracee.
const MAX_STRING: usize = libc::PATH_MAX as usize;
/// Most argv entries read out of a tracee.
const MAX_ARGS: usize = 4096;

/// A single BPF instruction.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct SockFilterInsn {
    code: u16,
    jt: u8,
    jf: u8,
    k: u32,
}

/// BPF program header.
#[repr(C)]
struct SockFprog {
    len: u16,
    filter: *const SockFilterInsn,
}

/// Whether the kernel lists `action` in its available seccomp actions.
pub fn seccomp_action_listed(actions_avail: &str, action: &str) -> bool {
    actions_avail.split_whitespace().any(|a| a == action)
}

/// Whether ptrace interception can work on this kernel.
pub fn supported() -> bool {
    match std::fs::read_to_string("/proc/sys/kernel/seccomp/actions_avail") {
        Ok(contents) => seccomp_action_listed(&contents, "trace"),
        Err(e) => {
            debug!("cannot read seccomp actions: {}", e);
            false
        }
    }
}

/// Route `execve` and `execveat` to the tracer.
///
/// Runs in the child between fork and exec: no allocation. Without
/// `CAP_SYS_ADMIN` the filter needs `no_new_privs`, which is set on demand.
pub fn install_exec_filter() -> Result<(), Errno> {
    // BPF program:
    //   ld  [arch]
    //   jeq AUDIT_ARCH_NATIVE, 0, allow
    //   ld  [nr]
    //   jeq SYS_execve, trace
    //   jeq SYS_execveat, trace, allow
    //   trace: ret SECCOMP_RET_TRACE
    //   allow: ret SECCOMP_RET_ALLOW
    let filter = [
        SockFilterInsn {
            code: BPF_LD | BPF_W | BPF_ABS,
            jt: 0,
            jf: 0,
            k: SECCOMP_DATA_ARCH_OFFSET,
        },
        SockFilterInsn {
            code: BPF_JMP | BPF_JEQ | BPF_K,
            jt: 0,
            jf: 4,
            k: AUDIT_ARCH_NATIVE,
        },
        SockFilterInsn {
            code: BPF_LD | BPF_W | BPF_ABS,
            jt: 0,
            jf: 0,
            k: SECCOMP_DATA_NR_OFFSET,
        },
        SockFilterInsn {
            code: BPF_JMP | BPF_JEQ | BPF_K,
            jt: 1,
            jf: 0,
            k: SYS_EXECVE as u32,
        },
        SockFilterInsn {
            code: BPF_JMP | BPF_JEQ | BPF_K,
            jt: 0,
            jf: 1,
            k: SYS_EXECVEAT as u32,
        },
        SockFilterInsn {
            code: BPF_RET | BPF_K,
            jt: 0,
            jf: 0,
            k: SECCOMP_RET_TRACE,
        },
        SockFilterInsn {
            code: BPF_RET | BPF_K,
            jt: 0,
            jf: 0,
            k: SECCOMP_RET_ALLOW,
        },
    ];
    let prog = SockFprog {
        len: filter.len() as u16,
        filter: filter.as_ptr(),
    };

    // SAFETY: prog and filter live on this stack frame for the whole call.
    let set_filter = || unsafe {
        libc::prctl(
            libc::PR_SET_SECCOMP,
            SECCOMP_MODE_FILTER,
            &prog as *const SockFprog,
        )
    };

    if set_filter() == 0 {
        return Ok(());
    }
    let err = Errno::last();
    if err != Errno::EACCES {
        return Err(err);
    }
    // SAFETY: prctl with PR_SET_NO_NEW_PRIVS is always safe to call.
    if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
        return Err(Errno::last());
    }
    if set_filter() == 0 {
        Ok(())
    } else {
        Err(Errno::last())
    }
}

extern "C" fn wake_up(_: libc::c_int) {}

/// Block in the child until the supervisor delivers `SIGUSR1`.
///
/// Called with every signal blocked; only `SIGUSR1` is let through while
/// suspended.
pub fn wait_for_tracer() {
    // SAFETY: sigaction, sigfillset, sigdelset and sigsuspend are all
    // async-signal-safe and operate on stack-local structures.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = wake_up as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::sigfillset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGUSR1, &sa, std::ptr::null_mut());

        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigfillset(&mut mask);
        libc::sigdelset(&mut mask, libc::SIGUSR1);
        libc::sigsuspend(&mask);
    }
}

/// Seize a child parked in [`wait_for_tracer`] and let it continue.
///
/// Runs with all signals blocked, so the trace stop consumed here does not
/// race the reaper.
pub fn seize(child: Pid) -> SeizeOutcome {
    let options = ptrace::Options::PTRACE_O_TRACESECCOMP
        | ptrace::Options::PTRACE_O_TRACECLONE
        | ptrace::Options::PTRACE_O_TRACEFORK
        | ptrace::Options::PTRACE_O_TRACEVFORK;

    let mut already_traced = false;
    if let Err(e) = ptrace::seize(child, options) {
        // Running under another intercepting supervisor is allowed.
        if e != Errno::EPERM {
            warn!("ptrace(PTRACE_SEIZE, {}) failed: {}", child, e);
            return SeizeOutcome::Failed(e);
        }
        debug!("unable to trace process {}, already being traced?", child);
        already_traced = true;
    }

    // The child is parked waiting for SIGUSR1.
    if let Err(e) = kill(child, Signal::SIGUSR1) {
        warn!("kill({}, SIGUSR1) failed: {}", child, e);
        return SeizeOutcome::Failed(e);
    }
    if already_traced {
        return SeizeOutcome::AlreadyTraced;
    }

    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: status is a valid out-pointer.
        let ret = unsafe { libc::waitpid(child.as_raw(), &mut status, libc::__WALL) };
        if ret != -1 {
            break;
        }
        let err = Errno::last();
        if err != Errno::EINTR {
            warn!("waitpid for traced process {} failed: {}", child, err);
            return SeizeOutcome::Failed(err);
        }
    }
    if !libc::WIFSTOPPED(status) {
        warn!("process {} exited unexpectedly", child);
        return SeizeOutcome::Failed(Errno::ESRCH);
    }
    if let Err(e) = ptrace::cont(child, Signal::SIGUSR1) {
        warn!("ptrace(PTRACE_CONT, {}, SIGUSR1) failed: {}", child, e);
        return SeizeOutcome::Failed(e);
    }
    SeizeOutcome::Seized
}

/// Kinds of ptrace stop the supervisor distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceStop {
    /// The tracee hit the exec filter.
    Seccomp,
    /// The tracee created a new (traced) process.
    NewProcess,
    /// Job-control stop of the tracee's group.
    GroupStop(i32),
    /// A signal is about to be delivered to the tracee.
    SignalDelivery(i32),
}

/// Classify a raw stopped wait status.
pub fn classify_stop(status: i32) -> TraceStop {
    let stopsig = libc::WSTOPSIG(status);
    let sigtrap = status >> 8;
    let event = |ev: libc::c_int| libc::SIGTRAP | (ev << 8);

    if sigtrap == event(libc::PTRACE_EVENT_SECCOMP) {
        return TraceStop::Seccomp;
    }
    if sigtrap == event(libc::PTRACE_EVENT_CLONE)
        || sigtrap == event(libc::PTRACE_EVENT_FORK)
        || sigtrap == event(libc::PTRACE_EVENT_VFORK)
    {
        return TraceStop::NewProcess;
    }
    match stopsig {
        libc::SIGSTOP | libc::SIGTSTP | libc::SIGTTIN | libc::SIGTTOU
            if status >> 16 == libc::PTRACE_EVENT_STOP =>
        {
            TraceStop::GroupStop(stopsig)
        }
        _ => TraceStop::SignalDelivery(stopsig),
    }
}

/// Handle a stop of traced process `pid` and restart it.
///
/// Returns true for a group stop, which the supervisor must act on; every
/// other stop is resumed transparently.
pub fn stopped(pid: Pid, status: i32, hooks: &mut dyn ExecHooks) -> bool {
    let mut deliver: Option<Signal> = None;
    let stop = classify_stop(status);

    match stop {
        TraceStop::Seccomp => match read_exec_request(pid) {
            Ok(sub) => hooks.subcommand(&sub),
            Err(e) => debug!("{}: failed to intercept execve: {}", pid, e),
        },
        TraceStop::NewProcess => match ptrace::getevent(pid) {
            Ok(new_pid) => debug!("{} forked new child {}", pid, new_pid),
            Err(e) => debug!("ptrace(PTRACE_GETEVENTMSG, {}) failed: {}", pid, e),
        },
        TraceStop::GroupStop(sig) => {
            debug!("{}: group-stop signal {}", pid, signal_name(sig));
        }
        TraceStop::SignalDelivery(sig) => {
            debug!("{}: signal-delivery-stop signal {}", pid, signal_name(sig));
            deliver = Signal::try_from(sig).ok();
        }
    }

    if let TraceStop::GroupStop(_) = stop {
        // Keep it stopped until SIGCONT while still reporting events.
        // SAFETY: PTRACE_LISTEN takes no address or data.
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_LISTEN,
                pid.as_raw(),
                std::ptr::null_mut::<libc::c_void>(),
                std::ptr::null_mut::<libc::c_void>(),
            )
        };
        if ret == -1 && Errno::last() != Errno::ESRCH {
            warn!("ptrace(PTRACE_LISTEN, {}) failed: {}", pid, Errno::last());
        }
        true
    } else {
        if let Err(e) = ptrace::cont(pid, deliver) {
            if e != Errno::ESRCH {
                warn!("ptrace(PTRACE_CONT, {}) failed: {}", pid, e);
            }
        }
        false
    }
}

/// Parse `/proc/<pid>/syscall`: the syscall number and its six arguments.
pub fn parse_syscall_line(line: &str) -> Option<(i64, [u64; 6])> {
    let mut fields = line.split_whitespace();
    let nr: i64 = fields.next()?.parse().ok()?;
    let mut args = [0u64; 6];
    for arg in args.iter_mut() {
        let field = fields.next()?;
        *arg = u64::from_str_radix(field.trim_start_matches("0x"), 16).ok()?;
    }
    Some((nr, args))
}

/// Addresses of the path and argv of a pending exec syscall.
fn exec_pointers(nr: i64, args: &[u64; 6]) -> Option<(u64, u64)> {
    match nr {
        SYS_EXECVE => Some((args[0], args[1])),
        SYS_EXECVEAT => Some((args[1], args[2])),
        _ => None,
    }
}

/// Read a NUL-terminated string at `addr` in the tracee's memory.
fn read_cstring(mem: &std::fs::File, addr: u64) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut chunk = [0u8; 256];
    let mut offset = addr;
    while out.len() < MAX_STRING {
        let n = mem.read_at(&mut chunk, offset)?;
        if n == 0 {
            break;
        }
        if let Some(end) = chunk[..n].iter().position(|&b| b == 0) {
            out.extend_from_slice(&chunk[..end]);
            return Ok(out);
        }
        out.extend_from_slice(&chunk[..n]);
        offset += n as u64;
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "unterminated string in tracee memory",
    ))
}

/// Read a NULL-terminated pointer array of strings at `addr`.
fn read_string_array(mem: &std::fs::File, addr: u64) -> std::io::Result<Vec<String>> {
    const PTR: usize = std::mem::size_of::<usize>();
    let mut out = Vec::new();
    if addr == 0 {
        return Ok(out);
    }
    for i in 0..MAX_ARGS {
        let mut raw = [0u8; PTR];
        mem.read_exact_at(&mut raw, addr + (i * PTR) as u64)?;
        let ptr = usize::from_ne_bytes(raw) as u64;
        if ptr == 0 {
            return Ok(out);
        }
        let bytes = read_cstring(mem, ptr)?;
        out.push(String::from_utf8_lossy(&bytes).into_owned());
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "argument vector too long",
    ))
}

/// Read the program and arguments of the exec `pid` is stopped in.
pub fn read_exec_request(pid: Pid) -> std::io::Result<Subcommand> {
    let line = std::fs::read_to_string(format!("/proc/{}/syscall", pid))?;
    let (nr, args) = parse_syscall_line(&line).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unexpected syscall line: {}", line.trim()),
        )
    })?;
    let (path_ptr, argv_ptr) = exec_pointers(nr, &args).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("syscall {} is not an exec", nr),
        )
    })?;

    let mem = std::fs::File::open(format!("/proc/{}/mem", pid))?;
    let path = read_cstring(&mem, path_ptr)?;
    let argv = read_string_array(&mem, argv_ptr)?;
    info!("{}: intercepted execve {:?}", pid, String::from_utf8_lossy(&path));

    Ok(Subcommand {
        pid: pid.as_raw(),
        path: PathBuf::from(OsString::from_vec(path)),
        argv,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn test_seccomp_action_listed() {
        let avail = "kill_process kill_thread trap errno user_notif trace log allow\n";
        assert!(seccomp_action_listed(avail, "trace"));
        assert!(!seccomp_action_listed(avail, "tra"));
        assert!(!seccomp_action_listed("", "trace"));
    }

    #[test]
    fn test_parse_syscall_line() {
        let line = format!(
            "{} 0x7ffd1000 0x7ffd2000 0x7ffd3000 0x0 0x0 0x0 0x7ffd0000 0x7f0012345678\n",
            SYS_EXECVE
        );
        let (nr, args) = parse_syscall_line(&line).expect("parse");
        assert_eq!(nr, SYS_EXECVE);
        assert_eq!(args[0], 0x7ffd1000);
        assert_eq!(args[1], 0x7ffd2000);
        assert_eq!(exec_pointers(nr, &args), Some((0x7ffd1000, 0x7ffd2000)));

        assert!(parse_syscall_line("running").is_none());
        assert!(parse_syscall_line("-1 0x7ffd0000 0x7f00").is_none());
    }

    #[test]
    fn test_execveat_pointers() {
        let args = [3, 0x1000, 0x2000, 0x3000, 0, 0];
        assert_eq!(exec_pointers(SYS_EXECVEAT, &args), Some((0x1000, 0x2000)));
        assert_eq!(exec_pointers(0, &args), None);
    }

    #[test]
    fn test_classify_stop() {
        let seccomp = (libc::SIGTRAP | (libc::PTRACE_EVENT_SECCOMP << 8)) << 8 | 0x7f;
        assert_eq!(classify_stop(seccomp), TraceStop::Seccomp);

        let fork = (libc::SIGTRAP | (libc::PTRACE_EVENT_FORK << 8)) << 8 | 0x7f;
        assert_eq!(classify_stop(fork), TraceStop::NewProcess);

        let group = (libc::PTRACE_EVENT_STOP << 16) | (libc::SIGTSTP << 8) | 0x7f;
        assert_eq!(classify_stop(group), TraceStop::GroupStop(libc::SIGTSTP));

        let delivery = (libc::SIGTSTP << 8) | 0x7f;
        assert_eq!(
            classify_stop(delivery),
            TraceStop::SignalDelivery(libc::SIGTSTP)
        );

        let int = (libc::SIGINT << 8) | 0x7f;
        assert_eq!(classify_stop(int), TraceStop::SignalDelivery(libc::SIGINT));
    }

    #[test]
    fn test_read_own_memory() {
        let path = CString::new("/usr/bin/env").expect("cstring");
        let a0 = CString::new("env").expect("cstring");
        let a1 = CString::new("-i").expect("cstring");
        let argv: [*const libc::c_char; 3] = [a0.as_ptr(), a1.as_ptr(), std::ptr::null()];

        let mem = std::fs::File::open("/proc/self/mem").expect("open mem");
        let got = read_cstring(&mem, path.as_ptr() as u64).expect("read path");
        assert_eq!(got, b"/usr/bin/env");

        let args = read_string_array(&mem, argv.as_ptr() as u64).expect("read argv");
        assert_eq!(args, vec!["env", "-i"]);
    }
}
