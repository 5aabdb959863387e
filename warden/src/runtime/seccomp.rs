//! Seccomp profile generation
//!
//! The profile default-denies and allows only the syscall families an
//! untrusted script needs: file I/O, process control, memory, time, and
//! signals. Socket syscalls are included only when the execution's network
//! policy enables networking.

use std::path::PathBuf;

use serde_json::{json, Value};

use crate::error::Result;

const FILE_IO_SYSCALLS: &[&str] = &[
    "read", "write", "readv", "writev", "pread64", "pwrite64", "open", "openat", "openat2",
    "close", "close_range", "creat", "stat", "fstat", "lstat", "newfstatat", "statx", "lseek",
    "access", "faccessat", "faccessat2", "dup", "dup2", "dup3", "pipe", "pipe2", "fcntl",
    "flock", "fsync", "fdatasync", "truncate", "ftruncate", "getdents", "getdents64", "getcwd",
    "chdir", "fchdir", "rename", "renameat", "renameat2", "mkdir", "mkdirat", "rmdir", "unlink",
    "unlinkat", "link", "linkat", "symlink", "symlinkat", "readlink", "readlinkat", "chmod",
    "fchmod", "fchmodat", "umask", "ioctl", "poll", "ppoll", "select", "pselect6", "epoll_create",
    "epoll_create1", "epoll_ctl", "epoll_wait", "epoll_pwait", "eventfd", "eventfd2",
];

const PROCESS_SYSCALLS: &[&str] = &[
    "clone", "clone3", "fork", "vfork", "execve", "execveat", "exit", "exit_group", "wait4",
    "waitid", "getpid", "getppid", "gettid", "getuid", "geteuid", "getgid", "getegid",
    "getgroups", "getpgrp", "getpgid", "setpgid", "getsid", "setsid", "sched_yield",
    "sched_getaffinity", "prctl", "arch_prctl", "set_tid_address", "set_robust_list",
    "get_robust_list", "futex", "futex_waitv", "getrlimit", "prlimit64", "getrusage",
];

const MEMORY_SYSCALLS: &[&str] = &[
    "brk", "mmap", "mmap2", "munmap", "mremap", "mprotect", "madvise", "mincore", "mlock",
    "munlock", "membarrier",
];

const TIME_SYSCALLS: &[&str] = &[
    "clock_gettime", "clock_getres", "clock_nanosleep", "gettimeofday", "time", "times",
    "nanosleep", "timer_create", "timer_settime", "timer_gettime", "timer_delete",
    "timerfd_create", "timerfd_settime", "timerfd_gettime",
];

const SIGNAL_SYSCALLS: &[&str] = &[
    "rt_sigaction", "rt_sigprocmask", "rt_sigreturn", "rt_sigpending", "rt_sigtimedwait",
    "rt_sigsuspend", "rt_sigqueueinfo", "sigaltstack", "kill", "tkill", "tgkill",
];

const SOCKET_SYSCALLS: &[&str] = &[
    "socket", "socketpair", "connect", "bind", "listen", "accept", "accept4", "getsockname",
    "getpeername", "sendto", "recvfrom", "sendmsg", "recvmsg", "sendmmsg", "recvmmsg",
    "shutdown", "setsockopt", "getsockopt",
];

/// Build the seccomp profile document
///
/// `network_enabled` adds the socket family; everything else is always the
/// same deny-by-default profile.
pub fn profile(network_enabled: bool) -> Value {
    let mut allowed: Vec<&str> = Vec::new();
    allowed.extend_from_slice(FILE_IO_SYSCALLS);
    allowed.extend_from_slice(PROCESS_SYSCALLS);
    allowed.extend_from_slice(MEMORY_SYSCALLS);
    allowed.extend_from_slice(TIME_SYSCALLS);
    allowed.extend_from_slice(SIGNAL_SYSCALLS);
    if network_enabled {
        allowed.extend_from_slice(SOCKET_SYSCALLS);
    }

    json!({
        "defaultAction": "SCMP_ACT_ERRNO",
        "architectures": ["SCMP_ARCH_X86_64", "SCMP_ARCH_AARCH64"],
        "syscalls": [
            {
                "names": allowed,
                "action": "SCMP_ACT_ALLOW"
            }
        ]
    })
}

/// Write the profile into `dir`, returning the file path
///
/// The file name encodes the network flag so both variants can coexist.
pub fn write_profile(dir: &std::path::Path, network_enabled: bool) -> Result<PathBuf> {
    let name = if network_enabled {
        "seccomp-net.json"
    } else {
        "seccomp.json"
    };
    let path = dir.join(name);
    let doc = serde_json::to_vec_pretty(&profile(network_enabled))
        .map_err(|e| crate::error::Error::Internal(format!("seccomp profile encode: {}", e)))?;
    std::fs::write(&path, doc)?;
    Ok(path)
}
