// FreeBSD amd64 syscall numbers (sys/kern/syscalls.master). The kernel takes
// the number in rax and arguments like Linux x86-64. A few entries are named
// after their Linux counterparts (`brk`, `getcwd`, `pread64`, `pwrite64`) so
// one allow-list serves both systems.

use super::{decode_x86_64_family, Abi, AbiBackend, RawRegisters, SyscallFrame, SyscallTable};
use once_cell::sync::Lazy;

const SYSCALLS: &[(&str, u64)] = &[
    ("exit", 1),
    ("fork", 2),
    ("read", 3),
    ("write", 4),
    ("open", 5),
    ("close", 6),
    ("wait4", 7),
    ("link", 9),
    ("unlink", 10),
    ("chdir", 12),
    ("fchdir", 13),
    ("chmod", 15),
    ("chown", 16),
    ("brk", 17),
    ("getpid", 20),
    ("mount", 21),
    ("unmount", 22),
    ("setuid", 23),
    ("getuid", 24),
    ("geteuid", 25),
    ("ptrace", 26),
    ("recvmsg", 27),
    ("sendmsg", 28),
    ("recvfrom", 29),
    ("access", 33),
    ("sync", 36),
    ("kill", 37),
    ("getppid", 39),
    ("dup", 41),
    ("getegid", 43),
    ("getgid", 47),
    ("sigaltstack", 53),
    ("ioctl", 54),
    ("symlink", 57),
    ("readlink", 58),
    ("execve", 59),
    ("umask", 60),
    ("chroot", 61),
    ("msync", 65),
    ("vfork", 66),
    ("munmap", 73),
    ("mprotect", 74),
    ("madvise", 75),
    ("mincore", 78),
    ("getgroups", 79),
    ("getpgrp", 81),
    ("setpgid", 82),
    ("setitimer", 83),
    ("getitimer", 86),
    ("getdtablesize", 89),
    ("dup2", 90),
    ("fcntl", 92),
    ("select", 93),
    ("fsync", 95),
    ("socket", 97),
    ("connect", 98),
    ("getpriority", 100),
    ("bind", 104),
    ("setsockopt", 105),
    ("listen", 106),
    ("gettimeofday", 116),
    ("getrusage", 117),
    ("getsockopt", 118),
    ("readv", 120),
    ("writev", 121),
    ("fchmod", 124),
    ("rename", 128),
    ("flock", 131),
    ("sendto", 133),
    ("socketpair", 135),
    ("mkdir", 136),
    ("rmdir", 137),
    ("utimes", 138),
    ("setsid", 147),
    ("sysarch", 165),
    ("getrlimit", 194),
    ("setrlimit", 195),
    ("__sysctl", 202),
    ("mlock", 203),
    ("getpgid", 207),
    ("poll", 209),
    ("clock_gettime", 232),
    ("clock_getres", 234),
    ("nanosleep", 240),
    ("clock_nanosleep", 244),
    ("minherit", 250),
    ("rfork", 251),
    ("issetugid", 253),
    ("getdents", 272),
    ("getcwd", 326),
    ("sched_yield", 331),
    ("sigprocmask", 340),
    ("sigsuspend", 341),
    ("sigpending", 343),
    ("kqueue", 362),
    ("sigaction", 416),
    ("sigreturn", 417),
    ("getcontext", 421),
    ("setcontext", 422),
    ("thr_exit", 431),
    ("thr_self", 432),
    ("thr_kill", 433),
    ("thr_wake", 443),
    ("_umtx_op", 454),
    ("thr_new", 455),
    ("pread64", 475),
    ("pwrite64", 476),
    ("mmap", 477),
    ("lseek", 478),
    ("truncate", 479),
    ("ftruncate", 480),
    ("thr_kill2", 481),
    ("cpuset_getaffinity", 487),
    ("faccessat", 489),
    ("fchmodat", 490),
    ("fchownat", 491),
    ("fexecve", 492),
    ("linkat", 495),
    ("mkdirat", 496),
    ("openat", 499),
    ("readlinkat", 500),
    ("renameat", 501),
    ("symlinkat", 502),
    ("unlinkat", 503),
    ("cap_enter", 516),
    ("cap_getmode", 517),
    ("pipe2", 542),
    ("ppoll", 545),
    ("utimensat", 547),
    ("fstat", 551),
    ("fstatat", 552),
    ("getdirentries", 554),
    ("statfs", 555),
    ("fstatfs", 556),
    ("kevent", 560),
    ("getrandom", 563),
    ("sigfastblock", 573),
    ("__realpathat", 574),
    ("close_range", 575),
];

static TABLE: Lazy<SyscallTable> = Lazy::new(|| SyscallTable::from_entries(SYSCALLS));

#[derive(Debug, Clone, Copy, Default)]
pub struct FreeBsdX64Backend;

impl AbiBackend for FreeBsdX64Backend {
    fn abi(&self) -> Abi {
        Abi::FreeBsdX64
    }

    fn table(&self) -> &'static SyscallTable {
        &TABLE
    }

    fn decode(&self, regs: &RawRegisters) -> Option<SyscallFrame> {
        decode_x86_64_family(Abi::FreeBsdX64, regs, |_, rax| rax)
    }
}
