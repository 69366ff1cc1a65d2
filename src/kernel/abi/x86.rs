// Linux i386 syscall numbers (arch/x86/entry/syscalls/syscall_32.tbl).
// Arguments travel in ebx, ecx, edx, esi, edi, ebp.

use super::{Abi, AbiBackend, RawRegisters, SyscallFrame, SyscallTable};
use once_cell::sync::Lazy;

const SYSCALLS: &[(&str, u64)] = &[
    ("restart_syscall", 0),
    ("exit", 1),
    ("fork", 2),
    ("read", 3),
    ("write", 4),
    ("open", 5),
    ("close", 6),
    ("waitpid", 7),
    ("creat", 8),
    ("link", 9),
    ("unlink", 10),
    ("execve", 11),
    ("chdir", 12),
    ("time", 13),
    ("mknod", 14),
    ("chmod", 15),
    ("lseek", 19),
    ("getpid", 20),
    ("mount", 21),
    ("setuid", 23),
    ("getuid", 24),
    ("ptrace", 26),
    ("alarm", 27),
    ("pause", 29),
    ("utime", 30),
    ("access", 33),
    ("sync", 36),
    ("kill", 37),
    ("rename", 38),
    ("mkdir", 39),
    ("rmdir", 40),
    ("dup", 41),
    ("pipe", 42),
    ("times", 43),
    ("brk", 45),
    ("setgid", 46),
    ("getgid", 47),
    ("geteuid", 49),
    ("getegid", 50),
    ("ioctl", 54),
    ("fcntl", 55),
    ("setpgid", 57),
    ("umask", 60),
    ("chroot", 61),
    ("dup2", 63),
    ("getppid", 64),
    ("getpgrp", 65),
    ("setsid", 66),
    ("sigaction", 67),
    ("setrlimit", 75),
    ("getrlimit", 76),
    ("getrusage", 77),
    ("gettimeofday", 78),
    ("symlink", 83),
    ("readlink", 85),
    ("mmap", 90),
    ("munmap", 91),
    ("truncate", 92),
    ("ftruncate", 93),
    ("fchmod", 94),
    ("getpriority", 96),
    ("statfs", 99),
    ("fstatfs", 100),
    ("socketcall", 102),
    ("setitimer", 104),
    ("getitimer", 105),
    ("stat", 106),
    ("lstat", 107),
    ("fstat", 108),
    ("wait4", 114),
    ("sysinfo", 116),
    ("ipc", 117),
    ("fsync", 118),
    ("sigreturn", 119),
    ("clone", 120),
    ("uname", 122),
    ("mprotect", 125),
    ("sigprocmask", 126),
    ("getpgid", 132),
    ("fchdir", 133),
    ("_llseek", 140),
    ("getdents", 141),
    ("_newselect", 142),
    ("flock", 143),
    ("msync", 144),
    ("readv", 145),
    ("writev", 146),
    ("getsid", 147),
    ("fdatasync", 148),
    ("sched_getparam", 155),
    ("sched_getscheduler", 157),
    ("sched_yield", 158),
    ("sched_get_priority_max", 159),
    ("sched_get_priority_min", 160),
    ("nanosleep", 162),
    ("mremap", 163),
    ("poll", 168),
    ("prctl", 172),
    ("rt_sigreturn", 173),
    ("rt_sigaction", 174),
    ("rt_sigprocmask", 175),
    ("rt_sigpending", 176),
    ("rt_sigtimedwait", 177),
    ("rt_sigsuspend", 179),
    ("pread64", 180),
    ("pwrite64", 181),
    ("getcwd", 183),
    ("sigaltstack", 186),
    ("sendfile", 187),
    ("vfork", 190),
    ("ugetrlimit", 191),
    ("mmap2", 192),
    ("truncate64", 193),
    ("ftruncate64", 194),
    ("stat64", 195),
    ("lstat64", 196),
    ("fstat64", 197),
    ("getuid32", 199),
    ("getgid32", 200),
    ("geteuid32", 201),
    ("getegid32", 202),
    ("getgroups32", 205),
    ("madvise", 219),
    ("getdents64", 220),
    ("fcntl64", 221),
    ("gettid", 224),
    ("readahead", 225),
    ("tkill", 238),
    ("sendfile64", 239),
    ("futex", 240),
    ("sched_setaffinity", 241),
    ("sched_getaffinity", 242),
    ("set_thread_area", 243),
    ("get_thread_area", 244),
    ("fadvise64", 250),
    ("exit_group", 252),
    ("epoll_create", 254),
    ("epoll_ctl", 255),
    ("epoll_wait", 256),
    ("set_tid_address", 258),
    ("clock_gettime", 265),
    ("clock_getres", 266),
    ("clock_nanosleep", 267),
    ("statfs64", 268),
    ("fstatfs64", 269),
    ("tgkill", 270),
    ("utimes", 271),
    ("fadvise64_64", 272),
    ("waitid", 284),
    ("openat", 295),
    ("mkdirat", 296),
    ("fchownat", 298),
    ("fstatat64", 300),
    ("unlinkat", 301),
    ("renameat", 302),
    ("linkat", 303),
    ("symlinkat", 304),
    ("readlinkat", 305),
    ("fchmodat", 306),
    ("faccessat", 307),
    ("pselect6", 308),
    ("ppoll", 309),
    ("set_robust_list", 311),
    ("get_robust_list", 312),
    ("getcpu", 318),
    ("utimensat", 320),
    ("eventfd2", 328),
    ("epoll_create1", 329),
    ("dup3", 330),
    ("pipe2", 331),
    ("preadv", 333),
    ("pwritev", 334),
    ("prlimit64", 340),
    ("renameat2", 353),
    ("getrandom", 355),
    ("memfd_create", 356),
    ("execveat", 358),
    ("socket", 359),
    ("socketpair", 360),
    ("connect", 362),
    ("membarrier", 375),
    ("copy_file_range", 377),
    ("statx", 383),
    ("rseq", 386),
    ("clock_gettime64", 403),
    ("clock_getres_time64", 406),
    ("clock_nanosleep_time64", 407),
    ("futex_time64", 422),
    ("pidfd_open", 434),
    ("clone3", 435),
    ("close_range", 436),
    ("openat2", 437),
    ("faccessat2", 439),
];

static TABLE: Lazy<SyscallTable> = Lazy::new(|| SyscallTable::from_entries(SYSCALLS));

#[derive(Debug, Clone, Copy, Default)]
pub struct X86Backend;

impl AbiBackend for X86Backend {
    fn abi(&self) -> Abi {
        Abi::X86
    }

    fn table(&self) -> &'static SyscallTable {
        &TABLE
    }

    fn decode(&self, regs: &RawRegisters) -> Option<SyscallFrame> {
        let low = |value: u64| value & 0xffff_ffff;
        match regs {
            RawRegisters::X86_64 {
                orig_rax,
                rbx,
                rcx,
                rdx,
                rsi,
                rdi,
                rbp,
                ..
            } => Some(SyscallFrame {
                abi: Abi::X86,
                number: low(*orig_rax),
                args: [low(*rbx), low(*rcx), low(*rdx), low(*rsi), low(*rdi), low(*rbp)],
            }),
            _ => None,
        }
    }
}
