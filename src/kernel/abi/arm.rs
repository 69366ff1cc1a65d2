// Linux ARM EABI syscall numbers (arch/arm/tools/syscall.tbl).
// The number is in r7 and arguments in r0-r5; r0 is clobbered by the return
// value so the first argument is read from orig_r0.

use super::{Abi, AbiBackend, RawRegisters, SyscallFrame, SyscallTable};
use once_cell::sync::Lazy;

const ORIG_R0: usize = 17;

const SYSCALLS: &[(&str, u64)] = &[
    ("restart_syscall", 0),
    ("exit", 1),
    ("fork", 2),
    ("read", 3),
    ("write", 4),
    ("open", 5),
    ("close", 6),
    ("creat", 8),
    ("link", 9),
    ("unlink", 10),
    ("execve", 11),
    ("chdir", 12),
    ("mknod", 14),
    ("chmod", 15),
    ("lseek", 19),
    ("getpid", 20),
    ("mount", 21),
    ("setuid", 23),
    ("getuid", 24),
    ("ptrace", 26),
    ("pause", 29),
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
    ("setrlimit", 75),
    ("getrusage", 77),
    ("gettimeofday", 78),
    ("symlink", 83),
    ("readlink", 85),
    ("munmap", 91),
    ("truncate", 92),
    ("ftruncate", 93),
    ("fchmod", 94),
    ("getpriority", 96),
    ("statfs", 99),
    ("fstatfs", 100),
    ("setitimer", 104),
    ("getitimer", 105),
    ("stat", 106),
    ("lstat", 107),
    ("fstat", 108),
    ("wait4", 114),
    ("sysinfo", 116),
    ("fsync", 118),
    ("sigreturn", 119),
    ("clone", 120),
    ("uname", 122),
    ("mprotect", 125),
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
    ("getdents64", 217),
    ("madvise", 220),
    ("fcntl64", 221),
    ("gettid", 224),
    ("readahead", 225),
    ("tkill", 238),
    ("sendfile64", 239),
    ("futex", 240),
    ("sched_setaffinity", 241),
    ("sched_getaffinity", 242),
    ("exit_group", 248),
    ("epoll_create", 250),
    ("epoll_ctl", 251),
    ("epoll_wait", 252),
    ("set_tid_address", 256),
    ("clock_gettime", 263),
    ("clock_getres", 264),
    ("clock_nanosleep", 265),
    ("statfs64", 266),
    ("fstatfs64", 267),
    ("tgkill", 268),
    ("utimes", 269),
    ("arm_fadvise64_64", 270),
    ("waitid", 280),
    ("socket", 281),
    ("bind", 282),
    ("connect", 283),
    ("openat", 322),
    ("mkdirat", 323),
    ("fchownat", 325),
    ("fstatat64", 327),
    ("unlinkat", 328),
    ("renameat", 329),
    ("linkat", 330),
    ("symlinkat", 331),
    ("readlinkat", 332),
    ("fchmodat", 333),
    ("faccessat", 334),
    ("pselect6", 335),
    ("ppoll", 336),
    ("set_robust_list", 338),
    ("get_robust_list", 339),
    ("getcpu", 345),
    ("utimensat", 348),
    ("eventfd2", 356),
    ("epoll_create1", 357),
    ("dup3", 358),
    ("pipe2", 359),
    ("preadv", 361),
    ("pwritev", 362),
    ("prlimit64", 369),
    ("renameat2", 382),
    ("getrandom", 384),
    ("memfd_create", 385),
    ("execveat", 387),
    ("membarrier", 389),
    ("copy_file_range", 391),
    ("statx", 397),
    ("rseq", 398),
    ("clock_gettime64", 403),
    ("clock_getres_time64", 406),
    ("clock_nanosleep_time64", 407),
    ("futex_time64", 422),
    ("pidfd_open", 434),
    ("clone3", 435),
    ("close_range", 436),
    ("openat2", 437),
    ("faccessat2", 439),
    ("cacheflush", 0xf0002),
    ("set_tls", 0xf0005),
];

static TABLE: Lazy<SyscallTable> = Lazy::new(|| SyscallTable::from_entries(SYSCALLS));

#[derive(Debug, Clone, Copy, Default)]
pub struct ArmBackend;

impl AbiBackend for ArmBackend {
    fn abi(&self) -> Abi {
        Abi::Arm
    }

    fn table(&self) -> &'static SyscallTable {
        &TABLE
    }

    fn decode(&self, regs: &RawRegisters) -> Option<SyscallFrame> {
        match regs {
            RawRegisters::Arm { regs } => Some(SyscallFrame {
                abi: Abi::Arm,
                number: u64::from(regs[7]),
                args: [
                    u64::from(regs[ORIG_R0]),
                    u64::from(regs[1]),
                    u64::from(regs[2]),
                    u64::from(regs[3]),
                    u64::from(regs[4]),
                    u64::from(regs[5]),
                ],
            }),
            _ => None,
        }
    }
}
