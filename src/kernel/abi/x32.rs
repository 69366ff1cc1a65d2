// Linux x32: the x86-64 table with the X32 bit set, except for the calls that
// pass pointers to structures whose layout differs. Those live at 512 and up.

use super::{
    decode_x86_64_family, Abi, AbiBackend, RawRegisters, SyscallFrame, SyscallTable,
    X32_SYSCALL_BIT,
};
use once_cell::sync::Lazy;

const X32_SPECIFIC: &[(&str, u64)] = &[
    ("rt_sigaction", 512),
    ("rt_sigreturn", 513),
    ("ioctl", 514),
    ("readv", 515),
    ("writev", 516),
    ("recvfrom", 517),
    ("sendmsg", 518),
    ("recvmsg", 519),
    ("execve", 520),
    ("ptrace", 521),
    ("rt_sigpending", 522),
    ("rt_sigtimedwait", 523),
    ("rt_sigqueueinfo", 524),
    ("sigaltstack", 525),
    ("timer_create", 526),
    ("mq_notify", 527),
    ("kexec_load", 528),
    ("waitid", 529),
    ("set_robust_list", 530),
    ("get_robust_list", 531),
    ("vmsplice", 532),
    ("move_pages", 533),
    ("preadv", 534),
    ("pwritev", 535),
    ("rt_tgsigqueueinfo", 536),
    ("recvmmsg", 537),
    ("sendmmsg", 538),
    ("process_vm_readv", 539),
    ("process_vm_writev", 540),
    ("setsockopt", 541),
    ("getsockopt", 542),
    ("io_setup", 543),
    ("io_submit", 544),
    ("execveat", 545),
    ("preadv2", 546),
    ("pwritev2", 547),
];

static TABLE: Lazy<SyscallTable> = Lazy::new(|| {
    let mut entries: Vec<(&'static str, u64)> = super::x64::SYSCALLS
        .iter()
        .filter(|(name, _)| !X32_SPECIFIC.iter().any(|(x32, _)| x32 == name))
        .copied()
        .collect();
    entries.extend_from_slice(X32_SPECIFIC);
    SyscallTable::from_entries(&entries)
});

#[derive(Debug, Clone, Copy, Default)]
pub struct X32Backend;

impl AbiBackend for X32Backend {
    fn abi(&self) -> Abi {
        Abi::X32
    }

    fn table(&self) -> &'static SyscallTable {
        &TABLE
    }

    /// Numbers are reported without the X32 marker bit.
    fn decode(&self, regs: &RawRegisters) -> Option<SyscallFrame> {
        decode_x86_64_family(Abi::X32, regs, |orig_rax, _| orig_rax & !X32_SYSCALL_BIT)
    }
}
