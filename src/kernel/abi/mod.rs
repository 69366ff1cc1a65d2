//! Syscall ABI backends
//!
//! Each backend owns a syscall numbering table and knows which registers carry
//! the syscall number and its six arguments. The policy layer never looks at
//! raw numbers itself; it asks the active backend for the canonical name.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod arm;
pub mod arm64;
pub mod freebsd_x64;
pub mod x32;
pub mod x64;
pub mod x86;

/// Syscall number bit marking an x32 call on an x86-64 kernel
pub const X32_SYSCALL_BIT: u64 = 0x4000_0000;

/// Code segment selector of 32-bit compat tasks on x86-64
const X86_COMPAT_CS: u64 = 0x23;

/// `AUDIT_ARCH_*` values reported by `PTRACE_GET_SYSCALL_INFO`
pub const AUDIT_ARCH_I386: u32 = 0x4000_0003;
pub const AUDIT_ARCH_X86_64: u32 = 0xc000_003e;

/// `int $0x80`, the i386 gate, which a 64-bit task can use too
pub const INT80: [u8; 2] = [0xcd, 0x80];

/// What the tracer could learn about how a task entered the kernel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryGate {
    /// Audit arch from `PTRACE_GET_SYSCALL_INFO`
    AuditArch(u32),
    /// The two instruction bytes ending at the saved instruction pointer
    Instruction([u8; 2]),
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Abi {
    X86,
    X32,
    X64,
    Arm,
    Arm64,
    FreeBsdX64,
}

impl Abi {
    pub const ALL: [Abi; 6] = [
        Abi::X86,
        Abi::X32,
        Abi::X64,
        Abi::Arm,
        Abi::Arm64,
        Abi::FreeBsdX64,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Abi::X86 => "x86",
            Abi::X32 => "x32",
            Abi::X64 => "x64",
            Abi::Arm => "arm",
            Abi::Arm64 => "arm64",
            Abi::FreeBsdX64 => "freebsd_x64",
        }
    }

    pub fn backend(&self) -> &'static dyn AbiBackend {
        match self {
            Abi::X86 => &x86::X86Backend,
            Abi::X32 => &x32::X32Backend,
            Abi::X64 => &x64::X64Backend,
            Abi::Arm => &arm::ArmBackend,
            Abi::Arm64 => &arm64::Arm64Backend,
            Abi::FreeBsdX64 => &freebsd_x64::FreeBsdX64Backend,
        }
    }

    /// ABI of binaries built for the host
    pub fn native() -> Option<Abi> {
        if cfg!(all(target_arch = "x86_64", target_os = "freebsd")) {
            Some(Abi::FreeBsdX64)
        } else if cfg!(all(target_arch = "x86_64", target_pointer_width = "32")) {
            Some(Abi::X32)
        } else if cfg!(target_arch = "x86_64") {
            Some(Abi::X64)
        } else if cfg!(target_arch = "x86") {
            Some(Abi::X86)
        } else if cfg!(target_arch = "aarch64") {
            Some(Abi::Arm64)
        } else if cfg!(target_arch = "arm") {
            Some(Abi::Arm)
        } else {
            None
        }
    }

    /// Like [`Abi::detect`], but trusts the entry gate over the code segment.
    /// A 64-bit task running `int $0x80` keeps a 64-bit CS yet gets the
    /// i386 table.
    pub fn detect_entry(regs: &RawRegisters, gate: EntryGate) -> Abi {
        match regs {
            RawRegisters::X86_64 { orig_rax, .. } if !cfg!(target_os = "freebsd") => match gate {
                EntryGate::AuditArch(AUDIT_ARCH_I386) | EntryGate::Instruction(INT80) => Abi::X86,
                EntryGate::AuditArch(AUDIT_ARCH_X86_64) if orig_rax & X32_SYSCALL_BIT != 0 => Abi::X32,
                EntryGate::AuditArch(AUDIT_ARCH_X86_64) => Abi::X64,
                _ => Abi::detect(regs),
            },
            _ => Abi::detect(regs),
        }
    }

    /// Work out which ABI a stopped task entered the kernel through from its
    /// registers alone
    pub fn detect(regs: &RawRegisters) -> Abi {
        match regs {
            RawRegisters::X86_64 { cs, orig_rax, .. } => {
                if cfg!(target_os = "freebsd") {
                    Abi::FreeBsdX64
                } else if *cs == X86_COMPAT_CS {
                    Abi::X86
                } else if orig_rax & X32_SYSCALL_BIT != 0 {
                    Abi::X32
                } else {
                    Abi::X64
                }
            }
            RawRegisters::Arm { .. } => Abi::Arm,
            RawRegisters::Aarch64 { .. } => Abi::Arm64,
        }
    }
}

impl std::fmt::Display for Abi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Register snapshot of a task stopped at syscall entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RawRegisters {
    /// x86-64 kernels, covering native, x32 and 32-bit compat tasks
    X86_64 {
        orig_rax: u64,
        rax: u64,
        rdi: u64,
        rsi: u64,
        rdx: u64,
        r10: u64,
        r8: u64,
        r9: u64,
        rbx: u64,
        rcx: u64,
        rbp: u64,
        cs: u64,
    },
    /// 32-bit ARM: r0-r15, cpsr, orig_r0
    Arm { regs: [u32; 18] },
    /// AArch64: x0-x30
    Aarch64 { regs: [u64; 31] },
}

/// ABI-independent view of one syscall invocation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyscallFrame {
    pub abi: Abi,
    pub number: u64,
    pub args: [u64; 6],
}

impl SyscallFrame {
    pub fn arg(&self, index: usize) -> u64 {
        self.args.get(index).copied().unwrap_or(0)
    }

    /// Argument reinterpreted as a C `int`, for fds and flags
    pub fn arg_int(&self, index: usize) -> i32 {
        self.arg(index) as u32 as i32
    }
}

/// Bidirectional syscall table
#[derive(Debug)]
pub struct SyscallTable {
    by_number: HashMap<u64, &'static str>,
    by_name: HashMap<&'static str, u64>,
}

impl SyscallTable {
    pub fn from_entries(entries: &[(&'static str, u64)]) -> Self {
        let mut by_number = HashMap::with_capacity(entries.len());
        let mut by_name = HashMap::with_capacity(entries.len());
        for &(name, number) in entries {
            by_number.insert(number, name);
            by_name.insert(name, number);
        }
        Self { by_number, by_name }
    }

    pub fn name(&self, number: u64) -> Option<&'static str> {
        self.by_number.get(&number).copied()
    }

    pub fn number(&self, name: &str) -> Option<u64> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.by_number.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_number.is_empty()
    }
}

/// Numbering table and calling convention of one ABI
pub trait AbiBackend: Send + Sync {
    fn abi(&self) -> Abi;

    fn table(&self) -> &'static SyscallTable;

    /// Extract the syscall number and arguments, or `None` when the register
    /// snapshot belongs to another architecture family.
    fn decode(&self, regs: &RawRegisters) -> Option<SyscallFrame>;

    fn syscall_name(&self, number: u64) -> Option<&'static str> {
        self.table().name(number)
    }

    fn syscall_number(&self, name: &str) -> Option<u64> {
        self.table().number(name)
    }
}

/// Decode with the System V x86-64 kernel convention
pub(crate) fn decode_x86_64_family(
    abi: Abi,
    regs: &RawRegisters,
    number_of: impl Fn(u64, u64) -> u64,
) -> Option<SyscallFrame> {
    match regs {
        RawRegisters::X86_64 {
            orig_rax,
            rax,
            rdi,
            rsi,
            rdx,
            r10,
            r8,
            r9,
            ..
        } => Some(SyscallFrame {
            abi,
            number: number_of(*orig_rax, *rax),
            args: [*rdi, *rsi, *rdx, *r10, *r8, *r9],
        }),
        _ => None,
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::x86_64_regs;
    use super::*;

    #[test]
    fn test_every_backend_reports_its_own_abi() {
        for abi in Abi::ALL {
            assert_eq!(abi.backend().abi(), abi);
            assert!(!abi.backend().table().is_empty());
        }
    }

    #[test]
    fn test_common_names_resolve_differently_per_abi() {
        let numbers: Vec<Option<u64>> = Abi::ALL
            .iter()
            .map(|abi| abi.backend().syscall_number("write"))
            .collect();
        assert_eq!(numbers[2], Some(1)); // x64
        assert_eq!(numbers[0], Some(4)); // x86
        assert_eq!(numbers[4], Some(64)); // arm64
    }

    #[test]
    fn test_tables_are_bijective() {
        for abi in Abi::ALL {
            let table = abi.backend().table();
            for number in 0..1024u64 {
                if let Some(name) = table.name(number) {
                    assert_eq!(table.number(name), Some(number), "{} {}", abi, name);
                }
            }
        }
    }

    #[test]
    fn test_detect_x86_family_on_linux() {
        if cfg!(target_os = "freebsd") {
            return;
        }
        assert_eq!(Abi::detect(&x86_64_regs(1, [0; 6], 0x33)), Abi::X64);
        assert_eq!(Abi::detect(&x86_64_regs(4, [0; 6], 0x23)), Abi::X86);
        assert_eq!(
            Abi::detect(&x86_64_regs(X32_SYSCALL_BIT | 1, [0; 6], 0x33)),
            Abi::X32
        );
    }

    #[test]
    fn test_int80_from_64_bit_task_uses_i386_table() {
        if cfg!(target_os = "freebsd") {
            return;
        }
        // eax=5 is i386 open but x64 fstat
        let regs = x86_64_regs(5, [0x1000, 0, 0, 0, 0, 0], 0x33);
        assert_eq!(Abi::detect(&regs), Abi::X64);
        assert_eq!(Abi::detect_entry(&regs, EntryGate::Instruction(INT80)), Abi::X86);
        assert_eq!(Abi::detect_entry(&regs, EntryGate::AuditArch(AUDIT_ARCH_I386)), Abi::X86);

        let frame = Abi::detect_entry(&regs, EntryGate::Instruction(INT80))
            .backend()
            .decode(&regs)
            .unwrap();
        assert_eq!(Abi::X86.backend().syscall_name(frame.number), Some("open"));
    }

    #[test]
    fn test_entry_gate_keeps_native_calls() {
        if cfg!(target_os = "freebsd") {
            return;
        }
        let regs = x86_64_regs(5, [0; 6], 0x33);
        // `syscall` is 0f 05
        assert_eq!(Abi::detect_entry(&regs, EntryGate::Instruction([0x0f, 0x05])), Abi::X64);
        assert_eq!(Abi::detect_entry(&regs, EntryGate::AuditArch(AUDIT_ARCH_X86_64)), Abi::X64);
        assert_eq!(Abi::detect_entry(&regs, EntryGate::Unknown), Abi::X64);

        let x32 = x86_64_regs(X32_SYSCALL_BIT | 1, [0; 6], 0x33);
        assert_eq!(Abi::detect_entry(&x32, EntryGate::AuditArch(AUDIT_ARCH_X86_64)), Abi::X32);
        let compat = x86_64_regs(4, [0; 6], 0x23);
        assert_eq!(Abi::detect_entry(&compat, EntryGate::Unknown), Abi::X86);
    }

    #[test]
    fn test_frame_arg_int_sign_extends() {
        let frame = SyscallFrame {
            abi: Abi::X64,
            number: 257,
            args: [0xffff_ff9c, 0, 0, 0, 0, 0],
        };
        assert_eq!(frame.arg_int(0), libc::AT_FDCWD);
    }
}
