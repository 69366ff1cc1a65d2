//! Register and memory access for tasks stopped under ptrace.
//!
//! All register-level `unsafe` lives here. Every function expects the task to
//! be in a ptrace stop owned by the calling thread.

use crate::config::types::{JudgeError, Result};
use crate::kernel::abi::{EntryGate, RawRegisters};
use crate::sandbox::policy::TraceeMemory;
use nix::sys::ptrace;
use nix::unistd::Pid;
use std::path::PathBuf;

#[cfg(target_arch = "x86_64")]
pub fn read_registers(pid: Pid) -> Result<RawRegisters> {
    let regs = ptrace::getregs(pid)?;
    Ok(RawRegisters::X86_64 {
        orig_rax: regs.orig_rax,
        rax: regs.rax,
        rdi: regs.rdi,
        rsi: regs.rsi,
        rdx: regs.rdx,
        r10: regs.r10,
        r8: regs.r8,
        r9: regs.r9,
        rbx: regs.rbx,
        rcx: regs.rcx,
        rbp: regs.rbp,
        cs: regs.cs,
    })
}

/// `PTRACE_GET_SYSCALL_INFO`, Linux 5.3+
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
const PTRACE_GET_SYSCALL_INFO: u32 = 0x420e;
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
const PTRACE_SYSCALL_INFO_ENTRY: u8 = 1;

/// Leading fields of `struct ptrace_syscall_info`; the kernel truncates its
/// copy to the size we pass
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
#[repr(C)]
#[derive(Default)]
struct SyscallInfoHead {
    op: u8,
    _pad: [u8; 3],
    arch: u32,
}

/// How the task stopped at syscall entry got into the kernel. Asks the
/// kernel first, then looks at the instruction that trapped.
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
pub fn entry_gate(pid: Pid) -> EntryGate {
    let mut head = SyscallInfoHead::default();
    // SAFETY: the kernel writes at most `size` bytes into `head`.
    let written = unsafe {
        libc::ptrace(
            PTRACE_GET_SYSCALL_INFO as _,
            pid.as_raw(),
            std::mem::size_of::<SyscallInfoHead>() as *mut libc::c_void,
            &mut head as *mut SyscallInfoHead as *mut libc::c_void,
        )
    };
    if written >= 8 && head.op == PTRACE_SYSCALL_INFO_ENTRY {
        return EntryGate::AuditArch(head.arch);
    }
    log::debug!("PTRACE_GET_SYSCALL_INFO unavailable for {}, reading the trap instruction", pid);
    let rip = match ptrace::getregs(pid) {
        Ok(regs) => regs.rip,
        Err(_) => return EntryGate::Unknown,
    };
    match ptrace::read(pid, rip.wrapping_sub(2) as ptrace::AddressType) {
        Ok(word) => {
            let bytes = word.to_ne_bytes();
            EntryGate::Instruction([bytes[0], bytes[1]])
        }
        Err(_) => EntryGate::Unknown,
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
pub fn entry_gate(_pid: Pid) -> EntryGate {
    EntryGate::Unknown
}

/// Turn the pending syscall into a no-op. Must be called at syscall entry.
#[cfg(target_arch = "x86_64")]
pub fn skip_syscall(pid: Pid) -> Result<()> {
    let mut regs = ptrace::getregs(pid)?;
    regs.orig_rax = u64::MAX;
    ptrace::setregs(pid, regs)?;
    Ok(())
}

/// Overwrite the syscall return value. Must be called at syscall exit.
#[cfg(target_arch = "x86_64")]
pub fn set_return_value(pid: Pid, value: i64) -> Result<()> {
    let mut regs = ptrace::getregs(pid)?;
    regs.rax = value as u64;
    ptrace::setregs(pid, regs)?;
    Ok(())
}

#[cfg(target_arch = "aarch64")]
mod regset {
    use super::*;

    pub const NT_PRSTATUS: libc::c_int = 1;
    pub const NT_ARM_SYSTEM_CALL: libc::c_int = 0x404;
    /// Size of the compat (32-bit ARM) general register set
    pub const COMPAT_REGSET_LEN: usize = 18 * 4;

    /// x0-x30, sp, pc, pstate
    pub type Buffer = [u64; 34];

    pub fn get(pid: Pid, kind: libc::c_int, buf: &mut Buffer) -> Result<usize> {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: std::mem::size_of::<Buffer>(),
        };
        // SAFETY: iov points at a live buffer of iov_len bytes; the kernel
        // shrinks iov_len to what it wrote.
        let rc = unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGSET,
                pid.as_raw(),
                kind as usize as *mut libc::c_void,
                &mut iov as *mut libc::iovec as *mut libc::c_void,
            )
        };
        if rc < 0 {
            return Err(nix::errno::Errno::last().into());
        }
        Ok(iov.iov_len)
    }

    pub fn set(pid: Pid, kind: libc::c_int, data: *mut libc::c_void, len: usize) -> Result<()> {
        let mut iov = libc::iovec {
            iov_base: data,
            iov_len: len,
        };
        // SAFETY: caller guarantees data points at len readable bytes.
        let rc = unsafe {
            libc::ptrace(
                libc::PTRACE_SETREGSET,
                pid.as_raw(),
                kind as usize as *mut libc::c_void,
                &mut iov as *mut libc::iovec as *mut libc::c_void,
            )
        };
        if rc < 0 {
            return Err(nix::errno::Errno::last().into());
        }
        Ok(())
    }
}

#[cfg(target_arch = "aarch64")]
pub fn read_registers(pid: Pid) -> Result<RawRegisters> {
    let mut buf: regset::Buffer = [0; 34];
    let len = regset::get(pid, regset::NT_PRSTATUS, &mut buf)?;
    if len == regset::COMPAT_REGSET_LEN {
        let mut regs = [0u32; 18];
        for (i, word) in buf.iter().take(9).enumerate() {
            regs[2 * i] = *word as u32;
            regs[2 * i + 1] = (*word >> 32) as u32;
        }
        return Ok(RawRegisters::Arm { regs });
    }
    let mut regs = [0u64; 31];
    regs.copy_from_slice(&buf[..31]);
    Ok(RawRegisters::Aarch64 { regs })
}

#[cfg(target_arch = "aarch64")]
pub fn skip_syscall(pid: Pid) -> Result<()> {
    let mut nr: libc::c_int = -1;
    regset::set(
        pid,
        regset::NT_ARM_SYSTEM_CALL,
        (&mut nr as *mut libc::c_int).cast(),
        std::mem::size_of::<libc::c_int>(),
    )
}

#[cfg(target_arch = "aarch64")]
pub fn set_return_value(pid: Pid, value: i64) -> Result<()> {
    let mut buf: regset::Buffer = [0; 34];
    let len = regset::get(pid, regset::NT_PRSTATUS, &mut buf)?;
    if len == regset::COMPAT_REGSET_LEN {
        buf[0] = (buf[0] & !0xffff_ffff) | u64::from(value as u32);
    } else {
        buf[0] = value as u64;
    }
    regset::set(pid, regset::NT_PRSTATUS, buf.as_mut_ptr().cast(), len)
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub fn read_registers(_pid: Pid) -> Result<RawRegisters> {
    Err(unsupported())
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub fn skip_syscall(_pid: Pid) -> Result<()> {
    Err(unsupported())
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub fn set_return_value(_pid: Pid, _value: i64) -> Result<()> {
    Err(unsupported())
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn unsupported() -> JudgeError {
    JudgeError::Sandbox(format!(
        "ptrace register access is not implemented for {}",
        std::env::consts::ARCH
    ))
}

/// Tracee memory read through process_vm_readv, falling back to PEEKDATA
/// where cross-process reads are refused.
#[derive(Debug, Clone, Copy)]
pub struct PtraceMemory {
    pid: Pid,
}

impl PtraceMemory {
    pub fn new(pid: Pid) -> Self {
        Self { pid }
    }

    fn read_vm(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        use nix::sys::uio::{process_vm_readv, RemoteIoVec};
        use std::io::IoSliceMut;

        let mut buf = vec![0u8; len];
        let read = {
            let mut local = [IoSliceMut::new(&mut buf)];
            let remote = [RemoteIoVec {
                base: addr as usize,
                len,
            }];
            process_vm_readv(self.pid, &mut local, &remote)?
        };
        buf.truncate(read);
        Ok(buf)
    }

    fn read_peek(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        const WORD: u64 = std::mem::size_of::<libc::c_long>() as u64;
        let mut out = Vec::with_capacity(len);
        let mut word_addr = addr & !(WORD - 1);
        let mut skip = (addr - word_addr) as usize;
        while out.len() < len {
            let word = ptrace::read(self.pid, word_addr as ptrace::AddressType)?;
            let bytes = word.to_ne_bytes();
            let take = (bytes.len() - skip).min(len - out.len());
            out.extend_from_slice(&bytes[skip..skip + take]);
            skip = 0;
            word_addr += WORD;
        }
        Ok(out)
    }
}

impl TraceeMemory for PtraceMemory {
    fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        match self.read_vm(addr, len) {
            Ok(bytes) => Ok(bytes),
            Err(err) => {
                log::debug!("process_vm_readv on {} failed ({}), using PEEKDATA", self.pid, err);
                self.read_peek(addr, len)
            }
        }
    }

    fn cwd(&self) -> Result<PathBuf> {
        Ok(std::fs::read_link(format!("/proc/{}/cwd", self.pid))?)
    }

    fn fd_path(&self, fd: i32) -> Result<PathBuf> {
        std::fs::read_link(format!("/proc/{}/fd/{}", self.pid, fd)).map_err(|err| {
            JudgeError::Sandbox(format!("cannot resolve fd {} of {}: {}", fd, self.pid, err))
        })
    }

    fn process_group(&self, pid: i32) -> Result<i32> {
        let target = if pid == 0 { self.pid } else { Pid::from_raw(pid) };
        Ok(nix::unistd::getpgid(Some(target))?.as_raw())
    }

    fn resource_limit(&self, resource: i32) -> Result<(u64, u64)> {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: a NULL new limit only reads; the kernel writes `limit`.
        let rc = unsafe { libc::prlimit(self.pid.as_raw(), resource as _, std::ptr::null(), &mut limit) };
        if rc != 0 {
            return Err(nix::errno::Errno::last().into());
        }
        Ok((limit.rlim_cur as u64, limit.rlim_max as u64))
    }
}
