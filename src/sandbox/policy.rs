use crate::config::types::Result;
use crate::kernel::abi::{Abi, SyscallFrame};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Longest path argument the tracer is willing to read
pub const PATH_MAX: usize = 4096;

/// Access to a stopped tracee's memory and process state
pub trait TraceeMemory {
    fn pid(&self) -> i32;

    /// Read up to `len` bytes starting at `addr`
    fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>>;

    /// Read a NUL-terminated string of at most `max` bytes (NUL excluded)
    fn read_cstring(&self, addr: u64, max: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut cursor = addr;
        while out.len() < max {
            // Never cross a page boundary in one read; the next page may be unmapped.
            let to_page_end = 4096 - (cursor as usize % 4096);
            let want = to_page_end.min(max - out.len());
            let chunk = self.read_bytes(cursor, want)?;
            if chunk.is_empty() {
                break;
            }
            if let Some(nul) = chunk.iter().position(|&b| b == 0) {
                out.extend_from_slice(&chunk[..nul]);
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
            cursor += chunk.len() as u64;
        }
        Err(crate::config::types::JudgeError::Sandbox(format!(
            "string at {:#x} longer than {} bytes",
            addr, max
        )))
    }

    fn cwd(&self) -> Result<PathBuf>;

    fn fd_path(&self, fd: i32) -> Result<PathBuf>;

    /// Process group of `pid`; 0 means the tracee itself
    fn process_group(&self, pid: i32) -> Result<i32>;

    /// Current `(soft, hard)` value of one of the tracee's resource limits
    fn resource_limit(&self, resource: i32) -> Result<(u64, u64)>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationKind {
    /// Forbidden by policy; reported as IR
    Disallowed,
    /// The call could not be inspected (bad pointer, unreadable state); reported as RTE
    Fault,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub detail: Option<String>,
}

impl Violation {
    pub fn disallowed(detail: impl Into<String>) -> Self {
        Self {
            kind: ViolationKind::Disallowed,
            detail: Some(detail.into()),
        }
    }

    pub fn fault(detail: impl Into<String>) -> Self {
        Self {
            kind: ViolationKind::Fault,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow,
    /// Skip the syscall and make it return `-errno`
    Emulate(i32),
    /// Kill the traced process
    Deny(Violation),
}

/// What a handler gets to look at
pub struct SyscallContext<'a> {
    pub name: &'static str,
    pub frame: &'a SyscallFrame,
    pub memory: &'a dyn TraceeMemory,
}

pub type Callback = Arc<dyn Fn(&SyscallContext<'_>) -> Decision + Send + Sync>;

#[derive(Clone)]
pub enum Handler {
    Allow,
    Disallow,
    Callback(Callback),
}

impl Handler {
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(&SyscallContext<'_>) -> Decision + Send + Sync + 'static,
    {
        Handler::Callback(Arc::new(f))
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Allow => f.write_str("Allow"),
            Handler::Disallow => f.write_str("Disallow"),
            Handler::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

/// A decision plus the syscall it was made for
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub abi: Abi,
    pub number: u64,
    pub name: Option<&'static str>,
    pub decision: Decision,
}

/// Default-deny syscall table keyed by canonical syscall name. Only calls
/// made through an accepted ABI reach the table; a fresh policy accepts the
/// host's native ABI alone.
#[derive(Clone, Debug)]
pub struct SyscallPolicy {
    handlers: HashMap<&'static str, Handler>,
    abis: Vec<Abi>,
}

impl Default for SyscallPolicy {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
            abis: Abi::native().into_iter().collect(),
        }
    }
}

impl SyscallPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also accept calls made through `abi`
    pub fn allow_abi(&mut self, abi: Abi) {
        if !self.abis.contains(&abi) {
            self.abis.push(abi);
        }
    }

    pub fn allows_abi(&self, abi: Abi) -> bool {
        self.abis.contains(&abi)
    }

    pub fn set(&mut self, name: &'static str, handler: Handler) {
        self.handlers.insert(name, handler);
    }

    pub fn allow(&mut self, name: &'static str) {
        self.set(name, Handler::Allow);
    }

    pub fn handler(&self, name: &str) -> &Handler {
        self.handlers.get(name).unwrap_or(&Handler::Disallow)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Decide on the syscall described by `frame`. Numbers the backend does
    /// not know are treated like any other unlisted syscall.
    pub fn decide(&self, frame: &SyscallFrame, memory: &dyn TraceeMemory) -> Verdict {
        let name = frame.abi.backend().syscall_name(frame.number);
        let decision = match name {
            _ if !self.allows_abi(frame.abi) => Decision::Deny(Violation::disallowed(format!(
                "{} syscall #{} through a {} entry",
                name.unwrap_or("unknown"),
                frame.number,
                frame.abi
            ))),
            None => Decision::Deny(Violation::disallowed(format!(
                "unknown {} syscall #{}",
                frame.abi, frame.number
            ))),
            Some(name) => match self.handler(name) {
                Handler::Allow => Decision::Allow,
                Handler::Disallow => Decision::Deny(Violation::disallowed(name)),
                Handler::Callback(callback) => callback(&SyscallContext {
                    name,
                    frame,
                    memory,
                }),
            },
        };
        Verdict {
            abi: frame.abi,
            number: frame.number,
            name,
            decision,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::types::JudgeError;
    use std::collections::BTreeMap;

    /// In-memory stand-in for a stopped tracee
    #[derive(Default)]
    pub struct FakeTracee {
        pub pid: i32,
        pub cwd: PathBuf,
        pub fds: BTreeMap<i32, PathBuf>,
        pub strings: BTreeMap<u64, Vec<u8>>,
        pub groups: BTreeMap<i32, i32>,
        pub limits: BTreeMap<i32, (u64, u64)>,
    }

    impl FakeTracee {
        pub fn new(cwd: &str) -> Self {
            Self {
                pid: 4242,
                cwd: PathBuf::from(cwd),
                ..Self::default()
            }
        }

        pub fn with_string(mut self, addr: u64, value: &str) -> Self {
            let mut bytes = value.as_bytes().to_vec();
            bytes.push(0);
            self.strings.insert(addr, bytes);
            self
        }

        pub fn with_fd(mut self, fd: i32, path: &str) -> Self {
            self.fds.insert(fd, PathBuf::from(path));
            self
        }

        pub fn with_bytes(mut self, addr: u64, bytes: Vec<u8>) -> Self {
            self.strings.insert(addr, bytes);
            self
        }

        pub fn with_group(mut self, pid: i32, group: i32) -> Self {
            self.groups.insert(pid, group);
            self
        }

        pub fn with_limit(mut self, resource: i32, soft: u64, hard: u64) -> Self {
            self.limits.insert(resource, (soft, hard));
            self
        }
    }

    impl TraceeMemory for FakeTracee {
        fn pid(&self) -> i32 {
            self.pid
        }

        fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
            for (base, bytes) in &self.strings {
                let end = base + bytes.len() as u64;
                if addr >= *base && addr < end {
                    let start = (addr - base) as usize;
                    let stop = (start + len).min(bytes.len());
                    return Ok(bytes[start..stop].to_vec());
                }
            }
            Err(JudgeError::Sandbox(format!("EFAULT at {:#x}", addr)))
        }

        fn cwd(&self) -> Result<PathBuf> {
            Ok(self.cwd.clone())
        }

        fn fd_path(&self, fd: i32) -> Result<PathBuf> {
            self.fds
                .get(&fd)
                .cloned()
                .ok_or_else(|| JudgeError::Sandbox(format!("EBADF {}", fd)))
        }

        fn process_group(&self, pid: i32) -> Result<i32> {
            let pid = if pid == 0 { self.pid } else { pid };
            self.groups
                .get(&pid)
                .copied()
                .ok_or_else(|| JudgeError::Sandbox(format!("ESRCH {}", pid)))
        }

        fn resource_limit(&self, resource: i32) -> Result<(u64, u64)> {
            self.limits
                .get(&resource)
                .copied()
                .ok_or_else(|| JudgeError::Sandbox(format!("EINVAL resource {}", resource)))
        }
    }

    pub fn frame(abi: Abi, name: &str, args: [u64; 6]) -> SyscallFrame {
        let number = abi
            .backend()
            .syscall_number(name)
            .unwrap_or_else(|| panic!("{} has no {}", abi, name));
        SyscallFrame { abi, number, args }
    }
}
