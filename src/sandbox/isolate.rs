//! Path-checked syscall handlers layered over a [`SyscallPolicy`].

use super::filesystem::{normalize, FilesystemAccessRule, FilesystemPolicy};
use super::guards;
use super::policy::{Decision, Handler, SyscallContext, SyscallPolicy, Violation, ViolationKind, PATH_MAX};
use crate::observability::audit;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Access {
    Read,
    Write,
    /// open-style flags in the given argument decide
    OpenFlags(usize),
    /// `struct open_how *` in the given argument; its first field is the flags
    OpenHow(usize),
}

#[derive(Clone, Copy, Debug)]
struct PathArg {
    /// Argument holding the directory fd, `None` for cwd-relative calls
    dirfd: Option<usize>,
    path: usize,
    /// A NULL path means "operate on dirfd" (utimensat)
    nullable: bool,
}

const fn cwd_path(path: usize) -> PathArg {
    PathArg {
        dirfd: None,
        path,
        nullable: false,
    }
}

const fn at_path(dirfd: usize, path: usize) -> PathArg {
    PathArg {
        dirfd: Some(dirfd),
        path,
        nullable: false,
    }
}

struct FsSpec {
    name: &'static str,
    paths: &'static [PathArg],
    access: Access,
    /// ENOENT may be substituted for a denial when lookup errnos are enabled
    lookup: bool,
    /// Installed only when the executor allow-lists the name
    opt_in: bool,
    /// False when the call acts on a final symlink itself
    follow: bool,
}

const fn spec(name: &'static str, paths: &'static [PathArg], access: Access) -> FsSpec {
    FsSpec {
        name,
        paths,
        access,
        lookup: false,
        opt_in: false,
        follow: true,
    }
}

const fn lookup(name: &'static str, paths: &'static [PathArg]) -> FsSpec {
    FsSpec {
        name,
        paths,
        access: Access::Read,
        lookup: true,
        opt_in: false,
        follow: true,
    }
}

const fn link_lookup(name: &'static str, paths: &'static [PathArg]) -> FsSpec {
    FsSpec {
        follow: false,
        ..lookup(name, paths)
    }
}

const fn opt_in(name: &'static str, paths: &'static [PathArg]) -> FsSpec {
    FsSpec {
        name,
        paths,
        access: Access::Read,
        lookup: false,
        opt_in: true,
        follow: true,
    }
}

const FS_SPECS: &[FsSpec] = &[
    spec("open", &[cwd_path(0)], Access::OpenFlags(1)),
    spec("openat", &[at_path(0, 1)], Access::OpenFlags(2)),
    spec("openat2", &[at_path(0, 1)], Access::OpenHow(2)),
    spec("creat", &[cwd_path(0)], Access::Write),
    lookup("stat", &[cwd_path(0)]),
    link_lookup("lstat", &[cwd_path(0)]),
    lookup("stat64", &[cwd_path(0)]),
    link_lookup("lstat64", &[cwd_path(0)]),
    lookup("newfstatat", &[at_path(0, 1)]),
    lookup("fstatat64", &[at_path(0, 1)]),
    lookup("fstatat", &[at_path(0, 1)]),
    lookup("statx", &[at_path(0, 1)]),
    lookup("access", &[cwd_path(0)]),
    lookup("faccessat", &[at_path(0, 1)]),
    lookup("faccessat2", &[at_path(0, 1)]),
    link_lookup("readlink", &[cwd_path(0)]),
    link_lookup("readlinkat", &[at_path(0, 1)]),
    spec("chdir", &[cwd_path(0)], Access::Read),
    opt_in("execve", &[cwd_path(0)]),
    opt_in("execveat", &[at_path(0, 1)]),
    spec("mkdir", &[cwd_path(0)], Access::Write),
    spec("mkdirat", &[at_path(0, 1)], Access::Write),
    spec("unlink", &[cwd_path(0)], Access::Write),
    spec("unlinkat", &[at_path(0, 1)], Access::Write),
    spec("rmdir", &[cwd_path(0)], Access::Write),
    spec("rename", &[cwd_path(0), cwd_path(1)], Access::Write),
    spec("renameat", &[at_path(0, 1), at_path(2, 3)], Access::Write),
    spec("renameat2", &[at_path(0, 1), at_path(2, 3)], Access::Write),
    spec("truncate", &[cwd_path(0)], Access::Write),
    spec("truncate64", &[cwd_path(0)], Access::Write),
    spec("chmod", &[cwd_path(0)], Access::Write),
    spec("fchmodat", &[at_path(0, 1)], Access::Write),
    spec(
        "utimensat",
        &[PathArg {
            dirfd: Some(0),
            path: 1,
            nullable: true,
        }],
        Access::Write,
    ),
];

fn fs_spec(name: &str) -> Option<&'static FsSpec> {
    FS_SPECS.iter().find(|spec| spec.name == name)
}

/// Builds the syscall policy handed to the tracer: an allow-list plus
/// filesystem checks for every path-bearing call.
#[derive(Clone, Debug)]
pub struct IsolateTracer {
    read_fs: Arc<FilesystemPolicy>,
    write_fs: Arc<FilesystemPolicy>,
    lookup_errno: bool,
    policy: SyscallPolicy,
}

impl IsolateTracer {
    pub fn new(read_fs: Vec<FilesystemAccessRule>, write_fs: Vec<FilesystemAccessRule>) -> Self {
        let mut tracer = Self {
            read_fs: Arc::new(FilesystemPolicy::new(read_fs)),
            write_fs: Arc::new(FilesystemPolicy::new(write_fs)),
            lookup_errno: false,
            policy: SyscallPolicy::new(),
        };
        for spec in FS_SPECS.iter().filter(|spec| !spec.opt_in) {
            tracer.install(spec);
        }
        tracer
    }

    /// Answer denied stat/access/readlink lookups with ENOENT instead of
    /// killing the process
    pub fn with_lookup_errno(mut self, lookup_errno: bool) -> Self {
        self.lookup_errno = lookup_errno;
        let lookups: Vec<&'static FsSpec> = FS_SPECS
            .iter()
            .filter(|spec| spec.lookup && self.policy.contains(spec.name))
            .collect();
        for spec in lookups {
            self.install(spec);
        }
        self
    }

    /// Allow-list `name`. Calls with a filesystem spec stay path-checked and
    /// calls aimed at other processes stay confined to the tracee's group.
    pub fn allow(mut self, name: &'static str) -> Self {
        match (fs_spec(name), guards::guard(name)) {
            (Some(spec), _) => self.install(spec),
            (None, Some(handler)) => self.policy.set(name, handler),
            (None, None) => self.policy.allow(name),
        }
        self
    }

    pub fn allow_all(self, names: &[&'static str]) -> Self {
        names.iter().fold(self, |tracer, name| tracer.allow(name))
    }

    pub fn handler(mut self, name: &'static str, handler: Handler) -> Self {
        self.policy.set(name, handler);
        self
    }

    pub fn read_policy(&self) -> &FilesystemPolicy {
        &self.read_fs
    }

    pub fn write_policy(&self) -> &FilesystemPolicy {
        &self.write_fs
    }

    pub fn into_policy(self) -> SyscallPolicy {
        self.policy
    }

    fn install(&mut self, spec: &'static FsSpec) {
        let read_fs = Arc::clone(&self.read_fs);
        let write_fs = Arc::clone(&self.write_fs);
        let lookup_errno = self.lookup_errno && spec.lookup;
        self.policy.set(
            spec.name,
            Handler::callback(move |ctx| {
                let decision = check_spec(ctx, spec, &read_fs, &write_fs);
                match decision {
                    Decision::Deny(Violation {
                        kind: ViolationKind::Disallowed,
                        ..
                    }) if lookup_errno => Decision::Emulate(libc::ENOENT),
                    other => other,
                }
            }),
        );
    }
}

fn check_spec(
    ctx: &SyscallContext<'_>,
    spec: &FsSpec,
    read_fs: &FilesystemPolicy,
    write_fs: &FilesystemPolicy,
) -> Decision {
    let write = match is_write(ctx, spec.access) {
        Ok(write) => write,
        Err(violation) => return Decision::Deny(violation),
    };
    let (policy, mode) = if write {
        (write_fs, "write")
    } else {
        (read_fs, "read")
    };
    for arg in spec.paths {
        if let Err(violation) = check_path(ctx, arg, spec.follow, policy, mode) {
            return Decision::Deny(violation);
        }
    }
    Decision::Allow
}

fn is_write(ctx: &SyscallContext<'_>, access: Access) -> Result<bool, Violation> {
    let flags = match access {
        Access::Read => return Ok(false),
        Access::Write => return Ok(true),
        Access::OpenFlags(arg) => ctx.frame.arg_int(arg),
        Access::OpenHow(arg) => {
            let bytes = ctx
                .memory
                .read_bytes(ctx.frame.arg(arg), 8)
                .map_err(|err| Violation::fault(format!("{}: unreadable open_how: {}", ctx.name, err)))?;
            let raw: [u8; 8] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| Violation::fault(format!("{}: short open_how", ctx.name)))?;
            u64::from_ne_bytes(raw) as u32 as i32
        }
    };
    Ok(open_flags_write(flags))
}

fn open_flags_write(flags: i32) -> bool {
    flags & libc::O_ACCMODE != libc::O_RDONLY
        || flags & (libc::O_CREAT | libc::O_TRUNC | libc::O_APPEND) != 0
}

fn check_path(
    ctx: &SyscallContext<'_>,
    arg: &PathArg,
    follow: bool,
    policy: &FilesystemPolicy,
    mode: &str,
) -> Result<(), Violation> {
    let addr = ctx.frame.arg(arg.path);
    if addr == 0 {
        if arg.nullable {
            return Ok(());
        }
        return Err(Violation::fault(format!("{}: NULL path", ctx.name)));
    }
    let raw = ctx
        .memory
        .read_cstring(addr, PATH_MAX)
        .map_err(|err| Violation::fault(format!("{}: unreadable path: {}", ctx.name, err)))?;

    if raw.is_empty() {
        // With AT_EMPTY_PATH this targets the already-opened dirfd; without
        // it the kernel fails the call with ENOENT.
        return Ok(());
    }

    let path = Path::new(OsStr::from_bytes(&raw));
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        let base = match arg.dirfd.map(|index| ctx.frame.arg_int(index)) {
            None | Some(libc::AT_FDCWD) => ctx.memory.cwd(),
            Some(fd) => ctx.memory.fd_path(fd),
        }
        .map_err(|err| Violation::fault(format!("{}: cannot resolve base: {}", ctx.name, err)))?;
        base.join(path)
    };

    let pid = ctx.memory.pid();
    let lexical = to_proc_self(&normalize(&absolute), pid);
    let host = from_proc_self(&lexical, pid);
    let resolved = if follow {
        resolve(&host)
    } else {
        resolve_parent(&host)
    };
    let resolved = to_proc_self(&resolved, pid);

    for candidate in [&lexical, &resolved] {
        if !policy.is_allowed(candidate) {
            audit::filesystem_denied(pid, ctx.name, mode, candidate);
            return Err(Violation::disallowed(format!(
                "{} {} access to {}",
                ctx.name,
                mode,
                candidate.display()
            )));
        }
    }
    Ok(())
}

/// Symlink-resolve through the host filesystem. A missing leaf resolves its
/// parent instead; anything unresolvable stays lexical.
fn resolve(path: &Path) -> PathBuf {
    if let Ok(real) = std::fs::canonicalize(path) {
        return real;
    }
    resolve_parent(path)
}

/// Symlink-resolve everything but the final component
fn resolve_parent(path: &Path) -> PathBuf {
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => match std::fs::canonicalize(parent) {
            Ok(real) => real.join(name),
            Err(_) => path.to_path_buf(),
        },
        _ => path.to_path_buf(),
    }
}

fn proc_pid(pid: i32) -> PathBuf {
    PathBuf::from(format!("/proc/{}", pid))
}

fn from_proc_self(path: &Path, pid: i32) -> PathBuf {
    match path.strip_prefix("/proc/self") {
        Ok(rest) => proc_pid(pid).join(rest),
        Err(_) => path.to_path_buf(),
    }
}

fn to_proc_self(path: &Path, pid: i32) -> PathBuf {
    let own = proc_pid(pid);
    match path.strip_prefix(&own) {
        Ok(rest) if rest.components().next() != Some(Component::ParentDir) => {
            Path::new("/proc/self").join(rest)
        }
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::super::policy::test_support::{frame, FakeTracee};
    use super::*;
    use crate::kernel::abi::Abi;
    use tempfile::TempDir;

    const PATH: u64 = 0x1000;
    const PATH2: u64 = 0x3000;
    const AT_FDCWD: u64 = libc::AT_FDCWD as u32 as u64;

    fn workdir() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        (dir, root)
    }

    fn tracer(dir: &Path) -> IsolateTracer {
        IsolateTracer::new(
            vec![
                FilesystemAccessRule::recursive_dir(dir),
                FilesystemAccessRule::exact_file("/etc/hostname-fake"),
                FilesystemAccessRule::recursive_dir("/proc/self"),
            ],
            vec![FilesystemAccessRule::exact_file(dir.join("out.txt"))],
        )
    }

    fn decide(policy: &SyscallPolicy, name: &str, args: [u64; 6], tracee: &FakeTracee) -> Decision {
        policy.decide(&frame(Abi::X64, name, args), tracee).decision
    }

    fn denied(decision: &Decision) -> bool {
        matches!(
            decision,
            Decision::Deny(Violation {
                kind: ViolationKind::Disallowed,
                ..
            })
        )
    }

    #[test]
    fn test_read_inside_working_dir_allowed() {
        let (_guard, root) = workdir();
        std::fs::write(root.join("input.txt"), "1 2").unwrap();
        let policy = tracer(root.as_path()).into_policy();
        let tracee = FakeTracee::new(root.as_path().to_str().unwrap()).with_string(PATH, "input.txt");

        let open = decide(&policy, "openat", [AT_FDCWD, PATH, libc::O_RDONLY as u64, 0, 0, 0], &tracee);
        assert_eq!(open, Decision::Allow);
    }

    #[test]
    fn test_traversal_out_of_working_dir_denied() {
        let (_guard, root) = workdir();
        let policy = tracer(root.as_path()).into_policy();
        let tracee = FakeTracee::new(root.as_path().to_str().unwrap()).with_string(PATH, "../../etc/passwd");

        let open = decide(&policy, "open", [PATH, libc::O_RDONLY as u64, 0, 0, 0, 0], &tracee);
        assert!(denied(&open), "{:?}", open);
    }

    #[test]
    fn test_symlink_escape_denied() {
        let (_guard, root) = workdir();
        std::os::unix::fs::symlink("/etc", root.join("escape")).unwrap();
        let policy = tracer(root.as_path()).into_policy();
        let tracee = FakeTracee::new("/").with_string(
            PATH,
            root.join("escape/passwd").to_str().unwrap(),
        );

        let open = decide(&policy, "open", [PATH, libc::O_RDONLY as u64, 0, 0, 0, 0], &tracee);
        assert!(denied(&open), "{:?}", open);
    }

    #[test]
    fn test_write_flags_use_write_rules() {
        let (_guard, root) = workdir();
        let policy = tracer(root.as_path()).into_policy();
        let tracee = FakeTracee::new(root.as_path().to_str().unwrap())
            .with_string(PATH, "out.txt")
            .with_string(PATH2, "other.txt");
        let flags = (libc::O_WRONLY | libc::O_CREAT) as u64;

        assert_eq!(decide(&policy, "open", [PATH, flags, 0o644, 0, 0, 0], &tracee), Decision::Allow);
        assert!(denied(&decide(&policy, "open", [PATH2, flags, 0o644, 0, 0, 0], &tracee)));
        // Readable is not writable
        assert!(denied(&decide(&policy, "unlink", [PATH2, 0, 0, 0, 0, 0], &tracee)));
    }

    #[test]
    fn test_rename_checks_both_paths() {
        let (_guard, root) = workdir();
        let policy = tracer(root.as_path()).into_policy();
        let tracee = FakeTracee::new(root.as_path().to_str().unwrap())
            .with_string(PATH, "out.txt")
            .with_string(PATH2, "/tmp/elsewhere");

        assert!(denied(&decide(&policy, "rename", [PATH, PATH2, 0, 0, 0, 0], &tracee)));
    }

    #[test]
    fn test_dirfd_relative_path_resolves_through_fd() {
        let (_guard, root) = workdir();
        std::fs::write(root.join("data"), "x").unwrap();
        let policy = tracer(root.as_path()).into_policy();
        let tracee = FakeTracee::new("/")
            .with_fd(7, root.as_path().to_str().unwrap())
            .with_string(PATH, "data");

        let open = decide(&policy, "openat", [7, PATH, libc::O_RDONLY as u64, 0, 0, 0], &tracee);
        assert_eq!(open, Decision::Allow);
    }

    #[test]
    fn test_empty_path_with_at_empty_path_is_fd_operation() {
        let (_guard, root) = workdir();
        let policy = tracer(root.as_path()).into_policy();
        let tracee = FakeTracee::new("/").with_string(PATH, "");

        let stat = decide(
            &policy,
            "newfstatat",
            [3, PATH, 0, libc::AT_EMPTY_PATH as u64, 0, 0],
            &tracee,
        );
        assert_eq!(stat, Decision::Allow);
    }

    #[test]
    fn test_unreadable_pointer_is_fault() {
        let (_guard, root) = workdir();
        let policy = tracer(root.as_path()).into_policy();
        let tracee = FakeTracee::new("/");

        let open = decide(&policy, "open", [0xdead, 0, 0, 0, 0, 0], &tracee);
        assert!(matches!(
            open,
            Decision::Deny(Violation {
                kind: ViolationKind::Fault,
                ..
            })
        ));
    }

    #[test]
    fn test_lookup_errno_turns_denied_stat_into_enoent() {
        let (_guard, root) = workdir();
        let policy = tracer(root.as_path()).with_lookup_errno(true).into_policy();
        let tracee = FakeTracee::new("/").with_string(PATH, "/etc/shadow");

        assert_eq!(
            decide(&policy, "stat", [PATH, 0, 0, 0, 0, 0], &tracee),
            Decision::Emulate(libc::ENOENT)
        );
        // Opening is not a lookup
        assert!(denied(&decide(&policy, "open", [PATH, 0, 0, 0, 0, 0], &tracee)));
    }

    #[test]
    fn test_proc_self_matches_own_pid() {
        let (_guard, root) = workdir();
        let policy = tracer(root.as_path()).into_policy();
        let tracee = FakeTracee::new("/")
            .with_string(PATH, "/proc/4242/status")
            .with_string(PATH2, "/proc/1/status");

        assert_eq!(decide(&policy, "open", [PATH, 0, 0, 0, 0, 0], &tracee), Decision::Allow);
        assert!(denied(&decide(&policy, "open", [PATH2, 0, 0, 0, 0, 0], &tracee)));
    }

    #[test]
    fn test_readlink_does_not_follow_the_link_it_reads() {
        let (_guard, root) = workdir();
        std::os::unix::fs::symlink("/etc/passwd", root.join("link")).unwrap();
        let policy = tracer(root.as_path()).into_policy();
        let tracee = FakeTracee::new(root.as_path().to_str().unwrap()).with_string(PATH, "link");

        assert_eq!(decide(&policy, "readlink", [PATH, 0x2000, 64, 0, 0, 0], &tracee), Decision::Allow);
        assert_eq!(
            decide(&policy, "readlinkat", [AT_FDCWD, PATH, 0x2000, 64, 0, 0], &tracee),
            Decision::Allow
        );
        assert_eq!(decide(&policy, "lstat", [PATH, 0x2000, 0, 0, 0, 0], &tracee), Decision::Allow);
        // Following the link still leaves the rules
        assert!(denied(&decide(&policy, "open", [PATH, 0, 0, 0, 0, 0], &tracee)));
        assert!(denied(&decide(&policy, "stat", [PATH, 0x2000, 0, 0, 0, 0], &tracee)));
    }

    #[test]
    fn test_readlink_of_own_exe_needs_only_the_link() {
        let policy = IsolateTracer::new(
            vec![
                FilesystemAccessRule::exact_dir("/proc/self"),
                FilesystemAccessRule::exact_file("/proc/self/exe"),
            ],
            Vec::new(),
        )
        .into_policy();
        // A live pid, so /proc/<pid>/exe points at this test binary
        let tracee = FakeTracee {
            pid: std::process::id() as i32,
            ..FakeTracee::new("/")
        }
        .with_string(PATH, "/proc/self/exe");

        assert_eq!(decide(&policy, "readlink", [PATH, 0x2000, 4096, 0, 0, 0], &tracee), Decision::Allow);
        assert!(denied(&decide(&policy, "open", [PATH, 0, 0, 0, 0, 0], &tracee)));
    }

    #[test]
    fn test_execve_is_opt_in_and_path_checked() {
        let (_guard, root) = workdir();
        let tracee = FakeTracee::new("/").with_string(PATH, "/bin/sh");

        let default = tracer(root.as_path()).into_policy();
        assert!(denied(&decide(&default, "execve", [PATH, 0, 0, 0, 0, 0], &tracee)));

        let allowed = tracer(root.as_path()).allow("execve").into_policy();
        // Still denied: /bin/sh is outside the read rules
        assert!(denied(&decide(&allowed, "execve", [PATH, 0, 0, 0, 0, 0], &tracee)));
    }

    #[test]
    fn test_allow_keeps_signals_guarded() {
        let (_guard, root) = workdir();
        let policy = tracer(root.as_path()).allow_all(&["kill", "ioctl", "getpid"]).into_policy();
        let tracee = FakeTracee::new("/").with_group(4242, 4242).with_group(1, 1);

        assert_eq!(decide(&policy, "getpid", [0; 6], &tracee), Decision::Allow);
        assert_eq!(decide(&policy, "kill", [4242, 15, 0, 0, 0, 0], &tracee), Decision::Allow);
        assert!(denied(&decide(&policy, "kill", [1, 9, 0, 0, 0, 0], &tracee)));
        assert!(denied(&decide(
            &policy,
            "ioctl",
            [0, libc::TIOCSTI as u64, 0x2000, 0, 0, 0],
            &tracee
        )));
    }

    #[test]
    fn test_open_flag_classification() {
        assert!(!open_flags_write(libc::O_RDONLY | libc::O_CLOEXEC));
        assert!(open_flags_write(libc::O_RDWR));
        assert!(open_flags_write(libc::O_RDONLY | libc::O_CREAT));
        assert!(open_flags_write(libc::O_WRONLY | libc::O_APPEND));
    }
}
