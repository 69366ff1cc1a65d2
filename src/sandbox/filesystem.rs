/// Filesystem access rules enforced on path-bearing syscalls
///
/// Paths are compared component-wise after lexical normalisation, so
/// `RecursiveDir("/foo")` covers `/foo/bar` but never `/foobar`.
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilesystemAccessRule {
    /// Only the path itself
    ExactFile(PathBuf),
    /// The directory and its direct children
    ExactDir(PathBuf),
    /// The directory and everything below it
    RecursiveDir(PathBuf),
}

impl FilesystemAccessRule {
    pub fn exact_file(path: impl AsRef<Path>) -> Self {
        FilesystemAccessRule::ExactFile(normalize(path.as_ref()))
    }

    pub fn exact_dir(path: impl AsRef<Path>) -> Self {
        FilesystemAccessRule::ExactDir(normalize(path.as_ref()))
    }

    pub fn recursive_dir(path: impl AsRef<Path>) -> Self {
        FilesystemAccessRule::RecursiveDir(normalize(path.as_ref()))
    }

    pub fn path(&self) -> &Path {
        match self {
            FilesystemAccessRule::ExactFile(p)
            | FilesystemAccessRule::ExactDir(p)
            | FilesystemAccessRule::RecursiveDir(p) => p,
        }
    }

    /// `path` must already be absolute and normalised.
    pub fn matches(&self, path: &Path) -> bool {
        match self {
            FilesystemAccessRule::ExactFile(p) => path == p,
            FilesystemAccessRule::ExactDir(p) => path == p || path.parent() == Some(p.as_path()),
            FilesystemAccessRule::RecursiveDir(p) => path.starts_with(p),
        }
    }
}

/// Ordered rule list; the first matching rule wins and no match means deny
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemPolicy {
    rules: Vec<FilesystemAccessRule>,
}

impl FilesystemPolicy {
    pub fn new(rules: Vec<FilesystemAccessRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[FilesystemAccessRule] {
        &self.rules
    }

    pub fn resolve(&self, path: &Path) -> Option<&FilesystemAccessRule> {
        if !path.is_absolute() {
            return None;
        }
        let path = normalize(path);
        self.rules.iter().find(|rule| rule.matches(&path))
    }

    pub fn is_allowed(&self, path: &Path) -> bool {
        self.resolve(path).is_some()
    }
}

/// Read and write rule sets handed to the tracer
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filesystem {
    pub read: Vec<FilesystemAccessRule>,
    pub write: Vec<FilesystemAccessRule>,
}

impl Filesystem {
    pub fn new(read: Vec<FilesystemAccessRule>, write: Vec<FilesystemAccessRule>) -> Self {
        Self { read, write }
    }

    /// Baseline every runtime needs: system libraries, a few devices and the
    /// handful of /proc and /sys entries libc consults at startup.
    pub fn default_rules() -> Self {
        use FilesystemAccessRule as R;

        let mut read = vec![
            R::exact_file("/dev/null"),
            R::exact_file("/dev/tty"),
            R::exact_file("/dev/zero"),
            R::exact_file("/dev/urandom"),
            R::exact_file("/dev/random"),
        ];

        // FreeBSD keeps home directories under /usr/home
        if Path::new("/usr/home").is_dir() {
            if let Ok(entries) = std::fs::read_dir("/usr") {
                let mut dirs: Vec<PathBuf> = entries
                    .filter_map(|entry| entry.ok())
                    .map(|entry| entry.path())
                    .filter(|path| path.is_dir() && !path.ends_with("home"))
                    .collect();
                dirs.sort();
                read.extend(dirs.into_iter().map(R::recursive_dir));
            }
        } else {
            read.push(R::recursive_dir("/usr"));
        }

        read.extend([
            R::recursive_dir("/lib"),
            R::recursive_dir("/lib32"),
            R::recursive_dir("/lib64"),
            R::recursive_dir("/opt"),
            R::exact_dir("/etc"),
            R::exact_file("/etc/localtime"),
            R::exact_file("/etc/timezone"),
            R::exact_dir("/usr"),
            R::exact_dir("/tmp"),
            R::exact_dir("/"),
        ]);

        if cfg!(target_os = "freebsd") {
            read.extend([
                R::exact_file("/etc/spwd.db"),
                R::exact_file("/etc/pwd.db"),
                R::exact_file("/dev/hv_tsc"),
                R::recursive_dir("/dev/fd"),
                R::exact_file("/etc/libmap.conf"),
                R::exact_file("/var/run/ld-elf.so.hints"),
            ]);
        } else {
            read.extend([
                R::exact_dir("/sys/devices/system/cpu"),
                R::exact_file("/sys/devices/system/cpu/online"),
                R::exact_file("/etc/selinux/config"),
                R::exact_file("/sys/kernel/mm/transparent_hugepage/enabled"),
                R::exact_file("/sys/kernel/mm/transparent_hugepage/hpage_pmd_size"),
                R::exact_file("/sys/kernel/mm/transparent_hugepage/shmem_enabled"),
                R::exact_dir("/proc"),
                R::exact_dir("/proc/self"),
                R::exact_file("/proc/self/maps"),
                R::exact_file("/proc/self/exe"),
                R::exact_file("/proc/self/auxv"),
                R::exact_file("/proc/meminfo"),
                R::exact_file("/proc/stat"),
                R::exact_file("/proc/cpuinfo"),
                R::exact_file("/proc/filesystems"),
                R::exact_dir("/proc/xen"),
                R::exact_file("/proc/uptime"),
                R::exact_file("/proc/sys/vm/overcommit_memory"),
                R::exact_file("/etc/ld.so.nohwcap"),
                R::exact_file("/etc/ld.so.preload"),
                R::exact_file("/etc/ld.so.cache"),
            ]);
        }

        Self {
            read,
            write: vec![R::exact_file("/dev/null")],
        }
    }

    /// Rules of `self` followed by those of `other`
    pub fn extended(&self, other: Option<&Filesystem>) -> Filesystem {
        let mut merged = self.clone();
        if let Some(other) = other {
            merged.read.extend(other.read.iter().cloned());
            merged.write.extend(other.write.iter().cloned());
        }
        merged
    }

    pub fn read_policy(&self) -> FilesystemPolicy {
        FilesystemPolicy::new(self.read.clone())
    }

    pub fn write_policy(&self) -> FilesystemPolicy {
        FilesystemPolicy::new(self.write.clone())
    }
}

/// Lexically normalise a path: drop `.`, resolve `..` without climbing
/// above the root, and strip trailing separators.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            Component::Normal(part) => out.push(part),
        }
    }
    if out.as_os_str().is_empty() {
        if path.is_absolute() {
            out.push("/");
        } else {
            out.push(".");
        }
    }
    out
}
