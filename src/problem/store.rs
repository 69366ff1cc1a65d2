use super::loader::{Problem, ProblemData, SubmissionMeta};
use super::types::ProblemConfig;
use crate::config::types::{JudgeError, Result};
use globset::GlobBuilder;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

const INIT_FILE: &str = "init.yml";

/// Problems found under the configured storage globs
#[derive(Debug, Clone, Default)]
pub struct ProblemStore {
    roots: BTreeMap<String, PathBuf>,
    /// Discovery order, with directory mtimes for the handshake
    problems: Vec<(String, f64)>,
}

impl ProblemStore {
    /// Find every `<glob>/init.yml`. The problem id is the directory name;
    /// on duplicates the first directory found wins.
    pub fn discover(globs: &[String]) -> Result<Self> {
        let mut store = Self::default();

        for pattern in globs {
            let trimmed = pattern.trim_end_matches('/');
            let full = format!("{}/{}", trimmed, INIT_FILE);
            let matcher = GlobBuilder::new(&full)
                .literal_separator(true)
                .build()
                .map_err(|e| JudgeError::Config(format!("bad problem glob `{}`: {}", pattern, e)))?
                .compile_matcher();

            let walk_root = literal_prefix(trimmed);
            if !walk_root.exists() {
                warn!("problem storage {} does not exist", walk_root.display());
                continue;
            }

            let mut found: Vec<PathBuf> = WalkDir::new(&walk_root)
                .follow_links(true)
                .into_iter()
                .filter_map(|entry| match entry {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        debug!("skipping unreadable entry: {}", e);
                        None
                    }
                })
                .filter(|entry| entry.file_type().is_file() && entry.file_name() == INIT_FILE)
                .map(|entry| entry.into_path())
                .filter(|path| matcher.is_match(path))
                .collect();
            found.sort();

            for init in found {
                store.register(&init);
            }
        }

        info!("discovered {} problems", store.problems.len());
        Ok(store)
    }

    fn register(&mut self, init: &Path) {
        let Some(dir) = init.parent() else { return };
        let Some(id) = dir.file_name().and_then(|name| name.to_str()) else {
            return;
        };
        if let Some(existing) = self.roots.get(id) {
            warn!(
                "duplicate problem {} found at {}, ignoring in favour of {}",
                id,
                dir.display(),
                existing.display()
            );
            return;
        }

        let mtime = std::fs::metadata(dir)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map_or(0.0, |age| age.as_secs_f64());
        self.roots.insert(id.to_string(), dir.to_path_buf());
        self.problems.push((id.to_string(), mtime));
    }

    /// `(id, mtime)` pairs for the handshake
    pub fn problems(&self) -> &[(String, f64)] {
        &self.problems
    }

    pub fn contains(&self, id: &str) -> bool {
        self.roots.contains_key(id)
    }

    pub fn root(&self, id: &str) -> Option<&Path> {
        self.roots.get(id).map(PathBuf::as_path)
    }

    /// Parse `init.yml` and build the case sequence for one submission
    pub fn load(&self, id: &str, time_limit: f64, memory_limit: u64, meta: SubmissionMeta) -> Result<Problem> {
        let root = self
            .root(id)
            .ok_or_else(|| JudgeError::InvalidInit(format!("unknown problem `{}`", id)))?;
        let data = ProblemData::new(root);
        let raw = data.read(INIT_FILE)?;

        let value: serde_yaml::Value = serde_yaml::from_slice(&raw)?;
        if value.is_null() {
            return Err(JudgeError::InvalidInit(format!("`init.yml` of problem `{}` is empty", id)));
        }
        if !value.is_mapping() {
            return Err(JudgeError::InvalidInit(format!("`init.yml` of problem `{}` is not a mapping", id)));
        }
        let config: ProblemConfig = serde_yaml::from_value(value)?;

        if let Some(archive) = &config.archive {
            let path = data.path(archive)?;
            if !path.exists() {
                return Err(JudgeError::InvalidInit(format!("archive file `{}` doesn't exist", path.display())));
            }
            return Err(JudgeError::InvalidInit(format!(
                "problem `{}` uses archive `{}`; archives are not supported",
                id, archive
            )));
        }

        Problem::new(id, time_limit, memory_limit, meta, config, data)
    }
}

/// Leading components of a glob that contain no metacharacters
fn literal_prefix(pattern: &str) -> PathBuf {
    let mut prefix = PathBuf::new();
    for component in Path::new(pattern).components() {
        let meta = match component {
            Component::Normal(part) => part
                .to_str()
                .map_or(true, |part| part.contains(['*', '?', '[', '{'])),
            _ => false,
        };
        if meta {
            break;
        }
        prefix.push(component.as_os_str());
    }
    if prefix.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        prefix
    }
}
