use super::types::{BatchedTestCase, CaseConfig, CaseEntry, ProblemConfig, TestCase};
use crate::config::types::{JudgeError, Result};
use crate::sandbox::filesystem::normalize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Submission metadata as sent by the server
pub type SubmissionMeta = BTreeMap<String, serde_json::Value>;

/// Read access to the files of one problem directory
#[derive(Debug, Clone)]
pub struct ProblemData {
    root: PathBuf,
}

impl ProblemData {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of `name` inside the problem directory. Names escaping the
    /// directory are rejected.
    pub fn path(&self, name: &str) -> Result<PathBuf> {
        let path = normalize(&self.root.join(name));
        if !path.starts_with(normalize(&self.root)) {
            return Err(JudgeError::InvalidInit(format!("`{}` is outside the problem directory", name)));
        }
        Ok(path)
    }

    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.path(name)?;
        std::fs::read(&path).map_err(|e| {
            JudgeError::InvalidInit(format!(
                "file `{}` could not be read in `{}`: {}",
                name,
                self.root.display(),
                e
            ))
        })
    }
}

/// A loaded problem with its case sequence, owned in one place
#[derive(Debug, Clone)]
pub struct Problem {
    pub id: String,
    pub time_limit: f64,
    /// KB
    pub memory_limit: u64,
    pub meta: SubmissionMeta,
    pub config: ProblemConfig,
    pub data: ProblemData,
    pub pretests_only: bool,
    entries: Vec<CaseEntry>,
}

impl Problem {
    pub fn new(
        id: impl Into<String>,
        time_limit: f64,
        memory_limit: u64,
        meta: SubmissionMeta,
        config: ProblemConfig,
        data: ProblemData,
    ) -> Result<Self> {
        let id = id.into();
        let main = match &config.test_cases {
            Some(cases) if !cases.is_empty() => cases,
            _ => return Err(JudgeError::InvalidInit(format!("problem `{}` has no test cases", id))),
        };
        let pretests = config.pretest_test_cases.as_deref().unwrap_or(&[]);
        let pretests_only = meta
            .get("pretests_only")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

        let mut builder = CaseBuilder::new(&id, &config);
        let mut entries = builder.build_list(pretests)?;
        let main_entries = builder.build_list(main)?;
        if !(pretests_only && !entries.is_empty()) {
            entries.extend(main_entries);
        }

        Ok(Self {
            id,
            time_limit,
            memory_limit,
            meta,
            config,
            data,
            pretests_only,
            entries,
        })
    }

    /// Cases in grading order
    pub fn cases(&self) -> &[CaseEntry] {
        &self.entries
    }

    /// Look a case up by its position
    pub fn case(&self, position: usize) -> Option<&TestCase> {
        self.entries
            .iter()
            .flat_map(CaseEntry::cases)
            .find(|case| case.position == position)
    }

    /// Whether only pretests are being graded
    pub fn pretested(&self) -> bool {
        self.pretests_only
            && self
                .config
                .pretest_test_cases
                .as_ref()
                .map_or(false, |cases| !cases.is_empty())
    }

    pub fn total_points(&self) -> u64 {
        self.entries
            .iter()
            .map(|entry| match entry {
                CaseEntry::Single(case) => case.points as u64,
                CaseEntry::Batch(batch) => batch.points as u64,
            })
            .sum()
    }

    /// Create the configured symlinks inside `workdir`
    pub fn install_symlinks(&self, workdir: &Path) -> Result<()> {
        let workdir = normalize(workdir);
        for (link, target) in &self.config.symlinks {
            let dest = normalize(&workdir.join(link));
            if dest == workdir || !dest.starts_with(&workdir) {
                return Err(JudgeError::Internal(format!(
                    "symlink `{}` would be created outside the working directory",
                    link
                )));
            }
            let source = self.data.path(target)?;
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::os::unix::fs::symlink(&source, &dest)?;
            log::debug!("linked {} -> {}", dest.display(), source.display());
        }
        Ok(())
    }
}

/// Assigns positions and batch numbers while validating batch structure
struct CaseBuilder<'a> {
    problem_id: &'a str,
    config: &'a ProblemConfig,
    position: usize,
    batch: usize,
}

impl<'a> CaseBuilder<'a> {
    fn new(problem_id: &'a str, config: &'a ProblemConfig) -> Self {
        Self {
            problem_id,
            config,
            position: 0,
            batch: 0,
        }
    }

    /// Dependencies are written relative to their own list, so each list
    /// keeps its own base.
    fn build_list(&mut self, configs: &[CaseConfig]) -> Result<Vec<CaseEntry>> {
        let base = self.batch;
        configs
            .iter()
            .map(|config| self.build_entry(config, base))
            .collect()
    }

    fn build_entry(&mut self, config: &CaseConfig, base: usize) -> Result<CaseEntry> {
        let Some(sub_configs) = &config.batched else {
            return Ok(CaseEntry::Single(self.case(config, 0, self.config.points)));
        };

        self.batch += 1;
        let number = self.batch;
        let local = number - base;

        if let Some(dep) = config.dependencies.iter().find(|&&dep| dep < 1) {
            return Err(JudgeError::InvalidInit(format!(
                "batch {} has dependency {}; dependencies must be positive",
                local, dep
            )));
        }
        if let Some(dep) = config.dependencies.iter().find(|&&dep| dep as usize >= local) {
            return Err(JudgeError::InvalidInit(format!(
                "batch {} depends on batch {}, which is not earlier",
                local, dep
            )));
        }
        if sub_configs.iter().any(|sub| sub.batched.is_some()) {
            return Err(JudgeError::InvalidInit("batches can't be nested".to_string()));
        }
        if sub_configs.is_empty() {
            return Err(JudgeError::InvalidInit(format!("batch {} has no test cases", local)));
        }

        let cases = sub_configs.iter().map(|sub| self.case(sub, number, 0)).collect();
        Ok(CaseEntry::Batch(BatchedTestCase {
            batch: number,
            points: config.points.unwrap_or(self.config.points),
            dependencies: config.dependencies.iter().map(|&dep| dep as usize + base).collect(),
            cases,
        }))
    }

    fn case(&mut self, config: &CaseConfig, batch: usize, default_points: u32) -> TestCase {
        let case = TestCase {
            problem_id: self.problem_id.to_string(),
            position: self.position,
            batch,
            input: config.input.clone(),
            output: config.output.clone(),
            points: config.points.unwrap_or(default_points),
            output_prefix_length: config.output_prefix_length.unwrap_or(self.config.output_prefix_length),
            has_binary_data: config.has_binary_data || self.config.binary_data,
        };
        self.position += 1;
        case
    }
}
