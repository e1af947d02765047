//! In-process working copy used by tests in place of an external tool.
//!
//! The committed revision is a map of relative path → content. Patches are
//! JSON maps of relative path → new content (`null` for deletion).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{LogPropertyInfo, RepositoryError, VcsBackend};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FakeCommit {
    pub author: String,
    pub message: String,
    pub properties: Vec<LogPropertyInfo>,
}

pub(crate) struct FakeBackend {
    root: PathBuf,
    committed: Mutex<BTreeMap<String, String>>,
    operations: Mutex<Vec<String>>,
    commits: Mutex<Vec<FakeCommit>>,
    failing_commits: Mutex<usize>,
}

impl FakeBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            committed: Mutex::new(BTreeMap::new()),
            operations: Mutex::new(Vec::new()),
            commits: Mutex::new(Vec::new()),
            failing_commits: Mutex::new(0),
        }
    }

    /// Treat the current working copy as committed.
    pub fn snapshot(&self) {
        *self.committed.lock().unwrap() = self.scan();
    }

    pub fn fail_next_commits(&self, count: usize) {
        *self.failing_commits.lock().unwrap() = count;
    }

    pub fn operations(&self) -> Vec<String> {
        self.operations.lock().unwrap().clone()
    }

    pub fn operations_named(&self, name: &str) -> usize {
        self.operations.lock().unwrap().iter().filter(|op| *op == name).count()
    }

    pub fn commits(&self) -> Vec<FakeCommit> {
        self.commits.lock().unwrap().clone()
    }

    pub fn commit_count(&self) -> usize {
        self.commits.lock().unwrap().len()
    }

    pub fn committed_file(&self, relative: &str) -> Option<String> {
        self.committed.lock().unwrap().get(relative).cloned()
    }

    fn record(&self, operation: &str) {
        self.operations.lock().unwrap().push(operation.to_string());
    }

    fn scan(&self) -> BTreeMap<String, String> {
        let mut files = BTreeMap::new();
        Self::scan_dir(&self.root, &self.root, &mut files);
        files
    }

    fn scan_dir(root: &Path, dir: &Path, files: &mut BTreeMap<String, String>) {
        let Ok(entries) = fs::read_dir(dir) else { return };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                Self::scan_dir(root, &path, files);
            } else if let Ok(content) = fs::read_to_string(&path) {
                let relative = path.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/");
                files.insert(relative, content);
            }
        }
    }

    fn changes(&self) -> BTreeMap<String, Option<String>> {
        let committed = self.committed.lock().unwrap().clone();
        let current = self.scan();
        let mut changes = BTreeMap::new();
        for (path, content) in &current {
            if committed.get(path) != Some(content) {
                changes.insert(path.clone(), Some(content.clone()));
            }
        }
        for path in committed.keys() {
            if !current.contains_key(path) {
                changes.insert(path.clone(), None);
            }
        }
        changes
    }

    fn write_files(&self, files: &BTreeMap<String, Option<String>>) {
        for (relative, content) in files {
            let path = self.root.join(relative);
            match content {
                Some(content) => {
                    fs::create_dir_all(path.parent().unwrap()).unwrap();
                    fs::write(&path, content).unwrap();
                }
                None => {
                    let _ = fs::remove_file(&path);
                }
            }
        }
    }
}

impl VcsBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn base_path(&self) -> &Path {
        &self.root
    }

    fn status(&self) -> Result<Vec<String>, RepositoryError> {
        self.record("status");
        let committed = self.committed.lock().unwrap().clone();
        Ok(self
            .changes()
            .into_iter()
            .map(|(path, content)| match (content, committed.contains_key(&path)) {
                (None, _) => format!("D {path}"),
                (Some(_), true) => format!("M {path}"),
                (Some(_), false) => format!("A {path}"),
            })
            .collect())
    }

    fn diff(&self) -> Result<String, RepositoryError> {
        self.record("diff");
        let changes = self.changes();
        if changes.is_empty() {
            return Ok(String::new());
        }
        Ok(serde_json::to_string(&changes).unwrap())
    }

    fn update(&self) -> Result<(), RepositoryError> {
        self.record("update");
        Ok(())
    }

    fn commit(
        &self,
        author: &str,
        message: &str,
        properties: &[LogPropertyInfo],
    ) -> Result<String, RepositoryError> {
        self.record("commit");
        {
            let mut failing = self.failing_commits.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(RepositoryError::Command {
                    command: "fake commit".into(),
                    message: "working copy is out of date".into(),
                });
            }
        }
        self.snapshot();
        self.commits.lock().unwrap().push(FakeCommit {
            author: author.to_string(),
            message: message.to_string(),
            properties: properties.to_vec(),
        });
        Ok(format!("Committed revision {}.", self.commit_count()))
    }

    fn revert(&self) -> Result<(), RepositoryError> {
        self.record("revert");
        let committed = self.committed.lock().unwrap().clone();
        let restore: BTreeMap<String, Option<String>> = self
            .changes()
            .into_keys()
            .map(|path| {
                let content = committed.get(&path).cloned();
                (path, content)
            })
            .collect();
        self.write_files(&restore);
        Ok(())
    }

    fn cleanup(&self) -> Result<(), RepositoryError> {
        self.record("cleanup");
        Ok(())
    }

    fn apply_patch(&self, patch_path: &Path) -> Result<(), RepositoryError> {
        self.record("patch");
        let text = fs::read_to_string(patch_path)?;
        let files: BTreeMap<String, Option<String>> = serde_json::from_str(&text).map_err(|e| {
            RepositoryError::Command {
                command: "fake patch".into(),
                message: e.to_string(),
            }
        })?;
        self.write_files(&files);
        Ok(())
    }

    fn add(&self, _path: &Path) -> Result<(), RepositoryError> {
        self.record("add");
        Ok(())
    }

    fn delete(&self, path: &Path) -> Result<(), RepositoryError> {
        self.record("delete");
        fs::remove_file(path)?;
        Ok(())
    }

    fn move_path(&self, from: &Path, to: &Path) -> Result<(), RepositoryError> {
        self.record("move");
        fs::rename(from, to)?;
        Ok(())
    }

    fn copy_path(&self, from: &Path, to: &Path) -> Result<(), RepositoryError> {
        self.record("copy");
        fs::copy(from, to)?;
        Ok(())
    }
}
