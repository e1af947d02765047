//! Transaction manager over a [`VcsBackend`] working copy.

use std::fs;
use std::path::{Component, Path, PathBuf};

use super::{LogPropertyInfo, RepositoryError, VcsBackend};

/// An open transaction: buffered commit messages and properties, plus the
/// patch file holding the last staged diff.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub author: String,
    pub name: String,
    pub messages: Vec<String>,
    pub properties: Vec<LogPropertyInfo>,
    pub patch_path: PathBuf,
}

impl Transaction {
    /// Properties with later keys overriding earlier ones.
    fn merged_properties(&self) -> Vec<LogPropertyInfo> {
        let mut merged: Vec<LogPropertyInfo> = Vec::new();
        for property in &self.properties {
            match merged.iter_mut().find(|p| p.key == property.key) {
                Some(existing) => existing.value = property.value.clone(),
                None => merged.push(property.clone()),
            }
        }
        merged
    }
}

pub struct Repository<B: VcsBackend> {
    backend: B,
    transactions_path: PathBuf,
    transaction: Option<Transaction>,
    needs_update: bool,
}

impl<B: VcsBackend> Repository<B> {
    /// Take over a working copy. Fails if it has local modifications.
    pub fn open(backend: B, transactions_path: impl Into<PathBuf>) -> Result<Self, RepositoryError> {
        let items = backend.status()?;
        if !items.is_empty() {
            return Err(RepositoryError::Dirty {
                path: backend.base_path().to_path_buf(),
                items,
            });
        }
        let transactions_path = transactions_path.into();
        fs::create_dir_all(&transactions_path)?;
        log::info!(
            "Opened {} repository at {}",
            backend.name(),
            backend.base_path().display()
        );
        Ok(Self {
            backend,
            transactions_path,
            transaction: None,
            needs_update: false,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn base_path(&self) -> &Path {
        self.backend.base_path()
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    pub fn is_in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    // ─── Transactions ─────────────────────────────────────────────────

    pub fn begin_transaction(&mut self, author: &str, name: &str) -> Result<(), RepositoryError> {
        if let Some(open) = &self.transaction {
            return Err(RepositoryError::TransactionInProgress(open.name.clone()));
        }
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            return Err(RepositoryError::InvalidPath(name.to_string()));
        }
        let patch_path = self.transactions_path.join(format!("{name}.patch"));
        log::debug!("Begin transaction '{}' by '{}'", name, author);
        self.transaction = Some(Transaction {
            author: author.to_string(),
            name: name.to_string(),
            messages: Vec::new(),
            properties: Vec::new(),
            patch_path,
        });
        Ok(())
    }

    /// Commit local modifications.
    ///
    /// Inside a transaction this only stages: the current diff replaces the
    /// transaction's patch file and the message is buffered. Outside a
    /// transaction the modifications are committed right away; a failed
    /// commit is retried exactly once after an update.
    pub fn commit(
        &mut self,
        author: &str,
        comment: &str,
        properties: &[LogPropertyInfo],
    ) -> Result<(), RepositoryError> {
        if let Some(transaction) = self.transaction.as_mut() {
            let diff = self.backend.diff()?;
            fs::write(&transaction.patch_path, diff)?;
            transaction.messages.push(comment.to_string());
            transaction.properties.extend_from_slice(properties);
            log::debug!("Staged commit in transaction '{}': {}", transaction.name, comment);
            return Ok(());
        }

        if self.needs_update {
            self.backend.update()?;
            self.needs_update = false;
        }
        match self.backend.commit(author, comment, properties) {
            Ok(output) => {
                log::debug!("{}", output.trim());
                Ok(())
            }
            Err(e) => {
                log::warn!("Commit failed, updating and retrying once: {}", e);
                self.backend.update()?;
                let output = self.backend.commit(author, comment, properties)?;
                log::debug!("{}", output.trim());
                Ok(())
            }
        }
    }

    /// Flush the transaction as one real commit.
    pub fn end_transaction(&mut self) -> Result<(), RepositoryError> {
        let transaction = self.transaction.clone().ok_or(RepositoryError::NoTransaction)?;

        if self.backend.status()?.is_empty() {
            log::debug!("repository has no changes");
        } else {
            self.backend.update()?;
            let message = transaction.messages.join("\n");
            let output = self.backend.commit(
                &transaction.author,
                &message,
                &transaction.merged_properties(),
            )?;
            log::debug!("{}", output.trim());
        }

        Self::remove_patch(&transaction.patch_path)?;
        self.transaction = None;
        log::debug!("End transaction '{}'", transaction.name);
        Ok(())
    }

    /// Discard the transaction.
    ///
    /// The working copy is reverted and then the last staged patch (if any)
    /// is re-applied, so modifications staged by `commit` survive while
    /// everything after the last staged commit is dropped.
    pub fn cancel_transaction(&mut self) -> Result<(), RepositoryError> {
        let transaction = self.transaction.take().ok_or(RepositoryError::NoTransaction)?;

        self.backend.revert()?;
        self.backend.cleanup()?;
        if transaction.patch_path.exists() {
            let staged = fs::metadata(&transaction.patch_path)?.len() > 0;
            if staged {
                self.backend.apply_patch(&transaction.patch_path)?;
            }
            Self::remove_patch(&transaction.patch_path)?;
        }
        log::debug!("Cancel transaction '{}'", transaction.name);
        Ok(())
    }

    // ─── Working copy ─────────────────────────────────────────────────

    pub fn status(&self) -> Result<Vec<String>, RepositoryError> {
        self.backend.status()
    }

    /// Discard local modifications outside of any transaction.
    pub fn revert(&mut self) -> Result<(), RepositoryError> {
        self.backend.revert()?;
        self.backend.cleanup()?;
        self.needs_update = true;
        Ok(())
    }

    pub fn add(&self, path: &Path) -> Result<(), RepositoryError> {
        self.backend.add(self.checked(path)?)
    }

    pub fn delete(&self, path: &Path) -> Result<(), RepositoryError> {
        self.backend.delete(self.checked(path)?)
    }

    pub fn move_path(&self, from: &Path, to: &Path) -> Result<(), RepositoryError> {
        self.backend.move_path(self.checked(from)?, self.checked(to)?)
    }

    pub fn copy_path(&self, from: &Path, to: &Path) -> Result<(), RepositoryError> {
        self.backend.copy_path(self.checked(from)?, self.checked(to)?)
    }

    /// `path` must name something strictly inside the working copy. Only
    /// plain components may follow the base, so `..` can never climb out.
    fn checked<'p>(&self, path: &'p Path) -> Result<&'p Path, RepositoryError> {
        let inside = path
            .strip_prefix(self.backend.base_path())
            .map(|rest| {
                rest.components().next().is_some()
                    && rest
                        .components()
                        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
            })
            .unwrap_or(false);
        if inside {
            Ok(path)
        } else {
            Err(RepositoryError::InvalidPath(path.display().to_string()))
        }
    }

    fn remove_patch(path: &Path) -> Result<(), RepositoryError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::fake::FakeBackend;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        transactions: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let root = dir.path().join("wc");
            let transactions = dir.path().join("transactions");
            fs::create_dir_all(&root).unwrap();
            Self {
                _dir: dir,
                root,
                transactions,
            }
        }

        fn file(&self, name: &str) -> PathBuf {
            self.root.join(name)
        }

        /// Working copy with `F` committed as "v0".
        fn repository(&self) -> Repository<FakeBackend> {
            fs::write(self.file("F"), "v0").unwrap();
            let backend = FakeBackend::new(&self.root);
            backend.snapshot();
            Repository::open(backend, &self.transactions).unwrap()
        }
    }

    #[test]
    fn test_open_rejects_dirty_working_copy() {
        let fx = Fixture::new();
        let backend = FakeBackend::new(&fx.root);
        fs::write(fx.file("F"), "uncommitted").unwrap();
        let err = Repository::open(backend, &fx.transactions).err().unwrap();
        match err {
            RepositoryError::Dirty { items, .. } => assert_eq!(items, vec!["A F".to_string()]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cancel_reapplies_last_staged_patch() {
        let fx = Fixture::new();
        let mut repo = fx.repository();

        repo.begin_transaction("admin", "t1").unwrap();
        fs::write(fx.file("F"), "v1").unwrap();
        repo.commit("admin", "m1", &[]).unwrap();
        repo.cancel_transaction().unwrap();

        // Rolled back to the last staged commit, not to the transaction start.
        assert_eq!(fs::read_to_string(fx.file("F")).unwrap(), "v1");
        assert!(!repo.is_in_transaction());
        assert!(!fx.transactions.join("t1.patch").exists());
        assert_eq!(repo.backend().commit_count(), 0);
    }

    #[test]
    fn test_cancel_drops_changes_after_last_stage() {
        let fx = Fixture::new();
        let mut repo = fx.repository();

        repo.begin_transaction("admin", "t1").unwrap();
        fs::write(fx.file("F"), "v1").unwrap();
        repo.commit("admin", "m1", &[]).unwrap();
        fs::write(fx.file("F"), "v2").unwrap();
        fs::write(fx.file("G"), "g").unwrap();
        repo.commit("admin", "m2", &[]).unwrap();
        fs::write(fx.file("F"), "v3").unwrap();
        fs::write(fx.file("H"), "late").unwrap();
        repo.cancel_transaction().unwrap();

        assert_eq!(fs::read_to_string(fx.file("F")).unwrap(), "v2");
        assert_eq!(fs::read_to_string(fx.file("G")).unwrap(), "g");
        assert!(!fx.file("H").exists());
    }

    #[test]
    fn test_cancel_without_staged_commit_restores_start() {
        let fx = Fixture::new();
        let mut repo = fx.repository();

        repo.begin_transaction("admin", "t1").unwrap();
        fs::write(fx.file("F"), "scratch").unwrap();
        repo.cancel_transaction().unwrap();

        assert_eq!(fs::read_to_string(fx.file("F")).unwrap(), "v0");
        assert!(!repo.backend().operations().contains(&"patch".to_string()));
    }

    #[test]
    fn test_end_transaction_without_changes_is_noop() {
        let fx = Fixture::new();
        let mut repo = fx.repository();

        repo.begin_transaction("admin", "empty").unwrap();
        repo.end_transaction().unwrap();

        assert_eq!(repo.backend().commit_count(), 0);
        assert!(!repo.is_in_transaction());
    }

    #[test]
    fn test_end_transaction_commits_buffered_messages() {
        let fx = Fixture::new();
        let mut repo = fx.repository();

        repo.begin_transaction("alice", "t1").unwrap();
        fs::write(fx.file("F"), "v1").unwrap();
        repo.commit("alice", "first", &[LogPropertyInfo::new("k", "1")]).unwrap();
        fs::write(fx.file("F"), "v2").unwrap();
        repo.commit("alice", "second", &[LogPropertyInfo::new("k", "2"), LogPropertyInfo::new("x", "y")])
            .unwrap();
        assert_eq!(repo.backend().commit_count(), 0);

        repo.end_transaction().unwrap();

        let commits = repo.backend().commits();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].author, "alice");
        assert_eq!(commits[0].message, "first\nsecond");
        assert_eq!(
            commits[0].properties,
            vec![LogPropertyInfo::new("k", "2"), LogPropertyInfo::new("x", "y")]
        );
        assert!(repo.status().unwrap().is_empty());
        assert!(!fx.transactions.join("t1.patch").exists());
    }

    #[test]
    fn test_direct_commit_retries_once() {
        let fx = Fixture::new();
        let mut repo = fx.repository();
        repo.backend().fail_next_commits(1);

        fs::write(fx.file("F"), "v1").unwrap();
        repo.commit("admin", "direct", &[]).unwrap();

        assert_eq!(repo.backend().operations_named("update"), 1);
        assert_eq!(repo.backend().operations_named("commit"), 2);
        assert_eq!(repo.backend().commit_count(), 1);
    }

    #[test]
    fn test_second_commit_failure_propagates() {
        let fx = Fixture::new();
        let mut repo = fx.repository();
        repo.backend().fail_next_commits(2);

        fs::write(fx.file("F"), "v1").unwrap();
        let err = repo.commit("admin", "direct", &[]).unwrap_err();

        assert!(matches!(err, RepositoryError::Command { .. }));
        assert_eq!(repo.backend().operations_named("update"), 1);
        assert_eq!(repo.backend().operations_named("commit"), 2);
        assert_eq!(repo.backend().commit_count(), 0);
    }

    #[test]
    fn test_single_open_transaction() {
        let fx = Fixture::new();
        let mut repo = fx.repository();

        assert!(matches!(repo.end_transaction(), Err(RepositoryError::NoTransaction)));
        assert!(matches!(repo.cancel_transaction(), Err(RepositoryError::NoTransaction)));

        repo.begin_transaction("admin", "a").unwrap();
        let err = repo.begin_transaction("admin", "b").unwrap_err();
        assert!(matches!(err, RepositoryError::TransactionInProgress(name) if name == "a"));
        repo.cancel_transaction().unwrap();

        assert!(matches!(
            repo.begin_transaction("admin", "../x"),
            Err(RepositoryError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_revert_forces_update_before_next_commit() {
        let fx = Fixture::new();
        let mut repo = fx.repository();

        fs::write(fx.file("F"), "dirty").unwrap();
        repo.revert().unwrap();
        assert_eq!(fs::read_to_string(fx.file("F")).unwrap(), "v0");

        fs::write(fx.file("F"), "v1").unwrap();
        repo.commit("admin", "after revert", &[]).unwrap();
        assert_eq!(repo.backend().operations_named("update"), 1);
        assert_eq!(repo.backend().operations_named("commit"), 1);
    }

    #[test]
    fn test_paths_outside_working_copy_are_rejected() {
        let fx = Fixture::new();
        let repo = fx.repository();
        let err = repo.add(Path::new("/etc/passwd")).unwrap_err();
        assert!(matches!(err, RepositoryError::InvalidPath(_)));

        let climbing = fx.root.join("tables/Items/../../../escaped.json");
        let err = repo.add(&climbing).unwrap_err();
        assert!(matches!(err, RepositoryError::InvalidPath(_)));
        assert!(matches!(repo.delete(&fx.root), Err(RepositoryError::InvalidPath(_))));
        assert!(repo.add(&fx.file("F")).is_ok());
    }
}
