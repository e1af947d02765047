//! Version-control backed persistence with transactional commits.
//!
//! ```text
//!            begin_transaction(author, name)
//!   Idle ───────────────────────────────────► TransactionOpen
//!    │  ▲                                      │   │   ▲
//!    │  │ end_transaction  (single real commit)│   │   │ commit (staged: diff → <name>.patch)
//!    │  └──────────────────────────────────────┘   └───┘
//!    │  ▲
//!    │  │ cancel_transaction (revert, cleanup, re-apply <name>.patch)
//!    │  └──────────────────────────────────────────── TransactionOpen
//!    │
//!    └─► commit (update if needed, commit, on failure: update + retry once)
//! ```
//!
//! The working copy is a single shared resource. The manager checks it is
//! clean when opened and assumes exclusive access afterwards; it takes no
//! locks of its own, so callers serialize access (see `RepositoryDomainHost`).

pub mod command;
pub mod git;
pub mod svn;
pub mod transaction;

#[cfg(test)]
pub(crate) mod fake;

pub use command::{CommandRunner, ProcessRunner, VcsCommand};
pub use git::GitBackend;
pub use svn::SvnBackend;
pub use transaction::{Repository, Transaction};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The working copy had local modifications when it was opened.
    #[error("repository '{}' is dirty: {}", path.display(), items.join(", "))]
    Dirty { path: PathBuf, items: Vec<String> },

    /// An external command failed.
    #[error("'{command}' failed: {message}")]
    Command { command: String, message: String },

    #[error("transaction '{0}' is already in progress")]
    TransactionInProgress(String),

    #[error("no transaction is in progress")]
    NoTransaction,

    #[error("invalid repository path: {0}")]
    InvalidPath(String),

    #[error("repository I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A revision property attached to a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPropertyInfo {
    pub key: String,
    pub value: String,
}

impl LogPropertyInfo {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Which version-control program backs a working copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Svn,
    Git,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "svn" => Ok(BackendKind::Svn),
            "git" => Ok(BackendKind::Git),
            other => Err(format!("unknown repository backend '{other}'")),
        }
    }
}

/// Primitive working-copy operations of a version-control system.
///
/// Every method blocks until the underlying tool finishes.
pub trait VcsBackend: Send {
    fn name(&self) -> &'static str;

    fn base_path(&self) -> &Path;

    /// One entry per locally modified path; empty when clean.
    fn status(&self) -> Result<Vec<String>, RepositoryError>;

    /// Patch text describing every local modification.
    fn diff(&self) -> Result<String, RepositoryError>;

    fn update(&self) -> Result<(), RepositoryError>;

    /// Commit every local modification. Returns the tool's output.
    fn commit(
        &self,
        author: &str,
        message: &str,
        properties: &[LogPropertyInfo],
    ) -> Result<String, RepositoryError>;

    /// Discard every local modification.
    fn revert(&self) -> Result<(), RepositoryError>;

    fn cleanup(&self) -> Result<(), RepositoryError>;

    fn apply_patch(&self, patch_path: &Path) -> Result<(), RepositoryError>;

    fn add(&self, path: &Path) -> Result<(), RepositoryError>;

    fn delete(&self, path: &Path) -> Result<(), RepositoryError>;

    fn move_path(&self, from: &Path, to: &Path) -> Result<(), RepositoryError>;

    fn copy_path(&self, from: &Path, to: &Path) -> Result<(), RepositoryError>;
}

/// Working-copy settings for a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub path: PathBuf,
    pub backend: BackendKind,
    /// Directory for transaction patch files; defaults to a sibling of `path`.
    pub transactions_path: Option<PathBuf>,
    /// Overrides the program name (`svn` / `git`).
    pub program: Option<String>,
}

impl RepositoryConfig {
    pub fn new(path: impl Into<PathBuf>, backend: BackendKind) -> Self {
        Self {
            path: path.into(),
            backend,
            transactions_path: None,
            program: None,
        }
    }

    pub fn transactions_path(&self) -> PathBuf {
        self.transactions_path.clone().unwrap_or_else(|| {
            let mut name = self
                .path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_default();
            name.push(".transactions");
            self.path.with_file_name(name)
        })
    }
}
