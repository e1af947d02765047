//! Durable home of domain content outside the engine.
//!
//! When a domain is deleted without force its content is committed through
//! a [`DomainHost`]. [`RepositoryDomainHost`] writes every table as a JSON
//! file into a version-controlled working copy and commits them as one
//! repository transaction.

use crema_core::DomainInfo;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::content::{check_table_name, DomainContent};
use crate::error::{CremaError, Result};
use crate::repository::{
    BackendKind, GitBackend, LogPropertyInfo, Repository, RepositoryConfig, RepositoryError,
    SvnBackend, VcsBackend,
};

/// File holding the domain's free-form properties.
const PROPERTIES_FILE: &str = "_properties.json";

pub trait DomainHost: Send + Sync {
    /// Persist `content` as the new state of the item described by `info`.
    /// Blocks until the commit finishes.
    fn commit(&self, info: &DomainInfo, content: &DomainContent, author: &str) -> Result<()>;
}

pub struct RepositoryDomainHost<B: VcsBackend> {
    repository: Mutex<Repository<B>>,
}

impl<B: VcsBackend> RepositoryDomainHost<B> {
    pub fn new(repository: Repository<B>) -> Self {
        Self {
            repository: Mutex::new(repository),
        }
    }

    /// Run `f` with exclusive access to the repository.
    pub fn with_repository<R>(&self, f: impl FnOnce(&mut Repository<B>) -> R) -> Result<R> {
        let mut repository = self
            .repository
            .lock()
            .map_err(|_| CremaError::InvalidOperation("repository lock poisoned".into()))?;
        Ok(f(&mut repository))
    }

    fn write_and_stage(
        repository: &mut Repository<B>,
        info: &DomainInfo,
        content: &DomainContent,
        author: &str,
    ) -> Result<()> {
        let directory = repository.base_path().join(item_directory(&info.item_path)?);
        content.tables.keys().try_for_each(|name| check_table_name(name))?;
        fs::create_dir_all(&directory).map_err(RepositoryError::from)?;

        let mut files: Vec<(PathBuf, String)> = Vec::new();
        for (name, table) in &content.tables {
            files.push((directory.join(format!("{name}.json")), to_json(table)?));
        }
        if !content.properties.is_empty() {
            files.push((directory.join(PROPERTIES_FILE), to_json(&content.properties)?));
        }
        for (path, text) in files {
            let is_new = !path.exists();
            fs::write(&path, text).map_err(RepositoryError::from)?;
            if is_new {
                repository.add(&path)?;
            }
        }

        let message = format!("{} '{}' saved", info.item_type, info.item_path);
        let properties = [
            LogPropertyInfo::new("crema:domain-id", info.domain_id.to_string()),
            LogPropertyInfo::new("crema:data-base-id", info.data_base_id.to_string()),
            LogPropertyInfo::new("crema:domain-type", info.domain_type.clone()),
        ];
        repository.commit(author, &message, &properties)?;
        Ok(())
    }
}

impl<B: VcsBackend> DomainHost for RepositoryDomainHost<B> {
    fn commit(&self, info: &DomainInfo, content: &DomainContent, author: &str) -> Result<()> {
        self.with_repository(|repository| {
            repository.begin_transaction(author, &info.domain_id.to_string())?;
            let result = Self::write_and_stage(repository, info, content, author)
                .and_then(|()| repository.end_transaction().map_err(CremaError::from));
            if let Err(e) = &result {
                log::warn!("Commit of domain {} failed: {}", info.domain_id, e);
                if repository.is_in_transaction() {
                    if let Err(cancel) = repository.cancel_transaction() {
                        log::error!("Cancel of domain {} failed: {}", info.domain_id, cancel);
                    }
                }
            } else {
                log::info!("Domain {} committed to {}", info.domain_id, info.item_path);
            }
            result
        })?
    }
}

/// Open the working copy described by `config` as a domain host.
///
/// Fails with [`RepositoryError::Dirty`] when the working copy has local
/// modifications.
pub fn open_repository_host(config: &RepositoryConfig) -> Result<Arc<dyn DomainHost>> {
    let transactions = config.transactions_path();
    let host: Arc<dyn DomainHost> = match config.backend {
        BackendKind::Svn => {
            let mut backend = SvnBackend::new(&config.path);
            if let Some(program) = &config.program {
                backend = backend.with_program(program.clone());
            }
            Arc::new(RepositoryDomainHost::new(Repository::open(backend, transactions)?))
        }
        BackendKind::Git => {
            let mut backend = GitBackend::new(&config.path);
            if let Some(program) = &config.program {
                backend = backend.with_program(program.clone());
            }
            Arc::new(RepositoryDomainHost::new(Repository::open(backend, transactions)?))
        }
    };
    log::info!("Repository {} opened ({:?})", config.path.display(), config.backend);
    Ok(host)
}

/// Relative directory for an item path such as `/tables/Items`.
pub(crate) fn item_directory(item_path: &str) -> Result<PathBuf> {
    let relative = Path::new(item_path.trim_start_matches('/'));
    let mut directory = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => directory.push(part),
            Component::CurDir => {}
            _ => {
                return Err(CremaError::InvalidArgument(format!(
                    "invalid item path '{item_path}'"
                )))
            }
        }
    }
    if directory.as_os_str().is_empty() {
        return Err(CremaError::InvalidArgument(format!("invalid item path '{item_path}'")));
    }
    Ok(directory)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| CremaError::InvalidArgument(e.to_string()))
}
