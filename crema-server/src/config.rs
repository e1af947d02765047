use anyhow::{Context, Result};
use clap::Parser;
use crema_collab::{BackendKind, RepositoryConfig, ServerConfig};
use crema_core::Authority;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// CLI arguments
#[derive(Parser, Debug, Default)]
#[command(name = "crema-server")]
#[command(about = "Crema collaborative domain-session server")]
pub struct Cli {
    /// Configuration file path (TOML)
    #[arg(short, long, env = "CREMA_CONFIG")]
    pub config: Option<PathBuf>,

    /// WebSocket bind address
    #[arg(long, env = "CREMA_BIND")]
    pub bind: Option<String>,

    /// Directory of the domain log
    #[arg(long, env = "CREMA_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Working copy that receives committed domains
    #[arg(long, env = "CREMA_REPOSITORY")]
    pub repository: Option<PathBuf>,

    /// Version-control backend of the working copy (svn or git)
    #[arg(long, env = "CREMA_BACKEND")]
    pub backend: Option<BackendKind>,

    /// Log level
    #[arg(long, env = "CREMA_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Session timeout in seconds
    #[arg(long, env = "CREMA_SESSION_TIMEOUT")]
    pub session_timeout: Option<u64>,
}

/// An account created at startup.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserSeed {
    pub user_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub password: String,
    #[serde(default = "default_authority")]
    pub authority: Authority,
}

impl UserSeed {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.user_id)
    }
}

fn default_authority() -> Authority {
    Authority::Member
}

/// Contents of the `--config` file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    bind: Option<String>,
    data_dir: Option<PathBuf>,
    heartbeat_interval_secs: Option<u64>,
    session_timeout_secs: Option<u64>,
    log_level: Option<String>,
    repository: Option<RepositoryConfig>,
    users: Vec<UserSeed>,
}

impl FileConfig {
    fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

/// Fully resolved startup settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub users: Vec<UserSeed>,
    pub log_level: String,
    /// No users were configured and the fallback admin account was added.
    pub default_admin: bool,
}

impl Settings {
    /// Defaults, then the config file, then CLI flags and `CREMA_*` variables.
    pub fn load(cli: &Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => FileConfig::read(path)?,
            None => FileConfig::default(),
        };
        Self::merge(cli, file)
    }

    fn merge(cli: &Cli, file: FileConfig) -> Result<Self> {
        let mut server = ServerConfig::default();
        let mut log_level = "info".to_string();

        if let Some(bind) = file.bind {
            server.bind_addr = bind;
        }
        if let Some(data_dir) = file.data_dir {
            server.store.path = data_dir;
        }
        if let Some(secs) = file.heartbeat_interval_secs {
            server.heartbeat_interval_secs = secs;
        }
        if let Some(secs) = file.session_timeout_secs {
            server.session_timeout_secs = secs;
        }
        if let Some(level) = file.log_level {
            log_level = level;
        }
        server.repository = file.repository;

        // Override with CLI args
        if let Some(bind) = &cli.bind {
            server.bind_addr = bind.clone();
        }
        if let Some(data_dir) = &cli.data_dir {
            server.store.path = data_dir.clone();
        }
        if let Some(secs) = cli.session_timeout {
            server.session_timeout_secs = secs;
        }
        if let Some(level) = &cli.log_level {
            log_level = level.clone();
        }
        if let Some(path) = &cli.repository {
            server.repository = Some(RepositoryConfig::new(
                path.clone(),
                cli.backend.unwrap_or(BackendKind::Svn),
            ));
        } else if let (Some(repository), Some(backend)) = (server.repository.as_mut(), cli.backend) {
            repository.backend = backend;
        }

        let mut settings = Self {
            server,
            users: file.users,
            log_level,
            default_admin: false,
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&mut self) -> Result<()> {
        if self.server.bind_addr.trim().is_empty() {
            anyhow::bail!("bind address must not be empty");
        }
        if self.server.heartbeat_interval_secs == 0 {
            anyhow::bail!("heartbeat_interval_secs must be greater than 0");
        }
        if self.server.session_timeout_secs == 0 {
            anyhow::bail!("session timeout must be greater than 0");
        }

        let mut seen = HashSet::new();
        for user in &self.users {
            if user.user_id.is_empty() {
                anyhow::bail!("a configured user has an empty user_id");
            }
            if !seen.insert(user.user_id.as_str()) {
                anyhow::bail!("user '{}' is configured twice", user.user_id);
            }
        }

        if self.users.is_empty() {
            self.users.push(UserSeed {
                user_id: "admin".to_string(),
                name: Some("Administrator".to_string()),
                password: "admin".to_string(),
                authority: Authority::Admin,
            });
            self.default_admin = true;
        }
        Ok(())
    }
}
