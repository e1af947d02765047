//! Crema server binary.
//!
//! Usage:
//! ```bash
//! crema-server --bind 0.0.0.0:9090 --data-dir ./data
//! crema-server --config crema.toml --repository ./wc --backend git
//! ```

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use crema_collab::CremaServer;

use config::{Cli, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli)?;

    // RUST_LOG wins over the configured level
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&settings.log_level)).init();

    if settings.default_admin {
        log::warn!("No users configured; created 'admin' with the default password");
    }

    let server = CremaServer::open(settings.server.clone()).context("Failed to open server")?;
    for user in &settings.users {
        server
            .registry()
            .add_user(&user.user_id, user.display_name(), &user.password, user.authority)
            .await
            .with_context(|| format!("Failed to add user '{}'", user.user_id))?;
    }
    log::info!(
        "Loaded {} domain(s) for {} user(s)",
        server.context().domains().await?.len(),
        settings.users.len()
    );

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                log::error!("Server stopped: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down");
        }
    }

    server.shutdown().await;
    Ok(())
}
