//! Converge agent
//!
//! Runs the installer worker against the host platform. Producers declare
//! the modules and configurations they want; the worker converges the
//! platform toward that set and keeps its progress in a local SQLite file.
//!
//! ## Architecture
//!
//! - **Installer**: producer API and the single worker owning the resource table
//! - **Tasks**: module and configuration operations emitted per entity group
//! - **Platform**: abstracts the host registry (mock for now)

use std::sync::Arc;

use anyhow::{Context, Result};
use converge_agent::config::Config;
use converge_agent::tasks::default_creators;
use converge_agent::MockPlatform;
use converge_reconcile::{Installer, LoggingListener, RetryTrigger, StateStore};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        data_dir = %config.data_dir.display(),
        state_db = %config.state_db.display(),
        max_task_retries = config.max_task_retries,
        "Starting converge agent"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data directory {}", config.data_dir.display()))?;
    let store = StateStore::open(&config.state_db)
        .with_context(|| format!("opening state database {}", config.state_db.display()))?;

    // Lifecycle events from the platform wake the worker for retries
    let retry = Arc::new(RetryTrigger::new());
    let platform = Arc::new(MockPlatform::new().with_retry_trigger(Arc::clone(&retry)));
    let creators = default_creators(platform, config.max_task_retries);

    let (installer, worker) = Installer::new(
        config.installer_config(),
        store,
        creators,
        Arc::new(LoggingListener),
        retry,
    );
    let mut worker_handle = tokio::spawn(worker.run());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut worker_handle => {
            if let Err(e) = result {
                error!(error = %e, "Installer worker panicked");
            }
            return Ok(());
        }
    }

    installer.deactivate();
    if let Err(e) = worker_handle.await {
        error!(error = %e, "Installer worker panicked");
    }

    info!("Converge agent shutdown complete");
    Ok(())
}
