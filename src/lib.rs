pub mod db;
pub mod error;
pub mod library;
pub mod models;
pub mod progress;
pub mod session;
pub mod settings;
pub mod storage;
pub mod tree;
mod utils;

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};

use db::Database;
use library::ChainLibrary;
use session::{SessionController, Sweeper};
use settings::{resolve_data_dir, SettingsStore};
use storage::{CachedStorage, Storage};
use tree::TreeCache;

/// Logs a session that outlived the previous process. It is kept as-is,
/// paused state included, so the user can finish or interrupt it.
async fn recover_active_session<S: Storage>(controller: &SessionController<S>) -> Result<()> {
    if let Some(snapshot) = controller.snapshot().await? {
        let state = if snapshot.session.is_paused {
            "paused"
        } else {
            "running"
        };
        warn!(
            "Recovered {state} session for '{}' started at {}",
            snapshot.chain_name, snapshot.session.started_at
        );
    }
    Ok(())
}

pub async fn run() -> Result<()> {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    info!("chainlock starting up...");

    let data_dir = resolve_data_dir()?;
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

    let settings = SettingsStore::new(data_dir.join("settings.json"))?.engine();
    let database = Database::new(data_dir.join("chainlock.sqlite3"))?;

    let tree_cache = Arc::new(TreeCache::new());
    let storage = Arc::new(CachedStorage::new(
        database,
        settings.query_cache_ttl(),
        Arc::clone(&tree_cache),
    ));
    let controller = SessionController::new(storage, tree_cache)
        .with_interruption_reason(settings.default_interruption_reason.clone())
        .with_lapse_grace(settings.lapse_grace());
    let library = ChainLibrary::for_controller(&controller);

    recover_active_session(&controller).await?;
    library
        .purge_recycle_bin(settings.deleted_chain_retention_days)
        .await?;

    let mut sweeper = Sweeper::new();
    sweeper.start(
        controller.clone(),
        settings.session_sweep_interval(),
        settings.group_sweep_interval(),
    )?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    sweeper.stop().await?;
    Ok(())
}
