//! Update orchestration daemon.
//!
//! Talks to the host shell as newline-delimited JSON over stdin/stdout. All
//! tracing/diagnostic output goes to stderr so that stdout remains a clean
//! JSON protocol channel.

use auto_update::config::{ConfigStore, UpdateConfig};
use auto_update::coordinator::UpdateCoordinator;
use auto_update::host::stdio::run_stdio_bridge;
use auto_update::host::{HostBridge, HostCommandServer};
use auto_update::loader::{DisabledLoader, GithubLoaderUpdater, LoaderUpdater};
use auto_update::package_manager::RpmOstree;
use auto_update::power::SysfsPowerSupply;
use auto_update::readiness::ReadinessGate;
use auto_update::{RestartArbiter, Scheduler};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = UpdateConfig::default_config_path();
    tracing::info!(config = %config_path.display(), "auto-updated starting");
    let store = ConfigStore::open(&config_path)
        .map_err(|e| anyhow::anyhow!("cannot load {}: {e}", config_path.display()))?;
    let config = store.snapshot();

    let bridge = HostBridge::default();
    let power = Arc::new(SysfsPowerSupply::new(config.power.supply_dir.clone()));
    let gate = ReadinessGate::new(power, Arc::new(bridge.clone()), store.clone());
    let arbiter = Arc::new(RestartArbiter::new(gate.clone(), Arc::new(bridge.clone())));

    let loader: Arc<dyn LoaderUpdater> = if config.loader.enabled {
        Arc::new(GithubLoaderUpdater::new(config.loader.clone())?)
    } else {
        tracing::info!("loader self-update disabled");
        Arc::new(DisabledLoader)
    };
    let coordinator = UpdateCoordinator::new(
        arbiter,
        gate,
        store.clone(),
        Arc::new(bridge.clone()),
        loader,
        Arc::new(RpmOstree::from_config(&config.package_manager)),
    );

    let scheduler = Arc::new(Scheduler::new(Arc::new(coordinator.clone())));
    let watcher = scheduler.watch_config(store.clone()).await;

    let server = HostCommandServer::new(bridge, coordinator.clone(), store, Arc::clone(&scheduler));
    let result = run_stdio_bridge(server).await;

    watcher.abort();
    scheduler.unbind().await;
    coordinator.shutdown().await;

    result.map_err(|e| {
        tracing::error!(error = %e, "auto-updated exited with error");
        anyhow::anyhow!("auto-updated failed: {e}")
    })?;
    tracing::info!("auto-updated shut down cleanly");
    Ok(())
}
