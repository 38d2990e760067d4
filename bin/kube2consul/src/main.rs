use anyhow::{anyhow, Context, Result};
use clap::Parser;
use k2c_consul::{ConsulCatalog, ConsulClient, ConsulError, LeaderLock};
use k2c_core::{
    ActionHandler, Catalog, EndpointSource, NamedLocks, Reconciler, Resync, SyncMetrics,
    WorkerPool,
};
use k2c_kube::KubeSource;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod cli;
mod health;

use cli::{Cli, LogFormat};
use health::{ConsulProbe, HealthState, KubernetesProbe, ProbeConfig};

fn init_tracing(cli: &Cli) -> Result<()> {
    let default_level = if cli.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match cli.log_format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    }
    .map_err(|e| anyhow!(e))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    info!("Starting kube2consul {}...", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(cli.sync_config());
    info!(
        "Tag: {}, resync every {:?}, {} workers",
        config.managed_tag, config.resync_period, config.workers
    );
    let metrics = SyncMetrics::new()?;

    let consul = ConsulClient::new(&cli.consul_api, cli.consul_token.clone())?;
    consul
        .leader()
        .await
        .with_context(|| format!("Cannot communicate with Consul at {}", consul.base_url()))?;
    let catalog: Arc<dyn Catalog> = Arc::new(ConsulCatalog::new(consul.clone()));
    info!("Consul client initialized ({})", consul.base_url());

    let client = k2c_kube::connect(&cli.kube_options()).await?;

    let shutdown = CancellationToken::new();
    tokio::spawn(forward_signals(shutdown.clone()));

    let server_failed = CancellationToken::new();
    let mut background = Vec::new();
    if !cli.no_health {
        let listener = health::bind(cli.health_port).await?;

        let state = Arc::new(HealthState::new(ProbeConfig::default()));
        background.push(health::spawn_probes(
            state.clone(),
            vec![
                Arc::new(ConsulProbe(catalog.clone())),
                Arc::new(KubernetesProbe(client.clone())),
            ],
            shutdown.clone(),
        ));

        let metrics = metrics.clone();
        let server_shutdown = shutdown.clone();
        let failed = server_failed.clone();
        background.push(tokio::spawn(async move {
            if let Err(e) = health::serve(listener, state, metrics, server_shutdown).await {
                error!("Health server error: {}", e);
                failed.cancel();
            }
        }));
    }

    let mut leader = None;
    if cli.lock {
        info!("Attempting to acquire lock {}", cli.lock_key);
        match LeaderLock::acquire(consul.clone(), &cli.lock_key, &shutdown).await {
            Ok(lock) => {
                info!("Lock acquired");
                leader = Some(lock);
            }
            Err(e) if shutdown.is_cancelled() => {
                info!("Shutdown requested before the lock was acquired: {}", e);
                return Ok(());
            }
            Err(e) => return Err(anyhow!(e).context("Failed acquiring lock")),
        }
    }
    let lock_lost = leader
        .as_ref()
        .map(LeaderLock::lost)
        .unwrap_or_default();

    let source: Arc<dyn EndpointSource> = Arc::new(KubeSource::new(client.clone()));
    let reconciler = Arc::new(Reconciler::new(catalog, config.clone(), metrics));
    let locks = Arc::new(NamedLocks::new());

    let handler = Arc::new(ActionHandler::new(
        source.clone(),
        reconciler.clone(),
        locks.clone(),
        config.clone(),
    ));
    let (queue, pool) = WorkerPool::start(config.workers, handler);
    let resync = Arc::new(Resync::new(source, reconciler, locks, config.clone()));

    let watchers = k2c_kube::spawn_watchers(client, config.clone(), queue, shutdown.clone());

    // first tick fires immediately
    let mut ticker = tokio::time::interval(config.resync_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = lock_lost.cancelled() => {
                error!("Lost lock, exiting");
                return Err(anyhow!("leader lock lost"));
            }
            _ = server_failed.cancelled() => {
                error!("Health server stopped, exiting");
                return Err(anyhow!("health server failed"));
            }
            _ = ticker.tick() => {
                resync.trigger();
            }
        }
    }

    info!("Shutdown signal received, stopping...");
    for watcher in watchers {
        if let Err(e) = watcher.await {
            warn!("Watcher terminated abnormally: {}", e);
        }
    }
    pool.shutdown().await;

    if let Some(mut lock) = leader {
        release_lock(&mut lock).await;
    }
    for task in background {
        if let Err(e) = task.await {
            warn!("Background task terminated abnormally: {}", e);
        }
    }

    info!("kube2consul stopped");
    Ok(())
}

async fn release_lock(lock: &mut LeaderLock) {
    info!("Attempting to release lock");
    match lock.release().await {
        Ok(()) => info!("Lock released"),
        Err(e) => error!("Lock release failed: {}", e),
    }

    info!("Cleaning lock entry");
    match lock.destroy().await {
        Ok(()) => {}
        Err(ConsulError::LockInUse) => info!("Cleanup aborted, lock in use"),
        Err(e) => error!("Lock cleanup failed: {}", e),
    }
}

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn forward_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    shutdown.cancel();
}
