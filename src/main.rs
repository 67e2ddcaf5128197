use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use venueplan::clock::SystemClock;
use venueplan::config::Config;
use venueplan::engine::{Collaborators, Engine};
use venueplan::identity::InMemoryDirectory;
use venueplan::notify::NotifyHub;
use venueplan::scheduler;
use venueplan::transition::LoggingTransitionService;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    venueplan::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let directory = match &config.users_file {
        Some(path) => InMemoryDirectory::from_json_file(path)?,
        None => InMemoryDirectory::new(),
    };
    if directory.is_empty() {
        tracing::warn!("no users loaded; every mutation will be rejected");
    }

    let engine = Arc::new(Engine::new(
        config.wal_path(),
        config.engine.clone(),
        Collaborators {
            clock: Arc::new(SystemClock),
            identity: Arc::new(directory),
            transitions: Arc::new(LoggingTransitionService),
            notify: Arc::new(NotifyHub::new()),
        },
    )?);

    info!("venueplan running");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  time zone: {}", config.engine.tz);
    info!("  lock timeout: {:?}", config.engine.lock_timeout);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let scheduler_task = tokio::spawn(scheduler::run_scheduler(engine.clone()));
    let compactor_task = tokio::spawn(scheduler::run_compactor(engine.clone(), config.compact_threshold));

    // Graceful shutdown on SIGTERM/ctrl-c
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("shutdown signal received");
    scheduler_task.abort();
    compactor_task.abort();

    engine.triggers().flush().await;
    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final compaction failed: {e}");
    }

    info!("venueplan stopped");
    Ok(())
}
