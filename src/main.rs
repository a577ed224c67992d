use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use usbvault_server::audit::AuditLogger;
use usbvault_server::background_jobs::{spawn_jobs, BackgroundJob, GeocodeBackfillJob, SessionCleanupJob};
use usbvault_server::backup::BackupManager;
use usbvault_server::config::{Config, PlatformMountRoots};
use usbvault_server::geocode::{HttpTransport, ReverseGeocoder};
use usbvault_server::ingest::IngestManager;
use usbvault_server::server::{run_server, ServerState};
use usbvault_server::store::{SqliteVaultStore, VaultStore};
use usbvault_server::usb::MountWatcher;

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(err) => {
                    error!(%err, "failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    cancel.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("shutdown signal received");
        cancel.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::parse();

    let store: Arc<dyn VaultStore> = Arc::new(SqliteVaultStore::open(&config.db_path())?);
    let audit = Arc::new(AuditLogger::new(store.clone()));
    let geocoder = Arc::new(ReverseGeocoder::new(
        store.clone(),
        Arc::new(HttpTransport::new()),
        config.geocode_enabled(),
        config.geocode_user_agent.clone(),
    ));
    let backuper = BackupManager::new(store.clone(), config.db_path());
    let ingestor = IngestManager::new(store.clone(), audit.clone(), geocoder.clone());

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    ingestor.start(cancel.clone());

    let watcher = {
        let ingestor = ingestor.clone();
        MountWatcher::new(
            Arc::new(PlatformMountRoots),
            Duration::from_secs(config.scan_interval_seconds),
            Arc::new(move |mount: &Path| ingestor.queue_mount(mount)),
        )
    };
    watcher.start(cancel.clone());

    let jobs: Vec<Arc<dyn BackgroundJob>> = vec![
        Arc::new(SessionCleanupJob::new(store.clone())),
        Arc::new(GeocodeBackfillJob::new(store.clone(), geocoder.clone())),
    ];
    spawn_jobs(jobs, cancel.clone());

    let state = ServerState {
        store,
        audit,
        ingestor,
        backuper,
        watcher,
        cancel: cancel.clone(),
        web_dir: config.web_dir.clone(),
        session_ttl_hours: usbvault_server::config::SESSION_TTL_HOURS,
    };
    run_server(state, &config.bind, config.port).await
}
