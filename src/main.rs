use anyhow::Result;
use axum::Router;
use bucket_mirror::{
    backup::BackupJob,
    config::AppConfig,
    pipeline::RunControl,
    routes,
    services::{
        registry::{BucketProvisioner, ManifestRegistry},
        status_board::StatusBoard,
        storage::{DefaultStorageFactory, StorageFactory},
    },
};
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = AppConfig::from_env_and_args()?;
    tracing::info!(
        manifest = %cfg.manifest.display(),
        target_endpoint = %cfg.target_endpoint,
        target_prefix = %cfg.target_prefix,
        workers = cfg.num_workers,
        max_passes = cfg.max_passes,
        "loaded configuration"
    );

    // --- Collaborators ---
    let registry = Arc::new(ManifestRegistry::from_path(&cfg.manifest, cfg.target_settings()).await?);
    let factory: Arc<dyn StorageFactory> = Arc::new(DefaultStorageFactory);
    let provisioner = Arc::new(BucketProvisioner::new(registry.clone(), factory.clone()));

    // --- Status server ---
    let board = StatusBoard::new();
    if let Some(addr) = &cfg.status_addr {
        serve_status(addr, board.clone()).await;
    }

    // --- Signals: first drains, second aborts ---
    let control = RunControl::new();
    tokio::spawn(watch_signals(control.clone()));

    let job = BackupJob::new(
        registry.clone(),
        registry,
        provisioner,
        factory,
        cfg.run_options(),
    )
    .with_status_board(board);

    match job.run(&control).await {
        Ok(reports) => {
            tracing::info!(pairs = reports.len(), "backup finished");
            Ok(())
        }
        Err(err) => {
            tracing::error!(error = %err, "backup failed");
            Err(err.into())
        }
    }
}

/// Serve /healthz, /readyz and /stats in the background. A bind failure is
/// logged and the backup runs without the server.
async fn serve_status(addr: &str, board: StatusBoard) {
    let app: Router = routes::routes::routes().with_state(board);

    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) if err.kind() == ErrorKind::PermissionDenied => {
            let port = addr.rsplit(':').next().unwrap_or("0");
            let fallback_addr = format!("127.0.0.1:{}", port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            match TcpListener::bind(&fallback_addr).await {
                Ok(listener) => listener,
                Err(err) => {
                    tracing::warn!(error = %err, "status server disabled");
                    return;
                }
            }
        }
        Err(err) => {
            tracing::warn!(addr, error = %err, "status server disabled");
            return;
        }
    };

    match listener.local_addr() {
        Ok(local) => tracing::info!("Status server listening on http://{}", local),
        Err(err) => tracing::warn!(error = %err, "status server address unknown"),
    }
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(error = %err, "status server stopped");
        }
    });
}

async fn watch_signals(control: RunControl) {
    shutdown_signal().await;
    tracing::warn!("shutdown requested, draining current run (signal again to abort)");
    control.drain();

    shutdown_signal().await;
    tracing::warn!("second shutdown request, aborting");
    control.abort();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
