use anyhow::Result;
use axum::Router;
use std::net::SocketAddr;
use std::process::ExitCode;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use zip_backup::backup::BackupManager;
use zip_backup::storage::Storage;
use zip_backup::{api, utils, web};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    utils::logging::init_tracing();

    let config = utils::config::load_config()?;

    info!("Starting Zip Backup v{}", env!("CARGO_PKG_VERSION"));
    info!("Project: {} ({})", config.product_name, config.project_root.display());

    let storage = Storage::new(&config.database_url).await?;
    storage.run_migrations().await?;

    if std::env::args().nth(1).as_deref() == Some("now") {
        return backup_now(&config, storage).await;
    }

    let backup_manager = BackupManager::new(&config, storage).await;

    let app = Router::new()
        .nest("/api", api::routes())
        .nest("/ws", web::websocket::routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(backup_manager.clone());

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    info!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = backup_manager.shutdown().await {
        error!("Control loop already stopped: {}", e);
    }
    info!("Server stopped gracefully");
    Ok(ExitCode::SUCCESS)
}

/// `zip-backup now`: one blocking backup, exit status follows the compressor.
async fn backup_now(config: &utils::config::Config, storage: Storage) -> Result<ExitCode> {
    let (scheduler, marshaler) = BackupManager::build_scheduler(config, &storage).await;
    let summary = BackupManager::run_once(scheduler, marshaler, Some(&storage)).await?;

    if summary.succeeded() {
        info!("Archive written to {}", summary.output_path.display());
        Ok(ExitCode::SUCCESS)
    } else {
        error!("Backup failed with exit code {}", summary.exit_code);
        Ok(ExitCode::FAILURE)
    }
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
