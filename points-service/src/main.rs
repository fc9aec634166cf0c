use points_service::{
    build_router,
    config::{PointsConfig, StoreBackend},
    services::{Database, EmailOtpDelivery, LogOtpDelivery, MemoryStore, OtpDelivery, Store},
    spawn_expiry_sweeper, AppState,
};
use service_core::error::AppError;
use service_core::observability::init_tracing;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Fail fast on bad configuration
    let config = PointsConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );

    points_service::services::metrics::init_metrics();

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        store = ?config.store.backend,
        "Starting points service"
    );

    let store: Arc<dyn Store> = match config.store.backend {
        StoreBackend::Postgres => {
            let db = Database::new(
                &config.store.database_url,
                config.store.max_connections,
                config.store.min_connections,
            )
            .await?;
            db.run_migrations().await?;
            tracing::info!("Database initialized successfully");
            Arc::new(db)
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store; data is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    let delivery: Arc<dyn OtpDelivery> = match &config.smtp {
        Some(smtp) => Arc::new(EmailOtpDelivery::new(smtp)?),
        None => {
            tracing::warn!("No SMTP relay configured; redemption OTPs are only returned in responses");
            Arc::new(LogOtpDelivery)
        }
    };

    let state = AppState::new(config.clone(), store, delivery);

    let sweeper = spawn_expiry_sweeper(
        state.clone(),
        Duration::from_secs(config.lifetimes.expiry_sweep_interval_seconds),
    );
    tracing::info!(
        interval_seconds = config.lifetimes.expiry_sweep_interval_seconds,
        "Expiry sweeper started"
    );

    let app = build_router(state).await?;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));

    let service_span = tracing::info_span!(
        "service",
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
    );
    let _guard = service_span.enter();

    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(config.common.shutdown_grace_seconds))
    .await?;

    sweeper.abort();
    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal(grace_seconds: u64) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }

    // Keep serving briefly so load balancers stop routing here first
    tokio::time::sleep(Duration::from_secs(grace_seconds)).await;
}
