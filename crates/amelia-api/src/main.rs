use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use amelia_api::{router, AppState};
use amelia_orchestrator::{Config, EventBus, FakeDriver, FakeTracker, LifecycleService, RetentionWorker};
use amelia_storage::{PostgresStore, Store};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "amelia_api=info,amelia_orchestrator=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("amelia-api starting...");

    let config = Config::from_env().context("failed to load configuration")?;

    let store = PostgresStore::connect(&config.database_url)
        .await
        .context("failed to connect to database")?;
    store.run_migrations().await.context("failed to run migrations")?;
    tracing::info!("connected to database and ran migrations");

    let store: Arc<dyn Store> = Arc::new(store);
    let event_bus = EventBus::new();

    // Collaborator transports are supplied by the deployment; no concrete
    // HTTP driver/tracker lives in this workspace (spec.md §6.4). The fakes
    // let the service start and exercise its own control surface standalone.
    let driver = Arc::new(FakeDriver::default());
    let tracker = Arc::new(FakeTracker);

    let lifecycle = LifecycleService::new(store.clone(), event_bus.clone(), config.clone(), driver, tracker);
    lifecycle
        .recover_on_startup()
        .await
        .context("crash-recovery scan failed")?;

    let retention = RetentionWorker::new(
        store.clone(),
        Duration::from_secs(u64::from(config.log_retention_days) * 86_400),
        config.log_retention_max_events,
    );
    let shutdown_token = tokio_util::sync::CancellationToken::new();
    let retention_task = {
        let token = shutdown_token.clone();
        tokio::spawn(async move { retention.run(token).await })
    };

    let app_state = AppState {
        store,
        lifecycle: lifecycle.clone(),
        event_bus,
        config: Arc::new(config.clone()),
    };
    let app = router(app_state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("stopping admission and draining in-flight workflows");
    lifecycle.shutdown().await;
    shutdown_token.cancel();
    let _ = retention_task.await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
