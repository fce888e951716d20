use authms::{
    config::AuthConfig,
    db::{create_pool, PgStore},
    notifiers_from_config, oauth_from_config, AppState, Components,
};
use service_core::observability::init_tracing;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use authms::utils::clock::SystemClock;

#[tokio::main]
async fn main() -> Result<(), service_core::error::AppError> {
    // Load configuration - fail fast if invalid
    let config = AuthConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.common.otlp_endpoint.as_deref(),
    )?;

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        session_variant = ?config.session.variant,
        dispatch_mode = ?config.registration.dispatch_mode,
        "Starting authentication service"
    );

    // Connect and check the schema version once
    let pool = create_pool(&config.database).await?;
    let store = PgStore::connect(pool).await?;
    store.health_check().await?;
    tracing::info!(schema_version = store.schema_version(), "Database initialized successfully");

    let notifiers = notifiers_from_config(&config)?;
    let oauth = oauth_from_config(&config)?;

    let store = Arc::new(store);
    let state = AppState::build(
        config,
        Components {
            credentials: store.clone(),
            tokens: store,
            notifiers,
            oauth,
            clock: Arc::new(SystemClock),
        },
    )?;

    let service_span = tracing::info_span!(
        "service",
        service = %state.config.service_name,
        version = %state.config.service_version,
    );
    let _guard = service_span.enter();

    let Some(gc) = &state.gc else {
        tracing::info!("Signed session tokens - no token garbage collector");
        shutdown_signal().await;
        tracing::info!("Service shutdown complete");
        return Ok(());
    };

    let cancel = CancellationToken::new();
    let gc = gc.start(cancel.clone()).await?;
    tracing::info!(armed_expiry = ?gc.armed_expiry(), "Token garbage collector armed");

    let gc_exit = gc.join();
    tokio::pin!(gc_exit);

    tokio::select! {
        _ = shutdown_signal() => {
            cancel.cancel();
            gc_exit.await?;
        }
        result = &mut gc_exit => {
            // The collector only stops on its own after a failed delete.
            result?;
        }
    }

    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
}
