//! stream-gateway server
//!
//! Serves `/stream/{id}` for files held by an HTTP origin, with one pooled
//! upstream session per configured credential.

use std::error::Error;
use std::sync::Arc;

use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stream_gateway::upstream::HttpOrigin;
use stream_gateway::{router, AuthValidator, Config, Gateway, SessionPool};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "stream_gateway=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    tracing::info!("Starting stream-gateway v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Upstream origin: {}", config.upstream.url);

    let origin = HttpOrigin::new(&config.upstream.url)?;
    let sessions = origin.sessions(&config.upstream.tokens, config.upstream.pool_size)?;
    let pool = SessionPool::new(sessions)?;
    tracing::info!("Session pool ready with {} sessions", pool.capacity());

    let auth = AuthValidator::new(config.stream.secret.as_bytes(), config.stream.hash_length)?;
    let gateway = Gateway::new(Arc::new(origin), pool.clone(), auth, config.policy())
        .with_buffers(config.stream.read_buffer, config.stream.write_buffer)
        .with_compression(config.stream.compression);
    let app = router(Arc::new(gateway));

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(pool))
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM and stops the pool from handing out
/// further sessions.
async fn shutdown_signal(pool: SessionPool) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
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
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }

    pool.close();
}
