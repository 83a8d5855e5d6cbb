use std::sync::Arc;

use anyhow::Context;
use bookclub_relay::{
    auth::{jwt::JwtIdentityVerifier, IdentityVerifier},
    collab::{MemberListAuthorizer, MemoryRoomStore, RoomAuthorizer, RoomStore},
    config::{LogFormat, RelayConfig},
    metrics::{self, RelayMetrics},
    rooms::RoomHub,
    server::build_router,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    init_tracing(&config);
    metrics::set_global_metrics(Arc::new(RelayMetrics::default()));

    if config.is_dev_jwt_secret() {
        warn!("using the development JWT secret; set BOOKCLUB_RELAY_JWT_SECRET in production");
    }
    let verifier: Arc<dyn IdentityVerifier> = Arc::new(
        JwtIdentityVerifier::new(&config.jwt_secret).context("invalid relay JWT secret")?,
    );

    let store = match &config.rooms_file {
        Some(path) => MemoryRoomStore::from_rooms_file(path)?,
        None => MemoryRoomStore::new(),
    };
    let room_count = store.room_count().await;
    let store: Arc<dyn RoomStore> = Arc::new(store);
    let authorizer: Arc<dyn RoomAuthorizer> = Arc::new(MemberListAuthorizer::new(store.clone()));
    let hub = RoomHub::new(store, authorizer, config.hub_settings());

    let app = build_router(hub.clone(), verifier, config.admission_timeout);
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, rooms = room_count, "starting relay server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server exited unexpectedly")?;

    let drained = hub.shutdown().await;
    info!(rooms = drained, "relay stopped");
    Ok(())
}

fn init_tracing(config: &RelayConfig) {
    let filter =
        EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(error = %error, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                error!(error = %error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
