//! API Server
//!
//! Wires storage, the game loop and the router together and serves them.

use super::{
    handlers::AppState,
    middleware::{create_cors_layer, request_id_middleware},
    routes::create_router,
};
use crate::config::{CrashConfig, ServerConfig};
use crate::game::RoundEngine;
use crate::storage::Storage;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::signal;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info};

/// Crash game server
pub struct ApiServer {
    config: CrashConfig,
    storage: Arc<dyn Storage>,
}

impl ApiServer {
    pub fn new(config: CrashConfig, storage: Arc<dyn Storage>) -> Self {
        Self { config, storage }
    }

    /// Start the game loop and serve until a shutdown signal arrives
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "crashpoint=info,tower_http=info".into()),
            )
            .try_init();

        info!("Starting crash game server");

        let engine = RoundEngine::new(self.config.game.clone());
        let state = AppState::launch(&self.config, engine, self.storage.clone())?;
        if !state.admin.is_enabled() {
            info!("Admin routes disabled (no ADMIN_SECRET)");
        }

        let app = create_app(state, &self.config.server);
        let addr = self.get_socket_addr()?;
        self.log_server_info(&addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Listening on http://{}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("Server stopped gracefully");
        Ok(())
    }

    fn get_socket_addr(&self) -> Result<SocketAddr, Box<dyn std::error::Error>> {
        Ok(SocketAddr::from((
            self.config.server.host.parse::<std::net::IpAddr>()?,
            self.config.server.port,
        )))
    }

    fn log_server_info(&self, addr: &SocketAddr) {
        let game = &self.config.game;
        info!("Server configuration:");
        info!("   Listen: {}", addr);
        info!("   Storage: {:?} ({})", self.config.storage.backend, self.config.storage.data_directory);
        info!("   CORS: {:?}", self.config.server.allowed_origins);
        info!("   Request timeout: {}s", self.config.server.request_timeout_secs);
        info!(
            "   Round timing: {}s countdown, {}ms ticks, {}s cooldown",
            game.countdown_secs, game.tick_interval_ms, game.cooldown_secs
        );
        info!("   House edge: {}", game.house_edge);
    }
}

/// Router plus the middleware stack
pub fn create_app(state: Arc<AppState>, config: &ServerConfig) -> axum::Router {
    create_router(state)
        // Request ID middleware (first for tracing)
        .layer(axum::middleware::from_fn(request_id_middleware))
        // CORS layer (before timeout to handle preflight)
        .layer(create_cors_layer(config.allowed_origins.clone()))
        .layer(TimeoutLayer::new(Duration::from_secs(config.request_timeout_secs)))
        .layer(TraceLayer::new_for_http())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received terminate signal"),
    }
}
