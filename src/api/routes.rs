//! Route Definitions

use super::{admin::*, handlers::*, websocket::websocket_handler};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

/// Build the router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        // Real-time channel
        .route("/ws", get(websocket_handler))
        // Public reads
        .route("/api/user/:id", get(user_handler))
        .route("/api/leaderboard", get(leaderboard_handler))
        .route("/api/history", get(history_handler))
        // Admin control surface
        .route("/admin/set-crash", post(set_crash_handler))
        .route("/admin/force-crash", post(force_crash_handler))
        .route("/admin/stats", get(stats_handler))
        .with_state(state)
}
