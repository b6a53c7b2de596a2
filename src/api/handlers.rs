//! Request Handlers
//!
//! Public read endpoints. Admin endpoints live in [`super::admin`], the
//! real-time channel in [`super::websocket`].

use super::{errors::ApiError, middleware::RequestId, models::*, security::AdminGuard};
use crate::config::CrashConfig;
use crate::game::{Credits, EventBus, GameHandle, GameRunner, Round, RoundEngine, User};
use crate::metrics::GameMetrics;
use crate::storage::Storage;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use std::sync::Arc;
use tracing::error;

/// Shared application state
pub struct AppState {
    pub game: GameHandle,
    pub storage: Arc<dyn Storage>,
    pub bus: EventBus,
    pub metrics: Arc<GameMetrics>,
    pub admin: AdminGuard,
    pub starting_balance: Credits,
    pub history_limit: usize,
    pub leaderboard_limit: usize,
}

impl AppState {
    /// Start the game loop for `engine` and collect everything the routes need
    pub fn launch(
        config: &CrashConfig,
        engine: RoundEngine,
        storage: Arc<dyn Storage>,
    ) -> prometheus::Result<Arc<Self>> {
        let metrics = Arc::new(GameMetrics::new()?);
        let bus = EventBus::new(config.game.event_buffer);
        let (runner, game) = GameRunner::new(engine, storage.clone(), bus.clone(), metrics.clone());
        runner.spawn();

        Ok(Arc::new(Self {
            game,
            storage,
            bus,
            metrics,
            admin: AdminGuard::new(config.admin.secret.as_deref()),
            starting_balance: Credits::from_units(config.game.starting_balance).unwrap_or_default(),
            history_limit: config.game.history_limit,
            leaderboard_limit: config.game.leaderboard_limit,
        }))
    }
}

/// GET /health
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "Running".to_string(),
        observers: state.bus.observer_count(),
    })
}

/// GET /api/user/:id
pub async fn user_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<User>, ApiError> {
    state
        .storage
        .find_user(&user_id)
        .await
        .map_err(|e| ApiError::from_store(request_id.0.clone(), e))?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(request_id.0, format!("User {} not found", user_id)))
}

/// GET /api/leaderboard
pub async fn leaderboard_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<LeaderboardEntry>>, ApiError> {
    let users = state
        .storage
        .top_users(state.leaderboard_limit)
        .await
        .map_err(|e| ApiError::from_store(request_id.0, e))?;

    Ok(Json(
        users
            .into_iter()
            .enumerate()
            .map(|(i, user)| LeaderboardEntry::new(i + 1, user))
            .collect(),
    ))
}

/// GET /api/history
pub async fn history_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Round>>, ApiError> {
    let rounds = state
        .storage
        .recent_rounds(state.history_limit)
        .await
        .map_err(|e| ApiError::from_store(request_id.0, e))?;
    Ok(Json(rounds))
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to render metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
