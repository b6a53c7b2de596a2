//! Admin control surface used by the operator bot

use super::{errors::ApiError, handlers::AppState, middleware::RequestId, models::*};
use crate::errors::GameError;
use axum::{
    extract::{Query, State},
    Extension, Json,
};
use std::sync::Arc;
use tracing::{info, warn};

fn authorize(state: &AppState, request_id: &RequestId, key: Option<&str>) -> Result<(), ApiError> {
    state.admin.verify(key).map_err(|e| {
        warn!(request_id = %request_id.0, "Rejected admin request");
        ApiError::from_game(request_id.0.clone(), e)
    })
}

/// POST /admin/set-crash
pub async fn set_crash_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Json(request): Json<SetCrashRequest>,
) -> Result<Json<AdminActionResponse>, ApiError> {
    authorize(&state, &request_id, request.admin_key.as_deref())?;

    let value = request.crash_point.value().ok_or_else(|| {
        ApiError::bad_request(request_id.0.clone(), "crashPoint must be a number".to_string())
    })?;
    let crash_point = state
        .game
        .set_next_crash(value)
        .await
        .map_err(|e| ApiError::from_game(request_id.0.clone(), e))?;

    info!(request_id = %request_id.0, "Admin set next crash point to {}", crash_point);
    Ok(Json(AdminActionResponse {
        success: true,
        message: format!("Next crash: {}", crash_point),
    }))
}

/// POST /admin/force-crash
pub async fn force_crash_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Json(request): Json<ForceCrashRequest>,
) -> Result<Json<AdminActionResponse>, ApiError> {
    authorize(&state, &request_id, request.admin_key.as_deref())?;

    match state.game.force_crash().await {
        Ok(crashed_at) => {
            info!(request_id = %request_id.0, "Admin force-crashed round at {}", crashed_at);
            Ok(Json(AdminActionResponse {
                success: true,
                message: format!("Round crashed at {}", crashed_at),
            }))
        }
        Err(GameError::PhaseViolation(message)) => Ok(Json(AdminActionResponse {
            success: false,
            message,
        })),
        Err(e) => Err(ApiError::from_game(request_id.0, e)),
    }
}

/// GET /admin/stats?adminKey=
pub async fn stats_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Query(query): Query<AdminKeyQuery>,
) -> Result<Json<StatsResponse>, ApiError> {
    authorize(&state, &request_id, query.admin_key.as_deref())?;

    let to_api = |e| ApiError::from_store(request_id.0.clone(), e);
    let total_users = state.storage.count_users().await.map_err(to_api)?;
    let total_rounds = state.storage.count_rounds().await.map_err(to_api)?;
    let top_users = state
        .storage
        .top_users(state.leaderboard_limit)
        .await
        .map_err(to_api)?;
    let current_game = state
        .game
        .admin_view()
        .await
        .map_err(|e| ApiError::from_game(request_id.0.clone(), e))?;

    Ok(Json(StatsResponse {
        total_users,
        total_rounds,
        online_players: state.bus.observer_count(),
        current_game,
        top_users,
    }))
}
