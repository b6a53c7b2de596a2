//! Real-time channel
//!
//! Every connection receives the broadcast stream of round events plus the
//! direct replies to its own requests. Outbound frames are JSON text tagged
//! by `type`; see [`ServerMessage`] and [`crate::game::GameEvent`].

use super::{handlers::AppState, models::*};
use crate::errors::GameError;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Authenticated player behind a connection
#[derive(Debug, Clone)]
struct Session {
    user_id: String,
    username: String,
}

/// GET /ws
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let client_id = Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();
    let (direct_tx, mut direct_rx) = mpsc::unbounded_channel::<ServerMessage>();

    // Snapshot and receiver come from the loop together, so no event older
    // than the snapshot can follow it
    let mut events = match state.game.subscribe().await {
        Ok((snapshot, events)) => {
            let _ = direct_tx.send(ServerMessage::GameState(snapshot));
            events
        }
        Err(e) => {
            warn!("No game state for client {}: {}", client_id, e);
            state.bus.subscribe()
        }
    };

    let online = state.bus.observer_connected();
    state.metrics.observers.set(online as i64);
    info!("WebSocket client {} connected (online: {})", client_id, online);

    let client_for_send = client_id.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            // Direct replies first so the snapshot precedes any broadcast
            let frame = tokio::select! {
                biased;

                direct = direct_rx.recv() => match direct {
                    Some(message) => encode(&message),
                    None => break,
                },
                event = events.recv() => match event {
                    Ok(event) => encode(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Client {} lagged, skipped {} events", client_for_send, skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };

            let Some(frame) = frame else {
                continue;
            };
            if sender.send(Message::Text(frame)).await.is_err() {
                debug!("Client {} went away", client_for_send);
                break;
            }
        }
    });

    let client_for_receive = client_id.clone();
    let receive_state = state.clone();
    let mut receive_task = tokio::spawn(async move {
        let mut session: Option<Session> = None;
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let reply = handle_client_message(&receive_state, &mut session, &text).await;
                    if direct_tx.send(reply).is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => {
                    debug!("Client {} requested close", client_for_receive);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("WebSocket error from client {}: {}", client_for_receive, e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => receive_task.abort(),
        _ = &mut receive_task => send_task.abort(),
    }

    let online = state.bus.observer_disconnected();
    state.metrics.observers.set(online as i64);
    info!("WebSocket client {} disconnected (online: {})", client_id, online);
}

fn encode<T: Serialize>(message: &T) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(text) => Some(text),
        Err(e) => {
            error!("Failed to serialize frame: {}", e);
            None
        }
    }
}

async fn handle_client_message(
    state: &AppState,
    session: &mut Option<Session>,
    text: &str,
) -> ServerMessage {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            return ServerMessage::Error {
                message: format!("Invalid message: {}", e),
            }
        }
    };

    match message {
        ClientMessage::Auth {
            user_id,
            display_name,
        } => {
            let user_id = user_id.into_string();
            if user_id.is_empty() {
                return ServerMessage::Error {
                    message: "userId is required".to_string(),
                };
            }
            let display_name = display_name
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| user_id.clone());

            match state
                .storage
                .find_or_create_user(&user_id, &display_name, state.starting_balance)
                .await
            {
                Ok(user) => {
                    debug!(user_id = %user.user_id, "Player authenticated");
                    *session = Some(Session {
                        user_id: user.user_id.clone(),
                        username: user.username.clone(),
                    });
                    ServerMessage::AuthSuccess {
                        balance: user.balance,
                        stats: PlayerStats::from(&user),
                    }
                }
                Err(e) => ServerMessage::Error {
                    message: GameError::from(e).to_string(),
                },
            }
        }

        ClientMessage::PlaceBet {
            amount,
            auto_cashout,
        } => {
            let Some(session) = session.as_ref() else {
                return ServerMessage::BetError {
                    message: "Authenticate first".to_string(),
                };
            };
            match state
                .game
                .place_bet(&session.user_id, &session.username, amount, auto_cashout)
                .await
            {
                Ok(receipt) => ServerMessage::BetPlaced {
                    success: true,
                    new_balance: receipt.new_balance,
                },
                Err(e) => ServerMessage::BetError {
                    message: e.to_string(),
                },
            }
        }

        ClientMessage::Cashout => {
            let Some(session) = session.as_ref() else {
                return ServerMessage::CashoutError {
                    message: GameError::no_active_bet().to_string(),
                };
            };
            match state.game.cashout(&session.user_id).await {
                Ok(outcome) => ServerMessage::CashoutSuccess {
                    win_amount: outcome.win_amount,
                    new_balance: outcome.new_balance,
                    multiplier: outcome.multiplier,
                },
                Err(e) => ServerMessage::CashoutError {
                    message: e.to_string(),
                },
            }
        }
    }
}
