//! API Request and Response Models

use crate::game::{AdminRoundView, Credits, Multiplier, RoundSnapshot, User};
use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub observers: u64,
}

/// Public leaderboard line. Carries no balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub user_id: String,
    pub username: String,
    pub total_winnings: Credits,
    pub games_played: u64,
    pub games_won: u64,
}

impl LeaderboardEntry {
    pub fn new(rank: usize, user: User) -> Self {
        Self {
            rank,
            user_id: user.user_id,
            username: user.username,
            total_winnings: user.total_winnings,
            games_played: user.games_played,
            games_won: user.games_won,
        }
    }
}

/// Player counters sent with `auth_success`
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlayerStats {
    pub games_played: u64,
    pub games_won: u64,
    pub total_winnings: Credits,
}

impl From<&User> for PlayerStats {
    fn from(user: &User) -> Self {
        Self {
            games_played: user.games_played,
            games_won: user.games_won,
            total_winnings: user.total_winnings,
        }
    }
}

/// Identifier sent either as a JSON string or as a number (chat ids)
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FlexibleId {
    Number(i64),
    Text(String),
}

impl FlexibleId {
    pub fn into_string(self) -> String {
        match self {
            FlexibleId::Number(n) => n.to_string(),
            FlexibleId::Text(s) => s.trim().to_string(),
        }
    }
}

/// Crash point given as a number or a numeric string
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CrashPointInput {
    Number(f64),
    Text(String),
}

impl CrashPointInput {
    pub fn value(&self) -> Option<f64> {
        match self {
            CrashPointInput::Number(n) => Some(*n),
            CrashPointInput::Text(s) => s.trim().trim_end_matches(['x', 'X']).parse().ok(),
        }
    }
}

/// POST /admin/set-crash
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetCrashRequest {
    pub crash_point: CrashPointInput,
    #[serde(default)]
    pub admin_key: Option<String>,
}

/// POST /admin/force-crash
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceCrashRequest {
    #[serde(default)]
    pub admin_key: Option<String>,
}

/// `?adminKey=` on admin routes
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminKeyQuery {
    #[serde(default)]
    pub admin_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminActionResponse {
    pub success: bool,
    pub message: String,
}

/// GET /admin/stats
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub total_users: u64,
    pub total_rounds: u64,
    pub online_players: u64,
    pub current_game: AdminRoundView,
    pub top_users: Vec<User>,
}

/// Inbound real-time frame
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Auth {
        #[serde(alias = "telegramId")]
        user_id: FlexibleId,
        #[serde(default, alias = "username")]
        display_name: Option<String>,
    },
    PlaceBet {
        amount: f64,
        #[serde(default, alias = "autoCashoutThreshold")]
        auto_cashout: Option<f64>,
    },
    Cashout,
}

/// Outbound frame addressed to one connection
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    GameState(RoundSnapshot),
    AuthSuccess {
        balance: Credits,
        stats: PlayerStats,
    },
    BetPlaced {
        success: bool,
        new_balance: Credits,
    },
    BetError {
        message: String,
    },
    /// `newBalance` is null while the credit is still being written
    CashoutSuccess {
        win_amount: Credits,
        new_balance: Option<Credits>,
        multiplier: Multiplier,
    },
    CashoutError {
        message: String,
    },
    Error {
        message: String,
    },
}
