//! Error types for the crash game engine
//!
//! Every failure a player or operator can trigger maps onto one of four
//! categories. None of them is fatal to the process: a rejected request
//! leaves round state and balances untouched.

use crate::storage::StoreError;

/// Root error type for game operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GameError {
    /// Malformed input or insufficient funds
    #[error("{0}")]
    Validation(String),

    /// Request arrived in a phase that does not allow it
    #[error("{0}")]
    PhaseViolation(String),

    /// Admin action with a wrong or missing key. Intentionally says nothing
    /// about which check failed.
    #[error("Access denied")]
    Authorization,

    /// Storage collaborator unavailable or rejected a write
    #[error("Storage unavailable: {0}")]
    Persistence(String),

    /// Game loop task is not accepting commands
    #[error("Game loop unavailable")]
    Unavailable,
}

impl GameError {
    pub fn validation(message: impl Into<String>) -> Self {
        GameError::Validation(message.into())
    }

    pub fn phase(message: impl Into<String>) -> Self {
        GameError::PhaseViolation(message.into())
    }

    pub fn insufficient_funds() -> Self {
        GameError::Validation("Insufficient funds".to_string())
    }

    pub fn betting_closed() -> Self {
        GameError::PhaseViolation("Betting is closed".to_string())
    }

    pub fn no_active_bet() -> Self {
        GameError::PhaseViolation("No active bet".to_string())
    }

    pub fn already_settled() -> Self {
        GameError::PhaseViolation("Bet already settled".to_string())
    }

    /// Stable machine-readable code used on the wire
    pub fn code(&self) -> &'static str {
        match self {
            GameError::Validation(_) => "VALIDATION_ERROR",
            GameError::PhaseViolation(_) => "PHASE_VIOLATION",
            GameError::Authorization => "FORBIDDEN",
            GameError::Persistence(_) => "PERSISTENCE_FAILURE",
            GameError::Unavailable => "SERVICE_UNAVAILABLE",
        }
    }
}

impl From<StoreError> for GameError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InsufficientFunds { .. } => GameError::insufficient_funds(),
            StoreError::UserNotFound(_) => {
                GameError::Validation("Unknown player, authenticate first".to_string())
            }
            other => GameError::Persistence(other.to_string()),
        }
    }
}

// Convenience type alias for Results
pub type GameResult<T> = Result<T, GameError>;
