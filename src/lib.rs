//! Crashpoint - real-time multiplier crash game
//!
//! A single game-loop task runs rounds back to back: a betting countdown, a
//! flight in which the multiplier climbs until a hidden crash point, and a
//! short cooldown. Players bet and cash out over a WebSocket; an operator
//! bot drives the admin HTTP routes.

pub mod api;
pub mod config;
pub mod errors;
pub mod game;
pub mod metrics;
pub mod storage;

pub use config::CrashConfig;
pub use errors::{GameError, GameResult};
pub use game::{GameHandle, RoundEngine};
