pub mod crash_point;
pub mod engine;
pub mod events;
pub mod ledger;
pub mod persistence;
pub mod runner;
pub mod settlement;
pub mod types;

pub use types::*;
pub use crash_point::{CrashPoint, CrashPointGenerator};
pub use engine::{AdminRoundView, Effect, PublicBet, RoundEngine, RoundSnapshot};
pub use events::{EventBus, GameEvent};
pub use runner::{BetReceipt, CashoutOutcome, GameHandle, GameRunner};
