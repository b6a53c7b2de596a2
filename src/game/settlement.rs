//! Cashout and loss settlement
//!
//! A bet leaves `active` exactly once. Both the manual request path and the
//! flight tick's auto scan go through [`cash_out`], which is a compare-and-set
//! on the bet status, so whichever reaches a bet first wins and the other
//! observes "already settled".

use crate::errors::{GameError, GameResult};
use crate::game::events::GameEvent;
use crate::game::types::{Bet, Credits, Multiplier, Phase, UserUpdate};

/// Result of a winning settlement
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub round_id: String,
    pub user_id: String,
    pub username: String,
    pub stake: Credits,
    pub multiplier: Multiplier,
    pub payout: Credits,
}

impl Settlement {
    /// Profile change crediting the payout
    pub fn user_update(&self) -> UserUpdate {
        UserUpdate::Cashout {
            round_id: self.round_id.clone(),
            stake: self.stake,
            multiplier: self.multiplier,
            payout: self.payout,
        }
    }

    /// Public announcement of the cashout
    pub fn event(&self) -> GameEvent {
        GameEvent::PlayerCashedOut {
            username: self.username.clone(),
            multiplier: self.multiplier,
            win_amount: self.payout,
        }
    }

    /// Player profit on top of the returned stake
    pub fn profit(&self) -> Credits {
        self.payout.saturating_sub(self.stake)
    }
}

/// Settle `bet` as a win at `multiplier`.
///
/// Fails without touching the bet when the round is not flying or the bet
/// is no longer active.
pub fn cash_out(
    bet: &mut Bet,
    phase: Phase,
    multiplier: Multiplier,
) -> GameResult<Settlement> {
    if phase != Phase::Flying {
        return Err(GameError::phase("Cashout is only possible during flight"));
    }

    let payout = bet
        .try_cash_out(multiplier)
        .ok_or_else(GameError::already_settled)?;

    Ok(Settlement {
        round_id: bet.round_id.clone(),
        user_id: bet.user_id.clone(),
        username: bet.username.clone(),
        stake: bet.amount,
        multiplier,
        payout,
    })
}

/// Settle `bet` as lost at the crash. Returns the counter update for its
/// owner, or `None` when the bet had already been cashed out.
pub fn lose(bet: &mut Bet) -> Option<(String, UserUpdate)> {
    if !bet.try_lose() {
        return None;
    }
    Some((
        bet.user_id.clone(),
        UserUpdate::Loss {
            round_id: bet.round_id.clone(),
            stake: bet.amount,
        },
    ))
}
