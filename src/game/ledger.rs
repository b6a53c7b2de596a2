//! Bet ledger for the active round
//!
//! Bets keep their placement order (auto-cashout ties settle first-placed
//! first) and are indexed by user id so a cashout request finds its bet
//! without scanning the round.

use crate::errors::{GameError, GameResult};
use crate::game::types::{Bet, Credits, Multiplier, Phase};
use std::collections::HashMap;

/// Smallest auto-cashout target that can ever pay out
pub const MIN_AUTO_CASHOUT: Multiplier = Multiplier(101);

/// Validated bet request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StakeRequest {
    pub amount: Credits,
    pub auto_cashout: Option<Multiplier>,
}

/// Check a raw bet request. Runs before any balance is touched.
pub fn validate_stake(amount: f64, auto_cashout: Option<f64>) -> GameResult<StakeRequest> {
    let amount = Credits::from_units(amount)
        .filter(|a| !a.is_zero())
        .ok_or_else(|| GameError::validation("Bet amount must be greater than zero"))?;

    let auto_cashout = match auto_cashout {
        None => None,
        Some(target) => Some(
            Multiplier::from_f64(target)
                .filter(|m| *m >= MIN_AUTO_CASHOUT)
                .ok_or_else(|| GameError::validation("Auto cashout must be at least 1.01x"))?,
        ),
    };

    Ok(StakeRequest {
        amount,
        auto_cashout,
    })
}

/// Reject bets outside the pre-flight window
pub fn ensure_betting_open(phase: Phase) -> GameResult<()> {
    if phase.accepts_bets() {
        Ok(())
    } else {
        Err(GameError::betting_closed())
    }
}

/// Ordered, user-indexed bet list of one round
#[derive(Debug, Clone, Default)]
pub struct BetBook {
    bets: Vec<Bet>,
    by_user: HashMap<String, Vec<usize>>,
}

impl BetBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a bet, returning its position
    pub fn push(&mut self, bet: Bet) -> usize {
        let index = self.bets.len();
        self.by_user
            .entry(bet.user_id.clone())
            .or_default()
            .push(index);
        self.bets.push(bet);
        index
    }

    pub fn len(&self) -> usize {
        self.bets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bets.is_empty()
    }

    pub fn bets(&self) -> &[Bet] {
        &self.bets
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Bet> {
        self.bets.get_mut(index)
    }

    pub fn has_bets_for(&self, user_id: &str) -> bool {
        self.by_user.contains_key(user_id)
    }

    /// Earliest still-active bet of a user
    pub fn first_active_for(&self, user_id: &str) -> Option<usize> {
        self.by_user
            .get(user_id)?
            .iter()
            .copied()
            .find(|&i| self.bets[i].is_active())
    }

    /// Active bets whose auto-cashout target is reached, in placement order
    pub fn auto_cashouts_due(&self, multiplier: Multiplier) -> Vec<usize> {
        self.bets
            .iter()
            .enumerate()
            .filter(|(_, bet)| bet.auto_cashout_due(multiplier))
            .map(|(i, _)| i)
            .collect()
    }

    /// Positions of every still-active bet
    pub fn active_indices(&self) -> Vec<usize> {
        self.bets
            .iter()
            .enumerate()
            .filter(|(_, bet)| bet.is_active())
            .map(|(i, _)| i)
            .collect()
    }
}
