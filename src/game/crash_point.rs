//! Crash point generation
//!
//! A pending admin override always wins and is consumed by exactly one round.
//! Otherwise the house-edge slice crashes instantly at 1.00x and the rest
//! follows an inverse distribution whose survival probability at `m` is
//! `0.99 / m`, so any fixed cashout target returns less than its stake on
//! average.

use crate::errors::{GameError, GameResult};
use crate::game::types::Multiplier;
use rand::Rng;

/// Numerator of the inverse distribution. Keeps a 1% edge on top of the
/// instant-crash slice.
const PAYOUT_RATIO: f64 = 0.99;

/// Lowest multiplier a non-instant round can crash at
const MIN_NATURAL_CRASH: Multiplier = Multiplier(101);

/// Crash point chosen for a round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashPoint {
    pub value: Multiplier,
    /// Set when the value came from an admin override
    pub admin_controlled: bool,
}

/// Produces crash points and holds the one-shot override slot
#[derive(Debug, Clone)]
pub struct CrashPointGenerator {
    house_edge: f64,
    ceiling: Multiplier,
    pending_override: Option<Multiplier>,
}

impl CrashPointGenerator {
    pub fn new(house_edge: f64, max_crash_point: f64) -> Self {
        let ceiling = Multiplier::from_f64(max_crash_point)
            .unwrap_or(MIN_NATURAL_CRASH)
            .max(MIN_NATURAL_CRASH);
        Self {
            house_edge,
            ceiling,
            pending_override: None,
        }
    }

    /// Queue an override for the next round. Replaces any earlier pending value.
    pub fn set_override(&mut self, value: f64) -> GameResult<Multiplier> {
        if !value.is_finite() || value < 1.0 {
            return Err(GameError::validation("Crash point must be a number >= 1.00"));
        }
        let value = Multiplier::from_f64(value).ok_or_else(|| {
            GameError::validation(format!("Crash point must be at most {}", Multiplier::MAX))
        })?;
        self.pending_override = Some(value);
        Ok(value)
    }

    pub fn pending_override(&self) -> Option<Multiplier> {
        self.pending_override
    }

    /// Crash point for the next round
    pub fn generate<R: Rng + ?Sized>(&mut self, rng: &mut R) -> CrashPoint {
        if let Some(value) = self.pending_override.take() {
            return CrashPoint {
                value,
                admin_controlled: true,
            };
        }

        CrashPoint {
            value: self.sample(rng),
            admin_controlled: false,
        }
    }

    /// Draw from the house distribution, ignoring any override
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Multiplier {
        if rng.gen::<f64>() < self.house_edge {
            return Multiplier::ONE;
        }

        let u: f64 = rng.gen();
        let raw = PAYOUT_RATIO / (1.0 - u);
        let hundredths = (raw * 100.0).floor();
        let capped = hundredths.min(self.ceiling.0 as f64) as u32;
        Multiplier(capped).max(MIN_NATURAL_CRASH)
    }
}
