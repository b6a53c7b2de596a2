//! Round state machine
//!
//! `RoundEngine` owns the phase, the countdown, the multiplier, the hidden
//! crash point and the bet book of the current round. It is synchronous and
//! never touches storage or sockets: every call returns the [`Effect`]s the
//! owning task has to carry out, in order.
//!
//! ```text
//! waiting -> countdown (1 s ticks) -> flying (fixed-step ticks) -> crashed
//!    ^                                                               |
//!    +------------------------- cooldown ----------------------------+
//! ```

use crate::config::GameConfig;
use crate::errors::{GameError, GameResult};
use crate::game::crash_point::CrashPointGenerator;
use crate::game::events::GameEvent;
use crate::game::ledger::{ensure_betting_open, BetBook, StakeRequest};
use crate::game::settlement::{self, Settlement};
use crate::game::types::{Bet, BetStatus, Credits, Multiplier, Phase, Round, UserUpdate};
use chrono::{DateTime, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Side effect requested by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Fan an event out to every observer
    Publish(GameEvent),
    /// Apply a profile change without holding up the round
    Persist { user_id: String, update: UserUpdate },
    /// Record a crashed round in history
    SealRound(Round),
}

/// Round in play. Discarded when the next betting window opens.
#[derive(Debug)]
struct ActiveRound {
    round_id: String,
    crash_point: Multiplier,
    admin_controlled: bool,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    book: BetBook,
}

impl ActiveRound {
    fn to_record(&self) -> Round {
        Round {
            round_id: self.round_id.clone(),
            crash_point: self.crash_point,
            start_time: self.start_time,
            end_time: self.end_time,
            bets: self.book.bets().to_vec(),
            admin_controlled: self.admin_controlled,
        }
    }
}

/// Public bet line of a snapshot. No balances, no user ids.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PublicBet {
    pub username: String,
    pub amount: Credits,
    pub status: BetStatus,
}

/// State sent to an observer on connect
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoundSnapshot {
    pub status: Phase,
    pub countdown: u32,
    pub multiplier: Multiplier,
    pub round_id: Option<String>,
    pub bets: Vec<PublicBet>,
}

/// Operator view of the current round, crash point included
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdminRoundView {
    pub status: Phase,
    pub round_id: Option<String>,
    pub multiplier: Multiplier,
    pub crash_point: Option<Multiplier>,
    pub admin_controlled: bool,
    pub bets: usize,
    pub countdown: u32,
    pub pending_override: Option<Multiplier>,
}

pub struct RoundEngine {
    config: GameConfig,
    generator: CrashPointGenerator,
    rng: StdRng,
    phase: Phase,
    countdown: u32,
    multiplier: Multiplier,
    round: Option<ActiveRound>,
}

impl RoundEngine {
    pub fn new(config: GameConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Engine drawing crash points and round ids from `rng`
    pub fn with_rng(config: GameConfig, rng: StdRng) -> Self {
        let generator = CrashPointGenerator::new(config.house_edge, config.max_crash_point);
        let countdown = config.countdown_secs;
        Self {
            config,
            generator,
            rng,
            phase: Phase::Waiting,
            countdown,
            multiplier: Multiplier::ONE,
            round: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn multiplier(&self) -> Multiplier {
        self.multiplier
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    pub fn round_id(&self) -> Option<&str> {
        self.round.as_ref().map(|r| r.round_id.as_str())
    }

    /// Time until the next scheduled transition or tick
    pub fn next_delay(&self) -> Duration {
        match self.phase {
            Phase::Waiting => Duration::ZERO,
            Phase::Countdown => self.config.countdown_tick(),
            Phase::Flying => self.config.tick_interval(),
            Phase::Crashed => self.config.cooldown(),
        }
    }

    /// Run the transition or tick that is due
    pub fn advance(&mut self) -> Vec<Effect> {
        match self.phase {
            Phase::Waiting | Phase::Crashed => self.open_round(),
            Phase::Countdown => self.countdown_tick(),
            Phase::Flying => self.flight_tick(),
        }
    }

    fn open_round(&mut self) -> Vec<Effect> {
        let round_id = hex::encode(self.rng.gen::<[u8; 8]>());
        let crash_point = self.generator.generate(&mut self.rng);

        self.phase = Phase::Countdown;
        self.countdown = self.config.countdown_secs;
        self.multiplier = Multiplier::ONE;
        self.round = Some(ActiveRound {
            round_id: round_id.clone(),
            crash_point: crash_point.value,
            admin_controlled: crash_point.admin_controlled,
            start_time: None,
            end_time: None,
            book: BetBook::new(),
        });

        if crash_point.admin_controlled {
            info!(round_id = %round_id, "Round opened with admin crash point");
        } else {
            info!(round_id = %round_id, "Round opened");
        }

        vec![Effect::Publish(GameEvent::GameWaiting {
            round_id,
            countdown: self.countdown,
        })]
    }

    fn countdown_tick(&mut self) -> Vec<Effect> {
        self.countdown = self.countdown.saturating_sub(1);
        let mut effects = vec![Effect::Publish(GameEvent::CountdownTick {
            countdown: self.countdown,
        })];
        if self.countdown == 0 {
            effects.extend(self.start_flight());
        }
        effects
    }

    fn start_flight(&mut self) -> Vec<Effect> {
        let Some(round) = self.round.as_mut() else {
            return Vec::new();
        };

        let start_time = Utc::now();
        round.start_time = Some(start_time);
        self.phase = Phase::Flying;
        self.multiplier = Multiplier::ONE;
        debug!(round_id = %round.round_id, bets = round.book.len(), "Flight started");

        let mut effects = vec![Effect::Publish(GameEvent::GameStarted {
            round_id: round.round_id.clone(),
            start_time,
        })];

        // Instant crash: nobody gets a chance to cash out
        if self.multiplier >= round.crash_point {
            effects.extend(self.crash());
        }
        effects
    }

    fn flight_tick(&mut self) -> Vec<Effect> {
        let Some(round) = self.round.as_mut() else {
            return Vec::new();
        };

        let multiplier = self
            .multiplier
            .step(self.config.tick_step_hundredths)
            .min(round.crash_point);
        self.multiplier = multiplier;

        let mut effects = vec![Effect::Publish(GameEvent::MultiplierUpdate { multiplier })];

        for index in round.book.auto_cashouts_due(multiplier) {
            let Some(bet) = round.book.get_mut(index) else {
                continue;
            };
            match settlement::cash_out(bet, Phase::Flying, multiplier) {
                Ok(settled) => {
                    debug!(
                        round_id = %settled.round_id,
                        user_id = %settled.user_id,
                        "Auto cashout at {}",
                        multiplier
                    );
                    effects.push(Effect::Persist {
                        user_id: settled.user_id.clone(),
                        update: settled.user_update(),
                    });
                    effects.push(Effect::Publish(settled.event()));
                }
                Err(e) => warn!("Auto cashout skipped: {}", e),
            }
        }

        if multiplier >= round.crash_point {
            effects.extend(self.crash());
        }
        effects
    }

    fn crash(&mut self) -> Vec<Effect> {
        let Some(round) = self.round.as_mut() else {
            self.phase = Phase::Crashed;
            return Vec::new();
        };

        let mut effects = Vec::new();
        for index in round.book.active_indices() {
            if let Some((user_id, update)) = round.book.get_mut(index).and_then(settlement::lose) {
                effects.push(Effect::Persist { user_id, update });
            }
        }
        // Flipped only once no bet of the round is left active
        self.phase = Phase::Crashed;

        round.end_time = Some(Utc::now());
        let record = round.to_record();
        info!(
            round_id = %record.round_id,
            crash_point = %record.crash_point,
            bets = record.bets.len(),
            house_net = %record.house_net(),
            "Round crashed"
        );

        effects.push(Effect::SealRound(record));
        effects.push(Effect::Publish(GameEvent::GameCrashed {
            crash_point: round.crash_point,
            round_id: round.round_id.clone(),
        }));
        effects
    }

    /// Id of the round currently taking bets
    pub fn betting_round(&self) -> GameResult<&str> {
        ensure_betting_open(self.phase)?;
        self.round_id().ok_or_else(GameError::betting_closed)
    }

    /// Add a bet whose stake has already been debited
    pub fn accept_bet(
        &mut self,
        user_id: &str,
        username: &str,
        stake: StakeRequest,
    ) -> GameResult<Vec<Effect>> {
        let round_id = self.betting_round()?.to_string();
        let round = self.round.as_mut().ok_or_else(GameError::betting_closed)?;

        round.book.push(Bet::new(
            round_id,
            user_id.to_string(),
            username.to_string(),
            stake.amount,
            stake.auto_cashout,
        ));

        Ok(vec![Effect::Publish(GameEvent::NewBet {
            username: username.to_string(),
            amount: stake.amount,
        })])
    }

    /// Cash out the caller's earliest active bet at the current multiplier.
    ///
    /// The returned effects only announce the win; crediting the payout is
    /// left to the caller so it can wait for the new balance.
    pub fn cashout(&mut self, user_id: &str) -> GameResult<(Settlement, Vec<Effect>)> {
        if self.phase != Phase::Flying {
            return Err(GameError::phase("Cashout is only possible during flight"));
        }
        let round = self.round.as_mut().ok_or_else(GameError::no_active_bet)?;

        let Some(index) = round.book.first_active_for(user_id) else {
            return Err(if round.book.has_bets_for(user_id) {
                GameError::already_settled()
            } else {
                GameError::no_active_bet()
            });
        };
        let bet = round.book.get_mut(index).ok_or_else(GameError::no_active_bet)?;

        let settled = settlement::cash_out(bet, self.phase, self.multiplier)?;
        debug!(
            round_id = %settled.round_id,
            user_id = %settled.user_id,
            "Manual cashout at {}",
            settled.multiplier
        );
        let effects = vec![Effect::Publish(settled.event())];
        Ok((settled, effects))
    }

    /// Crash the round in flight at its current multiplier
    pub fn force_crash(&mut self) -> GameResult<Vec<Effect>> {
        if self.phase != Phase::Flying {
            return Err(GameError::phase("Game is not in flight"));
        }
        let round = self.round.as_mut().ok_or_else(|| GameError::phase("Game is not in flight"))?;
        round.crash_point = self.multiplier;
        round.admin_controlled = true;
        warn!(round_id = %round.round_id, "Round force-crashed at {}", self.multiplier);
        Ok(self.crash())
    }

    /// Queue a crash point for the next round to open
    pub fn set_next_crash(&mut self, crash_point: f64) -> GameResult<Multiplier> {
        let value = self.generator.set_override(crash_point)?;
        info!("Next crash point set to {}", value);
        Ok(value)
    }

    /// Drop the current round after a failure, refunding every bet that has
    /// not settled, whatever the phase. Returns the refunds to persist. The
    /// round is not recorded in history.
    pub fn abort_round(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Some(round) = self.round.take() {
            for bet in round.book.bets().iter().filter(|b| b.is_active()) {
                effects.push(Effect::Persist {
                    user_id: bet.user_id.clone(),
                    update: UserUpdate::Refund {
                        round_id: bet.round_id.clone(),
                        stake: bet.amount,
                    },
                });
            }
            warn!(
                round_id = %round.round_id,
                refunds = effects.len(),
                "Round aborted"
            );
        }
        self.phase = Phase::Waiting;
        self.countdown = self.config.countdown_secs;
        self.multiplier = Multiplier::ONE;
        effects
    }

    /// Public state. Never includes the crash point.
    pub fn snapshot(&self) -> RoundSnapshot {
        RoundSnapshot {
            status: self.phase,
            countdown: self.countdown,
            multiplier: self.multiplier,
            round_id: self.round.as_ref().map(|r| r.round_id.clone()),
            bets: self
                .round
                .as_ref()
                .map(|r| {
                    r.book
                        .bets()
                        .iter()
                        .map(|b| PublicBet {
                            username: b.username.clone(),
                            amount: b.amount,
                            status: b.status,
                        })
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    pub fn admin_view(&self) -> AdminRoundView {
        AdminRoundView {
            status: self.phase,
            round_id: self.round.as_ref().map(|r| r.round_id.clone()),
            multiplier: self.multiplier,
            crash_point: self.round.as_ref().map(|r| r.crash_point),
            admin_controlled: self.round.as_ref().map_or(false, |r| r.admin_controlled),
            bets: self.round.as_ref().map_or(0, |r| r.book.len()),
            countdown: self.countdown,
            pending_override: self.generator.pending_override(),
        }
    }
}
