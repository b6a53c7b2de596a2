use crate::storage::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::VecDeque;
use std::fmt;

/// Base units per whole unit of the play currency
pub const CREDITS_PER_UNIT: u64 = 1_000_000;

/// Fixed-point amount of play currency in micro-units.
///
/// Travels on the wire as a decimal number (`0.05`) and is converted to
/// integer micro-units on the way in, so balances never accumulate float drift.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Credits(pub u64);

impl Credits {
    pub const ZERO: Credits = Credits(0);

    /// Convert a decimal wire amount. Rejects NaN, infinities and negatives.
    pub fn from_units(units: f64) -> Option<Self> {
        if !units.is_finite() || units < 0.0 {
            return None;
        }
        let raw = (units * CREDITS_PER_UNIT as f64).round();
        if raw > u64::MAX as f64 {
            return None;
        }
        Some(Credits(raw as u64))
    }

    pub fn as_units(self) -> f64 {
        self.0 as f64 / CREDITS_PER_UNIT as f64
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_sub(self, other: Credits) -> Option<Credits> {
        self.0.checked_sub(other.0).map(Credits)
    }

    pub fn saturating_add(self, other: Credits) -> Credits {
        Credits(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Credits) -> Credits {
        Credits(self.0.saturating_sub(other.0))
    }

    /// Payout of this stake at `multiplier`, rounded down to the micro-unit
    pub fn scale(self, multiplier: Multiplier) -> Credits {
        let raw = self.0 as u128 * multiplier.0 as u128 / 100;
        Credits(raw.min(u64::MAX as u128) as u64)
    }
}

impl fmt::Display for Credits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.as_units())
    }
}

impl Serialize for Credits {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_units())
    }
}

impl<'de> Deserialize<'de> for Credits {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let units = f64::deserialize(deserializer)?;
        Credits::from_units(units)
            .ok_or_else(|| serde::de::Error::custom("amount must be a finite, non-negative number"))
    }
}

/// Payout multiplier in hundredths (`150` is 1.50x)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Multiplier(pub u32);

impl Multiplier {
    pub const ONE: Multiplier = Multiplier(100);
    /// Largest representable multiplier
    pub const MAX: Multiplier = Multiplier(u32::MAX);

    /// Parse a decimal multiplier, rounded to the nearest hundredth. Values
    /// below 1.00 are rejected.
    pub fn from_f64(value: f64) -> Option<Self> {
        if !value.is_finite() || value < 1.0 {
            return None;
        }
        let hundredths = (value * 100.0).round();
        if hundredths > u32::MAX as f64 {
            return None;
        }
        Some(Multiplier(hundredths as u32))
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / 100.0
    }

    /// Advance by `step` hundredths
    pub fn step(self, step: u32) -> Multiplier {
        Multiplier(self.0.saturating_add(step))
    }
}

impl Default for Multiplier {
    fn default() -> Self {
        Multiplier::ONE
    }
}

impl fmt::Display for Multiplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}x", self.0 / 100, self.0 % 100)
    }
}

impl Serialize for Multiplier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

impl<'de> Deserialize<'de> for Multiplier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        Multiplier::from_f64(value)
            .ok_or_else(|| serde::de::Error::custom("multiplier must be a number >= 1.00"))
    }
}

/// Round lifecycle phase
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Waiting,
    Countdown,
    Flying,
    Crashed,
}

impl Phase {
    /// Bets are taken in the pre-flight window, including the instant
    /// between rounds.
    pub fn accepts_bets(self) -> bool {
        matches!(self, Phase::Waiting | Phase::Countdown)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Waiting => write!(f, "waiting"),
            Phase::Countdown => write!(f, "countdown"),
            Phase::Flying => write!(f, "flying"),
            Phase::Crashed => write!(f, "crashed"),
        }
    }
}

/// Bet status. `Active` is the only non-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BetStatus {
    Active,
    CashedOut,
    Lost,
}

/// A single stake in a round
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bet {
    pub round_id: String,
    pub user_id: String,
    pub username: String,
    pub amount: Credits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_cashout: Option<Multiplier>,
    pub status: BetStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cashout_multiplier: Option<Multiplier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub win_amount: Option<Credits>,
    pub placed_at: DateTime<Utc>,
}

impl Bet {
    pub fn new(
        round_id: String,
        user_id: String,
        username: String,
        amount: Credits,
        auto_cashout: Option<Multiplier>,
    ) -> Self {
        Self {
            round_id,
            user_id,
            username,
            amount,
            auto_cashout,
            status: BetStatus::Active,
            cashout_multiplier: None,
            win_amount: None,
            placed_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == BetStatus::Active
    }

    /// Compare-and-set `active -> cashed_out`. Returns the payout, or `None`
    /// when the bet was already settled.
    pub fn try_cash_out(&mut self, at: Multiplier) -> Option<Credits> {
        if self.status != BetStatus::Active {
            return None;
        }
        let payout = self.amount.scale(at);
        self.status = BetStatus::CashedOut;
        self.cashout_multiplier = Some(at);
        self.win_amount = Some(payout);
        Some(payout)
    }

    /// Compare-and-set `active -> lost`
    pub fn try_lose(&mut self) -> bool {
        if self.status != BetStatus::Active {
            return false;
        }
        self.status = BetStatus::Lost;
        true
    }

    /// Auto-cashout threshold reached at `multiplier`
    pub fn auto_cashout_due(&self, multiplier: Multiplier) -> bool {
        self.is_active() && self.auto_cashout.map_or(false, |target| target <= multiplier)
    }
}

/// One betting cycle. Sealed and persisted at the crash; never modified after.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Round {
    pub round_id: String,
    pub crash_point: Multiplier,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub bets: Vec<Bet>,
    #[serde(default)]
    pub admin_controlled: bool,
}

impl Round {
    /// Sum of stakes
    pub fn total_wagered(&self) -> Credits {
        self.bets
            .iter()
            .fold(Credits::ZERO, |acc, bet| acc.saturating_add(bet.amount))
    }

    /// Sum of cashout payouts
    pub fn total_paid_out(&self) -> Credits {
        self.bets
            .iter()
            .filter_map(|bet| bet.win_amount)
            .fold(Credits::ZERO, |acc, win| acc.saturating_add(win))
    }

    /// House result for the round: stakes kept minus payouts (negative when
    /// players won more than they staked)
    pub fn house_net(&self) -> i128 {
        self.total_wagered().0 as i128 - self.total_paid_out().0 as i128
    }
}

/// Entry of a player's bounded bet log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BetRecord {
    pub round_id: String,
    pub amount: Credits,
    pub status: BetStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<Multiplier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub win_amount: Option<Credits>,
    pub settled_at: DateTime<Utc>,
}

/// Durable player profile
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub user_id: String,
    pub username: String,
    pub balance: Credits,
    pub games_played: u64,
    pub games_won: u64,
    pub total_winnings: Credits,
    #[serde(default)]
    pub bets_history: VecDeque<BetRecord>,
    pub created_at: DateTime<Utc>,
}

/// Most recent settled bets kept on a profile
pub const MAX_BET_HISTORY: usize = 50;

impl User {
    pub fn new(user_id: &str, username: &str, starting_balance: Credits) -> Self {
        Self {
            user_id: user_id.to_string(),
            username: username.to_string(),
            balance: starting_balance,
            games_played: 0,
            games_won: 0,
            total_winnings: Credits::ZERO,
            bets_history: VecDeque::new(),
            created_at: Utc::now(),
        }
    }

    /// Apply a balance/counter change. All-or-nothing: on error the profile
    /// is left untouched.
    pub fn apply(&mut self, update: &UserUpdate) -> Result<(), StoreError> {
        match update {
            UserUpdate::Debit { amount } => {
                self.balance = self.balance.checked_sub(*amount).ok_or(
                    StoreError::InsufficientFunds {
                        balance: self.balance,
                        requested: *amount,
                    },
                )?;
            }
            UserUpdate::Cashout {
                round_id,
                stake,
                multiplier,
                payout,
            } => {
                self.balance = self.balance.saturating_add(*payout);
                self.games_played += 1;
                self.games_won += 1;
                self.total_winnings = self
                    .total_winnings
                    .saturating_add(payout.saturating_sub(*stake));
                self.record(BetRecord {
                    round_id: round_id.clone(),
                    amount: *stake,
                    status: BetStatus::CashedOut,
                    multiplier: Some(*multiplier),
                    win_amount: Some(*payout),
                    settled_at: Utc::now(),
                });
            }
            UserUpdate::Loss { round_id, stake } => {
                self.games_played += 1;
                self.record(BetRecord {
                    round_id: round_id.clone(),
                    amount: *stake,
                    status: BetStatus::Lost,
                    multiplier: None,
                    win_amount: None,
                    settled_at: Utc::now(),
                });
            }
            UserUpdate::Refund { stake, .. } => {
                self.balance = self.balance.saturating_add(*stake);
            }
        }
        Ok(())
    }

    fn record(&mut self, entry: BetRecord) {
        self.bets_history.push_back(entry);
        while self.bets_history.len() > MAX_BET_HISTORY {
            self.bets_history.pop_front();
        }
    }
}

/// Atomic change to a player's profile
#[derive(Debug, Clone, PartialEq)]
pub enum UserUpdate {
    /// Stake taken at bet time
    Debit { amount: Credits },
    /// Winning settlement
    Cashout {
        round_id: String,
        stake: Credits,
        multiplier: Multiplier,
        payout: Credits,
    },
    /// Bet still active at the crash. Counters only, the stake is already gone.
    Loss { round_id: String, stake: Credits },
    /// Stake returned from a round that was aborted before it could settle
    Refund { round_id: String, stake: Credits },
}

impl UserUpdate {
    /// Money owed to the player. Must eventually land once the bet has
    /// settled in memory.
    pub fn is_credit(&self) -> bool {
        matches!(self, UserUpdate::Cashout { .. } | UserUpdate::Refund { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credits_conversion() {
        assert_eq!(Credits::from_units(0.09), Some(Credits(90_000)));
        assert_eq!(Credits::from_units(0.115), Some(Credits(115_000)));
        assert_eq!(Credits::from_units(-1.0), None);
        assert_eq!(Credits::from_units(f64::NAN), None);
        assert_eq!(Credits(50_000).to_string(), "0.05");
    }

    #[test]
    fn test_credits_scale() {
        let stake = Credits::from_units(0.05).unwrap();
        assert_eq!(stake.scale(Multiplier(150)), Credits(75_000));
        assert_eq!(stake.scale(Multiplier::ONE), stake);
    }

    #[test]
    fn test_multiplier_parsing() {
        assert_eq!(Multiplier::from_f64(5.0), Some(Multiplier(500)));
        assert_eq!(Multiplier::from_f64(1.234), Some(Multiplier(123)));
        assert_eq!(Multiplier::from_f64(0.99), None);
        assert_eq!(Multiplier(150).to_string(), "1.50x");
        assert_eq!(Multiplier(199).step(1), Multiplier(200));
    }

    #[test]
    fn test_bet_settles_once() {
        let mut bet = Bet::new("r".into(), "u".into(), "alice".into(), Credits(1_000), None);
        assert_eq!(bet.try_cash_out(Multiplier(200)), Some(Credits(2_000)));
        assert_eq!(bet.try_cash_out(Multiplier(300)), None);
        assert!(!bet.try_lose());
        assert_eq!(bet.status, BetStatus::CashedOut);
        assert_eq!(bet.win_amount, Some(Credits(2_000)));
    }

    #[test]
    fn test_auto_cashout_due() {
        let bet = Bet::new("r".into(), "u".into(), "a".into(), Credits(1), Some(Multiplier(150)));
        assert!(!bet.auto_cashout_due(Multiplier(149)));
        assert!(bet.auto_cashout_due(Multiplier(150)));
        let manual = Bet::new("r".into(), "u".into(), "a".into(), Credits(1), None);
        assert!(!manual.auto_cashout_due(Multiplier(10_000)));
    }

    #[test]
    fn test_debit_is_all_or_nothing() {
        let mut user = User::new("1", "alice", Credits(90_000));
        let before = user.clone();
        let err = user.apply(&UserUpdate::Debit { amount: Credits(90_001) });
        assert!(matches!(err, Err(StoreError::InsufficientFunds { .. })));
        assert_eq!(user, before);

        user.apply(&UserUpdate::Debit { amount: Credits(90_000) }).unwrap();
        assert_eq!(user.balance, Credits::ZERO);
    }

    #[test]
    fn test_cashout_update_counters() {
        let mut user = User::new("1", "alice", Credits(40_000));
        user.apply(&UserUpdate::Cashout {
            round_id: "r1".into(),
            stake: Credits(50_000),
            multiplier: Multiplier(150),
            payout: Credits(75_000),
        })
        .unwrap();
        assert_eq!(user.balance, Credits(115_000));
        assert_eq!(user.games_played, 1);
        assert_eq!(user.games_won, 1);
        assert_eq!(user.total_winnings, Credits(25_000));
        assert_eq!(user.bets_history.len(), 1);
    }

    #[test]
    fn test_bet_history_is_bounded() {
        let mut user = User::new("1", "alice", Credits::ZERO);
        for i in 0..(MAX_BET_HISTORY + 5) {
            user.apply(&UserUpdate::Loss { round_id: i.to_string(), stake: Credits(1) })
                .unwrap();
        }
        assert_eq!(user.bets_history.len(), MAX_BET_HISTORY);
        assert_eq!(user.bets_history.front().unwrap().round_id, "5");
        assert_eq!(user.games_played as usize, MAX_BET_HISTORY + 5);
    }

    #[test]
    fn test_round_house_net() {
        let mut winner = Bet::new("r".into(), "a".into(), "a".into(), Credits(100), None);
        winner.try_cash_out(Multiplier(250));
        let mut loser = Bet::new("r".into(), "b".into(), "b".into(), Credits(300), None);
        loser.try_lose();
        let round = Round {
            round_id: "r".into(),
            crash_point: Multiplier(300),
            start_time: None,
            end_time: None,
            bets: vec![winner, loser],
            admin_controlled: false,
        };
        assert_eq!(round.total_wagered(), Credits(400));
        assert_eq!(round.total_paid_out(), Credits(250));
        assert_eq!(round.house_net(), 150);
    }

    #[test]
    fn test_phase_serialization() {
        assert_eq!(serde_json::to_string(&Phase::Countdown).unwrap(), "\"countdown\"");
        assert_eq!(serde_json::to_string(&BetStatus::CashedOut).unwrap(), "\"cashed_out\"");
        assert!(Phase::Waiting.accepts_bets());
        assert!(!Phase::Flying.accepts_bets());
    }
}
