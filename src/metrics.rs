//! Prometheus metrics for the game loop and the real-time channel

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};

/// Counters shared by the game loop, the persistence worker and the API
#[derive(Clone)]
pub struct GameMetrics {
    registry: Registry,
    pub rounds_total: IntCounter,
    pub bets_total: IntCounter,
    pub cashouts_total: IntCounter,
    pub losses_total: IntCounter,
    /// Stakes accepted, in micro-units
    pub wagered_credits_total: IntCounter,
    /// Payouts credited, in micro-units
    pub paid_out_credits_total: IntCounter,
    pub persistence_failures: IntCounter,
    pub loop_restarts_total: IntCounter,
    pub observers: IntGauge,
    pub crash_points: Histogram,
}

impl GameMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("crashpoint".to_string()), None)?;

        let rounds_total = IntCounter::new("rounds_total", "Rounds crashed and sealed")?;
        let bets_total = IntCounter::new("bets_total", "Bets accepted")?;
        let cashouts_total = IntCounter::new("cashouts_total", "Bets settled as wins")?;
        let losses_total = IntCounter::new("losses_total", "Bets lost at the crash")?;
        let wagered_credits_total =
            IntCounter::new("wagered_credits_total", "Sum of accepted stakes in micro-units")?;
        let paid_out_credits_total =
            IntCounter::new("paid_out_credits_total", "Sum of cashout payouts in micro-units")?;
        let persistence_failures =
            IntCounter::new("persistence_failures_total", "Storage writes that failed for good")?;
        let loop_restarts_total =
            IntCounter::new("loop_restarts_total", "Rounds aborted after a game loop failure")?;
        let observers = IntGauge::new("observers", "Connected real-time observers")?;
        let crash_points = Histogram::with_opts(
            HistogramOpts::new("crash_point", "Crash point of sealed rounds")
                .buckets(vec![1.0, 1.01, 1.5, 2.0, 3.0, 5.0, 10.0, 50.0, 100.0, 1000.0]),
        )?;

        registry.register(Box::new(rounds_total.clone()))?;
        registry.register(Box::new(bets_total.clone()))?;
        registry.register(Box::new(cashouts_total.clone()))?;
        registry.register(Box::new(losses_total.clone()))?;
        registry.register(Box::new(wagered_credits_total.clone()))?;
        registry.register(Box::new(paid_out_credits_total.clone()))?;
        registry.register(Box::new(persistence_failures.clone()))?;
        registry.register(Box::new(loop_restarts_total.clone()))?;
        registry.register(Box::new(observers.clone()))?;
        registry.register(Box::new(crash_points.clone()))?;

        Ok(Self {
            registry,
            rounds_total,
            bets_total,
            cashouts_total,
            losses_total,
            wagered_credits_total,
            paid_out_credits_total,
            persistence_failures,
            loop_restarts_total,
            observers,
            crash_points,
        })
    }

    /// Text exposition format
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
