//! Simulated execution engine.
//!
//! Evaluates the safety ladder and take-profit plan against a price feed
//! with instantaneous, costless fills. Shares the ledger mutation rules with
//! the live engine, so both modes produce numerically consistent results.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::config::{SafetyLevel, StrategyParams, TpLevel};
use crate::domain::{LedgerSnapshot, PositionLedger};
use crate::engine::events::EventBus;
use crate::error::{MartiError, Result};

pub struct SimEngine {
    params: StrategyParams,
    ladder: Vec<SafetyLevel>,
    tp_levels: Vec<TpLevel>,
    ledger: PositionLedger,
    events: EventBus,
    running: bool,
}

impl SimEngine {
    pub fn new(params: StrategyParams, events: EventBus) -> Result<Self> {
        params
            .validate()
            .map_err(|errors| MartiError::Validation(errors.join("; ")))?;
        let ladder = params.safety.levels();
        let tp_levels = params.take_profit.levels();
        let ledger = PositionLedger::new(tp_levels.len());
        Ok(Self {
            params,
            ladder,
            tp_levels,
            ledger,
            events,
            running: false,
        })
    }

    pub fn start(&mut self) {
        self.running = true;
        self.events.emit("simulated engine started");
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.events.emit("simulated engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn has_position(&self) -> bool {
        self.ledger.is_open()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        self.ledger.snapshot()
    }

    pub fn params(&self) -> &StrategyParams {
        &self.params
    }

    /// Open a cycle with one instantly filled buy at `price`. Invoked by the
    /// caller (optionally behind an entry filter), never by the engine.
    pub fn open_position(&mut self, price: Decimal) -> Result<()> {
        self.ledger.begin_cycle(price)?;
        let qty = self.params.base_order_value / price;
        self.ledger.apply_buy_fill(qty, self.params.base_order_value)?;
        let target = self.tp_target(0);
        self.events
            .emit(format!("position opened at {price}, first TP target {target}"));
        self.events.push_snapshot(self.ledger.snapshot());
        Ok(())
    }

    /// Evaluate one price sample. Safety levels are checked before
    /// take-profits so a tick that both deepens and exits is processed as
    /// deepen-then-exit against the new average.
    pub fn on_tick(&mut self, price: Decimal) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        if self.ledger.is_open() {
            self.check_safety(price)?;
            self.check_take_profit(price)?;
        }
        Ok(())
    }

    fn check_safety(&mut self, price: Decimal) -> Result<()> {
        let filled = self.ledger.filled_safety_count() as usize;
        let Some(level) = self.ladder.get(filled) else {
            return Ok(()); // ladder exhausted
        };
        let next_index = filled + 1;
        let safety_price =
            self.ledger.entry_price() * (Decimal::ONE - level.drop_percent / dec!(100));
        if price > safety_price {
            return Ok(());
        }

        // Instant fill at the ladder price, not the observed tick price.
        let qty = level.order_value / safety_price;
        self.ledger.apply_buy_fill(qty, level.order_value)?;
        self.ledger.note_safety_fill();
        let target = self.tp_target(0);
        self.events.emit(format!(
            "safety order {next_index} filled at {safety_price}, average {}, TP target {target}",
            self.ledger.average_price()
        ));
        self.events.push_snapshot(self.ledger.snapshot());
        Ok(())
    }

    fn check_take_profit(&mut self, price: Decimal) -> Result<()> {
        if self.ledger.total_base_held() <= Decimal::ZERO {
            return Ok(());
        }

        // All eligible tranches fire in declared order within this one pass.
        for idx in 0..self.tp_levels.len() {
            if self.ledger.tp_done(idx) {
                continue;
            }
            let level = self.tp_levels[idx];
            if level.share_percent.is_zero() {
                self.ledger.mark_tp_done(idx);
                continue;
            }
            let target = self.tp_target(idx);
            if price < target {
                continue;
            }
            let sell_qty = (self.ledger.armed_base() * level.share_percent / dec!(100))
                .min(self.ledger.total_base_held());
            if sell_qty <= Decimal::ZERO {
                self.ledger.mark_tp_done(idx);
                continue;
            }
            // Exits execute at the configured target, not the tick price.
            let pnl = self.ledger.apply_exit(sell_qty, target)?;
            self.ledger.mark_tp_done(idx);
            self.events.emit(format!(
                "TP{} filled at {target}, qty {sell_qty}, pnl {pnl}",
                idx + 1
            ));
            self.events.push_snapshot(self.ledger.snapshot());
        }

        if self.ledger.total_base_held() <= Decimal::ZERO || self.ledger.all_tp_done() {
            self.events.emit("all take-profits done, cycle closed");
            self.ledger.close_cycle();
            self.events.push_snapshot(self.ledger.snapshot());
        } else {
            debug!(
                held = %self.ledger.total_base_held(),
                "cycle stays open after take-profit pass"
            );
        }
        Ok(())
    }

    fn tp_target(&self, level: usize) -> Decimal {
        let percent = self
            .tp_levels
            .get(level)
            .map(|l| l.percent)
            .unwrap_or_default();
        self.ledger.average_price() * (Decimal::ONE + percent / dec!(100))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EntryFilterConfig, SafetyLadderConfig, TakeProfitConfig};

    fn params(take_profit: TakeProfitConfig, base_order_value: Decimal) -> StrategyParams {
        StrategyParams {
            symbol: "BTCUSDT".into(),
            quote_asset: "USDT".into(),
            base_order_value,
            safety: SafetyLadderConfig::Uniform {
                order_value: dec!(10),
                step_percent: dec!(2),
                max_count: 1,
            },
            take_profit,
            entry_filter: EntryFilterConfig::default(),
            poll_interval_secs: 1,
        }
    }

    fn engine(take_profit: TakeProfitConfig, base_order_value: Decimal) -> SimEngine {
        let mut engine =
            SimEngine::new(params(take_profit, base_order_value), EventBus::new(64)).unwrap();
        engine.start();
        engine
    }

    #[test]
    fn safety_fill_lowers_average() {
        // Entry at 100 with 10 quote, one safety level 2% below entry.
        let mut engine = engine(TakeProfitConfig::Single { percent: dec!(1) }, dec!(10));
        engine.open_position(dec!(100)).unwrap();
        engine.on_tick(dec!(98)).unwrap();

        let snap = engine.snapshot();
        let expected_base = dec!(10) / dec!(100) + dec!(10) / dec!(98);
        assert_eq!(snap.total_base_held, expected_base);
        assert_eq!(snap.total_quote_spent, dec!(20));
        assert_eq!(snap.average_price, dec!(20) / expected_base);
        assert_eq!(snap.filled_safety_count, 1);
        assert!(snap.is_open);
    }

    #[test]
    fn safety_ladder_stops_when_exhausted() {
        let mut engine = engine(TakeProfitConfig::Single { percent: dec!(50) }, dec!(10));
        engine.open_position(dec!(100)).unwrap();
        engine.on_tick(dec!(90)).unwrap();
        engine.on_tick(dec!(80)).unwrap();
        engine.on_tick(dec!(70)).unwrap();
        assert_eq!(engine.snapshot().filled_safety_count, 1);
    }

    #[test]
    fn single_take_profit_fills_at_target_price() {
        // Average 100, 1% target: 101. Exit executes at 101 even when the
        // tick is 101.2.
        let mut engine = engine(TakeProfitConfig::Single { percent: dec!(1) }, dec!(1000));
        engine.open_position(dec!(100)).unwrap();

        engine.on_tick(dec!(100.5)).unwrap();
        assert!(engine.snapshot().is_open);

        engine.on_tick(dec!(101.2)).unwrap();
        let snap = engine.snapshot();
        assert!(!snap.is_open);
        assert_eq!(snap.cycles_closed, 1);
        assert_eq!(snap.realized_pnl, dec!(10)); // 10 base * (101 - 100)
        assert_eq!(snap.total_base_held, Decimal::ZERO);
        assert_eq!(snap.total_quote_spent, Decimal::ZERO);
    }

    #[test]
    fn tiered_levels_all_fire_on_one_tick() {
        let tiers = TakeProfitConfig::Tiered {
            levels: vec![
                TpLevel {
                    percent: dec!(1),
                    share_percent: dec!(30),
                },
                TpLevel {
                    percent: dec!(2),
                    share_percent: dec!(30),
                },
                TpLevel {
                    percent: dec!(3),
                    share_percent: dec!(40),
                },
            ],
        };
        // 1000 quote at 100 = 10 base, average 100.
        let mut engine = engine(tiers, dec!(1000));
        engine.open_position(dec!(100)).unwrap();
        engine.on_tick(dec!(103)).unwrap();

        let snap = engine.snapshot();
        assert_eq!(snap.cycles_closed, 1);
        assert!(!snap.is_open);
        assert_eq!(snap.total_base_held, Decimal::ZERO);
        // 3 @ +1, 3 @ +2, 4 @ +3 over average 100
        assert_eq!(snap.realized_pnl, dec!(21));
    }

    #[test]
    fn zero_share_levels_are_trivially_satisfied() {
        let tiers = TakeProfitConfig::Tiered {
            levels: vec![
                TpLevel {
                    percent: dec!(1),
                    share_percent: dec!(100),
                },
                TpLevel {
                    percent: dec!(50),
                    share_percent: dec!(0),
                },
            ],
        };
        let mut engine = engine(tiers, dec!(1000));
        engine.open_position(dec!(100)).unwrap();
        engine.on_tick(dec!(101)).unwrap();

        // The zero-share level never blocks the close.
        let snap = engine.snapshot();
        assert_eq!(snap.cycles_closed, 1);
        assert!(!snap.is_open);
    }

    #[test]
    fn safety_fill_rearms_completed_tranches() {
        let tiers = TakeProfitConfig::Tiered {
            levels: vec![
                TpLevel {
                    percent: dec!(1),
                    share_percent: dec!(50),
                },
                TpLevel {
                    percent: dec!(10),
                    share_percent: dec!(50),
                },
            ],
        };
        let mut engine = engine(tiers, dec!(1000));
        engine.open_position(dec!(100)).unwrap();

        // First tranche fires, second stays out of reach.
        engine.on_tick(dec!(101)).unwrap();
        let snap = engine.snapshot();
        assert!(snap.is_open);
        assert!(snap.tp_done[0]);
        assert!(!snap.tp_done[1]);

        // A safety fill re-arms the whole exit plan against the new average.
        engine.on_tick(dec!(98)).unwrap();
        let snap = engine.snapshot();
        assert_eq!(snap.filled_safety_count, 1);
        assert!(!snap.tp_done[0]);
        assert!(!snap.tp_done[1]);
    }

    #[test]
    fn stopped_engine_ignores_ticks() {
        let mut engine = engine(TakeProfitConfig::Single { percent: dec!(1) }, dec!(10));
        engine.open_position(dec!(100)).unwrap();
        engine.stop();
        engine.on_tick(dec!(200)).unwrap();
        assert!(engine.snapshot().is_open);
    }

    #[test]
    fn rejects_invalid_parameters() {
        let mut bad = params(TakeProfitConfig::Single { percent: dec!(1) }, dec!(10));
        bad.base_order_value = Decimal::ZERO;
        assert!(SimEngine::new(bad, EventBus::new(8)).is_err());
    }
}
