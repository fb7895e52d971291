//! Position ledger
//!
//! The authoritative record of a single open/closed trading cycle. Pure data
//! plus invariant-preserving mutators; the owning engine is the only writer,
//! external consumers only ever see [`LedgerSnapshot`] copies.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{MartiError, Result};

/// Mutable record of the current trading cycle.
///
/// `realized_pnl` and `cycles_closed` accumulate across cycles for the whole
/// run; everything else resets when a cycle closes.
#[derive(Debug, Clone)]
pub struct PositionLedger {
    is_open: bool,
    entry_price: Decimal,
    average_price: Decimal,
    total_base_held: Decimal,
    total_quote_spent: Decimal,
    filled_safety_count: u32,
    /// Quantity held when the exit plan was last (re)armed. Take-profit
    /// tranches are sized against this, so shares summing to 100% liquidate
    /// exactly the armed quantity.
    armed_base: Decimal,
    tp_done: Vec<bool>,
    realized_pnl: Decimal,
    cycles_closed: u32,
}

impl PositionLedger {
    pub fn new(tp_levels: usize) -> Self {
        Self {
            is_open: false,
            entry_price: Decimal::ZERO,
            average_price: Decimal::ZERO,
            total_base_held: Decimal::ZERO,
            total_quote_spent: Decimal::ZERO,
            filled_safety_count: 0,
            armed_base: Decimal::ZERO,
            tp_done: vec![false; tp_levels],
            realized_pnl: Decimal::ZERO,
            cycles_closed: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn entry_price(&self) -> Decimal {
        self.entry_price
    }

    pub fn average_price(&self) -> Decimal {
        self.average_price
    }

    pub fn total_base_held(&self) -> Decimal {
        self.total_base_held
    }

    pub fn total_quote_spent(&self) -> Decimal {
        self.total_quote_spent
    }

    pub fn filled_safety_count(&self) -> u32 {
        self.filled_safety_count
    }

    pub fn armed_base(&self) -> Decimal {
        self.armed_base
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.realized_pnl
    }

    pub fn cycles_closed(&self) -> u32 {
        self.cycles_closed
    }

    pub fn tp_done(&self, level: usize) -> bool {
        self.tp_done.get(level).copied().unwrap_or(true)
    }

    pub fn all_tp_done(&self) -> bool {
        self.tp_done.iter().all(|d| *d)
    }

    /// Record the entry price of a new cycle. The cycle counts as open only
    /// once the first buy fill is applied.
    pub fn begin_cycle(&mut self, entry_price: Decimal) -> Result<()> {
        if self.is_open {
            return Err(MartiError::Invariant(
                "cannot begin a cycle while one is open".into(),
            ));
        }
        self.entry_price = entry_price;
        self.filled_safety_count = 0;
        self.armed_base = Decimal::ZERO;
        self.tp_done.iter_mut().for_each(|d| *d = false);
        Ok(())
    }

    /// Credit a filled buy (entry or safety) and recompute the average.
    /// Re-arms the exit plan against the new totals.
    pub fn apply_buy_fill(&mut self, qty: Decimal, quote: Decimal) -> Result<()> {
        if qty <= Decimal::ZERO || quote <= Decimal::ZERO {
            return Err(MartiError::Invariant(format!(
                "buy fill must be positive, got qty={qty} quote={quote}"
            )));
        }
        self.total_base_held += qty;
        self.total_quote_spent += quote;
        self.average_price = self.total_quote_spent / self.total_base_held;
        self.is_open = true;
        self.rearm_exits();
        Ok(())
    }

    /// Count a consumed safety level. The engine enforces the ladder bound.
    pub fn note_safety_fill(&mut self) {
        self.filled_safety_count += 1;
    }

    /// Reset the exit plan against the currently held quantity: clear every
    /// take-profit flag and re-base tranche sizing.
    pub fn rearm_exits(&mut self) {
        self.armed_base = self.total_base_held;
        self.tp_done.iter_mut().for_each(|d| *d = false);
    }

    pub fn mark_tp_done(&mut self, level: usize) {
        if let Some(flag) = self.tp_done.get_mut(level) {
            *flag = true;
        }
    }

    /// Remove `sell_qty` and its cost basis, realizing PnL at `exec_price`.
    pub fn apply_exit(&mut self, sell_qty: Decimal, exec_price: Decimal) -> Result<Decimal> {
        if !self.is_open || self.total_base_held <= Decimal::ZERO {
            return Err(MartiError::Invariant(
                "exit applied to an empty position".into(),
            ));
        }
        if sell_qty <= Decimal::ZERO || sell_qty > self.total_base_held {
            return Err(MartiError::Invariant(format!(
                "exit quantity {sell_qty} out of range (held {})",
                self.total_base_held
            )));
        }
        let cost_basis = sell_qty * self.average_price;
        let pnl = sell_qty * exec_price - cost_basis;
        self.realized_pnl += pnl;
        self.total_base_held -= sell_qty;
        self.total_quote_spent -= cost_basis;
        // Decimal division residue can leave dust below zero after the last
        // tranche; treat it as emptied.
        if self.total_quote_spent < Decimal::ZERO {
            self.total_quote_spent = Decimal::ZERO;
        }
        Ok(pnl)
    }

    /// Close the cycle after a single full-quantity exit order filled for
    /// `executed_quote`. Returns the realized PnL.
    pub fn settle_full_exit(&mut self, executed_quote: Decimal) -> Result<Decimal> {
        if !self.is_open {
            return Err(MartiError::Invariant(
                "full exit settled on a closed cycle".into(),
            ));
        }
        let pnl = executed_quote - self.total_quote_spent;
        self.realized_pnl += pnl;
        self.cycles_closed += 1;
        self.reset_position();
        Ok(pnl)
    }

    /// Close the cycle once every tranche is done or the quantity is gone.
    pub fn close_cycle(&mut self) {
        self.cycles_closed += 1;
        self.reset_position();
    }

    fn reset_position(&mut self) {
        self.is_open = false;
        self.entry_price = Decimal::ZERO;
        self.average_price = Decimal::ZERO;
        self.total_base_held = Decimal::ZERO;
        self.total_quote_spent = Decimal::ZERO;
        self.filled_safety_count = 0;
        self.armed_base = Decimal::ZERO;
        self.tp_done.iter_mut().for_each(|d| *d = false);
    }

    /// Owned copy for event consumers; never hands out a live reference.
    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            is_open: self.is_open,
            entry_price: self.entry_price,
            average_price: self.average_price,
            total_base_held: self.total_base_held,
            total_quote_spent: self.total_quote_spent,
            filled_safety_count: self.filled_safety_count,
            tp_done: self.tp_done.clone(),
            realized_pnl: self.realized_pnl,
            cycles_closed: self.cycles_closed,
        }
    }
}

/// Immutable copy of the ledger pushed through the event sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub is_open: bool,
    pub entry_price: Decimal,
    pub average_price: Decimal,
    pub total_base_held: Decimal,
    pub total_quote_spent: Decimal,
    pub filled_safety_count: u32,
    pub tp_done: Vec<bool>,
    pub realized_pnl: Decimal,
    pub cycles_closed: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn open_at(ledger: &mut PositionLedger, price: Decimal, quote: Decimal) {
        ledger.begin_cycle(price).unwrap();
        ledger.apply_buy_fill(quote / price, quote).unwrap();
    }

    #[test]
    fn average_tracks_quote_over_base() {
        let mut ledger = PositionLedger::new(1);
        open_at(&mut ledger, dec!(100), dec!(10));
        assert!(ledger.is_open());
        assert_eq!(ledger.average_price(), dec!(100));

        // Safety fill at 98 lowers the average (scenario A numbers).
        let qty = dec!(10) / dec!(98);
        ledger.apply_buy_fill(qty, dec!(10)).unwrap();
        ledger.note_safety_fill();

        let expected_base = dec!(10) / dec!(100) + dec!(10) / dec!(98);
        assert_eq!(ledger.total_base_held(), expected_base);
        assert_eq!(ledger.total_quote_spent(), dec!(20));
        assert_eq!(ledger.average_price(), dec!(20) / expected_base);
        assert!(ledger.average_price() < dec!(100));
        assert_eq!(ledger.filled_safety_count(), 1);
    }

    #[test]
    fn buy_fill_rearms_exit_plan() {
        let mut ledger = PositionLedger::new(3);
        open_at(&mut ledger, dec!(100), dec!(10));
        ledger.mark_tp_done(0);
        ledger.mark_tp_done(1);
        assert!(ledger.tp_done(0));

        ledger.apply_buy_fill(dec!(0.1), dec!(9.8)).unwrap();
        assert!(!ledger.tp_done(0));
        assert!(!ledger.tp_done(1));
        assert_eq!(ledger.armed_base(), ledger.total_base_held());
    }

    #[test]
    fn exit_realizes_pnl_against_average_cost() {
        let mut ledger = PositionLedger::new(1);
        open_at(&mut ledger, dec!(100), dec!(1000)); // 10 base @ 100
        let pnl = ledger.apply_exit(dec!(10), dec!(101)).unwrap();
        assert_eq!(pnl, dec!(10));
        assert_eq!(ledger.realized_pnl(), dec!(10));
        assert_eq!(ledger.total_base_held(), Decimal::ZERO);
        assert_eq!(ledger.total_quote_spent(), Decimal::ZERO);
    }

    #[test]
    fn settle_full_exit_resets_and_counts_cycle() {
        let mut ledger = PositionLedger::new(1);
        open_at(&mut ledger, dec!(100), dec!(50));
        let pnl = ledger.settle_full_exit(dec!(51)).unwrap();
        assert_eq!(pnl, dec!(1));
        assert!(!ledger.is_open());
        assert_eq!(ledger.cycles_closed(), 1);
        assert_eq!(ledger.realized_pnl(), dec!(1));
        assert_eq!(ledger.total_base_held(), Decimal::ZERO);
        assert_eq!(ledger.filled_safety_count(), 0);
    }

    #[test]
    fn realized_pnl_survives_cycle_close() {
        let mut ledger = PositionLedger::new(1);
        open_at(&mut ledger, dec!(100), dec!(50));
        ledger.settle_full_exit(dec!(52)).unwrap();
        open_at(&mut ledger, dec!(90), dec!(50));
        ledger.settle_full_exit(dec!(51)).unwrap();
        assert_eq!(ledger.realized_pnl(), dec!(3));
        assert_eq!(ledger.cycles_closed(), 2);
    }

    #[test]
    fn rejects_double_open_and_bad_mutations() {
        let mut ledger = PositionLedger::new(1);
        open_at(&mut ledger, dec!(100), dec!(10));
        assert!(ledger.begin_cycle(dec!(99)).is_err());
        assert!(ledger.apply_buy_fill(Decimal::ZERO, dec!(1)).is_err());
        assert!(ledger.apply_exit(dec!(999), dec!(101)).is_err());

        let mut closed = PositionLedger::new(1);
        assert!(closed.apply_exit(dec!(1), dec!(101)).is_err());
        assert!(closed.settle_full_exit(dec!(1)).is_err());
    }

    #[test]
    fn snapshot_is_a_detached_copy() {
        let mut ledger = PositionLedger::new(2);
        open_at(&mut ledger, dec!(100), dec!(10));
        let snap = ledger.snapshot();
        ledger.settle_full_exit(dec!(11)).unwrap();
        assert!(snap.is_open);
        assert_eq!(snap.total_quote_spent, dec!(10));
        assert!(!ledger.is_open());
    }
}
