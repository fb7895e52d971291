//! Live execution engine.
//!
//! Places real limit orders through an [`ExchangeGateway`] and reconciles
//! them by polling order status once per tick. The whole safety ladder is
//! placed up front; the take-profit order is cancelled and re-placed for the
//! full held quantity after every buy fill.
//!
//! Gateway failures on individual status checks are logged and retried on
//! the next tick; they never abort the pass, so one unreachable order cannot
//! block settlement of another.

use std::collections::HashSet;
use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{error, warn};

use crate::config::{SafetyLevel, StrategyParams};
use crate::domain::{LedgerSnapshot, OrderStatus, PositionLedger, SymbolFilters};
use crate::engine::events::EventBus;
use crate::error::{MartiError, Result};
use crate::exchange::ExchangeGateway;

pub struct LiveEngine<G: ExchangeGateway> {
    gateway: Arc<G>,
    params: StrategyParams,
    ladder: Vec<SafetyLevel>,
    /// Percent over the average price of the single full-quantity exit.
    tp_percent: Decimal,
    ledger: PositionLedger,
    events: EventBus,
    running: bool,
    filters: Option<SymbolFilters>,
    entry_order: Option<String>,
    /// Safety orders still resting on the book.
    safety_orders: Vec<String>,
    tp_order: Option<String>,
    /// Order ids whose fill has already been credited to the ledger.
    counted_fills: HashSet<String>,
}

impl<G: ExchangeGateway> LiveEngine<G> {
    /// Live mode keeps exactly one resting exit order, so only a single
    /// full-quantity take-profit plan is accepted.
    pub fn new(gateway: Arc<G>, params: StrategyParams, events: EventBus) -> Result<Self> {
        params
            .validate()
            .map_err(|errors| MartiError::Validation(errors.join("; ")))?;
        let tp_percent = params.take_profit.single_percent().ok_or_else(|| {
            MartiError::Validation(
                "live mode requires a single full-quantity take-profit level".into(),
            )
        })?;
        let ladder = params.safety.levels();
        Ok(Self {
            gateway,
            params,
            ladder,
            tp_percent,
            ledger: PositionLedger::new(1),
            events,
            running: false,
            filters: None,
            entry_order: None,
            safety_orders: Vec::new(),
            tp_order: None,
            counted_fills: HashSet::new(),
        })
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

    /// Fetch filters, verify funding, then place the entry order and the
    /// whole safety ladder. The engine only starts running when every
    /// placement succeeded.
    pub async fn start(&mut self, clean_start: bool) -> Result<()> {
        let symbol = self.params.symbol.clone();
        self.events.emit(format!("live engine starting on {symbol}"));

        let filters = self.gateway.get_exchange_filters(&symbol).await?;
        self.filters = Some(filters);

        let balances = self.gateway.get_account_balances().await?;
        let available = balances
            .get(&self.params.quote_asset)
            .copied()
            .unwrap_or_default();
        let required = self.params.required_quote();
        if available < required {
            return Err(MartiError::InsufficientFunds {
                asset: self.params.quote_asset.clone(),
                required,
                available,
            });
        }

        if clean_start {
            let cancelled = self.gateway.cancel_all_orders(&symbol).await?;
            if cancelled > 0 {
                self.events
                    .emit(format!("clean start: cancelled {cancelled} open orders"));
            }
        }

        let price = self.gateway.get_price(&symbol).await?;
        let entry_price = filters.round_price(price);
        if entry_price <= Decimal::ZERO {
            return Err(MartiError::Validation(format!(
                "price {price} rounds below the tick size"
            )));
        }
        let entry_qty = filters.round_qty(self.params.base_order_value / entry_price);
        if entry_qty <= Decimal::ZERO {
            return Err(MartiError::Validation(format!(
                "base order value {} rounds below the lot size at price {entry_price}",
                self.params.base_order_value
            )));
        }
        self.ledger.begin_cycle(entry_price)?;
        let ack = self
            .gateway
            .place_limit_buy(&symbol, entry_price, entry_qty)
            .await?;
        self.events.emit(format!(
            "entry order {} placed at {entry_price} for {entry_qty}",
            ack.order_id
        ));
        self.entry_order = Some(ack.order_id);

        for (idx, level) in self.ladder.clone().into_iter().enumerate() {
            let safety_price = filters
                .round_price(entry_price * (Decimal::ONE - level.drop_percent / dec!(100)));
            if safety_price <= Decimal::ZERO {
                warn!(level = idx + 1, "safety price rounds to zero, level skipped");
                continue;
            }
            let qty = filters.round_qty(level.order_value / safety_price);
            if qty <= Decimal::ZERO {
                warn!(level = idx + 1, "safety quantity rounds to zero, level skipped");
                self.events.emit(format!(
                    "safety order {} skipped: rounds below the lot size",
                    idx + 1
                ));
                continue;
            }
            let ack = self
                .gateway
                .place_limit_buy(&symbol, safety_price, qty)
                .await?;
            self.events.emit(format!(
                "safety order {} ({}) placed at {safety_price} for {qty}",
                idx + 1,
                ack.order_id
            ));
            self.safety_orders.push(ack.order_id);
        }

        self.running = true;
        Ok(())
    }

    pub async fn stop(&mut self, cancel_open: bool) {
        self.running = false;
        if cancel_open {
            match self.gateway.cancel_all_orders(&self.params.symbol).await {
                Ok(count) => self
                    .events
                    .emit(format!("engine stopped, cancelled {count} open orders")),
                Err(err) => {
                    warn!(error = %err, "failed to cancel open orders on stop");
                    self.events
                        .emit(format!("engine stopped, cancel failed: {err}"));
                }
            }
            self.entry_order = None;
            self.safety_orders.clear();
            self.tp_order = None;
        } else {
            self.events.emit("engine stopped, orders left resting");
        }
    }

    /// Cancel every open order for the symbol and forget the tracked ids.
    /// The ledger keeps whatever was already filled.
    pub async fn cancel_all(&mut self) -> Result<usize> {
        let count = self.gateway.cancel_all_orders(&self.params.symbol).await?;
        self.entry_order = None;
        self.safety_orders.clear();
        self.tp_order = None;
        self.events.emit(format!("cancelled {count} open orders"));
        Ok(count)
    }

    /// One reconciliation pass: entry, then safety ladder, then take-profit.
    /// Buys are credited with the exchange-reported executed amounts, never
    /// the requested ones.
    pub async fn on_tick(&mut self, auto_restart: bool) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        self.poll_entry().await?;
        if self.poll_safety().await? {
            self.replace_tp().await?;
        }
        self.poll_tp(auto_restart).await?;
        Ok(())
    }

    async fn poll_entry(&mut self) -> Result<()> {
        let Some(order_id) = self.entry_order.clone() else {
            return Ok(());
        };
        let report = match self.gateway.get_order(&self.params.symbol, &order_id).await {
            Ok(report) => report,
            Err(err) if err.is_recoverable() => {
                warn!(%order_id, error = %err, "entry status check failed, will retry");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        if !report.status.is_terminal() {
            return Ok(());
        }

        self.entry_order = None;
        if report.executed_qty > Decimal::ZERO && self.counted_fills.insert(order_id.clone()) {
            self.ledger
                .apply_buy_fill(report.executed_qty, report.executed_quote)?;
            self.events.emit(format!(
                "entry order {order_id} {}: {} filled at average {}",
                report.status,
                report.executed_qty,
                self.ledger.average_price()
            ));
            self.events.push_snapshot(self.ledger.snapshot());
            self.replace_tp().await?;
        }
        if report.status != OrderStatus::Filled && !self.ledger.is_open() {
            self.events.emit(format!(
                "entry order {order_id} {} before any fill, engine stopped",
                report.status
            ));
            self.running = false;
        }
        Ok(())
    }

    /// Poll every resting safety order. Returns whether any buy was credited
    /// (meaning the take-profit must be re-placed).
    async fn poll_safety(&mut self) -> Result<bool> {
        let mut credited = false;
        let mut settled: HashSet<String> = HashSet::new();
        let mut hard_error = None;

        for order_id in self.safety_orders.clone() {
            let report = match self.gateway.get_order(&self.params.symbol, &order_id).await {
                Ok(report) => report,
                Err(err) if err.is_recoverable() => {
                    warn!(%order_id, error = %err, "safety status check failed, will retry");
                    continue;
                }
                Err(err) => {
                    hard_error = Some(err);
                    break;
                }
            };
            if !report.status.is_terminal() {
                continue;
            }
            settled.insert(order_id.clone());

            if report.executed_qty > Decimal::ZERO && self.counted_fills.insert(order_id.clone())
            {
                match self
                    .ledger
                    .apply_buy_fill(report.executed_qty, report.executed_quote)
                {
                    Ok(()) => {
                        credited = true;
                        // A cancelled order with a partial fill still moves
                        // the average, but does not consume a ladder level.
                        if report.status == OrderStatus::Filled {
                            self.ledger.note_safety_fill();
                        }
                        self.events.emit(format!(
                            "safety order {order_id} {}: {} filled, average {}",
                            report.status,
                            report.executed_qty,
                            self.ledger.average_price()
                        ));
                        self.events.push_snapshot(self.ledger.snapshot());
                    }
                    Err(err) => {
                        hard_error = Some(err);
                        break;
                    }
                }
            } else if report.status != OrderStatus::Filled {
                self.events
                    .emit(format!("safety order {order_id} {}", report.status));
            }
        }

        self.safety_orders.retain(|id| !settled.contains(id));
        match hard_error {
            Some(err) => Err(err),
            None => Ok(credited),
        }
    }

    async fn poll_tp(&mut self, auto_restart: bool) -> Result<()> {
        if !self.ledger.is_open() {
            return Ok(());
        }
        let Some(order_id) = self.tp_order.clone() else {
            // The resting exit went missing (failed placement, manual
            // cancel); put it back while the position is open.
            return self.replace_tp().await;
        };
        let report = match self.gateway.get_order(&self.params.symbol, &order_id).await {
            Ok(report) => report,
            Err(err) if err.is_recoverable() => {
                warn!(%order_id, error = %err, "take-profit status check failed, will retry");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        match report.status {
            OrderStatus::Filled => {
                let pnl = self.ledger.settle_full_exit(report.executed_quote)?;
                self.events.emit(format!(
                    "take-profit {order_id} filled for {}, realized pnl {pnl}",
                    report.executed_quote
                ));
                self.events.push_snapshot(self.ledger.snapshot());
                self.cancel_outstanding().await;
                self.tp_order = None;
                self.counted_fills.clear();
                if auto_restart {
                    self.events.emit("auto-restart: opening the next cycle");
                    if let Err(err) = self.start(false).await {
                        error!(error = %err, "auto-restart failed, engine stopped");
                        self.events.emit(format!("auto-restart failed: {err}"));
                        self.running = false;
                    }
                } else {
                    self.events.emit("cycle complete, engine stopped");
                    self.running = false;
                }
            }
            status if status.is_terminal() => {
                self.events
                    .emit(format!("take-profit {order_id} {status}, re-placing"));
                self.tp_order = None;
                self.replace_tp().await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Cancel any previous exit order and place one for the full held
    /// quantity at average * (1 + tp_percent / 100). Placement failures are
    /// retried on the next tick.
    async fn replace_tp(&mut self) -> Result<()> {
        if let Some(old_id) = self.tp_order.take() {
            if let Err(err) = self.gateway.cancel_order(&self.params.symbol, &old_id).await {
                warn!(order_id = %old_id, error = %err, "failed to cancel previous take-profit");
            }
        }
        if !self.ledger.is_open() {
            return Ok(());
        }

        let filters = self.filters()?;
        let target = filters.round_price(
            self.ledger.average_price() * (Decimal::ONE + self.tp_percent / dec!(100)),
        );
        let qty = filters.round_qty(self.ledger.total_base_held());
        if target <= Decimal::ZERO || qty <= Decimal::ZERO {
            warn!(%target, %qty, "take-profit rounds to zero, not placed");
            return Ok(());
        }

        match self
            .gateway
            .place_limit_sell(&self.params.symbol, target, qty)
            .await
        {
            Ok(ack) => {
                self.events.emit(format!(
                    "take-profit {} placed at {target} for {qty}",
                    ack.order_id
                ));
                self.tp_order = Some(ack.order_id);
            }
            Err(err) if err.is_recoverable() => {
                warn!(error = %err, "take-profit placement failed, will retry");
                self.events
                    .emit(format!("take-profit placement failed: {err}"));
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    /// Best-effort cancel of the orders still resting after a full exit.
    async fn cancel_outstanding(&mut self) {
        for order_id in std::mem::take(&mut self.safety_orders) {
            if let Err(err) = self
                .gateway
                .cancel_order(&self.params.symbol, &order_id)
                .await
            {
                warn!(%order_id, error = %err, "failed to cancel resting safety order");
            }
        }
        if let Some(order_id) = self.entry_order.take() {
            if let Err(err) = self
                .gateway
                .cancel_order(&self.params.symbol, &order_id)
                .await
            {
                warn!(%order_id, error = %err, "failed to cancel resting entry order");
            }
        }
    }

    fn filters(&self) -> Result<SymbolFilters> {
        self.filters
            .ok_or_else(|| MartiError::Invariant("exchange filters not loaded".into()))
    }
}
