use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::domain::{OrderAck, OrderReport, SymbolFilters};
use crate::error::Result;

/// Exchange operations the engines depend on.
///
/// Every call is synchronous from the engine's perspective: a tick blocks on
/// the network calls it needs, with the per-call timeout owned by the
/// implementation. Implementations translate transport failures into
/// [`crate::error::GatewayError`].
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Last traded price for a symbol.
    async fn get_price(&self, symbol: &str) -> Result<Decimal>;

    /// Price and quantity rounding granularity for a symbol.
    async fn get_exchange_filters(&self, symbol: &str) -> Result<SymbolFilters>;

    /// Free balance per asset.
    async fn get_account_balances(&self) -> Result<HashMap<String, Decimal>>;

    /// Most recent closing prices, oldest first. Used by the entry filter.
    async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Decimal>>;

    async fn place_limit_buy(&self, symbol: &str, price: Decimal, qty: Decimal) -> Result<OrderAck>;

    async fn place_limit_sell(&self, symbol: &str, price: Decimal, qty: Decimal)
        -> Result<OrderAck>;

    async fn get_order(&self, symbol: &str, order_id: &str) -> Result<OrderReport>;

    /// Cancel one order. Callers cancelling best-effort tolerate an `Err`.
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<bool>;

    /// Cancel every open order for the symbol. Individual cancel failures are
    /// swallowed; returns the number of orders actually cancelled. Fails only
    /// when the open-order listing itself cannot be fetched.
    async fn cancel_all_orders(&self, symbol: &str) -> Result<usize>;
}
