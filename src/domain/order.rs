use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Order status as reported by the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Order accepted, resting on the book
    New,
    /// Order partially filled
    PartiallyFilled,
    /// Order fully filled
    Filled,
    /// Order cancelled
    Cancelled,
    /// Order rejected by the exchange
    Rejected,
    /// Order expired
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, OrderStatus::New | OrderStatus::PartiallyFilled)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::New => "NEW",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Expired => "EXPIRED",
        };
        write!(f, "{s}")
    }
}

impl FromStr for OrderStatus {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "NEW" => Ok(Self::New),
            "PARTIALLY_FILLED" => Ok(Self::PartiallyFilled),
            "FILLED" => Ok(Self::Filled),
            "CANCELED" | "CANCELLED" | "PARTIALLY_CANCELED" => Ok(Self::Cancelled),
            "REJECTED" => Ok(Self::Rejected),
            "EXPIRED" => Ok(Self::Expired),
            _ => Err("unknown order status"),
        }
    }
}

/// Acknowledgement returned when a limit order is placed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub status: OrderStatus,
}

/// Order state returned by a status query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderReport {
    pub status: OrderStatus,
    /// Base quantity actually executed so far
    pub executed_qty: Decimal,
    /// Quote amount actually spent/received so far
    pub executed_quote: Decimal,
}

/// Price and quantity granularity for a symbol
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SymbolFilters {
    pub price_step: Decimal,
    pub qty_step: Decimal,
}

impl SymbolFilters {
    /// Round a price down to the nearest multiple of the price step.
    pub fn round_price(&self, price: Decimal) -> Decimal {
        floor_to_step(price, self.price_step)
    }

    /// Round a quantity down to the nearest multiple of the quantity step.
    pub fn round_qty(&self, qty: Decimal) -> Decimal {
        floor_to_step(qty, self.qty_step)
    }
}

/// Floor to an exact multiple of `step`; never rounds up, so placed orders
/// never exceed declared capital or required price levels.
fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    (value / step).floor() * step
}
