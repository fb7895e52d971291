pub mod ledger;
pub mod order;

pub use ledger::{LedgerSnapshot, PositionLedger};
pub use order::{OrderAck, OrderReport, OrderSide, OrderStatus, SymbolFilters};
