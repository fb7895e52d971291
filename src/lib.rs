//! Martingale-style DCA position engine for MEXC spot markets.
//!
//! One position cycle at a time: an entry buy, a ladder of safety buys at
//! fixed drops below entry, and a take-profit plan over the average price.
//! The same lifecycle runs with simulated fills ([`engine::SimEngine`]) or
//! real limit orders reconciled by polling ([`engine::LiveEngine`]).

pub mod adapters;
pub mod cli;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod indicators;

pub use config::AppConfig;
pub use error::{GatewayError, MartiError, Result};
