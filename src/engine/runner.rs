//! Tick loops driving the engines at a fixed cadence.
//!
//! A stop request is honored at the start of the next tick; a tick that has
//! begun always runs to completion so the ledger never observes half a pass.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::config::{ExecutionConfig, StrategyParams};
use crate::engine::{LiveEngine, SimEngine};
use crate::error::Result;
use crate::exchange::ExchangeGateway;
use crate::indicators::rsi;

/// Stop flag for the tick loops. The holder triggers it once; every watcher
/// observes it at its next tick boundary.
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn watcher(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Drive the simulated engine: poll the price, open a cycle whenever none is
/// open (behind the optional RSI gate), then evaluate the tick.
pub async fn run_sim<G: ExchangeGateway>(
    mut engine: SimEngine,
    gateway: Arc<G>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    engine.start();
    let params = engine.params().clone();
    let mut ticker = interval(Duration::from_secs(params.poll_interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let price = match gateway.get_price(&params.symbol).await {
                    Ok(price) => price,
                    Err(err) => {
                        warn!(error = %err, "price fetch failed, tick skipped");
                        continue;
                    }
                };
                if !engine.has_position() {
                    if entry_allowed(gateway.as_ref(), &params).await {
                        engine.open_position(price)?;
                    }
                } else {
                    engine.on_tick(price)?;
                }
            }
        }
    }

    engine.stop();
    info!("simulated loop finished");
    Ok(())
}

/// Drive the live engine's reconciliation loop until it stops itself or a
/// shutdown is requested.
pub async fn run_live<G: ExchangeGateway>(
    mut engine: LiveEngine<G>,
    execution: ExecutionConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    engine.start(execution.clean_start).await?;
    let mut ticker = interval(Duration::from_secs(engine.params().poll_interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if !engine.is_running() {
                    info!("live engine stopped, loop exiting");
                    return Ok(());
                }
                if let Err(err) = engine.on_tick(execution.auto_restart).await {
                    engine.stop(execution.cancel_on_stop).await;
                    return Err(err);
                }
            }
        }
    }

    engine.stop(execution.cancel_on_stop).await;
    info!("live loop finished");
    Ok(())
}

/// Evaluate the optional RSI entry gate. An entry is allowed when the filter
/// is disabled or the RSI sits below the configured threshold; any failure
/// to evaluate blocks the entry rather than trading blind.
async fn entry_allowed<G: ExchangeGateway>(gateway: &G, params: &StrategyParams) -> bool {
    let filter = &params.entry_filter;
    if !filter.enabled {
        return true;
    }
    let limit = (filter.period + 1).max(100) as u32;
    let closes = match gateway
        .get_klines(&params.symbol, &filter.interval, limit)
        .await
    {
        Ok(closes) => closes,
        Err(err) => {
            warn!(error = %err, "kline fetch failed, entry skipped");
            return false;
        }
    };
    match rsi(&closes, filter.period) {
        Ok(value) => {
            let allowed = value < Decimal::from(filter.rsi_threshold);
            info!(rsi = %value, threshold = filter.rsi_threshold, allowed, "entry filter evaluated");
            allowed
        }
        Err(err) => {
            warn!(error = %err, "RSI evaluation failed, entry skipped");
            false
        }
    }
}
