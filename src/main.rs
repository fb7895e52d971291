use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use marti::adapters::MexcClient;
use marti::cli::{Cli, Commands};
use marti::config::AppConfig;
use marti::engine::{
    run_live, run_sim, EngineEvent, EventBus, LiveEngine, ShutdownSignal, SimEngine,
};
use marti::exchange::ExchangeGateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config =
        AppConfig::load_from(&cli.config_dir).context("failed to load configuration")?;
    init_logging(&config.logging.level)?;

    match cli.command {
        Commands::Live {
            clean_start,
            auto_restart,
            cancel_on_stop,
        } => {
            config.validate()?;
            let mut execution = config.execution.clone();
            execution.clean_start |= clean_start;
            execution.auto_restart |= auto_restart;
            execution.cancel_on_stop |= cancel_on_stop;

            let events = EventBus::default();
            spawn_event_logger(&events);
            let gateway = Arc::new(MexcClient::from_env(&config.gateway)?);
            let engine = LiveEngine::new(gateway, config.strategy.clone(), events)?;

            let shutdown = ShutdownSignal::new();
            let watcher = shutdown.watcher();
            spawn_interrupt_handler(shutdown);
            run_live(engine, execution, watcher).await?;
        }
        Commands::Sim => {
            config.validate()?;
            let events = EventBus::default();
            spawn_event_logger(&events);
            let gateway = Arc::new(MexcClient::public(&config.gateway)?);
            let engine = SimEngine::new(config.strategy.clone(), events)?;

            let shutdown = ShutdownSignal::new();
            let watcher = shutdown.watcher();
            spawn_interrupt_handler(shutdown);
            run_sim(engine, gateway, watcher).await?;
        }
        Commands::Price { symbol } => {
            let gateway = MexcClient::public(&config.gateway)?;
            let price = gateway.get_price(&symbol).await?;
            println!("{symbol}: {price}");
        }
        Commands::Balances => {
            let gateway = MexcClient::from_env(&config.gateway)?;
            let mut balances: Vec<_> = gateway.get_account_balances().await?.into_iter().collect();
            balances.sort_by(|a, b| a.0.cmp(&b.0));
            for (asset, free) in balances {
                if free > rust_decimal::Decimal::ZERO {
                    println!("{asset}: {free}");
                }
            }
        }
        Commands::CancelAll { symbol } => {
            let gateway = MexcClient::from_env(&config.gateway)?;
            let count = gateway.cancel_all_orders(&symbol).await?;
            println!("cancelled {count} open orders on {symbol}");
        }
    }

    Ok(())
}

/// Console logging always; a daily rolling file too when `MARTI_LOG_DIR` is
/// set. `RUST_LOG` overrides the configured level.
fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter).with(fmt::layer());

    if let Ok(dir) = std::env::var("MARTI_LOG_DIR") {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create log directory {dir}"))?;
        let appender = tracing_appender::rolling::daily(&dir, "marti.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        // Keep the flush guard alive for the whole process.
        Box::leak(Box::new(guard));
        registry
            .with(fmt::layer().with_ansi(false).with_writer(writer))
            .init();
    } else {
        registry.init();
    }
    Ok(())
}

fn spawn_event_logger(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(EngineEvent::Message(message)) => info!("{message}"),
                Ok(EngineEvent::Snapshot(snapshot)) => info!(
                    open = snapshot.is_open,
                    average = %snapshot.average_price,
                    held = %snapshot.total_base_held,
                    realized_pnl = %snapshot.realized_pnl,
                    cycles = snapshot.cycles_closed,
                    "ledger"
                ),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event consumer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn spawn_interrupt_handler(shutdown: ShutdownSignal) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping after the current tick");
            shutdown.trigger();
        }
    });
}
