use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "marti",
    about = "Martingale-style DCA position engine for MEXC spot markets",
    version
)]
pub struct Cli {
    /// Directory holding default.toml and environment overrides
    #[arg(long, global = true, default_value = "config")]
    pub config_dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the live engine with real orders
    Live {
        /// Cancel all resting orders for the symbol before starting
        #[arg(long)]
        clean_start: bool,
        /// Open a fresh cycle right after the take-profit fills
        #[arg(long)]
        auto_restart: bool,
        /// Cancel resting orders when the loop stops
        #[arg(long)]
        cancel_on_stop: bool,
    },
    /// Run the strategy against the live price feed with simulated fills
    Sim,
    /// Print the last traded price for a symbol
    Price { symbol: String },
    /// Print the non-zero free balances of the account
    Balances,
    /// Cancel every open order for a symbol
    CancelAll { symbol: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_live_with_flags() {
        let cli = Cli::parse_from(["marti", "live", "--clean-start", "--auto-restart"]);
        match cli.command {
            Commands::Live {
                clean_start,
                auto_restart,
                cancel_on_stop,
            } => {
                assert!(clean_start);
                assert!(auto_restart);
                assert!(!cancel_on_stop);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_config_dir_override() {
        let cli = Cli::parse_from(["marti", "--config-dir", "/etc/marti", "sim"]);
        assert_eq!(cli.config_dir, PathBuf::from("/etc/marti"));
        assert!(matches!(cli.command, Commands::Sim));
    }

    #[test]
    fn parses_price_query() {
        let cli = Cli::parse_from(["marti", "price", "ETHUSDT"]);
        match cli.command {
            Commands::Price { symbol } => assert_eq!(symbol, "ETHUSDT"),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
