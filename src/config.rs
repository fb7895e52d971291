use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::path::Path;

use crate::error::{MartiError, Result};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub strategy: StrategyParams,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Immutable description of one strategy instance, supplied once at engine
/// construction.
#[derive(Debug, Clone, Deserialize)]
pub struct StrategyParams {
    /// Traded pair, e.g. "BTCUSDT"
    pub symbol: String,
    /// Asset backing the ladder; checked against the account balance
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,
    /// Quote amount committed to the initial entry
    pub base_order_value: Decimal,
    pub safety: SafetyLadderConfig,
    pub take_profit: TakeProfitConfig,
    #[serde(default)]
    pub entry_filter: EntryFilterConfig,
    /// Reconciliation loop cadence
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_quote_asset() -> String {
    "USDT".to_string()
}

fn default_poll_interval() -> u64 {
    5
}

/// Safety-order ladder. Two schemas observed across iterations of the
/// strategy are accepted and normalized to the same level list:
/// a constant value-and-step ladder, or explicit per-level orders.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SafetyLadderConfig {
    Uniform {
        /// Quote amount committed per safety order
        order_value: Decimal,
        /// Price drop per level, percent of entry; level n triggers at
        /// entry * (1 - n * step_percent / 100)
        step_percent: Decimal,
        max_count: u32,
    },
    Explicit {
        orders: Vec<SafetyOrderSpec>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct SafetyOrderSpec {
    pub order_value: Decimal,
    /// Additional drop below the previous level, percent of entry
    pub step_percent: Decimal,
}

/// One normalized ladder level. `drop_percent` is cumulative below entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetyLevel {
    pub order_value: Decimal,
    pub drop_percent: Decimal,
}

impl SafetyLadderConfig {
    pub fn levels(&self) -> Vec<SafetyLevel> {
        match self {
            SafetyLadderConfig::Uniform {
                order_value,
                step_percent,
                max_count,
            } => (1..=*max_count)
                .map(|n| SafetyLevel {
                    order_value: *order_value,
                    drop_percent: Decimal::from(n) * *step_percent,
                })
                .collect(),
            SafetyLadderConfig::Explicit { orders } => {
                let mut drop = Decimal::ZERO;
                orders
                    .iter()
                    .map(|spec| {
                        drop += spec.step_percent;
                        SafetyLevel {
                            order_value: spec.order_value,
                            drop_percent: drop,
                        }
                    })
                    .collect()
            }
        }
    }

    pub fn level_count(&self) -> u32 {
        match self {
            SafetyLadderConfig::Uniform { max_count, .. } => *max_count,
            SafetyLadderConfig::Explicit { orders } => orders.len() as u32,
        }
    }

    /// Total quote amount the ladder can commit.
    pub fn total_value(&self) -> Decimal {
        match self {
            SafetyLadderConfig::Uniform {
                order_value,
                max_count,
                ..
            } => *order_value * Decimal::from(*max_count),
            SafetyLadderConfig::Explicit { orders } => {
                orders.iter().map(|o| o.order_value).sum()
            }
        }
    }
}

/// Exit plan: one target over the average, or up to three tiered tranches.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TakeProfitConfig {
    Tiered { levels: Vec<TpLevel> },
    Single { percent: Decimal },
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct TpLevel {
    /// Gain over the average price at which the tranche triggers, percent
    pub percent: Decimal,
    /// Share of the armed quantity to liquidate, percent
    pub share_percent: Decimal,
}

impl TakeProfitConfig {
    pub fn levels(&self) -> Vec<TpLevel> {
        match self {
            TakeProfitConfig::Single { percent } => vec![TpLevel {
                percent: *percent,
                share_percent: dec!(100),
            }],
            TakeProfitConfig::Tiered { levels } => levels.clone(),
        }
    }

    /// The percent of a single full-quantity exit, if this plan is one.
    /// Live mode maintains one outstanding take-profit order and only
    /// accepts this shape.
    pub fn single_percent(&self) -> Option<Decimal> {
        match self {
            TakeProfitConfig::Single { percent } => Some(*percent),
            TakeProfitConfig::Tiered { levels } => match levels.as_slice() {
                [only] if only.share_percent == dec!(100) => Some(only.percent),
                _ => None,
            },
        }
    }
}

/// Optional RSI gate for simulated entries.
#[derive(Debug, Clone, Deserialize)]
pub struct EntryFilterConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_rsi_threshold")]
    pub rsi_threshold: u32,
    #[serde(default = "default_rsi_interval")]
    pub interval: String,
    #[serde(default = "default_rsi_period")]
    pub period: usize,
}

fn default_rsi_threshold() -> u32 {
    30
}

fn default_rsi_interval() -> String {
    "15m".to_string()
}

fn default_rsi_period() -> usize {
    14
}

impl Default for EntryFilterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rsi_threshold: default_rsi_threshold(),
            interval: default_rsi_interval(),
            period: default_rsi_period(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Cancel all open orders for the symbol before placing the entry
    #[serde(default)]
    pub clean_start: bool,
    /// Begin a fresh cycle immediately after the take-profit fills
    #[serde(default)]
    pub auto_restart: bool,
    /// Cancel open orders when the loop is stopped
    #[serde(default)]
    pub cancel_on_stop: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            clean_start: false,
            auto_restart: false,
            cancel_on_stop: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Per-call HTTP timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.mexc.com".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Tolerance for the tiered-share sum check.
const SHARE_SUM_TOLERANCE: Decimal = dec!(0.01);

impl StrategyParams {
    /// Quote balance required to fund the entry plus the whole ladder.
    pub fn required_quote(&self) -> Decimal {
        self.base_order_value + self.safety.total_value()
    }

    /// Validate parameter values, collecting every problem found.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.symbol.trim().is_empty() {
            errors.push("symbol must not be empty".to_string());
        }
        if self.base_order_value <= Decimal::ZERO {
            errors.push("base_order_value must be positive".to_string());
        }

        for (idx, level) in self.safety.levels().iter().enumerate() {
            if level.order_value <= Decimal::ZERO {
                errors.push(format!("safety level {}: order_value must be positive", idx + 1));
            }
        }
        match &self.safety {
            SafetyLadderConfig::Uniform { step_percent, .. } => {
                if *step_percent <= Decimal::ZERO {
                    errors.push("safety step_percent must be positive".to_string());
                }
            }
            SafetyLadderConfig::Explicit { orders } => {
                for (idx, spec) in orders.iter().enumerate() {
                    if spec.step_percent <= Decimal::ZERO {
                        errors.push(format!(
                            "safety level {}: step_percent must be positive",
                            idx + 1
                        ));
                    }
                }
            }
        }

        let tp_levels = self.take_profit.levels();
        if tp_levels.is_empty() || tp_levels.len() > 3 {
            errors.push("take_profit must define between 1 and 3 levels".to_string());
        }
        let mut share_sum = Decimal::ZERO;
        for (idx, level) in tp_levels.iter().enumerate() {
            if level.percent <= Decimal::ZERO {
                errors.push(format!("take_profit level {}: percent must be positive", idx + 1));
            }
            if level.share_percent < Decimal::ZERO {
                errors.push(format!(
                    "take_profit level {}: share_percent must not be negative",
                    idx + 1
                ));
            }
            share_sum += level.share_percent;
        }
        // Levels with a zero share are treated as already satisfied, so only
        // the shares actually used must cover the position.
        if !tp_levels.is_empty() && (share_sum - dec!(100)).abs() > SHARE_SUM_TOLERANCE {
            errors.push(format!(
                "take_profit shares must sum to 100 (got {share_sum})"
            ));
        }

        if self.entry_filter.enabled {
            if !(1..=99).contains(&self.entry_filter.rsi_threshold) {
                errors.push("entry_filter rsi_threshold must be within 1..=99".to_string());
            }
            if self.entry_filter.period < 2 {
                errors.push("entry_filter period must be at least 2".to_string());
            }
        }

        if self.poll_interval_secs == 0 {
            errors.push("poll_interval_secs must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> std::result::Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(
                File::from(config_dir.join(
                    std::env::var("MARTI_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (MARTI_STRATEGY__SYMBOL, etc.)
            .add_source(
                Environment::with_prefix("MARTI")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate the whole configuration, surfacing every problem at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if let Err(mut strategy_errors) = self.strategy.validate() {
            errors.append(&mut strategy_errors);
        }
        if self.gateway.timeout_secs == 0 {
            errors.push("gateway timeout_secs must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(MartiError::Validation(errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_params() -> StrategyParams {
        StrategyParams {
            symbol: "BTCUSDT".into(),
            quote_asset: default_quote_asset(),
            base_order_value: dec!(10),
            safety: SafetyLadderConfig::Uniform {
                order_value: dec!(10),
                step_percent: dec!(2),
                max_count: 3,
            },
            take_profit: TakeProfitConfig::Single { percent: dec!(1) },
            entry_filter: EntryFilterConfig::default(),
            poll_interval_secs: 5,
        }
    }

    #[test]
    fn uniform_ladder_drops_compound_per_level() {
        let params = uniform_params();
        let levels = params.safety.levels();
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[0].drop_percent, dec!(2));
        assert_eq!(levels[1].drop_percent, dec!(4));
        assert_eq!(levels[2].drop_percent, dec!(6));
        assert!(levels.iter().all(|l| l.order_value == dec!(10)));
    }

    #[test]
    fn explicit_ladder_accumulates_steps() {
        let safety = SafetyLadderConfig::Explicit {
            orders: vec![
                SafetyOrderSpec {
                    order_value: dec!(10),
                    step_percent: dec!(1.5),
                },
                SafetyOrderSpec {
                    order_value: dec!(20),
                    step_percent: dec!(2.5),
                },
            ],
        };
        let levels = safety.levels();
        assert_eq!(levels[0].drop_percent, dec!(1.5));
        assert_eq!(levels[1].drop_percent, dec!(4.0));
        assert_eq!(safety.total_value(), dec!(30));
    }

    #[test]
    fn single_take_profit_normalizes_to_full_share() {
        let tp = TakeProfitConfig::Single { percent: dec!(1.5) };
        let levels = tp.levels();
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].share_percent, dec!(100));
        assert_eq!(tp.single_percent(), Some(dec!(1.5)));
    }

    #[test]
    fn tiered_plan_is_not_single() {
        let tp = TakeProfitConfig::Tiered {
            levels: vec![
                TpLevel {
                    percent: dec!(1),
                    share_percent: dec!(30),
                },
                TpLevel {
                    percent: dec!(2),
                    share_percent: dec!(70),
                },
            ],
        };
        assert_eq!(tp.single_percent(), None);
    }

    #[test]
    fn share_sum_validation() {
        let mut params = uniform_params();
        params.take_profit = TakeProfitConfig::Tiered {
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
        assert!(params.validate().is_ok());

        params.take_profit = TakeProfitConfig::Tiered {
            levels: vec![
                TpLevel {
                    percent: dec!(1),
                    share_percent: dec!(30),
                },
                TpLevel {
                    percent: dec!(2),
                    share_percent: dec!(30),
                },
            ],
        };
        let errors = params.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("sum to 100")));
    }

    #[test]
    fn zero_share_levels_are_allowed() {
        let mut params = uniform_params();
        params.take_profit = TakeProfitConfig::Tiered {
            levels: vec![
                TpLevel {
                    percent: dec!(1),
                    share_percent: dec!(100),
                },
                TpLevel {
                    percent: dec!(2),
                    share_percent: dec!(0),
                },
            ],
        };
        assert!(params.validate().is_ok());
    }

    #[test]
    fn rejects_nonpositive_amounts() {
        let mut params = uniform_params();
        params.base_order_value = Decimal::ZERO;
        params.poll_interval_secs = 0;
        let errors = params.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("base_order_value")));
        assert!(errors.iter().any(|e| e.contains("poll_interval_secs")));
    }

    #[test]
    fn required_quote_covers_entry_plus_ladder() {
        let params = uniform_params();
        assert_eq!(params.required_quote(), dec!(40));
    }

    #[test]
    fn both_ladder_shapes_deserialize_from_toml() {
        let uniform: StrategyParams = toml::from_str(
            r#"
            symbol = "BTCUSDT"
            base_order_value = "10"
            poll_interval_secs = 5

            [safety]
            order_value = "10"
            step_percent = "2"
            max_count = 3

            [take_profit]
            percent = "1"
            "#,
        )
        .expect("uniform shape should deserialize");
        assert_eq!(uniform.safety.level_count(), 3);
        assert!(uniform.take_profit.single_percent().is_some());

        let explicit: StrategyParams = toml::from_str(
            r#"
            symbol = "ETHUSDT"
            base_order_value = "15"

            [safety]
            orders = [
                { order_value = "10", step_percent = "1" },
                { order_value = "20", step_percent = "2" },
            ]

            [take_profit]
            levels = [
                { percent = "1", share_percent = "30" },
                { percent = "2", share_percent = "70" },
            ]
            "#,
        )
        .expect("explicit shape should deserialize");
        assert_eq!(explicit.safety.level_count(), 2);
        assert_eq!(explicit.take_profit.levels().len(), 2);
        assert_eq!(explicit.poll_interval_secs, 5);
    }
}
