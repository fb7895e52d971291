//! Relative Strength Index over closing prices, Wilder smoothing.
//!
//! Used only as an optional entry filter for the simulated engine; nothing
//! in the position lifecycle depends on it.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::error::{MartiError, Result};

/// Compute the RSI of `closes` (oldest first) over `period` candles.
///
/// Requires at least `period + 1` closes. Returns 100 when there were no
/// losses over the window.
pub fn rsi(closes: &[Decimal], period: usize) -> Result<Decimal> {
    if period < 2 {
        return Err(MartiError::Validation("RSI period must be at least 2".into()));
    }
    if closes.len() < period + 1 {
        return Err(MartiError::Validation(format!(
            "not enough candles for RSI: need {}, got {}",
            period + 1,
            closes.len()
        )));
    }

    let period_dec = Decimal::from(period as u64);
    let mut avg_gain = Decimal::ZERO;
    let mut avg_loss = Decimal::ZERO;
    for idx in 1..=period {
        let delta = closes[idx] - closes[idx - 1];
        avg_gain += delta.max(Decimal::ZERO);
        avg_loss += (-delta).max(Decimal::ZERO);
    }
    avg_gain /= period_dec;
    avg_loss /= period_dec;

    for idx in (period + 1)..closes.len() {
        let delta = closes[idx] - closes[idx - 1];
        let gain = delta.max(Decimal::ZERO);
        let loss = (-delta).max(Decimal::ZERO);
        avg_gain = (avg_gain * (period_dec - Decimal::ONE) + gain) / period_dec;
        avg_loss = (avg_loss * (period_dec - Decimal::ONE) + loss) / period_dec;
    }

    if avg_loss.is_zero() {
        return Ok(dec!(100));
    }

    let rs = avg_gain / avg_loss;
    Ok(dec!(100) - dec!(100) / (Decimal::ONE + rs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closes(values: &[i64]) -> Vec<Decimal> {
        values.iter().map(|v| Decimal::from(*v)).collect()
    }

    #[test]
    fn all_gains_saturate_at_100() {
        let data = closes(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]);
        assert_eq!(rsi(&data, 14).unwrap(), dec!(100));
    }

    #[test]
    fn balanced_moves_sit_near_50() {
        // Alternating +1/-1: average gain equals average loss.
        let data = closes(&[10, 11, 10, 11, 10, 11, 10, 11, 10, 11, 10]);
        let value = rsi(&data, 4).unwrap();
        assert!(value > dec!(40) && value < dec!(60), "rsi was {value}");
    }

    #[test]
    fn steady_losses_push_low() {
        let data = closes(&[20, 19, 18, 17, 16, 15, 14, 13, 12, 11, 10]);
        let value = rsi(&data, 4).unwrap();
        assert!(value < dec!(10), "rsi was {value}");
    }

    #[test]
    fn insufficient_data_is_rejected() {
        let data = closes(&[1, 2, 3]);
        assert!(rsi(&data, 14).is_err());
        assert!(rsi(&data, 1).is_err());
    }
}
