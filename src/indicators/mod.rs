// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators used by the signal
// scanner. Every public function returns `Option<T>` so callers are forced to
// handle insufficient-data and numerical-edge-case scenarios; a `None` here
// means "skip this instrument", never an error.

pub mod rolling;
pub mod rsi;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::types::Bar;

/// Window sizes for [`compute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndicatorParams {
    pub lookback: usize,
    pub rsi_period: usize,
}

impl Default for IndicatorParams {
    fn default() -> Self {
        Self {
            lookback: 125,
            rsi_period: 14,
        }
    }
}

/// Indicator values for the latest bar of one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub date: NaiveDate,
    pub close: f64,
    pub volume: f64,
    /// Highest high of the bars preceding `date`.
    pub rolling_high: f64,
    /// Lowest low of the bars preceding `date`.
    pub rolling_low: f64,
    /// Mean volume of the bars preceding `date`.
    pub volume_sma: f64,
    pub rsi: f64,
}

/// Compute the snapshot for the last bar of `bars`.
///
/// `bars` must be ascending by date without duplicates (see
/// [`normalize_series`]). Returns `None` unless `params.lookback` bars
/// precede the latest one, when the RSI window cannot be filled, or when
/// volume data is missing (zero or non-finite averages).
pub fn compute(bars: &[Bar], params: IndicatorParams) -> Option<IndicatorSnapshot> {
    if bars.len() <= params.lookback {
        return None;
    }

    let latest = bars.last()?;
    let window = rolling::preceding_window(bars, params.lookback)?;

    let rolling_high = rolling::highest_high(window)?;
    let rolling_low = rolling::lowest_low(window)?;
    let volume_sma = rolling::mean_volume(window)?;
    if volume_sma <= 0.0 || latest.volume <= 0.0 {
        return None;
    }

    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let rsi = rsi::calculate_rsi(&closes, params.rsi_period)?;

    Some(IndicatorSnapshot {
        date: latest.date,
        close: latest.close,
        volume: latest.volume,
        rolling_high,
        rolling_low,
        volume_sma,
        rsi,
    })
}

/// Sort `bars` ascending by date and drop duplicate dates (the later entry
/// wins).
pub fn normalize_series(mut bars: Vec<Bar>) -> Vec<Bar> {
    bars.sort_by_key(|b| b.date);
    let mut out: Vec<Bar> = Vec::with_capacity(bars.len());
    for bar in bars {
        match out.last_mut() {
            Some(last) if last.date == bar.date => *last = bar,
            _ => out.push(bar),
        }
    }
    out
}
