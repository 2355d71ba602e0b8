// =============================================================================
// Rolling Window Statistics - look-ahead-free extremes and volume average
// =============================================================================
//
// The window used to judge the latest bar is made of the bars that precede
// it, never the bar itself:
//
//   bars:   [ ... | b(n-L) ... b(n-1) | b(n) ]
//                  \___ window (L) __/   latest
//
// With fewer than L earlier bars there is no window: a short history never
// stands in for the full lookback.
// =============================================================================

use crate::types::Bar;

/// Return the `lookback` bars preceding the last bar of `bars`.
///
/// `None` when fewer than `lookback` earlier bars exist or `lookback == 0`.
pub fn preceding_window(bars: &[Bar], lookback: usize) -> Option<&[Bar]> {
    if lookback == 0 || bars.len() <= lookback {
        return None;
    }
    let end = bars.len() - 1;
    Some(&bars[end - lookback..end])
}

/// Highest high across `window`.
pub fn highest_high(window: &[Bar]) -> Option<f64> {
    window.iter().map(|b| b.high).reduce(f64::max)
}

/// Lowest low across `window`.
pub fn lowest_low(window: &[Bar]) -> Option<f64> {
    window.iter().map(|b| b.low).reduce(f64::min)
}

/// Simple moving average of volume across `window`.
pub fn mean_volume(window: &[Bar]) -> Option<f64> {
    if window.is_empty() {
        return None;
    }
    let mean = window.iter().map(|b| b.volume).sum::<f64>() / window.len() as f64;
    mean.is_finite().then_some(mean)
}
