// =============================================================================
// Relative Strength Index (RSI) - simple-average variant
// =============================================================================
//
// Step 1 - Compute price changes (deltas) from consecutive closes.
// Step 2 - Keep only the most recent `period` deltas.
// Step 3 - avg_gain = sum(positive deltas) / period
//          avg_loss = sum(|negative deltas|) / period
// Step 4 - RS  = avg_gain / avg_loss
//          RSI = 100 - 100 / (1 + RS)
//
// No exponential (Wilder) smoothing is applied: every delta inside the window
// carries equal weight, and deltas older than the window carry none. The
// breakout scanner's thresholds were tuned against this variant.
// =============================================================================

/// Compute the RSI of the latest close over the trailing `period` deltas.
///
/// # Edge cases
/// - `period == 0` => `None`
/// - `closes.len() < period + 1` => `None` (need at least `period` deltas)
/// - If average loss is zero, RSI is 100.0 (this includes a flat window).
/// - Non-finite results => `None`
pub fn calculate_rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let tail = &closes[closes.len() - (period + 1)..];

    let (sum_gain, sum_loss) = tail.windows(2).map(|w| w[1] - w[0]).fold(
        (0.0_f64, 0.0_f64),
        |(g, l), d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l - d)
            }
        },
    );

    let period_f = period as f64;
    rsi_from_averages(sum_gain / period_f, sum_loss / period_f)
}

/// Convert average gain / average loss into an RSI value in [0, 100].
fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    let rsi = if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };

    rsi.is_finite().then_some(rsi)
}
