// =============================================================================
// Signal Scanner - breakout / breakdown detection across the universe
// =============================================================================
//
// For every instrument the scanner fetches daily bars once, computes the
// look-ahead-free indicator snapshot and applies two mutually exclusive rules:
//
//   Breakout:  close > rolling_high  AND volume / volume_sma > ratio  AND rsi < 70
//   Breakdown: close < rolling_low   AND volume_sma / volume > ratio  AND rsi > 30
//
// With the default ratio of 1.0 the volume tests reduce to
// `volume > volume_sma` and `volume < volume_sma`.
//
// Instruments are scanned concurrently (bounded), then merged and ranked:
// breakouts by volume / volume_sma descending, breakdowns by
// volume_sma / volume descending, ties by symbol ascending. The ranking is a
// pure function of the data, so completion order never changes the result.
//
// The only state retained between scans is the instrument catalog, loaded
// once at construction.
// =============================================================================

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::gateway::{ExecutionGateway, GatewayError};
use crate::indicators::{compute, IndicatorParams, IndicatorSnapshot};
use crate::runtime_config::{RuntimeConfig, ScanParams};
use crate::types::{Instrument, Side};

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Breakout,
    Breakdown,
}

impl Signal {
    /// Entry side for this signal: long a breakout, short a breakdown.
    pub fn entry_side(self) -> Side {
        match self {
            Self::Breakout => Side::Buy,
            Self::Breakdown => Side::Sell,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Breakout => write!(f, "breakout"),
            Self::Breakdown => write!(f, "breakdown"),
        }
    }
}

/// An instrument that fired a signal on its latest bar.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub symbol: String,
    pub token: u64,
    pub signal: Signal,
    pub date: NaiveDate,
    pub close: f64,
    pub volume: f64,
    pub volume_sma: f64,
    pub rolling_high: f64,
    pub rolling_low: f64,
    pub rsi: f64,
    /// `volume / volume_sma`.
    pub volume_ratio: f64,
}

impl Candidate {
    fn from_snapshot(instrument: &Instrument, signal: Signal, snap: &IndicatorSnapshot) -> Self {
        Self {
            symbol: instrument.symbol.clone(),
            token: instrument.token,
            signal,
            date: snap.date,
            close: snap.close,
            volume: snap.volume,
            volume_sma: snap.volume_sma,
            rolling_high: snap.rolling_high,
            rolling_low: snap.rolling_low,
            rsi: snap.rsi,
            volume_ratio: snap.volume / snap.volume_sma,
        }
    }

    /// Ranking key: volume surge for breakouts, volume drought for breakdowns.
    pub fn strength(&self) -> f64 {
        match self.signal {
            Signal::Breakout => self.volume_ratio,
            Signal::Breakdown => self.volume_sma / self.volume,
        }
    }
}

/// Decision thresholds for the two rules.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalRules {
    /// Breakouts require RSI strictly below this.
    pub breakout_rsi_max: f64,
    /// Breakdowns require RSI strictly above this.
    pub breakdown_rsi_min: f64,
    /// Minimum volume surge for a breakout.
    pub breakout_volume_ratio: f64,
    /// Minimum volume drought for a breakdown.
    pub breakdown_volume_ratio: f64,
}

impl Default for SignalRules {
    fn default() -> Self {
        Self {
            breakout_rsi_max: 70.0,
            breakdown_rsi_min: 30.0,
            breakout_volume_ratio: 1.0,
            breakdown_volume_ratio: 1.0,
        }
    }
}

impl SignalRules {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            breakout_rsi_max: config.breakout.rsi_threshold,
            breakdown_rsi_min: config.breakdown.rsi_threshold,
            breakout_volume_ratio: config.breakout.volume_ratio_threshold,
            breakdown_volume_ratio: config.breakdown.volume_ratio_threshold,
        }
    }

    pub fn is_breakout(&self, s: &IndicatorSnapshot) -> bool {
        s.close > s.rolling_high
            && s.volume > s.volume_sma * self.breakout_volume_ratio
            && s.rsi < self.breakout_rsi_max
    }

    pub fn is_breakdown(&self, s: &IndicatorSnapshot) -> bool {
        s.close < s.rolling_low
            && s.volume * self.breakdown_volume_ratio < s.volume_sma
            && s.rsi > self.breakdown_rsi_min
    }

    /// At most one signal per snapshot: the price conditions are disjoint
    /// whenever `rolling_low <= rolling_high`.
    pub fn classify(&self, s: &IndicatorSnapshot) -> Option<Signal> {
        if self.is_breakout(s) {
            Some(Signal::Breakout)
        } else if self.is_breakdown(s) {
            Some(Signal::Breakdown)
        } else {
            None
        }
    }
}

/// Result of one pass over the universe.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanOutcome {
    pub breakouts: Vec<Candidate>,
    pub breakdowns: Vec<Candidate>,
    /// Instruments whose indicators were computed.
    pub scanned: usize,
    /// Instruments without enough data (short history, no volume).
    pub skipped: usize,
    /// Instruments whose bar fetch failed.
    pub failed: usize,
}

enum InstrumentScan {
    Signal(Candidate),
    Quiet,
    Skipped,
    Failed,
}

// =============================================================================
// Scanner
// =============================================================================

pub struct SignalScanner {
    gateway: Arc<dyn ExecutionGateway>,
    universe: Vec<Instrument>,
    params: IndicatorParams,
    history_days: i64,
    concurrency: usize,
    rules: SignalRules,
}

impl SignalScanner {
    /// Load the instrument catalog for `exchange` (once) and build a scanner.
    ///
    /// A non-empty `scan.symbols` restricts the universe to those symbols.
    pub async fn load(
        gateway: Arc<dyn ExecutionGateway>,
        exchange: &str,
        scan: &ScanParams,
        rules: SignalRules,
    ) -> Result<Self, GatewayError> {
        let catalog = gateway.instrument_catalog(exchange).await?;
        let universe = restrict_universe(catalog, &scan.symbols);
        info!(exchange, instruments = universe.len(), "scanner universe loaded");

        Ok(Self {
            gateway,
            universe,
            params: IndicatorParams {
                lookback: scan.lookback_days,
                rsi_period: scan.rsi_period,
            },
            history_days: scan.history_days,
            concurrency: scan.scan_concurrency.max(1),
            rules,
        })
    }

    pub fn universe(&self) -> &[Instrument] {
        &self.universe
    }

    /// Scan the cached universe for both signals.
    pub async fn scan(&self, today: NaiveDate) -> ScanOutcome {
        self.scan_universe(&self.universe, today).await
    }

    /// Ranked breakout candidates within `universe`.
    pub async fn scan_breakouts(&self, universe: &[Instrument], today: NaiveDate) -> Vec<Candidate> {
        self.scan_universe(universe, today).await.breakouts
    }

    /// Ranked breakdown candidates within `universe`.
    pub async fn scan_breakdowns(&self, universe: &[Instrument], today: NaiveDate) -> Vec<Candidate> {
        self.scan_universe(universe, today).await.breakdowns
    }

    /// Fetch each instrument's bars once and evaluate both rules.
    pub async fn scan_universe(&self, universe: &[Instrument], today: NaiveDate) -> ScanOutcome {
        let from = today - Duration::days(self.history_days);

        let results: Vec<InstrumentScan> = stream::iter(universe.iter().cloned())
            .map(|instrument| async move { self.scan_instrument(&instrument, from, today).await })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut outcome = ScanOutcome::default();
        for result in results {
            match result {
                InstrumentScan::Signal(c) => {
                    outcome.scanned += 1;
                    match c.signal {
                        Signal::Breakout => outcome.breakouts.push(c),
                        Signal::Breakdown => outcome.breakdowns.push(c),
                    }
                }
                InstrumentScan::Quiet => outcome.scanned += 1,
                InstrumentScan::Skipped => outcome.skipped += 1,
                InstrumentScan::Failed => outcome.failed += 1,
            }
        }

        rank(&mut outcome.breakouts);
        rank(&mut outcome.breakdowns);

        info!(
            scanned = outcome.scanned,
            skipped = outcome.skipped,
            failed = outcome.failed,
            breakouts = outcome.breakouts.len(),
            breakdowns = outcome.breakdowns.len(),
            "scan complete"
        );
        outcome
    }

    async fn scan_instrument(
        &self,
        instrument: &Instrument,
        from: NaiveDate,
        to: NaiveDate,
    ) -> InstrumentScan {
        let bars = match self.gateway.historical_bars(instrument.token, from, to).await {
            Ok(bars) => bars,
            Err(GatewayError::DataUnavailable(reason)) => {
                debug!(symbol = %instrument.symbol, reason = %reason, "no history, skipping");
                return InstrumentScan::Skipped;
            }
            Err(e) => {
                warn!(
                    symbol = %instrument.symbol,
                    token = instrument.token,
                    retryable = e.is_retryable(),
                    error = %e,
                    "bar fetch failed"
                );
                return InstrumentScan::Failed;
            }
        };

        let Some(snap) = compute(&bars, self.params) else {
            debug!(symbol = %instrument.symbol, bars = bars.len(), "insufficient data, skipping");
            return InstrumentScan::Skipped;
        };

        match self.rules.classify(&snap) {
            Some(signal) => {
                let candidate = Candidate::from_snapshot(instrument, signal, &snap);
                debug!(
                    symbol = %candidate.symbol,
                    %signal,
                    close = candidate.close,
                    rsi = candidate.rsi,
                    volume_ratio = candidate.volume_ratio,
                    "signal"
                );
                InstrumentScan::Signal(candidate)
            }
            None => InstrumentScan::Quiet,
        }
    }
}

/// Strongest first; ties by symbol so the order is deterministic.
fn rank(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.strength()
            .partial_cmp(&a.strength())
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
}

fn restrict_universe(catalog: Vec<Instrument>, symbols: &[String]) -> Vec<Instrument> {
    if symbols.is_empty() {
        return catalog;
    }
    let wanted: HashSet<&str> = symbols.iter().map(String::as_str).collect();
    let universe: Vec<Instrument> = catalog
        .into_iter()
        .filter(|i| wanted.contains(i.symbol.as_str()))
        .collect();

    if universe.len() < wanted.len() {
        let found: HashSet<&str> = universe.iter().map(|i| i.symbol.as_str()).collect();
        let missing: Vec<&&str> = wanted.iter().filter(|s| !found.contains(**s)).collect();
        warn!(?missing, "configured symbols not in catalog");
    }
    universe
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::MockGateway;
    use crate::indicators::fixtures::{base_series, breakdown_series, breakout_series, with_today};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 5, 6).unwrap()
    }

    async fn scanner(gw: Arc<MockGateway>, symbols: Vec<String>) -> SignalScanner {
        let params = ScanParams {
            symbols,
            ..ScanParams::default()
        };
        SignalScanner::load(gw, "NSE", &params, SignalRules::default())
            .await
            .unwrap()
    }

    fn snapshot(close: f64, volume: f64, rsi: f64) -> IndicatorSnapshot {
        IndicatorSnapshot {
            date: today(),
            close,
            volume,
            rolling_high: 100.0,
            rolling_low: 90.0,
            volume_sma: 1000.0,
            rsi,
        }
    }

    #[test]
    fn rules_are_strict() {
        let rules = SignalRules::default();
        assert!(rules.is_breakout(&snapshot(100.5, 1001.0, 69.9)));
        assert!(!rules.is_breakout(&snapshot(100.0, 2000.0, 50.0)));
        assert!(!rules.is_breakout(&snapshot(105.0, 1000.0, 50.0)));
        assert!(!rules.is_breakout(&snapshot(105.0, 2000.0, 70.0)));

        assert!(rules.is_breakdown(&snapshot(89.0, 999.0, 30.1)));
        assert!(!rules.is_breakdown(&snapshot(90.0, 500.0, 50.0)));
        assert!(!rules.is_breakdown(&snapshot(85.0, 500.0, 30.0)));
    }

    #[test]
    fn volume_ratio_thresholds_tighten_the_rules() {
        let rules = SignalRules {
            breakout_volume_ratio: 1.5,
            breakdown_volume_ratio: 2.0,
            ..SignalRules::default()
        };
        assert!(!rules.is_breakout(&snapshot(105.0, 1400.0, 50.0)));
        assert!(!rules.is_breakout(&snapshot(105.0, 1500.0, 50.0)));
        assert!(rules.is_breakout(&snapshot(105.0, 1600.0, 50.0)));

        assert!(!rules.is_breakdown(&snapshot(85.0, 600.0, 50.0)));
        assert!(!rules.is_breakdown(&snapshot(85.0, 500.0, 50.0)));
        assert!(rules.is_breakdown(&snapshot(85.0, 400.0, 50.0)));
    }

    #[test]
    fn rules_follow_configured_thresholds() {
        let mut cfg = RuntimeConfig::default();
        cfg.breakout.volume_ratio_threshold = 3.0;
        cfg.breakdown.rsi_threshold = 40.0;
        let rules = SignalRules::from_config(&cfg);
        assert_eq!(rules.breakout_volume_ratio, 3.0);
        assert_eq!(rules.breakdown_volume_ratio, 1.0);
        assert!(!rules.is_breakout(&snapshot(105.0, 2000.0, 50.0)));
        assert!(!rules.is_breakdown(&snapshot(85.0, 500.0, 35.0)));
    }

    #[test]
    fn rules_are_mutually_exclusive() {
        let rules = SignalRules::default();
        for close in [80.0, 89.9, 90.0, 95.0, 100.0, 100.1, 120.0] {
            for volume in [0.5, 999.0, 1000.0, 1001.0, 5000.0] {
                for rsi in [0.0, 29.0, 31.0, 50.0, 69.0, 71.0, 100.0] {
                    let s = snapshot(close, volume, rsi);
                    assert!(!(rules.is_breakout(&s) && rules.is_breakdown(&s)));
                }
            }
        }
    }

    #[tokio::test]
    async fn three_instrument_universe_yields_one_breakout() {
        let gw = Arc::new(MockGateway::new());
        gw.add_instrument("SHORTA", 1, base_series(40));
        gw.add_instrument("SHORTB", 2, with_today(base_series(100), 106.0, 95.0, 105.0, 2000.0));
        gw.add_instrument("BRK", 3, breakout_series());
        let scanner = scanner(gw.clone(), vec![]).await;

        let breakouts = scanner.scan_breakouts(scanner.universe(), today()).await;
        assert_eq!(breakouts.len(), 1);
        let c = &breakouts[0];
        assert_eq!(c.symbol, "BRK");
        assert_eq!(c.signal, Signal::Breakout);
        assert_eq!(c.close, 105.0);
        assert_eq!(c.rolling_high, 100.0);
        assert!((c.volume_ratio - 2.0).abs() < 1e-12);
        assert!(c.rsi < 70.0);

        let outcome = scanner.scan(today()).await;
        assert_eq!(outcome.skipped, 2);
        assert_eq!(outcome.scanned, 1);
        assert!(outcome.breakdowns.is_empty());
    }

    #[tokio::test]
    async fn breakdowns_rank_by_volume_drought() {
        let gw = Arc::new(MockGateway::new());
        gw.add_instrument("MILD", 1, breakdown_series());
        gw.add_instrument("DRY", 2, with_today(base_series(125), 92.0, 84.0, 85.0, 250.0));
        let scanner = scanner(gw, vec![]).await;

        let breakdowns = scanner.scan_breakdowns(scanner.universe(), today()).await;
        let symbols: Vec<&str> = breakdowns.iter().map(|c| c.symbol.as_str()).collect();
        assert_eq!(symbols, ["DRY", "MILD"]);
        assert!((breakdowns[0].strength() - 4.0).abs() < 1e-12);
        assert_eq!(breakdowns[0].signal.entry_side(), Side::Sell);
    }

    #[tokio::test]
    async fn equal_strength_ties_break_by_symbol() {
        let gw = Arc::new(MockGateway::new());
        for (sym, token) in [("ZETA", 1), ("ALPHA", 2), ("MID", 3)] {
            gw.add_instrument(sym, token, breakout_series());
        }
        gw.add_instrument("HOT", 4, with_today(base_series(125), 106.0, 95.0, 105.0, 3000.0));
        let scanner = scanner(gw, vec![]).await;

        let symbols: Vec<String> = scanner
            .scan(today())
            .await
            .breakouts
            .into_iter()
            .map(|c| c.symbol)
            .collect();
        assert_eq!(symbols, ["HOT", "ALPHA", "MID", "ZETA"]);
    }

    #[tokio::test]
    async fn fetch_failures_are_isolated() {
        let gw = Arc::new(MockGateway::new());
        gw.add_instrument("BAD", 1, breakout_series());
        gw.add_instrument("GOOD", 2, breakout_series());
        gw.fail_bars_for(1);
        let scanner = scanner(gw.clone(), vec![]).await;

        let outcome = scanner.scan(today()).await;
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.breakouts.len(), 1);
        assert_eq!(outcome.breakouts[0].symbol, "GOOD");
        assert_eq!(gw.bar_requests(), 2);
    }

    #[tokio::test]
    async fn allow_list_restricts_universe() {
        let gw = Arc::new(MockGateway::new());
        gw.add_instrument("INFY", 1, breakout_series());
        gw.add_instrument("TCS", 2, breakout_series());
        let scanner = scanner(gw, vec!["TCS".into(), "WIPRO".into()]).await;

        assert_eq!(scanner.universe().len(), 1);
        assert_eq!(scanner.universe()[0].symbol, "TCS");
    }

    #[tokio::test]
    async fn catalog_failure_is_fatal() {
        let gw = Arc::new(MockGateway::new());
        gw.set_fail_catalog(true);
        let res = SignalScanner::load(gw, "NSE", &ScanParams::default(), SignalRules::default()).await;
        assert!(res.is_err());
    }
}
