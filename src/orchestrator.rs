// =============================================================================
// Trading Orchestrator - the scan / size / submit / monitor control loop
// =============================================================================
//
// One driver ticks every `scan_interval_minutes`. Each tick runs at most one
// cycle: a tick that fires while the previous cycle is still running is
// skipped, never run in parallel, so two cycles can never size orders
// against the same capital snapshot.
//
// Cycle while the market is Open:
//   1. Account snapshot → available cash, open-position count.
//   2. At or above the cap → no entries (exits still run).
//   3. Scan breakouts and breakdowns.
//   4. Size and submit entries, breakouts first, stopping the moment the
//      running count hits the cap.
//   5. Run the position monitor.
// From `square_off_time` (if enabled) the cycle only squares off.
//
// Shutdown lets the running cycle finish its current order, then stops.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, Utc, Weekday};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::app_state::ErrorLog;
use crate::exit::{ExitReport, PositionMonitor};
use crate::gateway::{ExecutionGateway, GatewayError};
use crate::ledger::{exit_levels, NewTrade, PositionLedger, TradeId};
use crate::runtime_config::{MarketParams, RuntimeConfig, SideParams};
use crate::scanner::{Candidate, ScanOutcome, Signal, SignalScanner};
use crate::types::{AccountSnapshot, MarketPhase, Side};

// =============================================================================
// Market clock
// =============================================================================

/// Exchange trading window evaluated in exchange-local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarketClock {
    tz: FixedOffset,
    open: NaiveTime,
    close: NaiveTime,
    square_off: NaiveTime,
}

impl MarketClock {
    pub fn from_params(market: &MarketParams) -> Self {
        Self {
            tz: market.timezone(),
            open: market.open_time,
            close: market.close_time,
            square_off: market.square_off_time,
        }
    }

    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.tz).date_naive()
    }

    /// Open on weekdays within `[open, close)`.
    pub fn phase_at(&self, now: DateTime<Utc>) -> MarketPhase {
        let local = now.with_timezone(&self.tz);
        let weekday = !matches!(local.weekday(), Weekday::Sat | Weekday::Sun);
        let t = local.time();
        if weekday && t >= self.open && t < self.close {
            MarketPhase::Open
        } else {
            MarketPhase::Closed
        }
    }

    /// Whether `now` falls in the end-of-day square-off window.
    pub fn in_square_off(&self, now: DateTime<Utc>) -> bool {
        self.phase_at(now) == MarketPhase::Open
            && now.with_timezone(&self.tz).time() >= self.square_off
    }
}

/// Whole shares affordable with `allocation_pct` percent of `cash` at `price`.
pub fn position_size(cash: f64, allocation_pct: f64, price: f64) -> u32 {
    if !(cash > 0.0 && allocation_pct > 0.0 && price > 0.0) {
        return 0;
    }
    let qty = (cash * allocation_pct / 100.0 / price).floor();
    if qty >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        qty as u32
    }
}

// =============================================================================
// Cycle report
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanSummary {
    pub scanned: usize,
    pub skipped: usize,
    pub failed: usize,
    pub breakouts: usize,
    pub breakdowns: usize,
}

impl From<&ScanOutcome> for ScanSummary {
    fn from(o: &ScanOutcome) -> Self {
        Self {
            scanned: o.scanned,
            skipped: o.skipped,
            failed: o.failed,
            breakouts: o.breakouts.len(),
            breakdowns: o.breakdowns.len(),
        }
    }
}

/// An entry order that reached the broker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryRecord {
    pub symbol: String,
    pub signal: Signal,
    pub side: Side,
    pub quantity: u32,
    pub entry_price: f64,
    pub broker_order_id: String,
    /// `None` when the ledger write failed (untracked live position).
    pub trade_id: Option<TradeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedEntry {
    pub symbol: String,
    pub reason: String,
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub phase: MarketPhase,
    pub square_off: bool,
    pub account: Option<AccountSnapshot>,
    /// Why no entries were attempted, if none were.
    pub entries_skipped: Option<String>,
    pub scan: Option<ScanSummary>,
    pub entries: Vec<EntryRecord>,
    pub rejected: Vec<RejectedEntry>,
    pub exits: Option<ExitReport>,
}

impl CycleReport {
    fn new(started_at: DateTime<Utc>, phase: MarketPhase) -> Self {
        Self {
            started_at,
            finished_at: started_at,
            phase,
            square_off: false,
            account: None,
            entries_skipped: None,
            scan: None,
            entries: Vec::new(),
            rejected: Vec::new(),
            exits: None,
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

#[derive(Debug, Clone)]
struct Settings {
    breakout: SideParams,
    breakdown: SideParams,
    max_positions: u32,
    interval: Duration,
    auto_close: bool,
    skip_held_symbols: bool,
}

pub struct TradingOrchestrator {
    gateway: Arc<dyn ExecutionGateway>,
    ledger: Arc<PositionLedger>,
    scanner: Arc<SignalScanner>,
    monitor: Arc<PositionMonitor>,
    errors: Arc<ErrorLog>,
    clock: MarketClock,
    settings: Settings,
    cycle_guard: Mutex<()>,
    phase: RwLock<MarketPhase>,
    last_report: RwLock<Option<CycleReport>>,
}

impl TradingOrchestrator {
    pub fn new(
        config: &RuntimeConfig,
        gateway: Arc<dyn ExecutionGateway>,
        ledger: Arc<PositionLedger>,
        scanner: Arc<SignalScanner>,
        monitor: Arc<PositionMonitor>,
        errors: Arc<ErrorLog>,
    ) -> Self {
        Self {
            gateway,
            ledger,
            scanner,
            monitor,
            errors,
            clock: MarketClock::from_params(&config.market),
            settings: Settings {
                breakout: config.breakout.clone(),
                breakdown: config.breakdown.clone(),
                max_positions: config.general.max_positions,
                interval: Duration::from_secs(config.general.scan_interval_minutes.max(1) * 60),
                auto_close: config.general.auto_close_at_market_close,
                skip_held_symbols: config.general.skip_held_symbols,
            },
            cycle_guard: Mutex::new(()),
            phase: RwLock::new(MarketPhase::Closed),
            last_report: RwLock::new(None),
        }
    }

    pub fn clock(&self) -> &MarketClock {
        &self.clock
    }

    pub fn phase(&self) -> MarketPhase {
        *self.phase.read()
    }

    pub fn last_report(&self) -> Option<CycleReport> {
        self.last_report.read().clone()
    }

    pub fn cycle_running(&self) -> bool {
        self.cycle_guard.try_lock().is_err()
    }

    /// Drive ticks until `shutdown` flips to `true`, then wait for the
    /// running cycle to finish.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.settings.interval.as_secs(),
            max_positions = self.settings.max_positions,
            "orchestrator started"
        );

        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let this = Arc::clone(&self);
                    let rx = shutdown.clone();
                    tokio::spawn(async move {
                        this.tick(Utc::now(), &rx).await;
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("orchestrator stopping, waiting for the running cycle");
        let _drained = self.cycle_guard.lock().await;
        info!("orchestrator stopped");
    }

    /// Run one cycle unless another is still in progress.
    pub async fn tick(
        &self,
        now: DateTime<Utc>,
        shutdown: &watch::Receiver<bool>,
    ) -> Option<CycleReport> {
        let Ok(_guard) = self.cycle_guard.try_lock() else {
            warn!("previous cycle still running, skipping tick");
            return None;
        };
        if *shutdown.borrow() {
            return None;
        }

        let report = self.run_cycle(now, shutdown).await;
        *self.last_report.write() = Some(report.clone());
        Some(report)
    }

    /// Record the phase for `now`, logging transitions only.
    pub fn observe_phase(&self, now: DateTime<Utc>) -> MarketPhase {
        let phase = self.clock.phase_at(now);
        let previous = std::mem::replace(&mut *self.phase.write(), phase);
        if previous != phase {
            info!(from = %previous, to = %phase, "market phase changed");
        }
        phase
    }

    async fn run_cycle(&self, now: DateTime<Utc>, shutdown: &watch::Receiver<bool>) -> CycleReport {
        let phase = self.observe_phase(now);
        let mut report = CycleReport::new(now, phase);

        if phase == MarketPhase::Closed {
            debug!("market closed, nothing to do");
            report.entries_skipped = Some("market closed".into());
            report.finished_at = Utc::now();
            return report;
        }

        if self.settings.auto_close && self.clock.in_square_off(now) {
            report.square_off = true;
            report.entries_skipped = Some("square-off window".into());
            match self.monitor.square_off_all().await {
                Ok(exits) => report.exits = Some(exits),
                Err(e) => {
                    error!(error = %e, "square-off pass failed");
                    self.errors.record("square_off", Some(e.kind()), e.to_string());
                }
            }
            report.finished_at = Utc::now();
            return report;
        }

        match self.gateway.account_snapshot().await {
            Ok(account) => {
                report.account = Some(account);
                if account.open_positions >= self.settings.max_positions {
                    info!(
                        open = account.open_positions,
                        max = self.settings.max_positions,
                        "position cap reached, skipping entries"
                    );
                    report.entries_skipped = Some("position cap reached".into());
                } else {
                    let today = self.clock.local_date(now);
                    self.enter_positions(account, today, shutdown, &mut report).await;
                }
            }
            Err(e) => {
                warn!(error = %e, "account snapshot failed, skipping entries");
                self.errors.record("account_snapshot", Some("gateway"), e.to_string());
                report.entries_skipped = Some(format!("account snapshot failed: {e}"));
            }
        }

        if *shutdown.borrow() {
            info!("shutdown requested, skipping monitor pass");
        } else {
            match self.monitor.run_once().await {
                Ok(exits) => report.exits = Some(exits),
                Err(e) => {
                    warn!(error = %e, "monitor pass failed, will retry next cycle");
                    self.errors.record("monitor", Some(e.kind()), e.to_string());
                }
            }
        }

        report.finished_at = Utc::now();
        info!(
            entries = report.entries.len(),
            rejected = report.rejected.len(),
            exits = report.exits.as_ref().map_or(0, |x| x.closed.len()),
            elapsed_ms = (report.finished_at - report.started_at).num_milliseconds(),
            "cycle complete"
        );
        report
    }

    async fn enter_positions(
        &self,
        account: AccountSnapshot,
        today: NaiveDate,
        shutdown: &watch::Receiver<bool>,
        report: &mut CycleReport,
    ) {
        let outcome = self.scanner.scan(today).await;
        report.scan = Some(ScanSummary::from(&outcome));

        let mut held: HashSet<String> = HashSet::new();
        if self.settings.skip_held_symbols {
            match self.ledger.list_open().await {
                Ok(open) => held.extend(open.into_iter().map(|t| t.symbol)),
                Err(e) => {
                    error!(error = %e, "cannot read open trades, skipping entries");
                    self.errors.record("entry", Some("persistence"), e.to_string());
                    report.entries_skipped = Some("open trades unavailable".into());
                    return;
                }
            }
        }

        let mut open_count = account.open_positions;
        let candidates = outcome
            .breakouts
            .iter()
            .map(|c| (c, &self.settings.breakout))
            .chain(outcome.breakdowns.iter().map(|c| (c, &self.settings.breakdown)));

        for (candidate, params) in candidates {
            if *shutdown.borrow() {
                info!("shutdown requested, no further entries");
                break;
            }
            if open_count >= self.settings.max_positions {
                info!(open = open_count, "position cap reached mid-list");
                break;
            }
            if held.contains(&candidate.symbol) {
                debug!(symbol = %candidate.symbol, "already holding, skipping");
                continue;
            }

            let quantity = position_size(account.available_cash, params.allocation_pct, candidate.close);
            if quantity == 0 {
                debug!(
                    symbol = %candidate.symbol,
                    cash = account.available_cash,
                    price = candidate.close,
                    "allocation below one share, skipping"
                );
                continue;
            }

            if self.submit_entry(candidate, params, quantity, report).await {
                open_count += 1;
                held.insert(candidate.symbol.clone());
            }
        }
    }

    /// Place one entry order and record it. Returns whether the order was
    /// placed at the broker.
    async fn submit_entry(
        &self,
        candidate: &Candidate,
        params: &SideParams,
        quantity: u32,
        report: &mut CycleReport,
    ) -> bool {
        let side = candidate.signal.entry_side();
        let symbol = candidate.symbol.as_str();

        let order_id = match self.gateway.place_market_order(symbol, side, quantity).await {
            Ok(id) => id,
            Err(e) => {
                warn!(
                    symbol,
                    side = %side,
                    quantity,
                    retryable = e.is_retryable(),
                    error = %e,
                    "entry order failed"
                );
                let code = match e {
                    GatewayError::OrderRejected { .. } => "order_rejected",
                    _ => "gateway",
                };
                self.errors.record("entry", Some(code), format!("{symbol}: {e}"));
                report.rejected.push(RejectedEntry {
                    symbol: symbol.to_string(),
                    reason: e.to_string(),
                });
                return false;
            }
        };

        let (take_profit_price, stop_loss_price) =
            exit_levels(side, candidate.close, params.take_profit_pct, params.stop_loss_pct);
        let new_trade = NewTrade {
            symbol: symbol.to_string(),
            side,
            quantity,
            entry_price: candidate.close,
            take_profit_price,
            stop_loss_price,
            broker_order_id: order_id.clone(),
        };

        let trade_id = match self.ledger.open(new_trade).await {
            Ok(id) => {
                info!(
                    trade_id = %id,
                    symbol,
                    signal = %candidate.signal,
                    side = %side,
                    quantity,
                    entry_price = candidate.close,
                    order_id = %order_id,
                    "entry placed"
                );
                Some(id)
            }
            Err(e) => {
                error!(
                    symbol,
                    side = %side,
                    quantity,
                    order_id = %order_id,
                    error = %e,
                    "UNTRACKED LIVE POSITION: entry order placed but ledger write failed"
                );
                self.errors.record(
                    "entry",
                    Some("untracked_position"),
                    format!("{symbol} order {order_id} is live but untracked: {e}"),
                );
                None
            }
        };

        report.entries.push(EntryRecord {
            symbol: symbol.to_string(),
            signal: candidate.signal,
            side,
            quantity,
            entry_price: candidate.close,
            broker_order_id: order_id,
            trade_id,
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::MockGateway;
    use crate::indicators::fixtures::{base_series, breakdown_series, breakout_series, with_today};
    use crate::ledger::{ExitReason, TradeStatus};
    use crate::scanner::SignalRules;
    use chrono::TimeZone;

    struct Harness {
        gw: Arc<MockGateway>,
        ledger: Arc<PositionLedger>,
        errors: Arc<ErrorLog>,
        orch: TradingOrchestrator,
        shutdown: watch::Sender<bool>,
    }

    impl Harness {
        fn rx(&self) -> watch::Receiver<bool> {
            self.shutdown.subscribe()
        }
    }

    async fn harness_with(config: RuntimeConfig, gw: Arc<MockGateway>) -> Harness {
        let ledger = Arc::new(PositionLedger::in_memory().await);
        let scanner = Arc::new(
            SignalScanner::load(gw.clone(), "NSE", &config.scan, SignalRules::from_config(&config))
                .await
                .unwrap(),
        );
        let monitor = Arc::new(PositionMonitor::new(gw.clone(), ledger.clone()));
        let errors = Arc::new(ErrorLog::default());
        let orch = TradingOrchestrator::new(&config, gw.clone(), ledger.clone(), scanner, monitor, errors.clone());
        let (shutdown, _) = watch::channel(false);
        Harness {
            gw,
            ledger,
            errors,
            orch,
            shutdown,
        }
    }

    async fn harness(gw: Arc<MockGateway>) -> Harness {
        harness_with(RuntimeConfig::default(), gw).await
    }

    /// Monday 2023-05-08 at `h:m` IST.
    fn ist(h: u32, m: u32) -> DateTime<Utc> {
        FixedOffset::east_opt(330 * 60)
            .unwrap()
            .with_ymd_and_hms(2023, 5, 8, h, m, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    async fn open_trade(ledger: &PositionLedger, symbol: &str, entry: f64) -> TradeId {
        let (tp, sl) = exit_levels(Side::Buy, entry, 3.0, 3.0);
        ledger
            .open(NewTrade {
                symbol: symbol.into(),
                side: Side::Buy,
                quantity: 5,
                entry_price: entry,
                take_profit_price: tp,
                stop_loss_price: sl,
                broker_order_id: "pre".into(),
            })
            .await
            .unwrap()
    }

    #[test]
    fn sizing_floors_to_whole_shares() {
        assert_eq!(position_size(1_000_000.0, 0.1, 105.0), 9);
        assert_eq!(position_size(1_000_000.0, 1.0, 85.0), 117);
        assert_eq!(position_size(50_000.0, 0.1, 105.0), 0);
        assert_eq!(position_size(1_000_000.0, 1.0, 0.0), 0);
        assert_eq!(position_size(-5.0, 1.0, 10.0), 0);
    }

    #[test]
    fn clock_phases() {
        let clock = MarketClock::from_params(&MarketParams::default());
        assert_eq!(clock.phase_at(ist(9, 14)), MarketPhase::Closed);
        assert_eq!(clock.phase_at(ist(9, 15)), MarketPhase::Open);
        assert_eq!(clock.phase_at(ist(15, 29)), MarketPhase::Open);
        assert_eq!(clock.phase_at(ist(15, 30)), MarketPhase::Closed);
        assert!(!clock.in_square_off(ist(15, 19)));
        assert!(clock.in_square_off(ist(15, 20)));

        // Saturday 2023-05-06 midday.
        let saturday = ist(12, 0) - chrono::Duration::days(2);
        assert_eq!(clock.phase_at(saturday), MarketPhase::Closed);
        assert_eq!(clock.local_date(ist(0, 30)), NaiveDate::from_ymd_opt(2023, 5, 8).unwrap());
    }

    #[tokio::test]
    async fn breakout_entry_is_sized_and_recorded() {
        let gw = Arc::new(MockGateway::new());
        gw.add_instrument("BRK", 1, breakout_series());
        let h = harness(gw).await;

        let report = h.orch.tick(ist(10, 0), &h.rx()).await.unwrap();
        assert_eq!(report.entries.len(), 1);

        let orders = h.gw.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].symbol, "BRK");
        assert_eq!(orders[0].side, Side::Buy);
        assert_eq!(orders[0].quantity, 9);

        let open = h.ledger.list_open().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].broker_order_id, orders[0].order_id);
        assert!((open[0].take_profit_price - 108.15).abs() < 1e-9);
        assert!((open[0].stop_loss_price - 101.85).abs() < 1e-9);
        assert_eq!(h.orch.last_report(), Some(report));
    }

    #[tokio::test]
    async fn breakdown_entry_goes_short() {
        let gw = Arc::new(MockGateway::new());
        gw.add_instrument("BRD", 1, breakdown_series());
        let h = harness(gw).await;

        h.orch.tick(ist(11, 0), &h.rx()).await.unwrap();
        let orders = h.gw.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, Side::Sell);
        assert_eq!(orders[0].quantity, 117);
    }

    #[tokio::test]
    async fn cap_reached_blocks_entries_but_exits_run() {
        let gw = Arc::new(MockGateway::new());
        gw.add_instrument("BRK", 1, breakout_series());
        gw.set_account(1_000_000.0, 10);
        let h = harness(gw).await;

        let id = open_trade(&h.ledger, "HELD", 100.0).await;
        h.gw.set_price("HELD", 103.5);

        let report = h.orch.tick(ist(10, 0), &h.rx()).await.unwrap();
        assert!(report.entries.is_empty());
        assert_eq!(report.entries_skipped.as_deref(), Some("position cap reached"));
        assert_eq!(h.gw.bar_requests(), 0);

        let orders = h.gw.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].symbol, "HELD");
        assert_eq!(orders[0].side, Side::Sell);
        let closed = h.ledger.get(&id).await.unwrap();
        assert_eq!(closed.exit.unwrap().reason, ExitReason::Target);
    }

    #[tokio::test]
    async fn entries_stop_when_cap_is_hit_mid_list() {
        let gw = Arc::new(MockGateway::new());
        for (sym, token) in [("AAA", 1), ("BBB", 2), ("CCC", 3)] {
            gw.add_instrument(sym, token, breakout_series());
        }
        gw.set_account(1_000_000.0, 8);
        let h = harness(gw).await;

        let report = h.orch.tick(ist(10, 0), &h.rx()).await.unwrap();
        let symbols: Vec<&str> = report.entries.iter().map(|e| e.symbol.as_str()).collect();
        assert_eq!(symbols, ["AAA", "BBB"]);
        assert_eq!(h.gw.orders().len(), 2);
    }

    #[tokio::test]
    async fn closed_market_does_nothing() {
        let gw = Arc::new(MockGateway::new());
        gw.add_instrument("BRK", 1, breakout_series());
        let h = harness(gw).await;

        let report = h.orch.tick(ist(8, 0), &h.rx()).await.unwrap();
        assert_eq!(report.phase, MarketPhase::Closed);
        assert_eq!(h.gw.bar_requests(), 0);
        assert!(h.gw.orders().is_empty());
    }

    #[tokio::test]
    async fn phase_edges_are_tracked() {
        let h = harness(Arc::new(MockGateway::new())).await;
        assert_eq!(h.orch.observe_phase(ist(9, 0)), MarketPhase::Closed);
        assert_eq!(h.orch.observe_phase(ist(9, 30)), MarketPhase::Open);
        assert_eq!(h.orch.phase(), MarketPhase::Open);
        assert_eq!(h.orch.observe_phase(ist(16, 0)), MarketPhase::Closed);
    }

    #[tokio::test]
    async fn overlapping_tick_is_skipped() {
        let h = harness(Arc::new(MockGateway::new())).await;
        let _running = h.orch.cycle_guard.lock().await;
        assert!(h.orch.cycle_running());
        assert!(h.orch.tick(ist(10, 0), &h.rx()).await.is_none());
    }

    #[tokio::test]
    async fn paper_book_restored_after_restart_keeps_the_cap() {
        use crate::gateway::paper::PaperGateway;

        let mock = Arc::new(MockGateway::new());
        mock.add_instrument("BRK", 1, breakout_series());
        let config = RuntimeConfig::default();
        let ledger = Arc::new(PositionLedger::in_memory().await);
        for i in 0..config.general.max_positions {
            open_trade(&ledger, &format!("OLD{i}"), 100.0).await;
        }

        let open = ledger.list_open().await.unwrap();
        let paper: Arc<dyn ExecutionGateway> =
            Arc::new(PaperGateway::new(mock.clone(), config.paper_capital).with_open_trades(&open));
        let scanner = Arc::new(
            SignalScanner::load(paper.clone(), "NSE", &config.scan, SignalRules::from_config(&config))
                .await
                .unwrap(),
        );
        let monitor = Arc::new(PositionMonitor::new(paper.clone(), ledger.clone()));
        let orch = TradingOrchestrator::new(
            &config,
            paper,
            ledger.clone(),
            scanner,
            monitor,
            Arc::new(ErrorLog::default()),
        );
        let (_tx, rx) = watch::channel(false);

        let report = orch.tick(ist(10, 0), &rx).await.unwrap();
        assert_eq!(report.account.unwrap().open_positions, config.general.max_positions);
        assert!(report.entries.is_empty());
        assert_eq!(
            ledger.list_open().await.unwrap().len(),
            config.general.max_positions as usize
        );
    }

    #[tokio::test]
    async fn account_failure_skips_entries_but_still_monitors() {
        let gw = Arc::new(MockGateway::new());
        gw.add_instrument("BRK", 1, breakout_series());
        gw.set_fail_account(true);
        let h = harness(gw).await;
        let id = open_trade(&h.ledger, "HELD", 100.0).await;
        h.gw.set_price("HELD", 104.0);

        let report = h.orch.tick(ist(10, 0), &h.rx()).await.unwrap();
        assert!(report.account.is_none());
        assert!(report.scan.is_none());
        assert!(report.entries.is_empty());
        assert_eq!(h.errors.latest_for("account_snapshot").unwrap().code.as_deref(), Some("gateway"));

        let exits = report.exits.unwrap();
        assert_eq!(exits.closed.len(), 1);
        assert_eq!(exits.closed[0].trade_id, id);
        assert_eq!(exits.closed[0].reason, ExitReason::Target);
    }

    #[tokio::test]
    async fn held_symbols_are_not_re_entered() {
        let gw = Arc::new(MockGateway::new());
        gw.add_instrument("BRK", 1, breakout_series());
        let h = harness(gw).await;
        open_trade(&h.ledger, "BRK", 100.0).await;
        h.gw.set_price("BRK", 101.0);

        let report = h.orch.tick(ist(10, 0), &h.rx()).await.unwrap();
        assert!(report.entries.is_empty());
        assert!(h.gw.orders().is_empty());
    }

    #[tokio::test]
    async fn rejected_order_is_recorded_and_next_candidate_tried() {
        let gw = Arc::new(MockGateway::new());
        gw.add_instrument("AAA", 1, breakout_series());
        gw.add_instrument("BBB", 2, breakout_series());
        gw.reject_orders_for("AAA");
        let h = harness(gw).await;

        let report = h.orch.tick(ist(10, 0), &h.rx()).await.unwrap();
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].symbol, "AAA");
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.entries[0].symbol, "BBB");

        let latest = h.errors.latest_for("entry").unwrap();
        assert_eq!(latest.code.as_deref(), Some("order_rejected"));
    }

    #[tokio::test]
    async fn ledger_failure_after_entry_is_flagged() {
        let gw = Arc::new(MockGateway::new());
        gw.add_instrument("BRK", 1, breakout_series());
        let mut config = RuntimeConfig::default();
        config.general.skip_held_symbols = false;
        let h = harness_with(config, gw).await;
        h.ledger.shutdown_store().await;

        let report = h.orch.tick(ist(10, 0), &h.rx()).await.unwrap();
        assert_eq!(h.gw.orders().len(), 1);
        assert_eq!(report.entries.len(), 1);
        assert!(report.entries[0].trade_id.is_none());
        assert_eq!(
            h.errors.latest_for("entry").unwrap().code.as_deref(),
            Some("untracked_position")
        );
    }

    #[tokio::test]
    async fn square_off_window_closes_everything_without_scanning() {
        let gw = Arc::new(MockGateway::new());
        gw.add_instrument("BRK", 1, breakout_series());
        let h = harness(gw).await;
        let id = open_trade(&h.ledger, "HELD", 100.0).await;
        h.gw.set_price("HELD", 100.5);

        let report = h.orch.tick(ist(15, 25), &h.rx()).await.unwrap();
        assert!(report.square_off);
        assert_eq!(h.gw.bar_requests(), 0);
        let trade = h.ledger.get(&id).await.unwrap();
        assert_eq!(trade.status(), TradeStatus::Closed);
        assert_eq!(trade.exit.unwrap().reason, ExitReason::SquareOff);
    }

    #[tokio::test]
    async fn shutdown_stops_entries() {
        let gw = Arc::new(MockGateway::new());
        gw.add_instrument("BRK", 1, breakout_series());
        let h = harness(gw).await;
        h.shutdown.send_replace(true);

        assert!(h.orch.tick(ist(10, 0), &h.rx()).await.is_none());
        assert!(h.gw.orders().is_empty());
    }

    #[tokio::test]
    async fn tiny_allocation_skips_candidate() {
        let gw = Arc::new(MockGateway::new());
        gw.add_instrument("BRK", 1, with_today(base_series(125), 106.0, 95.0, 105.0, 2000.0));
        gw.set_account(10_000.0, 0);
        let h = harness(gw).await;

        let report = h.orch.tick(ist(10, 0), &h.rx()).await.unwrap();
        assert!(report.entries.is_empty());
        assert!(h.gw.orders().is_empty());
    }

    #[tokio::test]
    async fn driver_stops_on_shutdown() {
        let gw = Arc::new(MockGateway::new());
        let h = harness(gw).await;
        let orch = Arc::new(h.orch);
        let handle = tokio::spawn(Arc::clone(&orch).run(h.shutdown.subscribe()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        h.shutdown.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("driver did not stop")
            .unwrap();
    }
}
