// =============================================================================
// Position Monitor - turns barrier crossings into closing orders
// =============================================================================
//
// Once per cycle the orchestrator calls `run_once`:
//   1. Re-record exits whose broker order went through but whose ledger write
//      failed on an earlier cycle.
//   2. Load every OPEN trade and fetch last prices in ONE batched call.
//   3. Evaluate the fixed barriers (see `barrier`).
//   4. For each triggered exit: opposing market order → last price → P&L →
//      `ledger.close`.
//
// A failed order leaves the trade OPEN so the next cycle evaluates it again.
// The in-flight set guarantees that the monitor and a manual close never
// both place an opposing order for the same trade.
// =============================================================================

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::barrier::{check_exits, ExitAction};
use crate::gateway::{ExecutionGateway, GatewayError};
use crate::ledger::{pnl, ExitReason, LedgerError, PositionLedger, Trade, TradeId};

#[derive(Debug, Error)]
pub enum ExitError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Could not fetch prices for the monitor pass.
    #[error("price fetch failed: {0}")]
    Prices(GatewayError),

    /// The opposing order was not placed. The trade is still OPEN.
    #[error("exit order for trade {trade_id} failed: {source}")]
    Order {
        trade_id: TradeId,
        #[source]
        source: GatewayError,
    },

    /// Another exit for this trade is already running or awaiting its
    /// ledger write.
    #[error("an exit for trade {0} is already in progress")]
    InFlight(TradeId),

    #[error("no price available for {0}")]
    NoPrice(String),
}

impl ExitError {
    /// Short machine-friendly tag for the error log.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ledger(LedgerError::NotFound(_)) => "not_found",
            Self::Ledger(LedgerError::InvalidState(_)) => "invalid_state",
            Self::Ledger(_) => "persistence",
            Self::Prices(_) | Self::NoPrice(_) => "data_unavailable",
            Self::Order {
                source: GatewayError::OrderRejected { .. },
                ..
            } => "order_rejected",
            Self::Order { .. } => "gateway",
            Self::InFlight(_) => "in_flight",
        }
    }
}

/// A trade the monitor closed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClosedExit {
    pub trade_id: TradeId,
    pub symbol: String,
    pub reason: ExitReason,
    pub exit_price: f64,
    pub pnl: f64,
}

/// An exit that was attempted and failed this cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedExit {
    pub trade_id: TradeId,
    pub symbol: String,
    pub error: String,
}

/// Outcome of one monitor pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExitReport {
    pub evaluated: usize,
    pub without_price: usize,
    pub closed: Vec<ClosedExit>,
    pub failed: Vec<FailedExit>,
}

/// Exit already executed at the broker, waiting for its ledger write.
#[derive(Debug, Clone, Copy)]
struct PendingClose {
    exit_price: f64,
    reason: ExitReason,
    pnl: f64,
}

pub struct PositionMonitor {
    gateway: Arc<dyn ExecutionGateway>,
    ledger: Arc<PositionLedger>,
    in_flight: Mutex<HashSet<TradeId>>,
    unrecorded: Mutex<HashMap<TradeId, PendingClose>>,
}

/// Removes the trade id from the in-flight set when dropped.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<TradeId>>,
    id: TradeId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}

impl PositionMonitor {
    pub fn new(gateway: Arc<dyn ExecutionGateway>, ledger: Arc<PositionLedger>) -> Self {
        Self {
            gateway,
            ledger,
            in_flight: Mutex::new(HashSet::new()),
            unrecorded: Mutex::new(HashMap::new()),
        }
    }

    /// One monitor pass over every OPEN trade.
    pub async fn run_once(&self) -> Result<ExitReport, ExitError> {
        let mut report = ExitReport::default();
        self.retry_unrecorded(&mut report).await;

        let open = self.open_trades().await?;
        report.evaluated = open.len();
        if open.is_empty() {
            debug!("monitor: no open trades");
            return Ok(report);
        }

        let prices = self
            .gateway
            .last_price(&unique_symbols(&open))
            .await
            .map_err(ExitError::Prices)?;
        report.without_price = open
            .iter()
            .filter(|t| !prices.contains_key(&t.symbol))
            .count();

        for ExitAction {
            trade,
            reason,
            trigger_price,
        } in check_exits(&open, &prices)
        {
            info!(
                trade_id = %trade.id,
                symbol = %trade.symbol,
                side = %trade.side,
                entry_price = trade.entry_price,
                price = trigger_price,
                take_profit = trade.take_profit_price,
                stop_loss = trade.stop_loss_price,
                reason = %reason,
                "exit triggered"
            );
            self.execute_and_report(&trade, reason, trigger_price, &mut report)
                .await;
        }

        Ok(report)
    }

    /// Close every OPEN trade with reason `SquareOff`.
    pub async fn square_off_all(&self) -> Result<ExitReport, ExitError> {
        let mut report = ExitReport::default();
        self.retry_unrecorded(&mut report).await;

        let open = self.open_trades().await?;
        report.evaluated = open.len();
        if open.is_empty() {
            return Ok(report);
        }

        let prices = match self.gateway.last_price(&unique_symbols(&open)).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "square-off: price fetch failed, using entry prices as reference");
                HashMap::new()
            }
        };

        info!(count = open.len(), "square-off: closing all open trades");
        for trade in &open {
            let reference = match prices.get(&trade.symbol) {
                Some(p) => *p,
                None => {
                    report.without_price += 1;
                    trade.entry_price
                }
            };
            self.execute_and_report(trade, ExitReason::SquareOff, reference, &mut report)
                .await;
        }

        Ok(report)
    }

    /// Close one trade on request. Never retried on failure.
    pub async fn close_manually(&self, trade_id: &str) -> Result<ClosedExit, ExitError> {
        let trade = self.ledger.get(trade_id).await?;
        if !trade.is_open() {
            return Err(LedgerError::InvalidState(trade.id).into());
        }
        if self.unrecorded.lock().contains_key(trade_id) {
            return Err(ExitError::InFlight(trade.id));
        }

        let prices = self
            .gateway
            .last_price(std::slice::from_ref(&trade.symbol))
            .await
            .map_err(ExitError::Prices)?;
        let reference = prices
            .get(&trade.symbol)
            .copied()
            .ok_or_else(|| ExitError::NoPrice(trade.symbol.clone()))?;

        info!(trade_id, symbol = %trade.symbol, price = reference, "manual close requested");
        self.execute_exit(&trade, ExitReason::Manual, reference).await
    }

    /// Trades closed at the broker but not yet in the ledger.
    pub fn unrecorded_count(&self) -> usize {
        self.unrecorded.lock().len()
    }

    // -------------------------------------------------------------------------
    // Exit path
    // -------------------------------------------------------------------------

    async fn execute_and_report(
        &self,
        trade: &Trade,
        reason: ExitReason,
        reference_price: f64,
        report: &mut ExitReport,
    ) {
        match self.execute_exit(trade, reason, reference_price).await {
            Ok(closed) => report.closed.push(closed),
            Err(e) => {
                warn!(trade_id = %trade.id, symbol = %trade.symbol, error = %e, "exit failed, will retry next cycle");
                report.failed.push(FailedExit {
                    trade_id: trade.id.clone(),
                    symbol: trade.symbol.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    async fn execute_exit(
        &self,
        trade: &Trade,
        reason: ExitReason,
        reference_price: f64,
    ) -> Result<ClosedExit, ExitError> {
        let _guard = self.claim(&trade.id)?;

        // The trade list may be stale if another exit finished meanwhile.
        if !self.ledger.get(&trade.id).await?.is_open() {
            return Err(LedgerError::InvalidState(trade.id.clone()).into());
        }

        let close_side = trade.side.opposite();
        let order_id = self
            .gateway
            .place_market_order(&trade.symbol, close_side, trade.quantity)
            .await
            .map_err(|source| ExitError::Order {
                trade_id: trade.id.clone(),
                source,
            })?;

        let exit_price = match self
            .gateway
            .last_price(std::slice::from_ref(&trade.symbol))
            .await
        {
            Ok(prices) => prices.get(&trade.symbol).copied().unwrap_or(reference_price),
            Err(e) => {
                warn!(trade_id = %trade.id, error = %e, "post-exit price fetch failed, using trigger price");
                reference_price
            }
        };
        let realised = pnl(trade.side, trade.entry_price, exit_price, trade.quantity);

        match self.ledger.close(&trade.id, exit_price, reason, realised).await {
            Ok(()) => {
                info!(
                    trade_id = %trade.id,
                    symbol = %trade.symbol,
                    order_id = %order_id,
                    exit_price,
                    pnl = realised,
                    reason = %reason,
                    "position closed"
                );
                Ok(ClosedExit {
                    trade_id: trade.id.clone(),
                    symbol: trade.symbol.clone(),
                    reason,
                    exit_price,
                    pnl: realised,
                })
            }
            Err(LedgerError::Persistence(e)) => {
                error!(
                    trade_id = %trade.id,
                    symbol = %trade.symbol,
                    order_id = %order_id,
                    error = %e,
                    "exit order placed but ledger write failed, will re-record next cycle"
                );
                self.unrecorded.lock().insert(
                    trade.id.clone(),
                    PendingClose {
                        exit_price,
                        reason,
                        pnl: realised,
                    },
                );
                Err(LedgerError::Persistence(e).into())
            }
            Err(e) => {
                error!(
                    trade_id = %trade.id,
                    symbol = %trade.symbol,
                    order_id = %order_id,
                    error = %e,
                    "exit order placed for a trade the ledger refused to close"
                );
                Err(e.into())
            }
        }
    }

    /// Reserve `trade_id` for one exit. A trade whose earlier exit order is
    /// still waiting for its ledger write cannot be claimed: the in-flight
    /// lock is held across both checks, and an exit parks itself in
    /// `unrecorded` before releasing its own claim.
    fn claim(&self, trade_id: &str) -> Result<InFlightGuard<'_>, ExitError> {
        let mut in_flight = self.in_flight.lock();
        if self.unrecorded.lock().contains_key(trade_id) {
            debug!(trade_id, "exit already placed, awaiting ledger write");
            return Err(ExitError::InFlight(trade_id.to_string()));
        }
        if !in_flight.insert(trade_id.to_string()) {
            debug!(trade_id, "exit already in flight");
            return Err(ExitError::InFlight(trade_id.to_string()));
        }
        drop(in_flight);
        Ok(InFlightGuard {
            set: &self.in_flight,
            id: trade_id.to_string(),
        })
    }

    async fn open_trades(&self) -> Result<Vec<Trade>, ExitError> {
        let open = self.ledger.list_open().await?;
        let pending = self.unrecorded.lock();
        Ok(open
            .into_iter()
            .filter(|t| !pending.contains_key(&t.id))
            .collect())
    }

    async fn retry_unrecorded(&self, report: &mut ExitReport) {
        let pending: Vec<(TradeId, PendingClose)> = self
            .unrecorded
            .lock()
            .iter()
            .map(|(id, p)| (id.clone(), *p))
            .collect();

        for (id, p) in pending {
            match self.ledger.close(&id, p.exit_price, p.reason, p.pnl).await {
                Ok(()) => {
                    info!(trade_id = %id, "previously unrecorded exit recorded");
                    self.unrecorded.lock().remove(&id);
                    let symbol = self
                        .ledger
                        .get(&id)
                        .await
                        .map(|t| t.symbol)
                        .unwrap_or_default();
                    report.closed.push(ClosedExit {
                        trade_id: id,
                        symbol,
                        reason: p.reason,
                        exit_price: p.exit_price,
                        pnl: p.pnl,
                    });
                }
                Err(LedgerError::Persistence(e)) => {
                    warn!(trade_id = %id, error = %e, "ledger still unavailable for pending exit");
                }
                Err(e) => {
                    warn!(trade_id = %id, error = %e, "dropping pending exit");
                    self.unrecorded.lock().remove(&id);
                }
            }
        }
    }
}

fn unique_symbols(trades: &[Trade]) -> Vec<String> {
    trades
        .iter()
        .map(|t| t.symbol.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
