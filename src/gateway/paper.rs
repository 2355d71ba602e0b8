// =============================================================================
// Paper Gateway - demo-mode order simulation over live market data
// =============================================================================
//
// Wraps a real gateway. Catalog, historical bars and last prices are
// delegated unchanged; orders never reach the broker. Each simulated order
// gets a `PAPER-` id and adjusts a local signed net position per symbol, so
// `account_snapshot` reports the simulated exposure against a fixed capital.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use tracing::info;
use uuid::Uuid;

use super::{BrokerOrderId, ExecutionGateway, GatewayResult};
use crate::ledger::Trade;
use crate::types::{AccountSnapshot, Bar, Instrument, Side};

/// Demo-mode decorator around a market-data source.
pub struct PaperGateway {
    inner: Arc<dyn ExecutionGateway>,
    capital: f64,
    /// Signed net quantity per symbol (positive long, negative short).
    net: Mutex<HashMap<String, i64>>,
}

impl PaperGateway {
    pub fn new(inner: Arc<dyn ExecutionGateway>, capital: f64) -> Self {
        Self {
            inner,
            capital,
            net: Mutex::new(HashMap::new()),
        }
    }

    /// Seed the simulated book with trades still OPEN in the ledger, so a
    /// restart does not forget positions taken before it.
    pub fn with_open_trades(self, trades: &[Trade]) -> Self {
        {
            let mut net = self.net.lock();
            for trade in trades.iter().filter(|t| t.is_open()) {
                *net.entry(trade.symbol.clone()).or_insert(0) += signed(trade.side, trade.quantity);
            }
            net.retain(|_, qty| *qty != 0);
            info!(trades = trades.len(), positions = net.len(), "paper book restored from ledger");
        }
        self
    }

    /// Current simulated net quantity for `symbol`.
    pub fn net_quantity(&self, symbol: &str) -> i64 {
        self.net.lock().get(symbol).copied().unwrap_or(0)
    }
}

fn signed(side: Side, quantity: u32) -> i64 {
    match side {
        Side::Buy => i64::from(quantity),
        Side::Sell => -i64::from(quantity),
    }
}

#[async_trait]
impl ExecutionGateway for PaperGateway {
    async fn instrument_catalog(&self, exchange: &str) -> GatewayResult<Vec<Instrument>> {
        self.inner.instrument_catalog(exchange).await
    }

    async fn historical_bars(
        &self,
        token: u64,
        from: NaiveDate,
        to: NaiveDate,
    ) -> GatewayResult<Vec<Bar>> {
        self.inner.historical_bars(token, from, to).await
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: u32,
    ) -> GatewayResult<BrokerOrderId> {
        let order_id = format!("PAPER-{}", Uuid::new_v4());
        let delta = signed(side, quantity);

        {
            let mut net = self.net.lock();
            let entry = net.entry(symbol.to_string()).or_insert(0);
            *entry += delta;
            if *entry == 0 {
                net.remove(symbol);
            }
        }

        let net_after = self.net_quantity(symbol);
        info!(symbol, side = %side, quantity, order_id = %order_id, net_after, "paper fill");
        Ok(order_id)
    }

    async fn last_price(&self, symbols: &[String]) -> GatewayResult<HashMap<String, f64>> {
        self.inner.last_price(symbols).await
    }

    async fn account_snapshot(&self) -> GatewayResult<AccountSnapshot> {
        let open_positions = self.net.lock().len() as u32;
        Ok(AccountSnapshot {
            available_cash: self.capital,
            open_positions,
        })
    }
}
