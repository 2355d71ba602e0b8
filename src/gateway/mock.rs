// =============================================================================
// In-memory gateway used by unit tests
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;

use super::{BrokerOrderId, ExecutionGateway, GatewayError, GatewayResult};
use crate::types::{AccountSnapshot, Bar, Instrument, Side};

/// One order the mock accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: u32,
}

#[derive(Default)]
struct State {
    instruments: Vec<Instrument>,
    bars: HashMap<u64, Vec<Bar>>,
    prices: HashMap<String, f64>,
    account: Option<AccountSnapshot>,
    orders: Vec<RecordedOrder>,
    order_attempts: usize,
    failing_tokens: HashSet<u64>,
    rejected_symbols: HashSet<String>,
    fail_orders: bool,
    fail_prices: bool,
    fail_account: bool,
    fail_catalog: bool,
    order_delay: Option<Duration>,
    price_delay: Option<Duration>,
    bar_requests: usize,
}

/// Scriptable [`ExecutionGateway`] with failure toggles.
#[derive(Default)]
pub struct MockGateway {
    state: Mutex<State>,
}

impl MockGateway {
    pub fn new() -> Self {
        let gw = Self::default();
        gw.set_account(1_000_000.0, 0);
        gw
    }

    pub fn add_instrument(&self, symbol: &str, token: u64, bars: Vec<Bar>) {
        let mut s = self.state.lock();
        s.instruments.push(Instrument {
            symbol: symbol.to_string(),
            token,
        });
        s.bars.insert(token, bars);
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.state.lock().prices.insert(symbol.to_string(), price);
    }

    pub fn set_account(&self, available_cash: f64, open_positions: u32) {
        self.state.lock().account = Some(AccountSnapshot {
            available_cash,
            open_positions,
        });
    }

    pub fn fail_bars_for(&self, token: u64) {
        self.state.lock().failing_tokens.insert(token);
    }

    pub fn reject_orders_for(&self, symbol: &str) {
        self.state.lock().rejected_symbols.insert(symbol.to_string());
    }

    pub fn set_fail_orders(&self, fail: bool) {
        self.state.lock().fail_orders = fail;
    }

    pub fn set_fail_prices(&self, fail: bool) {
        self.state.lock().fail_prices = fail;
    }

    pub fn set_fail_account(&self, fail: bool) {
        self.state.lock().fail_account = fail;
    }

    pub fn set_fail_catalog(&self, fail: bool) {
        self.state.lock().fail_catalog = fail;
    }

    pub fn set_order_delay(&self, delay: Duration) {
        self.state.lock().order_delay = Some(delay);
    }

    pub fn set_price_delay(&self, delay: Duration) {
        self.state.lock().price_delay = Some(delay);
    }

    pub fn orders(&self) -> Vec<RecordedOrder> {
        self.state.lock().orders.clone()
    }

    /// Orders submitted, including the ones that failed.
    pub fn order_attempts(&self) -> usize {
        self.state.lock().order_attempts
    }

    pub fn bar_requests(&self) -> usize {
        self.state.lock().bar_requests
    }
}

#[async_trait]
impl ExecutionGateway for MockGateway {
    async fn instrument_catalog(&self, _exchange: &str) -> GatewayResult<Vec<Instrument>> {
        let s = self.state.lock();
        if s.fail_catalog {
            return Err(GatewayError::Transport("catalog unavailable".into()));
        }
        Ok(s.instruments.clone())
    }

    async fn historical_bars(
        &self,
        token: u64,
        _from: NaiveDate,
        _to: NaiveDate,
    ) -> GatewayResult<Vec<Bar>> {
        let mut s = self.state.lock();
        s.bar_requests += 1;
        if s.failing_tokens.contains(&token) {
            return Err(GatewayError::Transport(format!("bars for {token} timed out")));
        }
        s.bars
            .get(&token)
            .cloned()
            .ok_or_else(|| GatewayError::DataUnavailable(format!("unknown token {token}")))
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: u32,
    ) -> GatewayResult<BrokerOrderId> {
        let delay = self.state.lock().order_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut s = self.state.lock();
        s.order_attempts += 1;
        if s.fail_orders {
            return Err(GatewayError::Transport("order endpoint unreachable".into()));
        }
        if s.rejected_symbols.contains(symbol) {
            return Err(GatewayError::OrderRejected {
                reason: format!("{symbol} not allowed"),
            });
        }

        let order_id = format!("ORD-{}", s.orders.len() + 1);
        s.orders.push(RecordedOrder {
            order_id: order_id.clone(),
            symbol: symbol.to_string(),
            side,
            quantity,
        });
        Ok(order_id)
    }

    async fn last_price(&self, symbols: &[String]) -> GatewayResult<HashMap<String, f64>> {
        let delay = self.state.lock().price_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let s = self.state.lock();
        if s.fail_prices {
            return Err(GatewayError::Transport("quote endpoint unreachable".into()));
        }
        Ok(symbols
            .iter()
            .filter_map(|sym| s.prices.get(sym).map(|p| (sym.clone(), *p)))
            .collect())
    }

    async fn account_snapshot(&self) -> GatewayResult<AccountSnapshot> {
        let s = self.state.lock();
        if s.fail_account {
            return Err(GatewayError::Api {
                status: 503,
                message: "margins unavailable".into(),
            });
        }
        s.account
            .ok_or_else(|| GatewayError::DataUnavailable("no account".into()))
    }
}
