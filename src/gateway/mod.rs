// =============================================================================
// Execution Gateway - the engine's only view of the brokerage
// =============================================================================
//
// Everything the core needs from the broker goes through `ExecutionGateway`.
// Implementations map raw broker payloads into the typed structs in
// `crate::types` at this boundary; nothing downstream sees untyped JSON.
//
//   KiteClient   - Zerodha Kite Connect REST adapter (live orders).
//   PaperGateway - decorator that keeps market data live but simulates
//                  orders and positions locally (demo mode).
// =============================================================================

pub mod kite;
pub mod paper;
pub mod rate_limit;

#[cfg(test)]
pub mod mock;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

use crate::types::{AccountSnapshot, Bar, Instrument, Side};

/// Broker-assigned order reference.
pub type BrokerOrderId = String;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Failures surfaced by a gateway call.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Network or timeout failure. Retry on the next cycle.
    #[error("transport error: {0}")]
    Transport(String),

    /// The broker answered with an error that is not an order rejection.
    #[error("broker API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The broker declined the order. Do not retry within the cycle.
    #[error("order rejected: {reason}")]
    OrderRejected { reason: String },

    /// The broker has no data for the request (unknown token, no price).
    #[error("data unavailable: {0}")]
    DataUnavailable(String),

    /// The response could not be mapped into the expected shape.
    #[error("malformed broker response: {0}")]
    Decode(String),
}

impl GatewayError {
    /// Whether the same call may succeed on a later cycle.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::DataUnavailable(_) => true,
            Self::Api { status, .. } => *status >= 500 || *status == 429,
            Self::OrderRejected { .. } | Self::Decode(_) => false,
        }
    }
}

/// Broker operations consumed by the scanner, monitor and orchestrator.
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    /// Tradable equity instruments on `exchange`.
    async fn instrument_catalog(&self, exchange: &str) -> GatewayResult<Vec<Instrument>>;

    /// Daily bars for `token` between `from` and `to` inclusive.
    async fn historical_bars(
        &self,
        token: u64,
        from: NaiveDate,
        to: NaiveDate,
    ) -> GatewayResult<Vec<Bar>>;

    /// Submit a market order and return the broker's order id.
    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: u32,
    ) -> GatewayResult<BrokerOrderId>;

    /// Last traded price for each symbol. Symbols without a quote are absent
    /// from the map.
    async fn last_price(&self, symbols: &[String]) -> GatewayResult<HashMap<String, f64>>;

    async fn account_snapshot(&self) -> GatewayResult<AccountSnapshot>;
}
