// =============================================================================
// Kite Connect REST Client - Zerodha brokerage adapter
// =============================================================================
//
// Authentication: every request carries `Authorization: token
// <api_key>:<access_token>` and `X-Kite-Version: 3`. The access token is
// obtained once per trading day by exchanging a login request token
// (`generate_session`). The API secret is used only for that checksum and is
// never logged.
//
// All responses share the envelope
//   { "status": "success" | "error", "data": ..., "message": ..., "error_type": ... }
// and are decoded straight into typed structs.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use super::rate_limit::RequestPacer;
use super::{BrokerOrderId, ExecutionGateway, GatewayError, GatewayResult};
use crate::indicators::normalize_series;
use crate::types::{AccountSnapshot, Bar, Instrument, Side};

const DEFAULT_BASE_URL: &str = "https://api.kite.trade";
/// Kite accepts up to 1000 instruments per quote call; stay well below.
const LTP_BATCH: usize = 500;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: String,
    data: Option<T>,
    message: Option<String>,
    error_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CatalogRow {
    instrument_token: u64,
    tradingsymbol: String,
    instrument_type: String,
    segment: String,
}

#[derive(Debug, Deserialize)]
struct CandleData {
    candles: Vec<(String, f64, f64, f64, f64, f64)>,
}

#[derive(Debug, Deserialize)]
struct OrderData {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct LtpQuote {
    last_price: f64,
}

#[derive(Debug, Deserialize)]
struct Margins {
    equity: SegmentMargin,
}

#[derive(Debug, Deserialize)]
struct SegmentMargin {
    available: AvailableMargin,
}

#[derive(Debug, Deserialize)]
struct AvailableMargin {
    cash: f64,
}

#[derive(Debug, Deserialize)]
struct Positions {
    net: Vec<NetPosition>,
}

#[derive(Debug, Deserialize)]
struct NetPosition {
    tradingsymbol: String,
    quantity: i64,
}

#[derive(Debug, Deserialize)]
struct SessionData {
    access_token: String,
}

/// Whether a failed call was an order submission (rejections are final).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    Query,
    Order,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Kite Connect v3 REST client.
pub struct KiteClient {
    api_key: String,
    exchange: String,
    base_url: String,
    client: reqwest::Client,
    historical_pacer: RequestPacer,
    quote_pacer: RequestPacer,
    order_pacer: RequestPacer,
    default_pacer: RequestPacer,
}

impl KiteClient {
    /// Create a client for `exchange` (e.g. "NSE") with a valid access token.
    pub fn new(
        api_key: impl Into<String>,
        access_token: &str,
        exchange: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let api_key = api_key.into();

        let mut headers = HeaderMap::new();
        headers.insert("X-Kite-Version", HeaderValue::from_static("3"));
        let auth = HeaderValue::from_str(&format!("token {api_key}:{access_token}"))
            .context("access token contains invalid header characters")?;
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build reqwest client")?;

        debug!("KiteClient initialised (base_url={DEFAULT_BASE_URL})");

        Ok(Self {
            api_key,
            exchange: exchange.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            client,
            historical_pacer: RequestPacer::per_second("historical", 3),
            quote_pacer: RequestPacer::per_second("quote", 1),
            order_pacer: RequestPacer::per_second("orders", 10),
            default_pacer: RequestPacer::per_second("default", 10),
        })
    }

    // -------------------------------------------------------------------------
    // Session bootstrap
    // -------------------------------------------------------------------------

    /// Exchange a login `request_token` for an access token.
    #[instrument(skip_all, name = "kite::generate_session")]
    pub async fn generate_session(
        api_key: &str,
        api_secret: &str,
        request_token: &str,
    ) -> anyhow::Result<String> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build reqwest client")?;

        let checksum = session_checksum(api_key, request_token, api_secret);
        let req = client
            .post(format!("{DEFAULT_BASE_URL}/session/token"))
            .header("X-Kite-Version", "3")
            .form(&[
                ("api_key", api_key),
                ("request_token", request_token),
                ("checksum", checksum.as_str()),
            ]);

        let session: SessionData = send(req, "POST /session/token", CallKind::Query)
            .await
            .context("session token exchange failed")?;

        info!("Kite session established");
        Ok(session.access_token)
    }

    /// The exchange-qualified instrument key used by quote endpoints.
    fn quote_key(&self, symbol: &str) -> String {
        format!("{}:{}", self.exchange, symbol)
    }
}

#[async_trait]
impl ExecutionGateway for KiteClient {
    #[instrument(skip(self), name = "kite::instrument_catalog")]
    async fn instrument_catalog(&self, exchange: &str) -> GatewayResult<Vec<Instrument>> {
        self.default_pacer.acquire().await;
        let url = format!("{}/instruments/{}", self.base_url, exchange);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(format!("GET /instruments: {e}")))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| GatewayError::Transport(format!("GET /instruments body: {e}")))?;

        if !status.is_success() {
            return Err(GatewayError::Api {
                status: status.as_u16(),
                message: truncate(&body),
            });
        }

        let instruments = parse_catalog(&body, exchange)?;
        info!(exchange, count = instruments.len(), "instrument catalog loaded");
        Ok(instruments)
    }

    #[instrument(skip(self), name = "kite::historical_bars")]
    async fn historical_bars(
        &self,
        token: u64,
        from: NaiveDate,
        to: NaiveDate,
    ) -> GatewayResult<Vec<Bar>> {
        self.historical_pacer.acquire().await;
        let url = format!("{}/instruments/historical/{}/day", self.base_url, token);
        let req = self.client.get(&url).query(&[
            ("from", format!("{from} 00:00:00")),
            ("to", format!("{to} 23:59:59")),
        ]);

        let data: CandleData = send(req, "GET /instruments/historical", CallKind::Query).await?;
        let bars = map_candles(data.candles)?;
        debug!(token, count = bars.len(), "historical bars fetched");
        Ok(bars)
    }

    #[instrument(skip(self), name = "kite::place_market_order")]
    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: u32,
    ) -> GatewayResult<BrokerOrderId> {
        self.order_pacer.acquire().await;
        let url = format!("{}/orders/regular", self.base_url);
        let quantity = quantity.to_string();
        let req = self.client.post(&url).form(&[
            ("tradingsymbol", symbol),
            ("exchange", self.exchange.as_str()),
            ("transaction_type", side.as_str()),
            ("order_type", "MARKET"),
            ("quantity", quantity.as_str()),
            ("product", "MIS"),
            ("validity", "DAY"),
        ]);

        let order: OrderData = send(req, "POST /orders/regular", CallKind::Order).await?;
        info!(symbol, side = %side, quantity = %quantity, order_id = %order.order_id, "market order placed");
        Ok(order.order_id)
    }

    #[instrument(skip(self, symbols), fields(count = symbols.len()), name = "kite::last_price")]
    async fn last_price(&self, symbols: &[String]) -> GatewayResult<HashMap<String, f64>> {
        let mut prices = HashMap::with_capacity(symbols.len());
        let url = format!("{}/quote/ltp", self.base_url);
        let prefix = format!("{}:", self.exchange);

        for chunk in symbols.chunks(LTP_BATCH) {
            self.quote_pacer.acquire().await;
            let keys: Vec<(&str, String)> = chunk.iter().map(|s| ("i", self.quote_key(s))).collect();
            let req = self.client.get(&url).query(&keys);

            let quotes: HashMap<String, LtpQuote> = send(req, "GET /quote/ltp", CallKind::Query).await?;
            for (key, quote) in quotes {
                let symbol = key.strip_prefix(&prefix).unwrap_or(&key).to_string();
                prices.insert(symbol, quote.last_price);
            }
        }

        if prices.len() < symbols.len() {
            warn!(
                requested = symbols.len(),
                received = prices.len(),
                "last price missing for some symbols"
            );
        }
        Ok(prices)
    }

    #[instrument(skip(self), name = "kite::account_snapshot")]
    async fn account_snapshot(&self) -> GatewayResult<AccountSnapshot> {
        self.default_pacer.acquire().await;
        let margins: Margins = send(
            self.client.get(format!("{}/user/margins", self.base_url)),
            "GET /user/margins",
            CallKind::Query,
        )
        .await?;

        self.default_pacer.acquire().await;
        let positions: Positions = send(
            self.client.get(format!("{}/portfolio/positions", self.base_url)),
            "GET /portfolio/positions",
            CallKind::Query,
        )
        .await?;

        let open: Vec<&NetPosition> = positions.net.iter().filter(|p| p.quantity != 0).collect();
        for p in &open {
            debug!(symbol = %p.tradingsymbol, quantity = p.quantity, "open broker position");
        }
        let open_positions = open.len() as u32;
        Ok(AccountSnapshot {
            available_cash: margins.equity.available.cash,
            open_positions,
        })
    }
}

impl std::fmt::Debug for KiteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KiteClient")
            .field("api_key", &self.api_key)
            .field("access_token", &"<redacted>")
            .field("exchange", &self.exchange)
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Internal helpers
// =============================================================================

/// Send `req` and unwrap the Kite envelope into `T`.
async fn send<T: DeserializeOwned>(
    req: RequestBuilder,
    what: &str,
    kind: CallKind,
) -> GatewayResult<T> {
    let resp = req
        .send()
        .await
        .map_err(|e| GatewayError::Transport(format!("{what}: {e}")))?;

    let status = resp.status();
    let body = resp
        .text()
        .await
        .map_err(|e| GatewayError::Transport(format!("{what} body: {e}")))?;

    decode_envelope(status, &body, what, kind)
}

fn decode_envelope<T: DeserializeOwned>(
    status: StatusCode,
    body: &str,
    what: &str,
    kind: CallKind,
) -> GatewayResult<T> {
    let envelope: Envelope<T> = match serde_json::from_str(body) {
        Ok(env) => env,
        Err(e) if status.is_success() => {
            return Err(GatewayError::Decode(format!("{what}: {e}")));
        }
        Err(_) => {
            return Err(GatewayError::Api {
                status: status.as_u16(),
                message: truncate(body),
            });
        }
    };

    if status.is_success() && envelope.status == "success" {
        return envelope
            .data
            .ok_or_else(|| GatewayError::Decode(format!("{what}: missing data")));
    }

    let message = envelope
        .message
        .unwrap_or_else(|| format!("{what} failed with {status}"));
    let rejected = matches!(
        envelope.error_type.as_deref(),
        Some("OrderException" | "InputException" | "MarginException")
    );

    if kind == CallKind::Order && rejected {
        Err(GatewayError::OrderRejected { reason: message })
    } else {
        Err(GatewayError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

/// Parse the instrument dump CSV, keeping only equities listed on `exchange`.
fn parse_catalog(csv_body: &str, exchange: &str) -> GatewayResult<Vec<Instrument>> {
    let mut reader = csv::Reader::from_reader(csv_body.as_bytes());
    let mut instruments = Vec::new();

    for row in reader.deserialize::<CatalogRow>() {
        let row = row.map_err(|e| GatewayError::Decode(format!("instrument catalog: {e}")))?;
        if row.segment == exchange && row.instrument_type == "EQ" {
            instruments.push(Instrument {
                symbol: row.tradingsymbol,
                token: row.instrument_token,
            });
        }
    }
    Ok(instruments)
}

/// Map Kite candle rows `[timestamp, o, h, l, c, v]` into sorted daily bars.
fn map_candles(candles: Vec<(String, f64, f64, f64, f64, f64)>) -> GatewayResult<Vec<Bar>> {
    let mut bars = Vec::with_capacity(candles.len());
    for (ts, open, high, low, close, volume) in candles {
        let date = DateTime::parse_from_str(&ts, "%Y-%m-%dT%H:%M:%S%z")
            .map_err(|e| GatewayError::Decode(format!("candle timestamp '{ts}': {e}")))?
            .date_naive();
        bars.push(Bar {
            date,
            open,
            high,
            low,
            close,
            volume,
        });
    }
    Ok(normalize_series(bars))
}

/// `sha256(api_key + request_token + api_secret)` as lowercase hex.
fn session_checksum(api_key: &str, request_token: &str, api_secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hasher.update(request_token.as_bytes());
    hasher.update(api_secret.as_bytes());
    hex::encode(hasher.finalize())
}

fn truncate(body: &str) -> String {
    const MAX: usize = 300;
    if body.len() <= MAX {
        return body.to_string();
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}
