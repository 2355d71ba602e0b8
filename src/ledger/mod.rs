// =============================================================================
// Position Ledger - authoritative trade records and daily P&L aggregation
// =============================================================================
//
// Every trade moves OPEN → CLOSED exactly once. The close is a conditional
// update (`WHERE status = 'OPEN'`) executed in the same transaction as the
// daily-summary upsert for the exit date, so a double close can never be
// counted twice and a summary never disagrees with the rows it is built from.
//
// Only this module writes trade rows. The monitor and orchestrator request
// opens and closes through `PositionLedger`; the REST layer only reads.
// =============================================================================

pub mod store;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use self::store::{format_date, format_time, DbPool, SummaryRow, TradeRow};
use crate::types::Side;

pub type TradeId = String;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LedgerError {
    /// The backing store failed. Nothing was written.
    #[error("persistence failure: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("trade {0} not found")]
    NotFound(TradeId),

    /// The trade is already CLOSED.
    #[error("trade {0} is not open")]
    InvalidState(TradeId),

    #[error("stored record {id} is corrupt: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("invalid trade: {0}")]
    InvalidTrade(String),
}

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExitReason {
    Target,
    StopLoss,
    Manual,
    /// End-of-day auto-close.
    SquareOff,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Target => "TARGET",
            Self::StopLoss => "STOPLOSS",
            Self::Manual => "MANUAL",
            Self::SquareOff => "SQUAREOFF",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExitReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TARGET" => Ok(Self::Target),
            "STOPLOSS" => Ok(Self::StopLoss),
            "MANUAL" => Ok(Self::Manual),
            "SQUAREOFF" => Ok(Self::SquareOff),
            other => Err(format!("unknown exit reason '{other}'")),
        }
    }
}

/// Exit fields of a CLOSED trade. Present as a unit or not at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeExit {
    pub price: f64,
    pub time: DateTime<Utc>,
    pub reason: ExitReason,
    pub pnl: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub broker_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: u32,
    pub entry_price: f64,
    pub take_profit_price: f64,
    pub stop_loss_price: f64,
    pub entry_time: DateTime<Utc>,
    pub exit: Option<TradeExit>,
}

impl Trade {
    pub fn status(&self) -> TradeStatus {
        if self.exit.is_some() {
            TradeStatus::Closed
        } else {
            TradeStatus::Open
        }
    }

    pub fn is_open(&self) -> bool {
        self.exit.is_none()
    }

    /// Realised P&L as a percentage of the entry notional.
    pub fn pnl_pct(&self) -> Option<f64> {
        let notional = self.entry_price * f64::from(self.quantity);
        self.exit
            .as_ref()
            .filter(|_| notional > 0.0)
            .map(|exit| exit.pnl / notional * 100.0)
    }
}

/// Everything needed to record a freshly filled entry order.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTrade {
    pub symbol: String,
    pub side: Side,
    pub quantity: u32,
    pub entry_price: f64,
    pub take_profit_price: f64,
    pub stop_loss_price: f64,
    pub broker_order_id: String,
}

impl NewTrade {
    fn validate(&self) -> Result<(), LedgerError> {
        if self.quantity == 0 {
            return Err(LedgerError::InvalidTrade(format!("{}: quantity must be > 0", self.symbol)));
        }
        for (name, value) in [
            ("entry_price", self.entry_price),
            ("take_profit_price", self.take_profit_price),
            ("stop_loss_price", self.stop_loss_price),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(LedgerError::InvalidTrade(format!(
                    "{}: {name} must be positive, got {value}",
                    self.symbol
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Page {
    #[serde(default = "Page::default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

impl Page {
    pub const MAX_LIMIT: u32 = 500;

    fn default_limit() -> u32 {
        50
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: Self::default_limit(),
            offset: 0,
        }
    }
}

/// Aggregate of the trades that closed on one exchange-local date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub total_pnl: f64,
}

// ---------------------------------------------------------------------------
// Price conventions
// ---------------------------------------------------------------------------

/// Realised P&L of a round trip.
pub fn pnl(side: Side, entry: f64, exit: f64, quantity: u32) -> f64 {
    let qty = f64::from(quantity);
    match side {
        Side::Buy => (exit - entry) * qty,
        Side::Sell => (entry - exit) * qty,
    }
}

/// `(take_profit, stop_loss)` for an entry at `entry`.
pub fn exit_levels(side: Side, entry: f64, take_profit_pct: f64, stop_loss_pct: f64) -> (f64, f64) {
    let tp = take_profit_pct / 100.0;
    let sl = stop_loss_pct / 100.0;
    match side {
        Side::Buy => (entry * (1.0 + tp), entry * (1.0 - sl)),
        Side::Sell => (entry * (1.0 - tp), entry * (1.0 + sl)),
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

pub struct PositionLedger {
    pool: DbPool,
    /// Exchange offset used to assign exit dates.
    tz: FixedOffset,
}

impl PositionLedger {
    pub async fn connect(database_url: &str, tz: FixedOffset) -> Result<Self, LedgerError> {
        let pool = store::init_database(database_url).await?;
        Ok(Self { pool, tz })
    }

    /// Record a new OPEN trade and return its id.
    pub async fn open(&self, trade: NewTrade) -> Result<TradeId, LedgerError> {
        trade.validate()?;
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO trades (
                id, broker_order_id, symbol, side, quantity, entry_price,
                take_profit_price, stop_loss_price, entry_time, status
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'OPEN')
            "#,
        )
        .bind(&id)
        .bind(&trade.broker_order_id)
        .bind(&trade.symbol)
        .bind(trade.side.as_str())
        .bind(i64::from(trade.quantity))
        .bind(trade.entry_price)
        .bind(trade.take_profit_price)
        .bind(trade.stop_loss_price)
        .bind(format_time(Utc::now()))
        .execute(&self.pool)
        .await?;

        info!(
            trade_id = %id,
            symbol = %trade.symbol,
            side = %trade.side,
            quantity = trade.quantity,
            entry_price = trade.entry_price,
            take_profit = trade.take_profit_price,
            stop_loss = trade.stop_loss_price,
            "trade opened"
        );
        Ok(id)
    }

    /// Close an OPEN trade now.
    pub async fn close(
        &self,
        id: &str,
        exit_price: f64,
        reason: ExitReason,
        pnl: f64,
    ) -> Result<(), LedgerError> {
        self.close_at(id, exit_price, reason, pnl, Utc::now()).await
    }

    /// Close an OPEN trade with an explicit exit timestamp.
    pub async fn close_at(
        &self,
        id: &str,
        exit_price: f64,
        reason: ExitReason,
        pnl: f64,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        if !(exit_price.is_finite() && exit_price > 0.0) || !pnl.is_finite() {
            return Err(LedgerError::InvalidTrade(format!(
                "{id}: exit price {exit_price} / pnl {pnl} out of range"
            )));
        }

        let exit_date = at.with_timezone(&self.tz).date_naive();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE trades
            SET status = 'CLOSED', exit_price = ?1, exit_time = ?2, exit_reason = ?3,
                pnl = ?4, exit_date = ?5
            WHERE id = ?6 AND status = 'OPEN'
            "#,
        )
        .bind(exit_price)
        .bind(format_time(at))
        .bind(reason.as_str())
        .bind(pnl)
        .bind(format_date(exit_date))
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            let exists: Option<String> = sqlx::query_scalar("SELECT status FROM trades WHERE id = ?1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
            tx.rollback().await?;

            return Err(match exists {
                None => LedgerError::NotFound(id.to_string()),
                Some(_) => {
                    warn!(trade_id = id, "close rejected: trade already closed");
                    LedgerError::InvalidState(id.to_string())
                }
            });
        }

        upsert_daily_summary(&mut tx, exit_date).await?;
        tx.commit().await?;

        info!(trade_id = id, exit_price, reason = %reason, pnl, "trade closed");
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Trade, LedgerError> {
        let row = sqlx::query_as::<_, TradeRow>("SELECT * FROM trades WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.ok_or_else(|| LedgerError::NotFound(id.to_string()))?
            .try_into()
    }

    pub async fn list_open(&self) -> Result<Vec<Trade>, LedgerError> {
        let rows = sqlx::query_as::<_, TradeRow>(
            "SELECT * FROM trades WHERE status = 'OPEN' ORDER BY entry_time DESC, rowid DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Trade::try_from).collect()
    }

    /// One page of all trades, newest entry first, plus the total count.
    pub async fn list_all(&self, page: Page) -> Result<(Vec<Trade>, u64), LedgerError> {
        let limit = page.limit.clamp(1, Page::MAX_LIMIT);

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM trades")
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query_as::<_, TradeRow>(
            "SELECT * FROM trades ORDER BY entry_time DESC, rowid DESC LIMIT ?1 OFFSET ?2",
        )
        .bind(i64::from(limit))
        .bind(i64::from(page.offset))
        .fetch_all(&self.pool)
        .await?;

        let trades = rows
            .into_iter()
            .map(Trade::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((trades, total.max(0) as u64))
    }

    /// The `days` most recent daily summaries, newest first.
    pub async fn daily_summaries(&self, days: u32) -> Result<Vec<DailySummary>, LedgerError> {
        let rows = sqlx::query_as::<_, SummaryRow>(
            r#"
            SELECT date, total_trades, winning_trades, losing_trades, total_pnl
            FROM daily_summary
            ORDER BY date DESC
            LIMIT ?1
            "#,
        )
        .bind(i64::from(days))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DailySummary::try_from).collect()
    }

    #[cfg(test)]
    pub(crate) async fn in_memory() -> Self {
        Self::connect("sqlite::memory:", FixedOffset::east_opt(5 * 3600 + 1800).unwrap())
            .await
            .unwrap()
    }

    #[cfg(test)]
    pub(crate) async fn shutdown_store(&self) {
        self.pool.close().await;
    }
}

/// Rebuild the summary row for `date` from the CLOSED trades exiting on it.
async fn upsert_daily_summary(conn: &mut SqliteConnection, date: NaiveDate) -> Result<(), LedgerError> {
    sqlx::query(
        r#"
        INSERT INTO daily_summary (date, total_trades, winning_trades, losing_trades, total_pnl, updated_at)
        SELECT ?1,
               COUNT(*),
               COALESCE(SUM(CASE WHEN pnl > 0 THEN 1 ELSE 0 END), 0),
               COALESCE(SUM(CASE WHEN pnl <= 0 THEN 1 ELSE 0 END), 0),
               COALESCE(SUM(pnl), 0.0),
               ?2
        FROM trades
        WHERE status = 'CLOSED' AND exit_date = ?1
        ON CONFLICT(date) DO UPDATE SET
            total_trades = excluded.total_trades,
            winning_trades = excluded.winning_trades,
            losing_trades = excluded.losing_trades,
            total_pnl = excluded.total_pnl,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(format_date(date))
    .bind(format_time(Utc::now()))
    .execute(&mut *conn)
    .await?;

    debug!(%date, "daily summary updated");
    Ok(())
}
