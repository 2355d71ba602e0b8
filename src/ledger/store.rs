//! SQLite persistence for the position ledger.
//!
//! # Schema
//!
//! ## trades
//! - id: uuid v4 text
//! - broker_order_id, symbol, side ('BUY' | 'SELL'), quantity (> 0)
//! - entry_price, take_profit_price, stop_loss_price (> 0)
//! - entry_time: UTC timestamp text, fixed width so it sorts lexically
//! - status: 'OPEN' | 'CLOSED'
//! - exit_price, exit_time, exit_reason, pnl, exit_date: all NULL while
//!   OPEN, all set once CLOSED (enforced by a CHECK constraint)
//!
//! ## daily_summary
//! - date: exchange-local 'YYYY-MM-DD' (primary key)
//! - total_trades, winning_trades, losing_trades, total_pnl

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;

use super::{DailySummary, ExitReason, LedgerError, Trade, TradeExit};
use crate::types::Side;

pub type DbPool = SqlitePool;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Open (creating if missing) the database at `database_url` and apply the
/// schema.
pub async fn init_database(database_url: &str) -> Result<DbPool, LedgerError> {
    info!(database_url, "initializing trade store");

    if let Some(db_path) = database_url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    LedgerError::Persistence(sqlx::Error::Configuration(Box::new(e)))
                })?;
            }
        }
    }

    let in_memory = database_url.contains(":memory:");
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

    // Every connection to `:memory:` is its own database.
    let pool = SqlitePoolOptions::new()
        .max_connections(if in_memory { 1 } else { 5 })
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;
    info!("trade store ready");
    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), LedgerError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trades (
            id TEXT PRIMARY KEY,
            broker_order_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            side TEXT NOT NULL CHECK(side IN ('BUY', 'SELL')),
            quantity INTEGER NOT NULL CHECK(quantity > 0),
            entry_price REAL NOT NULL CHECK(entry_price > 0),
            take_profit_price REAL NOT NULL CHECK(take_profit_price > 0),
            stop_loss_price REAL NOT NULL CHECK(stop_loss_price > 0),
            entry_time TEXT NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('OPEN', 'CLOSED')),
            exit_price REAL,
            exit_time TEXT,
            exit_reason TEXT,
            pnl REAL,
            exit_date TEXT,
            CHECK (
                (status = 'OPEN' AND exit_price IS NULL AND exit_time IS NULL
                    AND exit_reason IS NULL AND pnl IS NULL AND exit_date IS NULL)
                OR
                (status = 'CLOSED' AND exit_price IS NOT NULL AND exit_time IS NOT NULL
                    AND exit_reason IS NOT NULL AND pnl IS NOT NULL AND exit_date IS NOT NULL)
            )
        )
        "#,
    )
    .execute(pool)
    .await?;

    for stmt in [
        "CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status)",
        "CREATE INDEX IF NOT EXISTS idx_trades_entry_time ON trades(entry_time)",
        "CREATE INDEX IF NOT EXISTS idx_trades_exit_date ON trades(exit_date)",
    ] {
        sqlx::query(stmt).execute(pool).await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS daily_summary (
            date TEXT PRIMARY KEY,
            total_trades INTEGER NOT NULL,
            winning_trades INTEGER NOT NULL,
            losing_trades INTEGER NOT NULL,
            total_pnl REAL NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
pub(super) struct TradeRow {
    pub id: String,
    pub broker_order_id: String,
    pub symbol: String,
    pub side: String,
    pub quantity: i64,
    pub entry_price: f64,
    pub take_profit_price: f64,
    pub stop_loss_price: f64,
    pub entry_time: String,
    pub status: String,
    pub exit_price: Option<f64>,
    pub exit_time: Option<String>,
    pub exit_reason: Option<String>,
    pub pnl: Option<f64>,
}

impl TryFrom<TradeRow> for Trade {
    type Error = LedgerError;

    fn try_from(row: TradeRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| LedgerError::Corrupt {
            id: row.id.clone(),
            reason,
        };

        let side = Side::from_str(&row.side).map_err(corrupt)?;
        let quantity = u32::try_from(row.quantity)
            .ok()
            .filter(|q| *q > 0)
            .ok_or_else(|| corrupt(format!("quantity {}", row.quantity)))?;
        let entry_time = parse_time(&row.entry_time).map_err(corrupt)?;

        let exit = match (
            row.status.as_str(),
            row.exit_price,
            &row.exit_time,
            &row.exit_reason,
            row.pnl,
        ) {
            ("OPEN", None, None, None, None) => None,
            ("CLOSED", Some(price), Some(time), Some(reason), Some(pnl)) => Some(TradeExit {
                price,
                time: parse_time(time).map_err(corrupt)?,
                reason: ExitReason::from_str(reason).map_err(corrupt)?,
                pnl,
            }),
            (status, ..) => {
                return Err(corrupt(format!("inconsistent exit fields for status {status}")));
            }
        };

        Ok(Trade {
            id: row.id,
            broker_order_id: row.broker_order_id,
            symbol: row.symbol,
            side,
            quantity,
            entry_price: row.entry_price,
            take_profit_price: row.take_profit_price,
            stop_loss_price: row.stop_loss_price,
            entry_time,
            exit,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(super) struct SummaryRow {
    pub date: String,
    pub total_trades: i64,
    pub winning_trades: i64,
    pub losing_trades: i64,
    pub total_pnl: f64,
}

impl TryFrom<SummaryRow> for DailySummary {
    type Error = LedgerError;

    fn try_from(row: SummaryRow) -> Result<Self, Self::Error> {
        let date = NaiveDate::parse_from_str(&row.date, DATE_FORMAT).map_err(|e| {
            LedgerError::Corrupt {
                id: row.date.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(DailySummary {
            date,
            total_trades: row.total_trades.max(0) as u32,
            winning_trades: row.winning_trades.max(0) as u32,
            losing_trades: row.losing_trades.max(0) as u32,
            total_pnl: row.total_pnl,
        })
    }
}

pub(super) fn format_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

pub(super) fn format_date(d: NaiveDate) -> String {
    d.format(DATE_FORMAT).to_string()
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, String> {
    NaiveDateTime::parse_from_str(s, TIME_FORMAT)
        .map(|t| t.and_utc())
        .map_err(|e| format!("timestamp '{s}': {e}"))
}
