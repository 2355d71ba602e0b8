// =============================================================================
// Runtime Configuration - engine settings with atomic save
// =============================================================================
//
// Every tunable parameter of the trading engine lives here. The file is plain
// JSON; all fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file. The breakout and breakdown sections
// fall back to their own side's defaults field by field.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. Secrets (API keys, access tokens) are never stored here; they come
// from the environment.
// =============================================================================

use std::path::Path;

use anyhow::{ensure, Context, Result};
use chrono::{FixedOffset, NaiveTime, Offset, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::info;

use crate::types::AccountMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_lookback_days() -> usize {
    125
}

fn default_rsi_period() -> usize {
    14
}

fn default_history_days() -> i64 {
    200
}

fn default_scan_concurrency() -> usize {
    4
}

fn default_breakout_rsi() -> f64 {
    70.0
}

fn default_breakdown_rsi() -> f64 {
    30.0
}

fn default_breakout_allocation_pct() -> f64 {
    0.1
}

fn default_breakdown_allocation_pct() -> f64 {
    1.0
}

fn default_volume_ratio_threshold() -> f64 {
    1.0
}

fn default_exit_pct() -> f64 {
    3.0
}

fn default_max_positions() -> u32 {
    10
}

fn default_scan_interval_minutes() -> u64 {
    5
}

fn default_exchange() -> String {
    "NSE".to_string()
}

fn default_open_time() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 15, 0).unwrap_or_default()
}

fn default_close_time() -> NaiveTime {
    NaiveTime::from_hms_opt(15, 30, 0).unwrap_or_default()
}

fn default_square_off_time() -> NaiveTime {
    NaiveTime::from_hms_opt(15, 20, 0).unwrap_or_default()
}

fn default_utc_offset_minutes() -> i32 {
    330
}

fn default_database_url() -> String {
    "sqlite://data/trades.db".to_string()
}

fn default_paper_capital() -> f64 {
    1_000_000.0
}

// =============================================================================
// Sections
// =============================================================================

/// Entry/exit parameters for one side of the strategy.
///
/// The two sides default differently, so a section is read through
/// [`SideSection`] and any field it omits falls back to that side's default.
#[derive(Debug, Clone, Serialize)]
pub struct SideParams {
    /// RSI filter. Breakouts require RSI below it, breakdowns above it.
    pub rsi_threshold: f64,
    /// Volume confirmation. Breakouts need `volume / volume_sma` above it,
    /// breakdowns need `volume_sma / volume` above it.
    pub volume_ratio_threshold: f64,
    /// Share of available cash committed per entry, in percent.
    pub allocation_pct: f64,
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
}

impl SideParams {
    pub fn breakout() -> Self {
        Self {
            rsi_threshold: default_breakout_rsi(),
            volume_ratio_threshold: default_volume_ratio_threshold(),
            allocation_pct: default_breakout_allocation_pct(),
            take_profit_pct: default_exit_pct(),
            stop_loss_pct: default_exit_pct(),
        }
    }

    pub fn breakdown() -> Self {
        Self {
            rsi_threshold: default_breakdown_rsi(),
            volume_ratio_threshold: default_volume_ratio_threshold(),
            allocation_pct: default_breakdown_allocation_pct(),
            take_profit_pct: default_exit_pct(),
            stop_loss_pct: default_exit_pct(),
        }
    }
}

/// A side section as written in the file; every field is optional.
#[derive(Debug, Default, Deserialize)]
struct SideSection {
    rsi_threshold: Option<f64>,
    volume_ratio_threshold: Option<f64>,
    allocation_pct: Option<f64>,
    take_profit_pct: Option<f64>,
    stop_loss_pct: Option<f64>,
}

impl SideSection {
    fn over(self, base: SideParams) -> SideParams {
        SideParams {
            rsi_threshold: self.rsi_threshold.unwrap_or(base.rsi_threshold),
            volume_ratio_threshold: self
                .volume_ratio_threshold
                .unwrap_or(base.volume_ratio_threshold),
            allocation_pct: self.allocation_pct.unwrap_or(base.allocation_pct),
            take_profit_pct: self.take_profit_pct.unwrap_or(base.take_profit_pct),
            stop_loss_pct: self.stop_loss_pct.unwrap_or(base.stop_loss_pct),
        }
    }
}

fn breakout_section<'de, D: Deserializer<'de>>(d: D) -> Result<SideParams, D::Error> {
    SideSection::deserialize(d).map(|s| s.over(SideParams::breakout()))
}

fn breakdown_section<'de, D: Deserializer<'de>>(d: D) -> Result<SideParams, D::Error> {
    SideSection::deserialize(d).map(|s| s.over(SideParams::breakdown()))
}

/// Universe and indicator window settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanParams {
    #[serde(default = "default_lookback_days")]
    pub lookback_days: usize,
    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,
    /// Calendar days of history requested per instrument. Must cover
    /// `lookback_days` trading sessions plus weekends and holidays.
    #[serde(default = "default_history_days")]
    pub history_days: i64,
    /// Maximum number of instruments fetched concurrently.
    #[serde(default = "default_scan_concurrency")]
    pub scan_concurrency: usize,
    /// Optional allow-list of symbols. Empty means the full catalog.
    #[serde(default)]
    pub symbols: Vec<String>,
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            lookback_days: default_lookback_days(),
            rsi_period: default_rsi_period(),
            history_days: default_history_days(),
            scan_concurrency: default_scan_concurrency(),
            symbols: Vec::new(),
        }
    }
}

/// Position caps and scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralParams {
    #[serde(default = "default_max_positions")]
    pub max_positions: u32,
    #[serde(default = "default_scan_interval_minutes")]
    pub scan_interval_minutes: u64,
    /// Square off every open trade at `market.square_off_time`.
    #[serde(default = "default_true")]
    pub auto_close_at_market_close: bool,
    /// Do not re-enter a symbol that already has an open trade.
    #[serde(default = "default_true")]
    pub skip_held_symbols: bool,
}

impl Default for GeneralParams {
    fn default() -> Self {
        Self {
            max_positions: default_max_positions(),
            scan_interval_minutes: default_scan_interval_minutes(),
            auto_close_at_market_close: true,
            skip_held_symbols: true,
        }
    }
}

/// Exchange session window, expressed in exchange-local time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketParams {
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default = "default_open_time")]
    pub open_time: NaiveTime,
    #[serde(default = "default_close_time")]
    pub close_time: NaiveTime,
    #[serde(default = "default_square_off_time")]
    pub square_off_time: NaiveTime,
    /// Exchange offset from UTC (IST is +330).
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,
}

impl Default for MarketParams {
    fn default() -> Self {
        Self {
            exchange: default_exchange(),
            open_time: default_open_time(),
            close_time: default_close_time(),
            square_off_time: default_square_off_time(),
            utc_offset_minutes: default_utc_offset_minutes(),
        }
    }
}

impl MarketParams {
    pub fn timezone(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix())
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level configuration for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Demo routes orders to the paper broker; Live sends them to Kite.
    #[serde(default)]
    pub account_mode: AccountMode,

    #[serde(default = "SideParams::breakout", deserialize_with = "breakout_section")]
    pub breakout: SideParams,

    #[serde(default = "SideParams::breakdown", deserialize_with = "breakdown_section")]
    pub breakdown: SideParams,

    #[serde(default)]
    pub scan: ScanParams,

    #[serde(default)]
    pub general: GeneralParams,

    #[serde(default)]
    pub market: MarketParams,

    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Starting cash reported by the paper broker in Demo mode.
    #[serde(default = "default_paper_capital")]
    pub paper_capital: f64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            account_mode: AccountMode::Demo,
            breakout: SideParams::breakout(),
            breakdown: SideParams::breakdown(),
            scan: ScanParams::default(),
            general: GeneralParams::default(),
            market: MarketParams::default(),
            database_url: default_database_url(),
            paper_capital: default_paper_capital(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("invalid runtime config in {}", path.display()))?;

        info!(
            path = %path.display(),
            account_mode = %config.account_mode,
            max_positions = config.general.max_positions,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Load `path`, or write the defaults there when the file does not exist.
    pub fn load_or_init(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }

        info!(path = %path.display(), "no config file found — writing defaults");
        let config = Self::default();
        config.save(path)?;
        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.scan.lookback_days > 0, "scan.lookback_days must be positive");
        ensure!(self.scan.rsi_period > 0, "scan.rsi_period must be positive");
        ensure!(self.scan.scan_concurrency > 0, "scan.scan_concurrency must be positive");
        ensure!(
            self.general.scan_interval_minutes > 0,
            "general.scan_interval_minutes must be positive"
        );
        ensure!(
            self.market.open_time < self.market.close_time,
            "market.open_time must precede market.close_time"
        );

        for (name, params) in [("breakout", &self.breakout), ("breakdown", &self.breakdown)] {
            ensure!(
                params.allocation_pct > 0.0 && params.allocation_pct <= 100.0,
                "{name}.allocation_pct must be within (0, 100]"
            );
            ensure!(
                params.take_profit_pct > 0.0 && params.stop_loss_pct > 0.0,
                "{name} take-profit and stop-loss percentages must be positive"
            );
            ensure!(
                params.volume_ratio_threshold > 0.0,
                "{name}.volume_ratio_threshold must be positive"
            );
            ensure!(
                params.stop_loss_pct < 100.0,
                "{name}.stop_loss_pct must be below 100"
            );
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.account_mode, AccountMode::Demo);
        assert_eq!(cfg.scan.lookback_days, 125);
        assert_eq!(cfg.scan.rsi_period, 14);
        assert!((cfg.breakout.rsi_threshold - 70.0).abs() < f64::EPSILON);
        assert!((cfg.breakdown.rsi_threshold - 30.0).abs() < f64::EPSILON);
        assert!((cfg.breakout.allocation_pct - 0.1).abs() < f64::EPSILON);
        assert!((cfg.breakdown.allocation_pct - 1.0).abs() < f64::EPSILON);
        assert!((cfg.breakout.take_profit_pct - 3.0).abs() < f64::EPSILON);
        assert!((cfg.breakdown.stop_loss_pct - 3.0).abs() < f64::EPSILON);
        assert_eq!(cfg.general.max_positions, 10);
        assert_eq!(cfg.general.scan_interval_minutes, 5);
        assert!(cfg.general.auto_close_at_market_close);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.account_mode, AccountMode::Demo);
        assert_eq!(cfg.general.max_positions, 10);
        assert_eq!(cfg.market.exchange, "NSE");
        assert_eq!(cfg.market.open_time, NaiveTime::from_hms_opt(9, 15, 0).unwrap());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "account_mode": "Live",
            "general": { "max_positions": 4 },
            "breakout": { "rsi_threshold": 65.0, "allocation_pct": 0.5 }
        }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.account_mode, AccountMode::Live);
        assert_eq!(cfg.general.max_positions, 4);
        assert_eq!(cfg.general.scan_interval_minutes, 5);
        assert!((cfg.breakout.rsi_threshold - 65.0).abs() < f64::EPSILON);
        assert!((cfg.breakout.take_profit_pct - 3.0).abs() < f64::EPSILON);
        assert!((cfg.breakdown.rsi_threshold - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn partial_side_section_keeps_that_sides_defaults() {
        let json = r#"{ "breakdown": { "take_profit_pct": 2.0 } }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert!((cfg.breakdown.take_profit_pct - 2.0).abs() < f64::EPSILON);
        assert!((cfg.breakdown.rsi_threshold - 30.0).abs() < f64::EPSILON);
        assert!((cfg.breakdown.allocation_pct - 1.0).abs() < f64::EPSILON);
        assert!((cfg.breakdown.stop_loss_pct - 3.0).abs() < f64::EPSILON);
        assert!((cfg.breakdown.volume_ratio_threshold - 1.0).abs() < f64::EPSILON);
        assert!((cfg.breakout.rsi_threshold - 70.0).abs() < f64::EPSILON);
        assert!(cfg.validate().is_ok());

        let empty: RuntimeConfig = serde_json::from_str(r#"{ "breakout": {} }"#).unwrap();
        assert!((empty.breakout.allocation_pct - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn saved_side_sections_load_back() {
        let mut cfg = RuntimeConfig::default();
        cfg.breakout.volume_ratio_threshold = 1.5;
        let json = serde_json::to_string(&cfg).unwrap();
        let loaded: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert!((loaded.breakout.volume_ratio_threshold - 1.5).abs() < f64::EPSILON);
        assert!((loaded.breakdown.rsi_threshold - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn validate_rejects_non_positive_volume_ratio() {
        let mut cfg = RuntimeConfig::default();
        cfg.breakout.volume_ratio_threshold = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_allocation() {
        let mut cfg = RuntimeConfig::default();
        cfg.breakdown.allocation_pct = 0.0;
        assert!(cfg.validate().is_err());
        cfg.breakdown.allocation_pct = 150.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_session() {
        let mut cfg = RuntimeConfig::default();
        cfg.market.open_time = NaiveTime::from_hms_opt(16, 0, 0).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn market_timezone_is_ist_by_default() {
        let tz = MarketParams::default().timezone();
        assert_eq!(tz.local_minus_utc(), 330 * 60);
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = std::env::temp_dir().join(format!("trader-cfg-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("trader_config.json");

        let created = RuntimeConfig::load_or_init(&path).unwrap();
        assert!(path.exists());
        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(created.general.max_positions, loaded.general.max_positions);
        assert_eq!(created.market.close_time, loaded.market.close_time);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
