// =============================================================================
// Fixed Barrier Exits - take profit / stop loss
// =============================================================================
//
// Every trade carries two price barriers fixed at entry:
//
//   Buy:  price >= take_profit  → Target      price <= stop_loss → StopLoss
//   Sell: price <= take_profit  → Target      price >= stop_loss → StopLoss
//
// Target is checked first, so a gapped price that crosses both barriers in
// the same tick resolves to Target. Barriers never move after entry.
// =============================================================================

use std::collections::HashMap;

use tracing::debug;

use crate::ledger::{ExitReason, Trade};
use crate::types::Side;

/// A triggered exit for one open trade.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitAction {
    pub trade: Trade,
    pub reason: ExitReason,
    /// The price that crossed the barrier.
    pub trigger_price: f64,
}

/// Evaluate one trade's barriers against `price`.
pub fn evaluate_exit(trade: &Trade, price: f64) -> Option<ExitReason> {
    match trade.side {
        Side::Buy => {
            if price >= trade.take_profit_price {
                Some(ExitReason::Target)
            } else if price <= trade.stop_loss_price {
                Some(ExitReason::StopLoss)
            } else {
                None
            }
        }
        Side::Sell => {
            if price <= trade.take_profit_price {
                Some(ExitReason::Target)
            } else if price >= trade.stop_loss_price {
                Some(ExitReason::StopLoss)
            } else {
                None
            }
        }
    }
}

/// Exits triggered by `prices` across `open_trades`. Trades without a usable
/// price are left for the next cycle.
pub fn check_exits(open_trades: &[Trade], prices: &HashMap<String, f64>) -> Vec<ExitAction> {
    open_trades
        .iter()
        .filter(|t| t.is_open())
        .filter_map(|trade| {
            let price = match prices.get(&trade.symbol) {
                Some(p) if p.is_finite() && *p > 0.0 => *p,
                _ => {
                    debug!(trade_id = %trade.id, symbol = %trade.symbol, "no price this cycle");
                    return None;
                }
            };
            evaluate_exit(trade, price).map(|reason| ExitAction {
                trade: trade.clone(),
                reason,
                trigger_price: price,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{exit_levels, TradeExit};
    use chrono::Utc;

    fn trade(symbol: &str, side: Side, entry: f64) -> Trade {
        let (tp, sl) = exit_levels(side, entry, 3.0, 3.0);
        Trade {
            id: format!("t-{symbol}"),
            broker_order_id: "o".into(),
            symbol: symbol.into(),
            side,
            quantity: 10,
            entry_price: entry,
            take_profit_price: tp,
            stop_loss_price: sl,
            entry_time: Utc::now(),
            exit: None,
        }
    }

    #[test]
    fn buy_barriers() {
        let t = trade("A", Side::Buy, 100.0);
        assert_eq!(evaluate_exit(&t, 103.0), Some(ExitReason::Target));
        assert_eq!(evaluate_exit(&t, 110.0), Some(ExitReason::Target));
        assert_eq!(evaluate_exit(&t, 97.0), Some(ExitReason::StopLoss));
        assert_eq!(evaluate_exit(&t, 100.0), None);
    }

    #[test]
    fn sell_barriers() {
        let t = trade("A", Side::Sell, 100.0);
        assert_eq!(evaluate_exit(&t, 97.0), Some(ExitReason::Target));
        assert_eq!(evaluate_exit(&t, 103.0), Some(ExitReason::StopLoss));
        assert_eq!(evaluate_exit(&t, 101.0), None);
    }

    #[test]
    fn target_wins_when_both_barriers_cross() {
        // Overlapping barriers: any price satisfies both comparisons.
        let mut buy = trade("A", Side::Buy, 100.0);
        buy.take_profit_price = 95.0;
        buy.stop_loss_price = 105.0;
        assert_eq!(evaluate_exit(&buy, 100.0), Some(ExitReason::Target));

        let mut sell = trade("B", Side::Sell, 100.0);
        sell.take_profit_price = 105.0;
        sell.stop_loss_price = 95.0;
        assert_eq!(evaluate_exit(&sell, 100.0), Some(ExitReason::Target));
    }

    #[test]
    fn missing_prices_are_skipped() {
        let trades = vec![trade("A", Side::Buy, 100.0), trade("B", Side::Sell, 50.0)];
        let mut prices = HashMap::new();
        prices.insert("A".to_string(), 104.0);
        prices.insert("B".to_string(), f64::NAN);

        let actions = check_exits(&trades, &prices);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].trade.symbol, "A");
        assert_eq!(actions[0].reason, ExitReason::Target);
        assert_eq!(actions[0].trigger_price, 104.0);
    }

    #[test]
    fn closed_trades_are_ignored() {
        let mut t = trade("A", Side::Buy, 100.0);
        t.exit = Some(TradeExit {
            price: 103.0,
            time: Utc::now(),
            reason: ExitReason::Target,
            pnl: 30.0,
        });
        let prices = HashMap::from([("A".to_string(), 200.0)]);
        assert!(check_exits(&[t], &prices).is_empty());
    }
}
