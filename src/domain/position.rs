//! Position tracking and the trade ledger.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::stage::StopRatchet;

#[derive(Debug, Clone, PartialEq)]
pub struct Lot {
    pub entry_date: NaiveDate,
    pub entry_price: f64,
    pub quantity: i64,
    pub stage: usize,
}

/// A long position built from one or more buy lots and reduced by sell stages.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub instrument_id: String,
    pub lots: Vec<Lot>,
    pub filled_buy_stages: BTreeSet<usize>,
    /// Sell stage number to the close at which it fired.
    pub fired_sell_stages: BTreeMap<usize, f64>,
    pub stop: StopRatchet,
    pub entered_quantity: i64,
    pub exited_quantity: i64,
    pub opened_row: usize,
}

impl Position {
    pub fn new(instrument_id: impl Into<String>, opened_row: usize) -> Self {
        Self {
            instrument_id: instrument_id.into(),
            lots: Vec::new(),
            filled_buy_stages: BTreeSet::new(),
            fired_sell_stages: BTreeMap::new(),
            stop: StopRatchet::default(),
            entered_quantity: 0,
            exited_quantity: 0,
            opened_row,
        }
    }

    pub fn add_lot(&mut self, lot: Lot) {
        self.entered_quantity += lot.quantity;
        self.filled_buy_stages.insert(lot.stage);
        self.lots.push(lot);
    }

    pub fn open_quantity(&self) -> i64 {
        self.entered_quantity - self.exited_quantity
    }

    pub fn is_open(&self) -> bool {
        self.open_quantity() > 0
    }

    /// Quantity-weighted mean of the lot entry prices.
    pub fn average_entry_price(&self) -> f64 {
        if self.entered_quantity == 0 {
            return 0.0;
        }
        let cost: f64 = self
            .lots
            .iter()
            .map(|lot| lot.entry_price * lot.quantity as f64)
            .sum();
        cost / self.entered_quantity as f64
    }

    /// Unrealized profit of `price` over the average entry, in percent.
    pub fn profit_pct(&self, price: f64) -> f64 {
        let avg = self.average_entry_price();
        if avg == 0.0 {
            return 0.0;
        }
        (price - avg) / avg * 100.0
    }

    pub fn market_value(&self, price: f64) -> f64 {
        self.open_quantity() as f64 * price
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        self.open_quantity() as f64 * (price - self.average_entry_price())
    }

    pub fn should_stop_out(&self, price: f64) -> bool {
        self.stop.level().is_some_and(|stop| price <= stop)
    }

    pub fn has_exited(&self) -> bool {
        !self.fired_sell_stages.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeReason {
    Signal,
    BuyStage,
    SellStage,
    TargetProfit,
    StopLoss,
    ForcedLiquidation,
}

impl TradeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeReason::Signal => "signal",
            TradeReason::BuyStage => "buy_stage",
            TradeReason::SellStage => "sell_stage",
            TradeReason::TargetProfit => "target_profit",
            TradeReason::StopLoss => "stop_loss",
            TradeReason::ForcedLiquidation => "forced_liquidation",
        }
    }
}

impl std::fmt::Display for TradeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub instrument_id: String,
    pub side: TradeSide,
    pub date: NaiveDate,
    /// Fill price after slippage and commission.
    pub price: f64,
    pub quantity: i64,
    /// Percentage of the entered quantity this sell stage targets.
    pub exit_ratio: Option<f64>,
    pub reason: TradeReason,
    pub stage: Option<usize>,
    pub realized_profit: Option<f64>,
}

impl Trade {
    pub fn is_closing(&self) -> bool {
        self.side == TradeSide::Sell
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn position_with_lots() -> Position {
        let mut p = Position::new("BHP", 3);
        p.add_lot(Lot {
            entry_date: date(1),
            entry_price: 10.0,
            quantity: 100,
            stage: 1,
        });
        p.add_lot(Lot {
            entry_date: date(2),
            entry_price: 13.0,
            quantity: 50,
            stage: 2,
        });
        p
    }

    #[test]
    fn average_price_is_quantity_weighted() {
        let p = position_with_lots();
        assert_eq!(p.entered_quantity, 150);
        assert!((p.average_entry_price() - 11.0).abs() < 1e-12);
        assert_eq!(p.filled_buy_stages.len(), 2);
    }

    #[test]
    fn open_quantity_tracks_exits() {
        let mut p = position_with_lots();
        p.exited_quantity = 60;
        assert_eq!(p.open_quantity(), 90);
        assert!((p.market_value(12.0) - 1080.0).abs() < 1e-9);
        assert!((p.unrealized_pnl(12.0) - 90.0).abs() < 1e-9);
        p.exited_quantity = 150;
        assert!(!p.is_open());
    }

    #[test]
    fn profit_pct_relative_to_average() {
        let p = position_with_lots();
        assert!((p.profit_pct(12.1) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn stop_out_requires_a_level() {
        let mut p = position_with_lots();
        assert!(!p.should_stop_out(1.0));
        p.stop.rebase(9.5);
        assert!(p.should_stop_out(9.5));
        assert!(!p.should_stop_out(9.6));
    }

    #[test]
    fn reasons_serialize_snake_case() {
        let json = serde_json::to_string(&TradeReason::ForcedLiquidation).unwrap();
        assert_eq!(json, "\"forced_liquidation\"");
        assert_eq!(TradeReason::TargetProfit.to_string(), "target_profit");
    }
}
