//! Fill simulation.
//!
//! Slippage and commission are both applied multiplicatively to the close:
//! a buy fills at `close * (1 + slippage) * (1 + commission)`, a sell at
//! `close * (1 - slippage) * (1 - commission)`. Quantities are whole units.

use chrono::NaiveDate;

use super::portfolio::Portfolio;
use super::position::{Lot, Position};
use super::strategy::Capital;

/// Trading cost rates, as fractions.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ExecutionConfig {
    pub commission_rate: f64,
    pub slippage_rate: f64,
}

impl From<&Capital> for ExecutionConfig {
    fn from(capital: &Capital) -> Self {
        ExecutionConfig {
            commission_rate: capital.commission_rate,
            slippage_rate: capital.slippage_rate,
        }
    }
}

pub fn buy_fill_price(close: f64, config: &ExecutionConfig) -> f64 {
    close * (1.0 + config.slippage_rate) * (1.0 + config.commission_rate)
}

pub fn sell_fill_price(close: f64, config: &ExecutionConfig) -> f64 {
    close * (1.0 - config.slippage_rate) * (1.0 - config.commission_rate)
}

/// Result of an entry attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryResult {
    Entered {
        quantity: i64,
        fill_price: f64,
        cost: f64,
    },
    /// The budget does not buy a single unit at the fill price.
    InsufficientCapital { budget: f64, fill_price: f64 },
}

/// One buy instruction from a fired buy stage.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryOrder<'a> {
    pub instrument_id: &'a str,
    pub row: usize,
    pub date: NaiveDate,
    pub close: f64,
    /// Share of current cash to spend (position size times stage size).
    pub fraction: f64,
    pub stage: usize,
}

/// Buys `cash * fraction` worth of whole units and adds them as a lot.
///
/// Opens a new position when the portfolio is flat.
pub fn enter_long(portfolio: &mut Portfolio, order: &EntryOrder<'_>, config: &ExecutionConfig) -> EntryResult {
    let fill_price = buy_fill_price(order.close, config);
    let budget = portfolio.cash * order.fraction;
    let quantity = if fill_price > 0.0 {
        (budget / fill_price).floor() as i64
    } else {
        0
    };

    if quantity <= 0 {
        return EntryResult::InsufficientCapital { budget, fill_price };
    }

    let cost = quantity as f64 * fill_price;
    portfolio.cash -= cost;

    let position = portfolio
        .position
        .get_or_insert_with(|| Position::new(order.instrument_id, order.row));
    position.add_lot(Lot {
        entry_date: order.date,
        entry_price: fill_price,
        quantity,
        stage: order.stage,
    });

    EntryResult::Entered {
        quantity,
        fill_price,
        cost,
    }
}

/// Result of a (partial) exit.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitResult {
    pub quantity: i64,
    pub fill_price: f64,
    pub proceeds: f64,
    pub realized_profit: f64,
    /// Whether the exit left the position flat.
    pub closed: bool,
}

/// Sells `quantity` units of the open position.
///
/// Returns `None` when there is no open position. The caller guarantees
/// `0 < quantity <= open quantity`. A position sold down to zero is removed.
pub fn exit_long(portfolio: &mut Portfolio, close: f64, quantity: i64, config: &ExecutionConfig) -> Option<ExitResult> {
    let position = portfolio.position.as_mut()?;

    let fill_price = sell_fill_price(close, config);
    let average = position.average_entry_price();
    let proceeds = quantity as f64 * fill_price;
    let realized_profit = (fill_price - average) * quantity as f64;

    position.exited_quantity += quantity;
    portfolio.cash += proceeds;

    let closed = !position.is_open();
    if closed {
        portfolio.position = None;
    }

    Some(ExitResult {
        quantity,
        fill_price,
        proceeds,
        realized_profit,
        closed,
    })
}
