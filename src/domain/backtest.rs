//! Trade simulator and batch runner.
//!
//! One instrument is simulated strictly in row order. Per row:
//!
//! 1. the next unfilled buy stage is evaluated and, when it fires, filled
//! 2. on rows after the opening row, the stop is checked first; a breach
//!    sells the remainder and skips stage processing for the row
//! 3. otherwise unfired sell stages are evaluated in ascending order, each
//!    fired stage selling its share and possibly ratcheting the stop
//! 4. on the final row, any remainder is force-closed
//! 5. equity is marked at the close
//!
//! Instruments are independent; [`run_batch`] fans them out on a rayon pool.

use chrono::NaiveDate;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use super::condition_eval::EvalContext;
use super::error::StagetraderError;
use super::execution::{EntryOrder, EntryResult, ExecutionConfig, enter_long, exit_long};
use super::indicator::{IndicatorCache, RunWarning};
use super::metrics::Metrics;
use super::ohlcv::Bar;
use super::portfolio::{EquityPoint, Portfolio};
use super::position::{Trade, TradeReason, TradeSide};
use super::sandbox::{FormulaExecutor, SandboxLimits};
use super::series::InstrumentSeries;
use super::stage::StageManager;
use super::strategy::Strategy;

/// Run-level settings shared by every job of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BacktestConfig {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Annual rate used by the Sharpe and Sortino ratios.
    pub risk_free_rate: f64,
    /// Worker threads for batch runs; 0 lets rayon decide.
    pub threads: usize,
    pub sandbox: SandboxLimits,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        BacktestConfig {
            start_date: None,
            end_date: None,
            risk_free_rate: 0.0,
            threads: 0,
            sandbox: SandboxLimits::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacktestResult {
    pub instrument_id: String,
    pub strategy_name: String,
    pub initial_capital: f64,
    pub final_equity: f64,
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub metrics: Metrics,
    pub warnings: Vec<RunWarning>,
}

struct Simulation<'a> {
    instrument_id: &'a str,
    bars: &'a [Bar],
    ctx: EvalContext<'a>,
    manager: StageManager,
    execution: ExecutionConfig,
    position_size: f64,
    portfolio: Portfolio,
}

impl Simulation<'_> {
    fn invariant(&self, row: usize, stage: usize, reason: impl Into<String>) -> StagetraderError {
        StagetraderError::SimulationInvariant {
            instrument: self.instrument_id.to_string(),
            row,
            stage,
            reason: reason.into(),
        }
    }

    fn step(&mut self, row: usize) -> Result<(), StagetraderError> {
        let bars = self.bars;
        let bar = &bars[row];
        self.try_enter(row, bar);

        let opened_this_row = self
            .portfolio
            .position
            .as_ref()
            .is_some_and(|p| p.opened_row == row);
        if self.portfolio.has_position() && !opened_this_row {
            if self.portfolio.position.as_ref().is_some_and(|p| p.should_stop_out(bar.close)) {
                self.exit_all(bar, TradeReason::StopLoss);
            } else {
                self.run_sell_stages(row, bar)?;
            }
        }

        if row + 1 == self.bars.len() && self.portfolio.has_position() {
            self.exit_all(bar, TradeReason::ForcedLiquidation);
        }

        let equity = self.portfolio.total_equity(bar.close);
        self.portfolio.record_equity(bar.date, equity);
        Ok(())
    }

    fn try_enter(&mut self, row: usize, bar: &Bar) {
        let Some(stage) = self.manager.next_buy_stage(self.portfolio.position.as_ref()) else {
            return;
        };
        if !stage.conditions.fires(&self.ctx, row) {
            return;
        }
        let number = stage.number;
        let order = EntryOrder {
            instrument_id: self.instrument_id,
            row,
            date: bar.date,
            close: bar.close,
            fraction: self.position_size * stage.size_fraction,
            stage: number,
        };

        match enter_long(&mut self.portfolio, &order, &self.execution) {
            EntryResult::Entered { quantity, fill_price, .. } => {
                debug!(
                    instrument = self.instrument_id,
                    date = %bar.date,
                    stage = number,
                    quantity,
                    price = fill_price,
                    "buy"
                );
                self.portfolio.record_trade(Trade {
                    instrument_id: self.instrument_id.to_string(),
                    side: TradeSide::Buy,
                    date: bar.date,
                    price: fill_price,
                    quantity,
                    exit_ratio: None,
                    reason: self.manager.entry_reason(),
                    stage: Some(number),
                    realized_profit: None,
                });
                if let Some(position) = self.portfolio.position.as_mut() {
                    if let Some(level) = self.manager.static_stop(position.average_entry_price()) {
                        position.stop.rebase(level);
                    }
                }
            }
            EntryResult::InsufficientCapital { budget, fill_price } => {
                debug!(
                    instrument = self.instrument_id,
                    date = %bar.date,
                    stage = number,
                    budget,
                    price = fill_price,
                    "buy stage fired but budget buys no units"
                );
            }
        }
    }

    fn run_sell_stages(&mut self, row: usize, bar: &Bar) -> Result<(), StagetraderError> {
        for index in 0..self.manager.sell_stages().len() {
            let Some(position) = self.portfolio.position.as_ref() else {
                break;
            };
            let stage = &self.manager.sell_stages()[index];
            if position.fired_sell_stages.contains_key(&stage.number) {
                continue;
            }
            let profit_pct = position.profit_pct(bar.close);
            let Some(signal) = self.manager.sell_signal(stage, &self.ctx, row, profit_pct) else {
                continue;
            };

            let number = stage.number;
            let exit_ratio = stage.exit_ratio;
            let quantity = self.manager.exit_quantity(stage, position);
            let open = position.open_quantity();
            if quantity < 0 || quantity > open {
                return Err(self.invariant(
                    row,
                    number,
                    format!("exit quantity {} outside open quantity {}", quantity, open),
                ));
            }
            debug!(
                instrument = self.instrument_id,
                date = %bar.date,
                stage = number,
                reason = %signal.reason,
                detail = %signal.detail,
                "sell stage fired"
            );

            if let Some(position) = self.portfolio.position.as_mut() {
                position.fired_sell_stages.insert(number, bar.close);
            }
            if quantity > 0 {
                self.sell(bar, quantity, signal.reason, Some(number), Some(exit_ratio));
            } else {
                debug!(instrument = self.instrument_id, stage = number, "sell stage rounds to zero units");
            }

            self.ratchet(row, index)?;
        }
        Ok(())
    }

    /// Moves the stop after sell stage `index` fired, if that stage ratchets.
    fn ratchet(&mut self, row: usize, index: usize) -> Result<(), StagetraderError> {
        let stage = &self.manager.sell_stages()[index];
        let (Some(anchor), Some(position)) = (stage.anchor.as_ref(), self.portfolio.position.as_ref()) else {
            return Ok(());
        };
        let Some(level) = self.manager.anchor_level(anchor, position) else {
            return Ok(());
        };
        let number = stage.number;
        let moved = self
            .portfolio
            .position
            .as_mut()
            .map(|p| p.stop.tighten(level))
            .transpose();
        match moved {
            Ok(_) => {
                debug!(instrument = self.instrument_id, stage = number, stop = level, "stop ratcheted");
                Ok(())
            }
            Err(err) => Err(self.invariant(row, number, err.to_string())),
        }
    }

    fn exit_all(&mut self, bar: &Bar, reason: TradeReason) {
        let quantity = self.portfolio.open_quantity();
        if quantity > 0 {
            self.sell(bar, quantity, reason, None, None);
        }
    }

    fn sell(&mut self, bar: &Bar, quantity: i64, reason: TradeReason, stage: Option<usize>, exit_ratio: Option<f64>) {
        let Some(fill) = exit_long(&mut self.portfolio, bar.close, quantity, &self.execution) else {
            return;
        };
        debug!(
            instrument = self.instrument_id,
            date = %bar.date,
            quantity,
            price = fill.fill_price,
            profit = fill.realized_profit,
            reason = %reason,
            "sell"
        );
        self.portfolio.record_trade(Trade {
            instrument_id: self.instrument_id.to_string(),
            side: TradeSide::Sell,
            date: bar.date,
            price: fill.fill_price,
            quantity: fill.quantity,
            exit_ratio,
            reason,
            stage,
            realized_profit: Some(fill.realized_profit),
        });
    }
}

/// Simulates `strategy` over the series held by `cache`.
///
/// Indicators are computed through the cache, so several strategies run
/// against one cache share their common columns.
pub fn run_backtest(
    strategy: &Strategy,
    cache: &mut IndicatorCache<'_>,
    config: &BacktestConfig,
) -> Result<BacktestResult, StagetraderError> {
    let series = cache.series();
    if series.is_empty() {
        return Err(StagetraderError::NoData {
            instrument: series.instrument_id().to_string(),
        });
    }

    let (bindings, warnings) = cache.bind(&strategy.indicators)?;
    let manager = StageManager::new(strategy, &bindings)?;
    info!(
        instrument = series.instrument_id(),
        strategy = %strategy.name,
        bars = series.len(),
        buy_stages = manager.buy_stages().len(),
        sell_stages = manager.sell_stages().len(),
        "running backtest"
    );

    let mut sim = Simulation {
        instrument_id: series.instrument_id(),
        bars: series.bars(),
        ctx: EvalContext::new(series.bars(), cache.arena()),
        manager,
        execution: ExecutionConfig::from(&strategy.capital),
        position_size: strategy.capital.position_size,
        portfolio: Portfolio::new(strategy.capital.initial_capital),
    };
    for row in 0..sim.bars.len() {
        sim.step(row)?;
    }

    let portfolio = sim.portfolio;
    let metrics = Metrics::compute(&portfolio, config.risk_free_rate);
    let final_equity = portfolio
        .equity_curve
        .last()
        .map(|p| p.equity)
        .unwrap_or(portfolio.initial_capital);
    info!(
        instrument = series.instrument_id(),
        strategy = %strategy.name,
        trades = portfolio.trades.len(),
        final_equity,
        total_return = metrics.total_return,
        "backtest complete"
    );

    Ok(BacktestResult {
        instrument_id: series.instrument_id().to_string(),
        strategy_name: strategy.name.clone(),
        initial_capital: portfolio.initial_capital,
        final_equity,
        trades: portfolio.trades,
        equity_curve: portfolio.equity_curve,
        metrics,
        warnings,
    })
}

/// One instrument and the strategies to run against it.
#[derive(Debug, Clone, Copy)]
pub struct BatchJob<'a> {
    pub series: &'a InstrumentSeries,
    pub strategies: &'a [Strategy],
}

/// Result of one (instrument, strategy) pair of a batch.
#[derive(Debug)]
pub struct JobOutcome {
    pub instrument_id: String,
    pub strategy_name: String,
    pub result: Result<BacktestResult, StagetraderError>,
}

/// A job that failed, in machine-readable form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobError {
    pub instrument_id: String,
    pub strategy_name: String,
    pub kind: String,
    pub message: String,
}

/// Everything a run hands to the reporting sink.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct RunReport {
    pub results: Vec<BacktestResult>,
    pub errors: Vec<JobError>,
}

impl RunReport {
    pub fn from_outcomes(outcomes: Vec<JobOutcome>) -> Self {
        let mut report = RunReport::default();
        for outcome in outcomes {
            match outcome.result {
                Ok(result) => report.results.push(result),
                Err(err) => report.errors.push(JobError {
                    instrument_id: outcome.instrument_id,
                    strategy_name: outcome.strategy_name,
                    kind: err.kind().to_string(),
                    message: err.to_string(),
                }),
            }
        }
        report
    }

    pub fn warning_count(&self) -> usize {
        self.results.iter().map(|r| r.warnings.len()).sum()
    }
}

/// Runs every job on a private rayon pool.
///
/// Each job gets its own indicator cache; nothing mutable is shared between
/// jobs. Outcomes come back in job order, then strategy order.
pub fn run_batch(jobs: &[BatchJob<'_>], config: &BacktestConfig) -> Result<Vec<JobOutcome>, StagetraderError> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.threads)
        .thread_name(|i| format!("stagetrader-{i}"))
        .build()
        .map_err(|e| StagetraderError::config("thread pool", e.to_string()))?;

    info!(jobs = jobs.len(), threads = pool.current_num_threads(), "starting batch");
    let outcomes: Vec<Vec<JobOutcome>> = pool.install(|| {
        jobs.par_iter()
            .map(|job| {
                let mut cache = IndicatorCache::new(job.series, FormulaExecutor::new(config.sandbox));
                job.strategies
                    .iter()
                    .map(|strategy| JobOutcome {
                        instrument_id: job.series.instrument_id().to_string(),
                        strategy_name: strategy.name.clone(),
                        result: run_backtest(strategy, &mut cache, config),
                    })
                    .collect()
            })
            .collect()
    });
    Ok(outcomes.into_iter().flatten().collect())
}
