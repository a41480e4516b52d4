//! Stage manager: staged entries and exits plus the dynamic stop ratchet.
//!
//! Entries move `Flat -> Partial(k) -> Full`; exits move
//! `Open -> PartiallyExited(k) -> Closed`. The stop only ever tightens:
//! re-basing keeps the higher level, and a ladder step that would lower it is
//! reported as an error instead of being clamped.

use crate::domain::condition_eval::{ConditionSet, EvalContext};
use crate::domain::error::StagetraderError;
use crate::domain::indicator::ColumnBindings;
use crate::domain::position::{Position, TradeReason};
use crate::domain::strategy::{ProfitLogic, Strategy};
use serde::{Deserialize, Serialize};

/// Where a ladder step moves the stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StopAnchor {
    /// The average entry price.
    BreakEven,
    /// The close at which an earlier sell stage fired.
    StageTrigger { stage: usize },
    /// `average entry * (1 + pct / 100)`.
    ProfitPct { pct: f64 },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("stop would loosen from {current:.4} to {proposed:.4}")]
pub struct LooseningStop {
    pub current: f64,
    pub proposed: f64,
}

/// Active stop-loss level of one position. Never decreases.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StopRatchet {
    level: Option<f64>,
}

impl StopRatchet {
    pub fn level(&self) -> Option<f64> {
        self.level
    }

    /// Sets the level if there is none yet, otherwise keeps the tighter one.
    pub fn rebase(&mut self, proposed: f64) -> f64 {
        let level = match self.level {
            Some(current) => current.max(proposed),
            None => proposed,
        };
        self.level = Some(level);
        level
    }

    /// Moves the stop to `proposed`, which must not be below the current level.
    pub fn tighten(&mut self, proposed: f64) -> Result<f64, LooseningStop> {
        if let Some(current) = self.level {
            if proposed < current {
                return Err(LooseningStop { current, proposed });
            }
        }
        self.level = Some(proposed);
        Ok(proposed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Flat,
    Partial(usize),
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Open,
    PartiallyExited(usize),
    Closed,
}

#[derive(Debug, Clone)]
pub struct CompiledBuyStage {
    pub number: usize,
    pub size_fraction: f64,
    pub conditions: ConditionSet,
}

#[derive(Debug, Clone)]
pub struct CompiledSellStage {
    pub number: usize,
    pub exit_ratio: f64,
    pub conditions: ConditionSet,
    pub target_profit_pct: Option<f64>,
    pub profit_logic: ProfitLogic,
    pub anchor: Option<StopAnchor>,
}

/// Why a sell stage fired.
#[derive(Debug, Clone, PartialEq)]
pub struct SellSignal {
    pub reason: TradeReason,
    pub detail: String,
}

/// The staged plan of one strategy bound to one instrument's columns.
#[derive(Debug, Clone)]
pub struct StageManager {
    buy: Vec<CompiledBuyStage>,
    sell: Vec<CompiledSellStage>,
    stop_pct: Option<f64>,
    flat: bool,
}

const RATIO_EPSILON: f64 = 1e-9;

impl StageManager {
    pub fn new(strategy: &Strategy, bindings: &ColumnBindings) -> Result<Self, StagetraderError> {
        let buy = strategy
            .buy_stages
            .iter()
            .map(|stage| {
                Ok(CompiledBuyStage {
                    number: stage.number,
                    size_fraction: stage.size_fraction,
                    conditions: ConditionSet::compile(&stage.conditions, stage.logic, bindings)?,
                })
            })
            .collect::<Result<Vec<_>, StagetraderError>>()?;
        let sell = strategy
            .sell_stages
            .iter()
            .map(|stage| {
                Ok(CompiledSellStage {
                    number: stage.number,
                    exit_ratio: stage.exit_ratio,
                    conditions: ConditionSet::compile(&stage.conditions, stage.logic, bindings)?,
                    target_profit_pct: stage.target_profit_pct,
                    profit_logic: stage.profit_logic,
                    anchor: strategy.stop_loss.anchor_after(stage),
                })
            })
            .collect::<Result<Vec<_>, StagetraderError>>()?;
        Ok(Self {
            buy,
            sell,
            stop_pct: strategy.stop_loss.pct,
            flat: strategy.flat,
        })
    }

    pub fn buy_stages(&self) -> &[CompiledBuyStage] {
        &self.buy
    }

    pub fn sell_stages(&self) -> &[CompiledSellStage] {
        &self.sell
    }

    pub fn is_flat(&self) -> bool {
        self.flat
    }

    pub fn entry_state(&self, position: Option<&Position>) -> EntryState {
        let filled = position.map(|p| p.filled_buy_stages.len()).unwrap_or(0);
        match filled {
            0 => EntryState::Flat,
            n if n >= self.buy.len() => EntryState::Full,
            n => EntryState::Partial(n),
        }
    }

    pub fn exit_state(&self, position: &Position) -> ExitState {
        if position.entered_quantity > 0 && !position.is_open() {
            return ExitState::Closed;
        }
        match position.fired_sell_stages.len() {
            0 => ExitState::Open,
            n => ExitState::PartiallyExited(n),
        }
    }

    /// The buy stage to evaluate next. Entries close once any sell stage has
    /// fired for the position.
    pub fn next_buy_stage(&self, position: Option<&Position>) -> Option<&CompiledBuyStage> {
        match position {
            None => self.buy.first(),
            Some(p) if p.has_exited() => None,
            Some(p) => self.buy.iter().find(|s| !p.filled_buy_stages.contains(&s.number)),
        }
    }

    /// Static stop level for the given average entry, if a static stop is configured.
    pub fn static_stop(&self, average_entry: f64) -> Option<f64> {
        self.stop_pct.map(|pct| average_entry * (1.0 - pct / 100.0))
    }

    pub fn entry_reason(&self) -> TradeReason {
        if self.flat { TradeReason::Signal } else { TradeReason::BuyStage }
    }

    /// Decides whether `stage` fires at `row` for a position with the given
    /// unrealized profit percentage.
    pub fn sell_signal(
        &self,
        stage: &CompiledSellStage,
        ctx: &EvalContext<'_>,
        row: usize,
        profit_pct: f64,
    ) -> Option<SellSignal> {
        let target_hit = stage.target_profit_pct.map(|target| profit_pct >= target);
        let verdict = (!stage.conditions.is_empty()).then(|| stage.conditions.evaluate(ctx, row));
        let conditions_hit = verdict.as_ref().map(|v| v.fires);

        let fires = match stage.profit_logic {
            ProfitLogic::Or => target_hit.unwrap_or(false) || conditions_hit.unwrap_or(false),
            ProfitLogic::And => match (target_hit, conditions_hit) {
                (Some(t), Some(c)) => t && c,
                (Some(t), None) => t,
                (None, Some(c)) => c,
                (None, None) => false,
            },
        };
        if !fires {
            return None;
        }

        let reason = if target_hit == Some(true) {
            TradeReason::TargetProfit
        } else if self.flat {
            TradeReason::Signal
        } else {
            TradeReason::SellStage
        };
        let detail = match (target_hit, verdict) {
            (Some(true), _) => format!(
                "profit {:.2}% reached target {:.2}%",
                profit_pct,
                stage.target_profit_pct.unwrap_or_default()
            ),
            (_, Some(v)) => v.reason,
            _ => String::new(),
        };
        Some(SellSignal { reason, detail })
    }

    /// Units `stage` sells, from the cumulative ratio of every fired stage
    /// including this one. Reaching 100% sells the whole remainder.
    pub fn exit_quantity(&self, stage: &CompiledSellStage, position: &Position) -> i64 {
        let fired: f64 = self
            .sell
            .iter()
            .filter(|s| position.fired_sell_stages.contains_key(&s.number))
            .map(|s| s.exit_ratio)
            .sum();
        let cumulative = fired + stage.exit_ratio;
        if cumulative >= 100.0 - RATIO_EPSILON {
            return position.open_quantity();
        }
        let target = (position.entered_quantity as f64 * cumulative / 100.0).floor() as i64;
        target - position.exited_quantity
    }

    /// Stop level the anchor points at, or `None` when it refers to a stage
    /// that has not fired for this position.
    pub fn anchor_level(&self, anchor: &StopAnchor, position: &Position) -> Option<f64> {
        let avg = position.average_entry_price();
        match anchor {
            StopAnchor::BreakEven => Some(avg),
            StopAnchor::StageTrigger { stage } => position.fired_sell_stages.get(stage).copied(),
            StopAnchor::ProfitPct { pct } => Some(avg * (1.0 + pct / 100.0)),
        }
    }
}
