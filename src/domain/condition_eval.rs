//! Condition evaluation.
//!
//! # Evaluation Semantics
//!
//! - An undefined operand makes the comparison `false`
//! - `cross_above` / `cross_below` compare the current and previous row and
//!   are `false` on row 0 or when any of the four values is undefined
//! - `==` uses an absolute tolerance of 1e-9
//! - A sequential list folds left to right: each condition joins the running
//!   result with its own `combine_with` (missing means AND); the first
//!   condition's combinator is ignored
//! - An empty list never fires
//!
//! Evaluation is a pure function of the row index and the column arena, so
//! rows can be evaluated in any order.

use crate::domain::condition::{Combine, Condition, Operand, Operator};
use crate::domain::error::StagetraderError;
use crate::domain::indicator::{ColumnArena, ColumnBindings, ColumnId};
use crate::domain::ohlcv::Bar;

const EPSILON: f64 = 1e-9;

/// How the conditions of one stage reduce to a single verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StageLogic {
    /// Left-to-right fold honouring each condition's `combine_with`.
    #[default]
    Sequential,
    All,
    Any,
}

impl StageLogic {
    /// Maps a stage's optional `requireAll` flag.
    pub fn from_require_all(require_all: Option<bool>) -> Self {
        match require_all {
            None => StageLogic::Sequential,
            Some(true) => StageLogic::All,
            Some(false) => StageLogic::Any,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub fires: bool,
    pub reason: String,
}

/// Read access to the data a condition can see.
#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    pub bars: &'a [Bar],
    pub arena: &'a ColumnArena,
}

/// Conditions bound to column handles, ready to evaluate.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionSet {
    conditions: Vec<Condition<ColumnId>>,
    labels: Vec<String>,
    logic: StageLogic,
}

impl<'a> EvalContext<'a> {
    pub fn new(bars: &'a [Bar], arena: &'a ColumnArena) -> Self {
        Self { bars, arena }
    }

    fn operand(&self, operand: &Operand<ColumnId>, row: usize) -> Option<f64> {
        match operand {
            Operand::Price(field) => self.bars.get(row).map(|bar| bar.field(*field)),
            Operand::Constant(value) => Some(*value),
            Operand::Column(id) => self.arena.value(*id, row),
        }
    }
}

/// Evaluates a single condition at `row`.
pub fn evaluate_condition(condition: &Condition<ColumnId>, ctx: &EvalContext<'_>, row: usize) -> bool {
    let current = (ctx.operand(&condition.left, row), ctx.operand(&condition.right, row));
    let (Some(left), Some(right)) = current else {
        return false;
    };

    match condition.operator {
        Operator::Lt => left < right,
        Operator::Gt => left > right,
        Operator::Le => left <= right,
        Operator::Ge => left >= right,
        Operator::Eq => (left - right).abs() < EPSILON,
        Operator::CrossAbove | Operator::CrossBelow => {
            if row == 0 {
                return false;
            }
            let previous = (
                ctx.operand(&condition.left, row - 1),
                ctx.operand(&condition.right, row - 1),
            );
            let (Some(left_prev), Some(right_prev)) = previous else {
                return false;
            };
            if condition.operator == Operator::CrossAbove {
                left > right && left_prev <= right_prev
            } else {
                left < right && left_prev >= right_prev
            }
        }
    }
}

impl ConditionSet {
    /// Binds named conditions to the columns of one instrument.
    pub fn compile(conditions: &[Condition], logic: StageLogic, bindings: &ColumnBindings) -> Result<Self, StagetraderError> {
        let labels = conditions.iter().map(|c| c.to_string()).collect();
        let conditions = conditions
            .iter()
            .cloned()
            .map(|c| {
                c.map_columns(|name| {
                    bindings.get(&name).ok_or_else(|| {
                        StagetraderError::config("condition", format!("unknown indicator column '{}'", name))
                    })
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            conditions,
            labels,
            logic,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    pub fn logic(&self) -> StageLogic {
        self.logic
    }

    /// Whether the set fires at `row`, without building a reason.
    pub fn fires(&self, ctx: &EvalContext<'_>, row: usize) -> bool {
        if self.conditions.is_empty() {
            return false;
        }
        let mut values = self.conditions.iter().map(|c| evaluate_condition(c, ctx, row));
        match self.logic {
            StageLogic::All => values.all(|v| v),
            StageLogic::Any => values.any(|v| v),
            StageLogic::Sequential => {
                let mut result = false;
                for (i, (value, cond)) in values.zip(&self.conditions).enumerate() {
                    result = fold(i, result, value, cond.combine_with);
                }
                result
            }
        }
    }

    /// Full verdict; every condition's contribution appears in the reason.
    pub fn evaluate(&self, ctx: &EvalContext<'_>, row: usize) -> Verdict {
        if self.conditions.is_empty() {
            return Verdict {
                fires: false,
                reason: "no conditions".to_string(),
            };
        }
        let mut result = false;
        let mut parts = Vec::with_capacity(self.conditions.len());
        for (i, (cond, label)) in self.conditions.iter().zip(&self.labels).enumerate() {
            let value = evaluate_condition(cond, ctx, row);
            result = match self.logic {
                StageLogic::Sequential => fold(i, result, value, cond.combine_with),
                StageLogic::All => (i == 0 || result) && value,
                StageLogic::Any => result || value,
            };
            parts.push(format!("[{}]={}", label, value));
        }
        let joiner = match self.logic {
            StageLogic::Sequential => " ",
            StageLogic::All => " ALL ",
            StageLogic::Any => " ANY ",
        };
        Verdict {
            fires: result,
            reason: format!("{} => {}", parts.join(joiner), result),
        }
    }
}

fn fold(index: usize, acc: bool, value: bool, combine: Option<Combine>) -> bool {
    if index == 0 {
        return value;
    }
    match combine {
        Some(Combine::Or) => acc || value,
        Some(Combine::And) | None => acc && value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::indicator::IndicatorColumn;
    use crate::domain::ohlcv::PriceField;
    use chrono::NaiveDate;
    use proptest::prelude::*;

    fn bars(closes: &[f64]) -> Vec<Bar> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| Bar {
                instrument_id: "T".into(),
                date: start + chrono::Duration::days(i as i64),
                open: *c,
                high: *c,
                low: *c,
                close: *c,
                volume: 100,
            })
            .collect()
    }

    fn cond(left: Operand<ColumnId>, op: Operator, right: Operand<ColumnId>) -> Condition<ColumnId> {
        Condition::new(left, op, right)
    }

    fn set(conditions: Vec<Condition<ColumnId>>, logic: StageLogic) -> ConditionSet {
        ConditionSet {
            labels: conditions.iter().map(|_| "c".to_string()).collect(),
            conditions,
            logic,
        }
    }

    #[test]
    fn undefined_operand_is_false() {
        let mut arena = ColumnArena::new();
        let id = arena.push(IndicatorColumn::new("x", vec![None, Some(1.0)]));
        let b = bars(&[1.0, 1.0]);
        let ctx = EvalContext::new(&b, &arena);
        let lt = cond(Operand::Column(id), Operator::Lt, Operand::Constant(5.0));
        let ge = cond(Operand::Column(id), Operator::Ge, Operand::Constant(5.0));
        assert!(!evaluate_condition(&lt, &ctx, 0));
        assert!(!evaluate_condition(&ge, &ctx, 0));
        assert!(evaluate_condition(&lt, &ctx, 1));
    }

    #[test]
    fn cross_above_fires_only_on_crossing_row() {
        let mut arena = ColumnArena::new();
        let fast = arena.push(IndicatorColumn::new("fast", vec![Some(1.0), Some(2.0), Some(4.0), Some(5.0)]));
        let slow = arena.push(IndicatorColumn::new("slow", vec![Some(3.0), Some(3.0), Some(3.0), Some(3.0)]));
        let b = bars(&[1.0; 4]);
        let ctx = EvalContext::new(&b, &arena);
        let c = cond(Operand::Column(fast), Operator::CrossAbove, Operand::Column(slow));
        let fired: Vec<bool> = (0..4).map(|r| evaluate_condition(&c, &ctx, r)).collect();
        assert_eq!(fired, vec![false, false, true, false]);
    }

    #[test]
    fn crossover_false_when_previous_undefined() {
        let mut arena = ColumnArena::new();
        let fast = arena.push(IndicatorColumn::new("fast", vec![None, Some(5.0)]));
        let b = bars(&[3.0, 3.0]);
        let ctx = EvalContext::new(&b, &arena);
        let c = cond(Operand::Column(fast), Operator::CrossAbove, Operand::Price(PriceField::Close));
        assert!(!evaluate_condition(&c, &ctx, 1));
    }

    #[test]
    fn equality_uses_tolerance() {
        let arena = ColumnArena::new();
        let b = bars(&[10.0]);
        let ctx = EvalContext::new(&b, &arena);
        let c = cond(Operand::Price(PriceField::Close), Operator::Eq, Operand::Constant(10.0 + 1e-12));
        assert!(evaluate_condition(&c, &ctx, 0));
    }

    #[test]
    fn sequential_fold_is_order_sensitive() {
        let arena = ColumnArena::new();
        let b = bars(&[10.0]);
        let ctx = EvalContext::new(&b, &arena);
        let t = || cond(Operand::Price(PriceField::Close), Operator::Gt, Operand::Constant(5.0));
        let f = || cond(Operand::Price(PriceField::Close), Operator::Lt, Operand::Constant(5.0));

        // (T OR F) AND F = false
        let a = set(vec![t(), f().with_combine(Combine::Or), f().with_combine(Combine::And)], StageLogic::Sequential);
        // (F AND F) OR T = true
        let b2 = set(vec![f(), f().with_combine(Combine::And), t().with_combine(Combine::Or)], StageLogic::Sequential);
        assert!(!a.fires(&ctx, 0));
        assert!(b2.fires(&ctx, 0));
    }

    #[test]
    fn missing_combinator_means_and() {
        let arena = ColumnArena::new();
        let b = bars(&[10.0]);
        let ctx = EvalContext::new(&b, &arena);
        let t = cond(Operand::Price(PriceField::Close), Operator::Gt, Operand::Constant(5.0));
        let f = cond(Operand::Price(PriceField::Close), Operator::Lt, Operand::Constant(5.0));
        assert!(!set(vec![t.clone(), f.clone()], StageLogic::Sequential).fires(&ctx, 0));
        assert!(set(vec![t.clone(), f.clone()], StageLogic::Any).fires(&ctx, 0));
        assert!(!set(vec![t.clone(), f], StageLogic::All).fires(&ctx, 0));
        assert!(set(vec![t], StageLogic::All).fires(&ctx, 0));
    }

    #[test]
    fn empty_set_never_fires() {
        let arena = ColumnArena::new();
        let b = bars(&[10.0]);
        let ctx = EvalContext::new(&b, &arena);
        for logic in [StageLogic::Sequential, StageLogic::All, StageLogic::Any] {
            assert!(!set(vec![], logic).fires(&ctx, 0));
            assert!(!set(vec![], logic).evaluate(&ctx, 0).fires);
        }
    }

    #[test]
    fn verdict_matches_fires_and_lists_every_condition() {
        let arena = ColumnArena::new();
        let b = bars(&[10.0]);
        let ctx = EvalContext::new(&b, &arena);
        let t = cond(Operand::Price(PriceField::Close), Operator::Gt, Operand::Constant(5.0));
        let f = cond(Operand::Price(PriceField::Close), Operator::Lt, Operand::Constant(5.0)).with_combine(Combine::Or);
        let s = set(vec![t, f], StageLogic::Sequential);
        let verdict = s.evaluate(&ctx, 0);
        assert_eq!(verdict.fires, s.fires(&ctx, 0));
        assert_eq!(verdict.reason.matches("[c]").count(), 2);
    }

    #[test]
    fn compile_rejects_unknown_column() {
        let bindings = ColumnBindings::default();
        let named = Condition::new(
            Operand::Column("rsi_14".to_string()),
            Operator::Lt,
            Operand::Constant(30.0),
        );
        assert!(ConditionSet::compile(&[named], StageLogic::Sequential, &bindings).is_err());
    }

    proptest! {
        #[test]
        fn crossovers_are_exclusive(
            a in prop::collection::vec(prop::option::of(-10.0..10.0_f64), 2..40),
            level in -10.0..10.0_f64,
        ) {
            let mut arena = ColumnArena::new();
            let id = arena.push(IndicatorColumn::new("a", a.clone()));
            let b = bars(&vec![level; a.len()]);
            let ctx = EvalContext::new(&b, &arena);
            let above = cond(Operand::Column(id), Operator::CrossAbove, Operand::Price(PriceField::Close));
            let below = cond(Operand::Column(id), Operator::CrossBelow, Operand::Price(PriceField::Close));
            prop_assert!(!evaluate_condition(&above, &ctx, 0));
            prop_assert!(!evaluate_condition(&below, &ctx, 0));
            for row in 0..a.len() {
                prop_assert!(!(evaluate_condition(&above, &ctx, row) && evaluate_condition(&below, &ctx, row)));
            }
        }
    }
}
