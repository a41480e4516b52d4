//! Validated strategy.
//!
//! [`Strategy::from_document`] is the single place where a stored document is
//! checked: indicator declarations become tagged kinds, condition references
//! are resolved to exact column names, flat condition lists and profit ladders
//! are normalised into staged form, and every ratio, percentage and stage
//! reference is range-checked. A strategy that passes never fails
//! configuration checks during simulation.

pub mod document;

use crate::domain::condition::Condition;
use crate::domain::condition_eval::StageLogic;
use crate::domain::error::StagetraderError;
use crate::domain::indicator::{BuiltinKind, FormulaSpec, IndicatorKind, IndicatorSpec};
use crate::domain::ohlcv::PriceField;
use crate::domain::sandbox::validate::{INPUTS, VOCABULARY, is_blocked_identifier};
use crate::domain::stage::StopAnchor;
use document::{
    ConditionDocument, IndicatorDocument, IndicatorKindTag, StageDocument, StrategyDocument,
    TargetProfitDocument,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub use document::CapitalDocument as Capital;

/// How a sell stage combines its profit target with its conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfitLogic {
    #[default]
    Or,
    And,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuyStage {
    /// 1-based.
    pub number: usize,
    pub size_fraction: f64,
    pub conditions: Vec<Condition>,
    pub logic: StageLogic,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SellStage {
    /// 1-based.
    pub number: usize,
    /// Percentage of the entered quantity, in (0, 100].
    pub exit_ratio: f64,
    pub conditions: Vec<Condition>,
    pub logic: StageLogic,
    pub target_profit_pct: Option<f64>,
    pub profit_logic: ProfitLogic,
    pub dynamic_stop_loss: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StopLossPlan {
    /// Static stop distance below the average entry, in percent.
    pub pct: Option<f64>,
    /// Explicit ladder steps keyed by the sell stage they follow.
    pub ladder: BTreeMap<usize, StopAnchor>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Strategy {
    pub name: String,
    pub description: String,
    pub indicators: Vec<IndicatorSpec>,
    pub buy_stages: Vec<BuyStage>,
    pub sell_stages: Vec<SellStage>,
    pub stop_loss: StopLossPlan,
    pub capital: Capital,
    /// Built from flat `buyConditions` rather than explicit stages.
    pub flat: bool,
}

impl StopLossPlan {
    /// Where the stop moves after `stage` fires, if that stage ratchets.
    ///
    /// Stages without an explicit ladder entry use the default ladder:
    /// stage 1 to break-even, stage k to the trigger price of stage k-1.
    pub fn anchor_after(&self, stage: &SellStage) -> Option<StopAnchor> {
        if !stage.dynamic_stop_loss {
            return None;
        }
        Some(match self.ladder.get(&stage.number) {
            Some(anchor) => anchor.clone(),
            None if stage.number <= 1 => StopAnchor::BreakEven,
            None => StopAnchor::StageTrigger {
                stage: stage.number - 1,
            },
        })
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn invalid(context: impl Into<String>, reason: impl Into<String>) -> StagetraderError {
    StagetraderError::config(context, reason)
}

fn indicator_spec(doc: &IndicatorDocument) -> Result<IndicatorSpec, StagetraderError> {
    let context = format!("indicator '{}'", doc.name);
    if doc.name.trim().is_empty() {
        return Err(invalid("indicator", "indicator name must not be empty"));
    }
    if let Some(alias) = &doc.alias {
        if !is_identifier(alias) {
            return Err(invalid(&context, format!("alias '{}' is not a valid identifier", alias)));
        }
        if PriceField::parse(alias).is_some() {
            return Err(invalid(&context, format!("alias '{}' collides with a price field", alias)));
        }
    }

    let kind = match doc.kind {
        IndicatorKindTag::Builtin => {
            if doc.formula.is_some() || !doc.output_columns.is_empty() {
                return Err(invalid(&context, "built-in indicators take no formula or outputColumns"));
            }
            IndicatorKind::Builtin(BuiltinKind::parse(&doc.name, &doc.parameters, doc.source_column.as_deref())?)
        }
        IndicatorKindTag::Formula => {
            let body = doc
                .formula
                .as_deref()
                .filter(|b| !b.trim().is_empty())
                .ok_or_else(|| invalid(&context, "formula indicators need a non-empty 'formula'"))?;
            if doc.source_column.is_some() {
                return Err(invalid(&context, "formula indicators read every price column; sourceColumn is not allowed"));
            }
            if doc.output_columns.is_empty() {
                return Err(invalid(&context, "formula indicators must declare outputColumns"));
            }
            let mut seen = BTreeSet::new();
            for output in &doc.output_columns {
                if !is_identifier(output) || PriceField::parse(output).is_some() {
                    return Err(invalid(&context, format!("invalid output column name '{}'", output)));
                }
                if !seen.insert(output) {
                    return Err(invalid(&context, format!("output column '{}' declared twice", output)));
                }
            }
            for (key, value) in &doc.parameters {
                if !is_identifier(key)
                    || is_blocked_identifier(key)
                    || INPUTS.contains(&key.as_str())
                    || VOCABULARY.contains(&key.as_str())
                {
                    return Err(invalid(&context, format!("parameter name '{}' is reserved or invalid", key)));
                }
                if !value.is_finite() {
                    return Err(invalid(&context, format!("parameter '{}' must be finite", key)));
                }
            }
            IndicatorKind::Formula(FormulaSpec::new(
                body.to_string(),
                doc.parameters.clone(),
                doc.output_columns.clone(),
                doc.on_error,
            ))
        }
    };

    if doc.alias.is_some() && matches!(kind, IndicatorKind::Formula(_)) {
        return Err(invalid(&context, "formula outputs are named by outputColumns; alias is not allowed"));
    }

    Ok(IndicatorSpec {
        name: doc.name.to_ascii_lowercase(),
        alias: doc.alias.clone(),
        kind,
    })
}

/// Maps condition references to exact output column names.
struct ColumnResolver<'a> {
    outputs: BTreeSet<String>,
    indicators: &'a [IndicatorSpec],
}

impl<'a> ColumnResolver<'a> {
    fn new(indicators: &'a [IndicatorSpec]) -> Result<Self, StagetraderError> {
        let mut outputs = BTreeSet::new();
        for spec in indicators {
            for name in spec.output_names() {
                if !outputs.insert(name.clone()) {
                    return Err(invalid(
                        format!("indicator '{}'", spec.label()),
                        format!("duplicate output column '{}'", name),
                    ));
                }
            }
        }
        Ok(Self { outputs, indicators })
    }

    fn resolve(&self, reference: String) -> Result<String, StagetraderError> {
        if self.outputs.contains(&reference) {
            return Ok(reference);
        }
        let candidates: Vec<String> = self
            .indicators
            .iter()
            .filter(|spec| spec.name.eq_ignore_ascii_case(&reference) && spec.is_single_output())
            .flat_map(|spec| spec.output_names())
            .collect();
        match candidates.as_slice() {
            [only] => Ok(only.clone()),
            [] => Err(invalid("condition", format!("unknown indicator column '{}'", reference))),
            many => Err(invalid(
                "condition",
                format!("'{}' is ambiguous; use one of: {}", reference, many.join(", ")),
            )),
        }
    }

    fn conditions(&self, docs: &[ConditionDocument]) -> Result<Vec<Condition>, StagetraderError> {
        docs.iter()
            .map(|doc| doc.to_condition()?.map_columns(|name| self.resolve(name)))
            .collect()
    }
}

fn check_ratio(context: &str, ratio: f64) -> Result<f64, StagetraderError> {
    if ratio.is_finite() && ratio > 0.0 && ratio <= 100.0 {
        Ok(ratio)
    } else {
        Err(invalid(context, format!("exit ratio must be in (0, 100], got {}", ratio)))
    }
}

fn check_target(context: &str, pct: f64) -> Result<f64, StagetraderError> {
    if pct.is_finite() && pct > 0.0 {
        Ok(pct)
    } else {
        Err(invalid(context, format!("target profit must be positive, got {}", pct)))
    }
}

fn check_capital(capital: &Capital) -> Result<(), StagetraderError> {
    if !(capital.initial_capital.is_finite() && capital.initial_capital > 0.0) {
        return Err(invalid("capital", "initialCapital must be positive"));
    }
    for (key, rate) in [
        ("commissionRate", capital.commission_rate),
        ("slippageRate", capital.slippage_rate),
    ] {
        if !(0.0..1.0).contains(&rate) {
            return Err(invalid("capital", format!("{} must be in [0, 1), got {}", key, rate)));
        }
    }
    if !(capital.position_size > 0.0 && capital.position_size <= 1.0) {
        return Err(invalid(
            "capital",
            format!("positionSize must be in (0, 1], got {}", capital.position_size),
        ));
    }
    Ok(())
}

impl Strategy {
    pub fn from_document(doc: &StrategyDocument) -> Result<Self, StagetraderError> {
        if doc.name.trim().is_empty() {
            return Err(invalid("strategy", "name must not be empty"));
        }
        check_capital(&doc.capital)?;

        let indicators = doc
            .indicators
            .iter()
            .map(indicator_spec)
            .collect::<Result<Vec<_>, _>>()?;
        let resolver = ColumnResolver::new(&indicators)?;

        let flat = doc.buy_stages.is_empty();
        let buy_stages = build_buy_stages(doc, &resolver)?;
        let sell_stages = build_sell_stages(doc, &resolver, flat)?;
        let stop_loss = build_stop_loss(doc, &sell_stages)?;

        let mut sell_stages = sell_stages;
        for stage in &mut sell_stages {
            if stop_loss.ladder.contains_key(&stage.number) {
                stage.dynamic_stop_loss = true;
            }
        }

        Ok(Strategy {
            name: doc.name.clone(),
            description: doc.description.clone(),
            indicators,
            buy_stages,
            sell_stages,
            stop_loss,
            capital: doc.capital.clone(),
            flat,
        })
    }

    /// Every column name referenced by a condition.
    pub fn referenced_columns(&self) -> BTreeSet<&str> {
        let buy = self.buy_stages.iter().flat_map(|s| &s.conditions);
        let sell = self.sell_stages.iter().flat_map(|s| &s.conditions);
        buy.chain(sell)
            .flat_map(|c| c.columns())
            .map(String::as_str)
            .collect()
    }
}

fn build_buy_stages(doc: &StrategyDocument, resolver: &ColumnResolver<'_>) -> Result<Vec<BuyStage>, StagetraderError> {
    if doc.buy_stages.is_empty() {
        if doc.buy_conditions.is_empty() {
            return Err(invalid("strategy", "either buyConditions or buyStages is required"));
        }
        return Ok(vec![BuyStage {
            number: 1,
            size_fraction: 1.0,
            conditions: resolver.conditions(&doc.buy_conditions)?,
            logic: StageLogic::Sequential,
        }]);
    }
    if !doc.buy_conditions.is_empty() {
        return Err(invalid("strategy", "buyConditions and buyStages are mutually exclusive"));
    }

    doc.buy_stages
        .iter()
        .enumerate()
        .map(|(i, stage)| {
            let number = i + 1;
            let context = format!("buy stage {}", number);
            let size_fraction = stage.size_fraction.unwrap_or(1.0);
            if !(size_fraction > 0.0 && size_fraction <= 1.0) {
                return Err(invalid(&context, format!("sizeFraction must be in (0, 1], got {}", size_fraction)));
            }
            if stage.conditions.is_empty() {
                return Err(invalid(&context, "a buy stage needs at least one condition"));
            }
            if stage.exit_ratio.is_some() || stage.target_profit_pct.is_some() {
                return Err(invalid(&context, "exitRatio and targetProfitPct apply to sell stages only"));
            }
            Ok(BuyStage {
                number,
                size_fraction,
                conditions: resolver.conditions(&stage.conditions)?,
                logic: StageLogic::from_require_all(stage.require_all),
            })
        })
        .collect()
}

fn sell_stage_from_doc(
    number: usize,
    stage: &StageDocument,
    ladder_rung: Option<&document::LadderRung>,
    resolver: &ColumnResolver<'_>,
) -> Result<SellStage, StagetraderError> {
    let context = format!("sell stage {}", number);
    if stage.size_fraction.is_some() {
        return Err(invalid(&context, "sizeFraction applies to buy stages only"));
    }
    let exit_ratio = stage
        .exit_ratio
        .or(ladder_rung.map(|r| r.exit_ratio))
        .ok_or_else(|| invalid(&context, "exitRatio is required"))?;
    let target = stage.target_profit_pct.or(ladder_rung.map(|r| r.pct));
    Ok(SellStage {
        number,
        exit_ratio: check_ratio(&context, exit_ratio)?,
        conditions: resolver.conditions(&stage.conditions)?,
        logic: StageLogic::from_require_all(stage.require_all),
        target_profit_pct: target.map(|t| check_target(&context, t)).transpose()?,
        profit_logic: stage.profit_logic,
        dynamic_stop_loss: stage.dynamic_stop_loss.unwrap_or(false),
    })
}

fn build_sell_stages(
    doc: &StrategyDocument,
    resolver: &ColumnResolver<'_>,
    flat: bool,
) -> Result<Vec<SellStage>, StagetraderError> {
    if !doc.sell_stages.is_empty() && !doc.sell_conditions.is_empty() {
        return Err(invalid("strategy", "sellConditions and sellStages are mutually exclusive"));
    }
    if !flat && !doc.sell_conditions.is_empty() {
        return Err(invalid("strategy", "staged strategies declare exits as sellStages"));
    }

    let ladder = match &doc.target_profit {
        Some(TargetProfitDocument::Staged { ladder }) => {
            if ladder.is_empty() {
                return Err(invalid("targetProfit", "staged ladder must not be empty"));
            }
            Some(ladder.as_slice())
        }
        _ => None,
    };
    let simple = match &doc.target_profit {
        Some(TargetProfitDocument::Simple { pct }) => Some(check_target("targetProfit", *pct)?),
        _ => None,
    };

    let mut stages = Vec::new();
    if !doc.sell_stages.is_empty() {
        if simple.is_some() {
            return Err(invalid("targetProfit", "with sellStages, set targetProfitPct per stage or use a staged ladder"));
        }
        if let Some(ladder) = ladder {
            if ladder.len() != doc.sell_stages.len() {
                return Err(invalid(
                    "targetProfit",
                    format!(
                        "ladder has {} rungs but there are {} sell stages",
                        ladder.len(),
                        doc.sell_stages.len()
                    ),
                ));
            }
        }
        for (i, stage) in doc.sell_stages.iter().enumerate() {
            let rung = ladder.and_then(|l| l.get(i));
            stages.push(sell_stage_from_doc(i + 1, stage, rung, resolver)?);
        }
    } else if let Some(ladder) = ladder {
        for (i, rung) in ladder.iter().enumerate() {
            stages.push(sell_stage_from_doc(i + 1, &StageDocument::default(), Some(rung), resolver)?);
        }
    }

    let total: f64 = stages.iter().map(|s| s.exit_ratio).sum();
    if total > 100.0 + 1e-9 {
        return Err(invalid("sell stages", format!("exit ratios sum to {}, more than 100", total)));
    }

    for stage in &stages {
        if stage.conditions.is_empty() && stage.target_profit_pct.is_none() {
            return Err(invalid(
                format!("sell stage {}", stage.number),
                "a sell stage needs conditions or a target profit",
            ));
        }
    }

    // Flat sell conditions close whatever the ladder left open.
    if doc.sell_stages.is_empty() && (!doc.sell_conditions.is_empty() || simple.is_some()) {
        stages.push(SellStage {
            number: stages.len() + 1,
            exit_ratio: 100.0,
            conditions: resolver.conditions(&doc.sell_conditions)?,
            logic: StageLogic::Sequential,
            target_profit_pct: simple,
            profit_logic: ProfitLogic::Or,
            dynamic_stop_loss: false,
        });
    }
    Ok(stages)
}

fn build_stop_loss(doc: &StrategyDocument, sell_stages: &[SellStage]) -> Result<StopLossPlan, StagetraderError> {
    let Some(stop) = &doc.stop_loss else {
        return Ok(StopLossPlan::default());
    };
    let pct = if stop.enabled {
        if !(stop.pct > 0.0 && stop.pct < 100.0) {
            return Err(invalid("stopLoss", format!("pct must be in (0, 100), got {}", stop.pct)));
        }
        Some(stop.pct)
    } else {
        None
    };

    let mut ladder = BTreeMap::new();
    for step in &stop.dynamic {
        let context = format!("stopLoss.dynamic afterStage {}", step.after_stage);
        if step.after_stage == 0 || step.after_stage > sell_stages.len() {
            return Err(invalid(&context, "refers to a sell stage that does not exist"));
        }
        match &step.move_to {
            StopAnchor::StageTrigger { stage } => {
                if *stage == 0 || *stage >= step.after_stage {
                    return Err(invalid(
                        &context,
                        format!("stageTrigger {} must name an earlier sell stage", stage),
                    ));
                }
            }
            StopAnchor::ProfitPct { pct } => {
                if !(pct.is_finite() && *pct > -100.0) {
                    return Err(invalid(&context, format!("profitPct must be above -100, got {}", pct)));
                }
            }
            StopAnchor::BreakEven => {}
        }
        if ladder.insert(step.after_stage, step.move_to.clone()).is_some() {
            return Err(invalid(&context, "declared more than once"));
        }
    }

    Ok(StopLossPlan { pct, ladder })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::condition::{Operand, Operator};

    fn doc(json: &str) -> StrategyDocument {
        StrategyDocument::from_json(json).unwrap()
    }

    fn strategy(json: &str) -> Result<Strategy, StagetraderError> {
        Strategy::from_document(&doc(json))
    }

    #[test]
    fn flat_document_becomes_single_stages() {
        let s = strategy(
            r#"{"name": "rsi", "indicators": [{"name": "rsi"}],
                "buyConditions": ["rsi < 30"], "sellConditions": ["rsi_14 > 70"]}"#,
        )
        .unwrap();
        assert!(s.flat);
        assert_eq!(s.buy_stages.len(), 1);
        assert_eq!(s.buy_stages[0].size_fraction, 1.0);
        assert_eq!(s.buy_stages[0].conditions[0].left, Operand::Column("rsi_14".into()));
        assert_eq!(s.sell_stages.len(), 1);
        assert_eq!(s.sell_stages[0].exit_ratio, 100.0);
    }

    #[test]
    fn staged_ladder_generates_condition_free_stages() {
        let s = strategy(
            r#"{"name": "ladder", "buyConditions": ["close > 0"],
                "targetProfit": {"mode": "staged", "ladder": [
                    {"pct": 3, "exitRatio": 50}, {"pct": 5, "exitRatio": 30}, {"pct": 10, "exitRatio": 20}]}}"#,
        )
        .unwrap();
        let ratios: Vec<f64> = s.sell_stages.iter().map(|st| st.exit_ratio).collect();
        assert_eq!(ratios, vec![50.0, 30.0, 20.0]);
        assert_eq!(s.sell_stages[2].target_profit_pct, Some(10.0));
        assert!(s.sell_stages.iter().all(|st| st.conditions.is_empty()));
    }

    #[test]
    fn ladder_with_flat_conditions_appends_closing_stage() {
        let s = strategy(
            r#"{"name": "mix", "buyConditions": ["close > 0"], "sellConditions": ["close < 1"],
                "targetProfit": {"mode": "staged", "ladder": [{"pct": 3, "exitRatio": 50}]}}"#,
        )
        .unwrap();
        assert_eq!(s.sell_stages.len(), 2);
        assert_eq!(s.sell_stages[1].number, 2);
        assert_eq!(s.sell_stages[1].conditions[0].operator, Operator::Lt);
    }

    #[test]
    fn no_sell_side_means_no_sell_stage() {
        let s = strategy(r#"{"name": "hold", "buyConditions": ["close > 0"]}"#).unwrap();
        assert!(s.sell_stages.is_empty());
    }

    #[test]
    fn unknown_reference_is_config_error() {
        let err = strategy(r#"{"name": "x", "buyConditions": ["rsi_14 < 30"]}"#).unwrap_err();
        assert!(err.to_string().contains("unknown indicator column 'rsi_14'"));
    }

    #[test]
    fn ambiguous_bare_name_is_config_error() {
        let err = strategy(
            r#"{"name": "x", "indicators": [{"name": "sma", "parameters": {"period": 10}},
                                            {"name": "sma", "parameters": {"period": 50}}],
                "buyConditions": ["sma > 1"]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("ambiguous"));
    }

    #[test]
    fn duplicate_output_names_rejected() {
        let err = strategy(
            r#"{"name": "x", "indicators": [{"name": "sma", "parameters": {"period": 10}},
                                            {"name": "ema", "alias": "sma_10"}],
                "buyConditions": ["close > 1"]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate output column"));
    }

    #[test]
    fn alias_may_not_shadow_price() {
        let err = strategy(
            r#"{"name": "x", "indicators": [{"name": "sma", "alias": "close"}], "buyConditions": ["close > 1"]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("price field"));
    }

    #[test]
    fn exit_ratios_over_100_rejected() {
        let err = strategy(
            r#"{"name": "x", "buyConditions": ["close > 0"],
                "sellStages": [{"exitRatio": 60, "targetProfitPct": 2}, {"exitRatio": 50, "targetProfitPct": 4}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("sum"));
    }

    #[test]
    fn ladder_must_match_sell_stage_count() {
        let err = strategy(
            r#"{"name": "x", "buyConditions": ["close > 0"],
                "sellStages": [{"conditions": ["close > 5"]}],
                "targetProfit": {"mode": "staged", "ladder": [{"pct": 3, "exitRatio": 50}, {"pct": 5, "exitRatio": 50}]}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("rungs"));
    }

    #[test]
    fn stage_trigger_must_point_backwards() {
        let err = strategy(
            r#"{"name": "x", "buyConditions": ["close > 0"],
                "targetProfit": {"mode": "staged", "ladder": [{"pct": 3, "exitRatio": 50}, {"pct": 5, "exitRatio": 50}]},
                "stopLoss": {"enabled": true, "pct": 3,
                             "dynamic": [{"afterStage": 1, "moveTo": {"type": "stageTrigger", "stage": 1}}]}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("earlier sell stage"));
    }

    #[test]
    fn ladder_entry_marks_stage_dynamic_and_default_ladder_applies() {
        let s = strategy(
            r#"{"name": "x", "buyConditions": ["close > 0"],
                "sellStages": [{"exitRatio": 50, "targetProfitPct": 3},
                               {"exitRatio": 25, "targetProfitPct": 5, "dynamicStopLoss": true}],
                "stopLoss": {"enabled": true, "pct": 3,
                             "dynamic": [{"afterStage": 1, "moveTo": {"type": "profitPct", "pct": 1}}]}}"#,
        )
        .unwrap();
        assert!(s.sell_stages[0].dynamic_stop_loss);
        assert_eq!(
            s.stop_loss.anchor_after(&s.sell_stages[0]),
            Some(StopAnchor::ProfitPct { pct: 1.0 })
        );
        assert_eq!(
            s.stop_loss.anchor_after(&s.sell_stages[1]),
            Some(StopAnchor::StageTrigger { stage: 1 })
        );
        assert_eq!(s.stop_loss.pct, Some(3.0));
    }

    #[test]
    fn capital_ranges_checked() {
        let err = strategy(
            r#"{"name": "x", "buyConditions": ["close > 0"], "capital": {"positionSize": 1.5}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("positionSize"));
    }

    #[test]
    fn formula_parameter_cannot_shadow_inputs() {
        let err = strategy(
            r#"{"name": "x", "indicators": [{"name": "f", "kind": "formula", "formula": "emit s = close",
                 "outputColumns": ["s"], "parameters": {"close": 1}}],
                "buyConditions": ["s > 0"]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn formula_outputs_are_referencable() {
        let s = strategy(
            r#"{"name": "x", "indicators": [{"name": "f", "kind": "formula", "formula": "emit spread = close - open",
                 "outputColumns": ["spread"]}],
                "buyConditions": ["spread > 0"]}"#,
        )
        .unwrap();
        assert_eq!(s.referenced_columns().into_iter().collect::<Vec<_>>(), vec!["spread"]);
    }
}
