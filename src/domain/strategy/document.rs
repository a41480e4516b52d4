//! Raw strategy document, exactly as it is stored (camelCase JSON).
//!
//! Nothing here is validated beyond its shape; [`super::Strategy::from_document`]
//! turns a document into a checked strategy.

use crate::domain::condition::{Combine, Condition, Operand, Operator};
use crate::domain::condition_parser::parse_condition;
use crate::domain::error::StagetraderError;
use crate::domain::indicator::OnError;
use crate::domain::stage::StopAnchor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::ProfitLogic;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyDocument {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub indicators: Vec<IndicatorDocument>,
    #[serde(default)]
    pub buy_conditions: Vec<ConditionDocument>,
    #[serde(default)]
    pub sell_conditions: Vec<ConditionDocument>,
    #[serde(default)]
    pub buy_stages: Vec<StageDocument>,
    #[serde(default)]
    pub sell_stages: Vec<StageDocument>,
    #[serde(default)]
    pub target_profit: Option<TargetProfitDocument>,
    #[serde(default)]
    pub stop_loss: Option<StopLossDocument>,
    #[serde(default)]
    pub capital: CapitalDocument,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorKindTag {
    #[default]
    Builtin,
    Formula,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndicatorDocument {
    pub name: String,
    #[serde(default)]
    pub kind: IndicatorKindTag,
    #[serde(default)]
    pub parameters: BTreeMap<String, f64>,
    #[serde(default)]
    pub source_column: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub formula: Option<String>,
    #[serde(default)]
    pub output_columns: Vec<String>,
    #[serde(default)]
    pub on_error: OnError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OperandDocument {
    Number(f64),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionObject {
    #[serde(alias = "indicator")]
    pub left: OperandDocument,
    pub operator: String,
    #[serde(alias = "value")]
    pub right: OperandDocument,
    #[serde(default, alias = "combine_with")]
    pub combine_with: Option<Combine>,
}

/// A condition is either a shorthand string or an explicit object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionDocument {
    Text(String),
    Object(ConditionObject),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageDocument {
    #[serde(default)]
    pub size_fraction: Option<f64>,
    #[serde(default)]
    pub conditions: Vec<ConditionDocument>,
    #[serde(default)]
    pub require_all: Option<bool>,
    #[serde(default)]
    pub exit_ratio: Option<f64>,
    #[serde(default)]
    pub target_profit_pct: Option<f64>,
    #[serde(default)]
    pub profit_logic: ProfitLogic,
    #[serde(default)]
    pub dynamic_stop_loss: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LadderRung {
    pub pct: f64,
    pub exit_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum TargetProfitDocument {
    Simple { pct: f64 },
    Staged { ladder: Vec<LadderRung> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicStep {
    pub after_stage: usize,
    pub move_to: StopAnchor,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopLossDocument {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub pct: f64,
    #[serde(default)]
    pub dynamic: Vec<DynamicStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CapitalDocument {
    pub initial_capital: f64,
    pub commission_rate: f64,
    pub slippage_rate: f64,
    pub position_size: f64,
}

impl Default for CapitalDocument {
    fn default() -> Self {
        Self {
            initial_capital: 100_000.0,
            commission_rate: 0.0,
            slippage_rate: 0.0,
            position_size: 1.0,
        }
    }
}

impl OperandDocument {
    fn to_operand(&self) -> Operand {
        match self {
            OperandDocument::Number(value) => Operand::Constant(*value),
            OperandDocument::Name(name) => Operand::from_token(name),
        }
    }
}

impl ConditionDocument {
    /// Converts to a condition whose column references are still unresolved.
    pub fn to_condition(&self) -> Result<Condition, StagetraderError> {
        match self {
            ConditionDocument::Text(text) => Ok(parse_condition(text)?),
            ConditionDocument::Object(object) => {
                let operator = Operator::parse(object.operator.trim()).ok_or_else(|| {
                    StagetraderError::config(
                        "condition",
                        format!("unknown operator '{}'", object.operator),
                    )
                })?;
                Ok(Condition {
                    left: object.left.to_operand(),
                    operator,
                    right: object.right.to_operand(),
                    combine_with: object.combine_with,
                })
            }
        }
    }
}

impl StrategyDocument {
    pub fn from_json(text: &str) -> Result<Self, StagetraderError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ohlcv::PriceField;

    #[test]
    fn parses_flat_document() {
        let doc = StrategyDocument::from_json(
            r#"{
                "name": "RSI swing",
                "indicators": [{"name": "rsi", "parameters": {"period": 14}}],
                "buyConditions": [{"indicator": "rsi_14", "operator": "<", "value": 30}],
                "sellConditions": ["rsi_14 > 70"]
            }"#,
        )
        .unwrap();
        assert_eq!(doc.indicators[0].kind, IndicatorKindTag::Builtin);
        assert_eq!(doc.capital.initial_capital, 100_000.0);
        let buy = doc.buy_conditions[0].to_condition().unwrap();
        assert_eq!(buy.left, Operand::Column("rsi_14".into()));
        assert_eq!(buy.right, Operand::Constant(30.0));
        let sell = doc.sell_conditions[0].to_condition().unwrap();
        assert_eq!(sell.operator, Operator::Gt);
    }

    #[test]
    fn parses_target_and_stop_blocks() {
        let doc = StrategyDocument::from_json(
            r#"{
                "name": "ladder",
                "buyConditions": ["close > 0"],
                "targetProfit": {"mode": "staged", "ladder": [{"pct": 3, "exitRatio": 50}]},
                "stopLoss": {"enabled": true, "pct": 3,
                             "dynamic": [{"afterStage": 2, "moveTo": {"type": "stageTrigger", "stage": 1}}]},
                "capital": {"initialCapital": 5000, "commissionRate": 0.001}
            }"#,
        )
        .unwrap();
        assert_eq!(
            doc.target_profit,
            Some(TargetProfitDocument::Staged {
                ladder: vec![LadderRung {
                    pct: 3.0,
                    exit_ratio: 50.0
                }]
            })
        );
        let stop = doc.stop_loss.unwrap();
        assert_eq!(stop.dynamic[0].move_to, StopAnchor::StageTrigger { stage: 1 });
        assert_eq!(doc.capital.initial_capital, 5000.0);
        assert_eq!(doc.capital.position_size, 1.0);
    }

    #[test]
    fn object_condition_with_price_operand() {
        let doc: ConditionDocument =
            serde_json::from_str(r#"{"left": "price", "operator": ">=", "right": "sma_20", "combineWith": "OR"}"#).unwrap();
        let cond = doc.to_condition().unwrap();
        assert_eq!(cond.left, Operand::Price(PriceField::Close));
        assert_eq!(cond.combine_with, Some(Combine::Or));
    }

    #[test]
    fn unknown_operator_is_config_error() {
        let doc: ConditionDocument =
            serde_json::from_str(r#"{"left": "close", "operator": "!=", "right": 1}"#).unwrap();
        assert!(matches!(doc.to_condition(), Err(StagetraderError::Configuration { .. })));
    }

    #[test]
    fn malformed_shorthand_is_parse_error() {
        let doc = ConditionDocument::Text("rsi_14 ?? 30".into());
        assert!(matches!(doc.to_condition(), Err(StagetraderError::ConditionParse(_))));
    }
}
