//! Condition model.
//!
//! A [`Condition`] compares two operands with an [`Operator`]. Operands name
//! indicator columns by string until the strategy is bound to an instrument;
//! [`Condition::map_columns`] then swaps the names for column handles.

use crate::domain::ohlcv::PriceField;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Operand<C = String> {
    Price(PriceField),
    Constant(f64),
    Column(C),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    CrossAbove,
    CrossBelow,
}

/// How a condition joins the result accumulated from the conditions before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Combine {
    #[serde(alias = "and")]
    And,
    #[serde(alias = "or")]
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition<C = String> {
    pub left: Operand<C>,
    pub operator: Operator,
    pub right: Operand<C>,
    /// `None` behaves like `AND`.
    pub combine_with: Option<Combine>,
}

impl Operator {
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "<" => Some(Operator::Lt),
            ">" => Some(Operator::Gt),
            "<=" => Some(Operator::Le),
            ">=" => Some(Operator::Ge),
            "==" | "=" => Some(Operator::Eq),
            "cross_above" | "crosses_above" => Some(Operator::CrossAbove),
            "cross_below" | "crosses_below" => Some(Operator::CrossBelow),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Lt => "<",
            Operator::Gt => ">",
            Operator::Le => "<=",
            Operator::Ge => ">=",
            Operator::Eq => "==",
            Operator::CrossAbove => "cross_above",
            Operator::CrossBelow => "cross_below",
        }
    }

    pub fn is_crossover(&self) -> bool {
        matches!(self, Operator::CrossAbove | Operator::CrossBelow)
    }
}

impl Combine {
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_uppercase().as_str() {
            "AND" => Some(Combine::And),
            "OR" => Some(Combine::Or),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Combine::And => "AND",
            Combine::Or => "OR",
        }
    }
}

impl Operand<String> {
    /// Classifies a bare token: number, raw price field, or column name.
    pub fn from_token(token: &str) -> Self {
        let token = token.trim();
        match token.parse::<f64>() {
            Ok(value) if value.is_finite() => return Operand::Constant(value),
            _ => {}
        }
        match PriceField::parse(token) {
            Some(field) => Operand::Price(field),
            None => Operand::Column(token.to_string()),
        }
    }
}

impl<C> Operand<C> {
    pub fn map_column<D, E>(self, f: &mut impl FnMut(C) -> Result<D, E>) -> Result<Operand<D>, E> {
        Ok(match self {
            Operand::Price(field) => Operand::Price(field),
            Operand::Constant(value) => Operand::Constant(value),
            Operand::Column(c) => Operand::Column(f(c)?),
        })
    }

    pub fn column(&self) -> Option<&C> {
        match self {
            Operand::Column(c) => Some(c),
            _ => None,
        }
    }
}

impl<C> Condition<C> {
    pub fn new(left: Operand<C>, operator: Operator, right: Operand<C>) -> Self {
        Self {
            left,
            operator,
            right,
            combine_with: None,
        }
    }

    pub fn with_combine(mut self, combine: Combine) -> Self {
        self.combine_with = Some(combine);
        self
    }

    /// Rewrites every column reference, keeping operators and combinators.
    pub fn map_columns<D, E>(self, mut f: impl FnMut(C) -> Result<D, E>) -> Result<Condition<D>, E> {
        Ok(Condition {
            left: self.left.map_column(&mut f)?,
            operator: self.operator,
            right: self.right.map_column(&mut f)?,
            combine_with: self.combine_with,
        })
    }

    pub fn columns(&self) -> impl Iterator<Item = &C> {
        self.left.column().into_iter().chain(self.right.column())
    }
}

impl<C: fmt::Display> fmt::Display for Operand<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Price(field) => write!(f, "{}", field),
            Operand::Constant(value) => write!(f, "{}", value),
            Operand::Column(c) => write!(f, "{}", c),
        }
    }
}

impl<C: fmt::Display> fmt::Display for Condition<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(combine) = self.combine_with {
            write!(f, "{} ", combine.as_str())?;
        }
        write!(f, "{} {} {}", self.left, self.operator.as_str(), self.right)
    }
}
