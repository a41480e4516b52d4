//! Shorthand condition parser.
//!
//! Grammar:
//!
//! ```text
//! condition := [ "AND" | "OR" ] operand operator operand
//! operator  := "<" | ">" | "<=" | ">=" | "==" | "=" | "cross_above" | "cross_below"
//! operand   := number | identifier
//! ```
//!
//! Errors carry the character offset of the offending token.

use crate::domain::condition::{Combine, Condition, Operand, Operator};
use crate::domain::error::ParseError;

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn remaining(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.remaining().chars().next()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.peek() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn error(&self, message: impl Into<String>, position: usize) -> ParseError {
        ParseError {
            message: message.into(),
            position,
        }
    }

    fn peek_word(&self) -> &'a str {
        let rest = self.remaining();
        let end = rest
            .char_indices()
            .find(|(_, c)| !(c.is_alphanumeric() || *c == '_'))
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        &rest[..end]
    }

    fn describe_next(&self) -> String {
        match self.peek() {
            None => "end of input".to_string(),
            Some(_) if !self.peek_word().is_empty() => format!("'{}'", self.peek_word()),
            Some(ch) => format!("'{}'", ch),
        }
    }

    fn parse_combine(&mut self) -> Option<Combine> {
        self.skip_whitespace();
        let word = self.peek_word();
        let combine = Combine::parse(word)?;
        self.pos += word.len();
        Some(combine)
    }

    fn parse_number(&mut self) -> Result<f64, ParseError> {
        let start = self.pos;
        if matches!(self.peek(), Some('-') | Some('+')) {
            self.advance();
        }
        let mut digits = 0;
        let mut has_dot = false;
        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                digits += 1;
                self.advance();
            } else if ch == '.' && !has_dot {
                has_dot = true;
                self.advance();
            } else {
                break;
            }
        }
        if digits == 0 {
            return Err(self.error("expected number", start));
        }
        let text = &self.input[start..self.pos];
        text.parse::<f64>()
            .map_err(|_| self.error(format!("invalid number: {}", text), start))
    }

    fn parse_operand(&mut self) -> Result<Operand, ParseError> {
        self.skip_whitespace();
        let start = self.pos;
        match self.peek() {
            Some(ch) if ch.is_ascii_digit() || ch == '-' || ch == '+' || ch == '.' => {
                Ok(Operand::Constant(self.parse_number()?))
            }
            Some(ch) if ch.is_alphabetic() || ch == '_' => {
                let word = self.peek_word();
                self.pos += word.len();
                Ok(Operand::from_token(word))
            }
            _ => Err(self.error(
                format!("expected operand, found {}", self.describe_next()),
                start,
            )),
        }
    }

    fn parse_operator(&mut self) -> Result<Operator, ParseError> {
        self.skip_whitespace();
        let start = self.pos;
        for symbol in ["<=", ">=", "==", "<", ">", "="] {
            if self.remaining().starts_with(symbol) {
                self.pos += symbol.len();
                return Operator::parse(symbol)
                    .ok_or_else(|| self.error(format!("unknown operator '{}'", symbol), start));
            }
        }
        let word = self.peek_word();
        match Operator::parse(word) {
            Some(op) if op.is_crossover() => {
                self.pos += word.len();
                Ok(op)
            }
            _ => Err(self.error(
                format!("expected operator, found {}", self.describe_next()),
                start,
            )),
        }
    }

    fn parse_condition(&mut self) -> Result<Condition, ParseError> {
        let combine = self.parse_combine();
        let left = self.parse_operand()?;
        let operator = self.parse_operator()?;
        let right = self.parse_operand()?;
        self.skip_whitespace();
        if self.pos < self.input.len() {
            return Err(self.error(
                format!("unexpected trailing input {}", self.describe_next()),
                self.pos,
            ));
        }
        Ok(Condition {
            left,
            operator,
            right,
            combine_with: combine,
        })
    }
}

/// Parses one shorthand condition such as `"OR sma_10 cross_above sma_50"`.
pub fn parse_condition(input: &str) -> Result<Condition, ParseError> {
    if input.trim().is_empty() {
        return Err(ParseError {
            message: "empty condition".to_string(),
            position: 0,
        });
    }
    Parser::new(input).parse_condition()
}
