//! Formula language parser.
//!
//! Recursive descent over the raw text, producing a [`Program`]. Statements
//! end at a newline, `;` or a closing `}`; newlines inside brackets are
//! ignored. `#` starts a comment that runs to the end of the line.

use super::ast::{BinaryOp, Expr, ExprKind, Program, Stmt, StmtKind};
use crate::domain::error::ParseError;

const MAX_NESTING: usize = 64;

struct Parser<'a> {
    input: &'a str,
    pos: usize,
    depth: usize,
    brackets: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            depth: 0,
            brackets: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            position: self.pos,
        }
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

    fn skip_comment(&mut self) {
        if self.peek() == Some('#') {
            while let Some(ch) = self.peek() {
                if ch == '\n' {
                    break;
                }
                self.advance();
            }
        }
    }

    /// Skips blanks and comments; newlines only inside brackets.
    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.peek() {
            if ch == '#' {
                self.skip_comment();
            } else if ch == '\n' && self.brackets == 0 {
                break;
            } else if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn skip_separators(&mut self) {
        while let Some(ch) = self.peek() {
            if ch == '#' {
                self.skip_comment();
            } else if ch.is_whitespace() || ch == ';' {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn expect_char(&mut self, expected: char) -> Result<(), ParseError> {
        self.skip_whitespace();
        match self.peek() {
            Some(ch) if ch == expected => {
                self.advance();
                Ok(())
            }
            Some(ch) => Err(self.error(format!("expected '{}', found '{}'", expected, ch))),
            None => Err(self.error(format!("expected '{}', found end of input", expected))),
        }
    }

    fn consume_exact(&mut self, s: &str) -> bool {
        if self.remaining().starts_with(s) {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        let remaining = self.remaining();
        remaining.starts_with(keyword)
            && !remaining[keyword.len()..]
                .chars()
                .next()
                .is_some_and(|c| c.is_alphanumeric() || c == '_')
    }

    fn consume_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.pos += keyword.len();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), ParseError> {
        self.skip_whitespace();
        if self.consume_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}', found '{}'", keyword, self.peek_word())))
        }
    }

    fn peek_word(&self) -> String {
        let word: String = self
            .remaining()
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        if word.is_empty() {
            self.peek()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "end of input".to_string())
        } else {
            word
        }
    }

    fn parse_identifier(&mut self) -> Result<String, ParseError> {
        self.skip_whitespace();
        match self.peek() {
            Some(ch) if ch.is_alphabetic() || ch == '_' => {}
            _ => return Err(self.error(format!("expected identifier, found '{}'", self.peek_word()))),
        }
        let start = self.pos;
        while let Some(ch) = self.peek() {
            if ch.is_alphanumeric() || ch == '_' {
                self.advance();
            } else {
                break;
            }
        }
        Ok(self.input[start..self.pos].to_string())
    }

    fn parse_dotted_name(&mut self) -> Result<String, ParseError> {
        let mut name = self.parse_identifier()?;
        while self.peek() == Some('.') {
            self.advance();
            name.push('.');
            name.push_str(&self.parse_identifier()?);
        }
        Ok(name)
    }

    fn parse_block(&mut self, in_block: bool) -> Result<Vec<Stmt>, ParseError> {
        let mut stmts = Vec::new();
        loop {
            self.skip_separators();
            match self.peek() {
                None if in_block => return Err(self.error("expected '}', found end of input")),
                None => break,
                Some('}') if in_block => break,
                _ => {}
            }

            stmts.push(self.parse_statement()?);

            self.skip_whitespace();
            match self.peek() {
                None | Some('\n') | Some(';') => {}
                Some('}') if in_block => {}
                Some(_) => {
                    return Err(self.error(format!(
                        "expected end of statement, found '{}'",
                        self.peek_word()
                    )));
                }
            }
        }
        Ok(stmts)
    }

    fn parse_statement(&mut self) -> Result<Stmt, ParseError> {
        self.skip_whitespace();
        let pos = self.pos;

        if self.consume_keyword("import") {
            let module = self.parse_dotted_name()?;
            return Ok(Stmt {
                kind: StmtKind::Import { module },
                pos,
            });
        }

        if self.consume_keyword("from") {
            let module = self.parse_dotted_name()?;
            self.expect_keyword("import")?;
            self.parse_dotted_name()?;
            loop {
                self.skip_whitespace();
                if self.peek() != Some(',') {
                    break;
                }
                self.advance();
                self.parse_dotted_name()?;
            }
            return Ok(Stmt {
                kind: StmtKind::Import { module },
                pos,
            });
        }

        if self.consume_keyword("emit") {
            let target = self.parse_identifier()?;
            self.expect_assign()?;
            let value = self.parse_expr()?;
            return Ok(Stmt {
                kind: StmtKind::Emit { target, value },
                pos,
            });
        }

        if self.consume_keyword("for") {
            let var = self.parse_identifier()?;
            self.expect_keyword("in")?;
            self.expect_keyword("range")?;
            self.expect_char('(')?;
            self.brackets += 1;
            let count = self.parse_expr()?;
            self.expect_char(')')?;
            self.brackets -= 1;
            self.expect_char('{')?;
            let body = self.parse_block(true)?;
            self.expect_char('}')?;
            return Ok(Stmt {
                kind: StmtKind::For { var, count, body },
                pos,
            });
        }

        let save = self.pos;
        if let Ok(target) = self.parse_identifier() {
            self.skip_whitespace();
            if self.peek() == Some('=') && !self.remaining().starts_with("==") {
                self.advance();
                let value = self.parse_expr()?;
                return Ok(Stmt {
                    kind: StmtKind::Assign { target, value },
                    pos,
                });
            }
        }
        self.pos = save;

        let expr = self.parse_expr()?;
        Ok(Stmt {
            kind: StmtKind::Expr(expr),
            pos,
        })
    }

    fn expect_assign(&mut self) -> Result<(), ParseError> {
        self.skip_whitespace();
        if self.remaining().starts_with("==") {
            return Err(self.error("expected '=', found '=='"));
        }
        self.expect_char('=')
    }

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.error("expression nested too deeply"));
        }
        let expr = self.parse_comparison();
        self.depth -= 1;
        expr
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_additive()?;
        loop {
            self.skip_whitespace();
            let pos = self.pos;
            let op = if self.consume_exact("<=") {
                BinaryOp::Le
            } else if self.consume_exact(">=") {
                BinaryOp::Ge
            } else if self.consume_exact("==") {
                BinaryOp::Eq
            } else if self.consume_exact("!=") {
                BinaryOp::Ne
            } else if self.consume_exact("<") {
                BinaryOp::Lt
            } else if self.consume_exact(">") {
                BinaryOp::Gt
            } else {
                break;
            };
            let rhs = self.parse_additive()?;
            lhs = binary(op, lhs, rhs, pos);
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            self.skip_whitespace();
            let pos = self.pos;
            let op = match self.peek() {
                Some('+') => BinaryOp::Add,
                Some('-') => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_multiplicative()?;
            lhs = binary(op, lhs, rhs, pos);
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_unary()?;
        loop {
            self.skip_whitespace();
            let pos = self.pos;
            if self.remaining().starts_with("**") {
                break;
            }
            let op = match self.peek() {
                Some('*') => BinaryOp::Mul,
                Some('/') => BinaryOp::Div,
                Some('%') => BinaryOp::Rem,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = binary(op, lhs, rhs, pos);
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        self.skip_whitespace();
        let pos = self.pos;
        match self.peek() {
            Some('-') => {
                self.advance();
                self.depth += 1;
                if self.depth > MAX_NESTING {
                    return Err(self.error("expression nested too deeply"));
                }
                let operand = self.parse_unary()?;
                self.depth -= 1;
                Ok(Expr::new(ExprKind::Neg(Box::new(operand)), pos))
            }
            Some('+') => {
                self.advance();
                self.parse_unary()
            }
            _ => self.parse_power(),
        }
    }

    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        let base = self.parse_postfix()?;
        self.skip_whitespace();
        let pos = self.pos;
        if self.consume_exact("**") {
            let exponent = self.parse_unary()?;
            return Ok(binary(BinaryOp::Pow, base, exponent, pos));
        }
        Ok(base)
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            self.skip_whitespace();
            let pos = self.pos;
            match self.peek() {
                Some('.') => {
                    self.advance();
                    let attr = self.parse_identifier()?;
                    expr = Expr::new(
                        ExprKind::Attribute {
                            target: Box::new(expr),
                            attr,
                        },
                        pos,
                    );
                }
                Some('(') => {
                    self.advance();
                    self.brackets += 1;
                    let args = self.parse_args()?;
                    self.brackets -= 1;
                    expr = Expr::new(
                        ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                        },
                        pos,
                    );
                }
                Some('[') => {
                    self.advance();
                    self.brackets += 1;
                    let index = self.parse_expr()?;
                    self.expect_char(']')?;
                    self.brackets -= 1;
                    expr = Expr::new(
                        ExprKind::Index {
                            target: Box::new(expr),
                            index: Box::new(index),
                        },
                        pos,
                    );
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        self.skip_whitespace();
        if self.peek() == Some(')') {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            self.skip_whitespace();
            match self.peek() {
                Some(',') => {
                    self.advance();
                }
                Some(')') => {
                    self.advance();
                    return Ok(args);
                }
                _ => {
                    return Err(self.error(format!(
                        "expected ',' or ')', found '{}'",
                        self.peek_word()
                    )));
                }
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        self.skip_whitespace();
        let pos = self.pos;
        match self.peek() {
            Some(ch) if ch.is_ascii_digit() || ch == '.' => {
                let value = self.parse_number()?;
                Ok(Expr::new(ExprKind::Number(value), pos))
            }
            Some(quote @ ('"' | '\'')) => {
                self.advance();
                let start = self.pos;
                while let Some(ch) = self.peek() {
                    if ch == quote {
                        let text = self.input[start..self.pos].to_string();
                        self.advance();
                        return Ok(Expr::new(ExprKind::Str(text), pos));
                    }
                    if ch == '\n' {
                        break;
                    }
                    self.advance();
                }
                Err(ParseError {
                    message: "unterminated string literal".to_string(),
                    position: pos,
                })
            }
            Some(ch) if ch.is_alphabetic() || ch == '_' => {
                let name = self.parse_identifier()?;
                Ok(Expr::new(ExprKind::Name(name), pos))
            }
            Some('(') => {
                self.advance();
                self.brackets += 1;
                let inner = self.parse_expr()?;
                self.expect_char(')')?;
                self.brackets -= 1;
                Ok(inner)
            }
            Some(ch) => Err(self.error(format!("unexpected character '{}'", ch))),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn parse_number(&mut self) -> Result<f64, ParseError> {
        let start = self.pos;
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
            return Err(ParseError {
                message: "expected number".to_string(),
                position: start,
            });
        }

        if matches!(self.peek(), Some('e' | 'E')) {
            let save = self.pos;
            self.advance();
            if matches!(self.peek(), Some('+' | '-')) {
                self.advance();
            }
            if self.peek().is_some_and(|c| c.is_ascii_digit()) {
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.advance();
                }
            } else {
                self.pos = save;
            }
        }

        let text = &self.input[start..self.pos];
        text.parse::<f64>().map_err(|_| ParseError {
            message: format!("invalid number: {}", text),
            position: start,
        })
    }
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr, pos: usize) -> Expr {
    Expr::new(
        ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        pos,
    )
}

/// Parse a formula body into a program.
pub fn parse(input: &str) -> Result<Program, ParseError> {
    let mut parser = Parser::new(input);
    let stmts = parser.parse_block(false)?;
    Ok(Program { stmts })
}
