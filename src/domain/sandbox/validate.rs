//! Static allow-list validation of a parsed formula.
//!
//! Runs before any execution. Everything not explicitly allowed is rejected:
//! imports, attribute access, subscripts, dunder names, blocked identifiers,
//! calls to anything outside the numeric vocabulary, and string literals that
//! look like filesystem paths.

use super::ast::{Expr, ExprKind, Program, Stmt, StmtKind};
use crate::domain::error::SandboxError;

/// Functions a formula may call.
pub const VOCABULARY: &[&str] = &[
    "sma",
    "ema",
    "rolling_sum",
    "rolling_mean",
    "rolling_min",
    "rolling_max",
    "rolling_std",
    "shift",
    "diff",
    "cumsum",
    "abs",
    "sqrt",
    "log",
    "exp",
    "min",
    "max",
    "clip",
    "where",
    "fill",
    "concat",
    "len",
    "nan",
    "is_nan",
];

/// Names bound from the input snapshot.
pub const INPUTS: &[&str] = &["open", "high", "low", "close", "volume", "bars"];

const BLOCKED: &[&str] = &[
    "open_file",
    "exec",
    "eval",
    "compile",
    "getattr",
    "setattr",
    "delattr",
    "globals",
    "locals",
    "vars",
    "dir",
    "input",
    "print",
    "file",
    "os",
    "sys",
    "subprocess",
    "socket",
    "shutil",
    "pathlib",
    "importlib",
    "builtins",
    "system",
    "popen",
    "spawn",
    "fork",
    "kill",
    "sleep",
    "time",
    "thread",
    "threading",
    "lambda",
    "while",
    "def",
    "class",
    "with",
    "yield",
];

pub fn is_blocked_identifier(name: &str) -> bool {
    name.starts_with("__") || BLOCKED.contains(&name)
}

fn looks_like_path(text: &str) -> bool {
    let bytes = text.as_bytes();
    text.contains('/')
        || text.contains('\\')
        || text.starts_with('~')
        || text.starts_with("..")
        || (bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':')
}

fn reject(reason: impl Into<String>, position: usize) -> SandboxError {
    SandboxError::Rejected {
        reason: reason.into(),
        position,
    }
}

/// Checks the size limit and walks the tree; the first violation wins.
pub fn validate(source: &str, program: &Program, max_source_bytes: usize) -> Result<(), SandboxError> {
    if source.len() > max_source_bytes {
        return Err(reject(
            format!(
                "formula is {} bytes, limit is {}",
                source.len(),
                max_source_bytes
            ),
            0,
        ));
    }
    program.stmts.iter().try_for_each(validate_stmt)
}

fn validate_target(name: &str, pos: usize) -> Result<(), SandboxError> {
    if is_blocked_identifier(name) {
        return Err(reject(format!("blocked identifier '{}'", name), pos));
    }
    if VOCABULARY.contains(&name) || INPUTS.contains(&name) {
        return Err(reject(format!("cannot rebind reserved name '{}'", name), pos));
    }
    Ok(())
}

fn validate_stmt(stmt: &Stmt) -> Result<(), SandboxError> {
    match &stmt.kind {
        StmtKind::Import { module } => Err(reject(
            format!("import statements are not allowed (module '{}')", module),
            stmt.pos,
        )),
        StmtKind::Assign { target, value } | StmtKind::Emit { target, value } => {
            validate_target(target, stmt.pos)?;
            validate_expr(value)
        }
        StmtKind::For { var, count, body } => {
            validate_target(var, stmt.pos)?;
            validate_expr(count)?;
            body.iter().try_for_each(validate_stmt)
        }
        StmtKind::Expr(expr) => validate_expr(expr),
    }
}

fn validate_expr(expr: &Expr) -> Result<(), SandboxError> {
    match &expr.kind {
        ExprKind::Number(_) => Ok(()),
        ExprKind::Str(text) => {
            if looks_like_path(text) {
                Err(reject(
                    format!("string literal '{}' looks like a filesystem path", text),
                    expr.pos,
                ))
            } else {
                Ok(())
            }
        }
        ExprKind::Name(name) => {
            if is_blocked_identifier(name) {
                Err(reject(format!("blocked identifier '{}'", name), expr.pos))
            } else {
                Ok(())
            }
        }
        ExprKind::Attribute { attr, .. } => Err(reject(
            format!("attribute access is not allowed ('.{}')", attr),
            expr.pos,
        )),
        ExprKind::Index { .. } => Err(reject("subscripts are not allowed", expr.pos)),
        ExprKind::Call { callee, args } => {
            match &callee.kind {
                ExprKind::Name(name) if VOCABULARY.contains(&name.as_str()) => {}
                ExprKind::Name(name) if is_blocked_identifier(name) => {
                    return Err(reject(format!("blocked identifier '{}'", name), callee.pos));
                }
                ExprKind::Name(name) if INPUTS.contains(&name.as_str()) => {
                    return Err(reject(format!("'{}' is a price series and cannot be called", name), callee.pos));
                }
                ExprKind::Name(name) => {
                    return Err(reject(format!("call to unknown function '{}'", name), callee.pos));
                }
                _ => {
                    validate_expr(callee)?;
                    return Err(reject("only named functions may be called", expr.pos));
                }
            }
            args.iter().try_for_each(validate_expr)
        }
        ExprKind::Neg(operand) => validate_expr(operand),
        ExprKind::Binary { lhs, rhs, .. } => {
            validate_expr(lhs)?;
            validate_expr(rhs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::sandbox::parser::parse;

    fn check(source: &str) -> Result<(), SandboxError> {
        let program = parse(source).map_err(SandboxError::from)?;
        validate(source, &program, 64 * 1024)
    }

    fn reason(source: &str) -> String {
        match check(source) {
            Err(SandboxError::Rejected { reason, .. }) => reason,
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn accepts_vocabulary_formula() {
        assert!(check("m = sma(close, period)\nemit spread = close - m").is_ok());
        assert!(check("emit z = where(close > open, 1, 0)").is_ok());
    }

    #[test]
    fn rejects_imports() {
        assert!(reason("import os").contains("import"));
        assert!(reason("from subprocess import run").contains("import"));
    }

    #[test]
    fn rejects_blocked_names_and_dunders() {
        assert!(reason("emit x = eval(close)").contains("blocked identifier 'eval'"));
        assert!(reason("emit x = __import__").contains("blocked"));
        assert!(reason("x = sys").contains("blocked"));
    }

    #[test]
    fn rejects_unknown_calls() {
        assert!(reason("emit x = open_file(close)").contains("blocked"));
        assert!(reason("emit x = fetch(close)").contains("unknown function 'fetch'"));
    }

    #[test]
    fn rejects_file_access_and_sleeping() {
        let open = check("emit x = open(\"prices.csv\")").unwrap_err();
        assert_eq!(open.kind(), "rejected");
        assert!(open.to_string().contains("'open' is a price series"));

        let sleep = check("sleep(5)\nemit x = close").unwrap_err();
        assert_eq!(sleep.kind(), "rejected");
        assert!(sleep.to_string().contains("blocked identifier 'sleep'"));
    }

    #[test]
    fn rejects_attribute_access_and_subscripts() {
        assert!(reason("emit x = close.values").contains("attribute"));
        assert!(reason("emit x = close[1]").contains("subscripts"));
    }

    #[test]
    fn rejects_path_like_strings() {
        assert!(reason("x = '/etc/passwd'").contains("path"));
        assert!(reason("x = 'C:temp'").contains("path"));
        assert!(reason("x = '~secrets'").contains("path"));
        assert!(reason(r"x = 'a\b'").contains("path"));
        assert!(check("x = 'label'").is_ok());
    }

    #[test]
    fn rejects_rebinding_reserved_names() {
        assert!(reason("close = 1").contains("reserved"));
        assert!(reason("sma = 1").contains("reserved"));
    }

    #[test]
    fn rejects_oversized_source() {
        let source = "x = 1\n".repeat(100);
        let program = parse(&source).unwrap();
        let err = validate(&source, &program, 50).unwrap_err();
        assert!(matches!(err, SandboxError::Rejected { position: 0, .. }));
    }

    #[test]
    fn validates_inside_loops() {
        assert!(reason("for i in range(2) {\n import os\n}").contains("import"));
    }

    #[test]
    fn rejection_reports_position() {
        let err = check("x = 1\nemit y = eval(x)").unwrap_err();
        match err {
            SandboxError::Rejected { position, .. } => assert_eq!(position, 15),
            other => panic!("unexpected {:?}", other),
        }
    }
}
