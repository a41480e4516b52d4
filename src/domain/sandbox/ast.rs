//! Syntax tree of the formula language.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub pos: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Number(f64),
    Str(String),
    Name(String),
    Attribute { target: Box<Expr>, attr: String },
    Call { callee: Box<Expr>, args: Vec<Expr> },
    Index { target: Box<Expr>, index: Box<Expr> },
    Neg(Box<Expr>),
    Binary { op: BinaryOp, lhs: Box<Expr>, rhs: Box<Expr> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub pos: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// `import x` or `from x import y`. Parsed so it can be rejected with a
    /// precise position.
    Import { module: String },
    Assign { target: String, value: Expr },
    Emit { target: String, value: Expr },
    For { var: String, count: Expr, body: Vec<Stmt> },
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub stmts: Vec<Stmt>,
}

impl Expr {
    pub fn new(kind: ExprKind, pos: usize) -> Self {
        Self { kind, pos }
    }
}
