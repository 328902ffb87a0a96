//! Abstract Syntax Tree definitions for the kernel language
//!
//! The tree follows the shape of a Python syntax tree so that the lowering
//! engine can dispatch on the same node kinds. Statements carry the source
//! line they start on; expressions are reported at their statement's line.

/// A parsed source file: a sequence of function definitions
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub functions: Vec<FunctionDef>,
}

impl Module {
    pub fn function(&self, name: &str) -> Option<&FunctionDef> {
        self.functions.iter().find(|f| f.name == name)
    }
}

/// A function definition: `def name(params) -> returns: body`
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub decorators: Vec<Expr>,
    pub params: Vec<Param>,
    pub returns: Option<Expr>,
    pub body: Vec<Stmt>,
    pub line: usize,
    /// Last line covered by the body
    pub end_line: usize,
}

/// A function parameter with its optional annotation
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub annotation: Option<Expr>,
}

/// A statement with its source line
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub line: usize,
}

impl Stmt {
    pub fn new(kind: StmtKind, line: usize) -> Self {
        Self { kind, line }
    }
}

/// Statement kinds
#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// `t1 = t2 = value`
    Assign { targets: Vec<Expr>, value: Expr },
    /// `target: annotation [= value]`
    AnnAssign {
        target: Expr,
        annotation: Expr,
        value: Option<Expr>,
    },
    /// `target op= value`
    AugAssign { target: Expr, op: BinOp, value: Expr },
    If {
        test: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    For {
        target: Expr,
        iter: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    While {
        test: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    Return { value: Option<Expr> },
    /// Bare expression statement
    Expr(Expr),
    FunctionDef(Box<FunctionDef>),
    Pass,
    Break,
    Continue,
}

impl StmtKind {
    /// Node-kind name, as reported in diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            StmtKind::Assign { .. } => "Assign",
            StmtKind::AnnAssign { .. } => "AnnAssign",
            StmtKind::AugAssign { .. } => "AugAssign",
            StmtKind::If { .. } => "If",
            StmtKind::For { .. } => "For",
            StmtKind::While { .. } => "While",
            StmtKind::Return { .. } => "Return",
            StmtKind::Expr(_) => "Expr",
            StmtKind::FunctionDef(_) => "FunctionDef",
            StmtKind::Pass => "Pass",
            StmtKind::Break => "Break",
            StmtKind::Continue => "Continue",
        }
    }
}

/// Literal constants
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// Expression types
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Name(String),
    Constant(Constant),
    BinOp {
        left: Box<Expr>,
        op: BinOp,
        right: Box<Expr>,
    },
    UnaryOp { op: UnaryOp, operand: Box<Expr> },
    /// `a and b and c`
    BoolOp { op: BoolOp, values: Vec<Expr> },
    /// `a < b <= c`
    Compare {
        left: Box<Expr>,
        ops: Vec<CmpOp>,
        comparators: Vec<Expr>,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        keywords: Vec<Keyword>,
    },
    /// `value[i, j]`
    Subscript { value: Box<Expr>, indices: Vec<Expr> },
    /// `value.attr`
    Attribute { value: Box<Expr>, attr: String },
    /// `lower:upper:step`, only inside subscripts
    Slice {
        lower: Option<Box<Expr>>,
        upper: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },
    Tuple(Vec<Expr>),
}

impl Expr {
    pub fn name(name: impl Into<String>) -> Self {
        Expr::Name(name.into())
    }

    pub fn int(value: i64) -> Self {
        Expr::Constant(Constant::Int(value))
    }

    pub fn binop(left: Expr, op: BinOp, right: Expr) -> Self {
        Expr::BinOp {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    /// Node-kind name, as reported in diagnostics
    pub fn kind_name(&self) -> &'static str {
        match self {
            Expr::Name(_) => "Name",
            Expr::Constant(_) => "Constant",
            Expr::BinOp { .. } => "BinOp",
            Expr::UnaryOp { .. } => "UnaryOp",
            Expr::BoolOp { .. } => "BoolOp",
            Expr::Compare { .. } => "Compare",
            Expr::Call { .. } => "Call",
            Expr::Subscript { .. } => "Subscript",
            Expr::Attribute { .. } => "Attribute",
            Expr::Slice { .. } => "Slice",
            Expr::Tuple(_) => "Tuple",
        }
    }

    /// Visit this expression and every sub-expression, parents first
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::Name(_) | Expr::Constant(_) => {}
            Expr::BinOp { left, right, .. } => {
                left.walk(f);
                right.walk(f);
            }
            Expr::UnaryOp { operand, .. } => operand.walk(f),
            Expr::BoolOp { values, .. } | Expr::Tuple(values) => {
                for value in values {
                    value.walk(f);
                }
            }
            Expr::Compare {
                left, comparators, ..
            } => {
                left.walk(f);
                for comparator in comparators {
                    comparator.walk(f);
                }
            }
            Expr::Call {
                func,
                args,
                keywords,
            } => {
                func.walk(f);
                for arg in args {
                    arg.walk(f);
                }
                for keyword in keywords {
                    keyword.value.walk(f);
                }
            }
            Expr::Subscript { value, indices } => {
                value.walk(f);
                for index in indices {
                    index.walk(f);
                }
            }
            Expr::Attribute { value, .. } => value.walk(f),
            Expr::Slice { lower, upper, step } => {
                for part in [lower, upper, step].into_iter().flatten() {
                    part.walk(f);
                }
            }
        }
    }
}

/// Keyword argument: `name=value`
#[derive(Debug, Clone, PartialEq)]
pub struct Keyword {
    pub arg: String,
    pub value: Expr,
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mult,
    Div,
    FloorDiv,
    Mod,
    Pow,
    MatMult,
    BitAnd,
    BitOr,
    BitXor,
    LShift,
    RShift,
}

impl BinOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mult => "*",
            BinOp::Div => "/",
            BinOp::FloorDiv => "//",
            BinOp::Mod => "%",
            BinOp::Pow => "**",
            BinOp::MatMult => "@",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::LShift => "<<",
            BinOp::RShift => ">>",
        }
    }
}

impl std::fmt::Display for BinOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `-x`
    USub,
    /// `+x`
    UAdd,
    /// `not x`
    Not,
    /// `~x`
    Invert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
}

impl CmpOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::NotEq => "!=",
            CmpOp::Lt => "<",
            CmpOp::LtE => "<=",
            CmpOp::Gt => ">",
            CmpOp::GtE => ">=",
        }
    }
}
