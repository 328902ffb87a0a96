//! Typed intermediate representation produced by lowering
//!
//! The IR is a small imperative tree: scalar expressions over typed
//! variables, buffer loads and stores, counted loops and conditionals. A
//! backend consumes either the [`Function`] value (serde) or its printed form.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ast::{BinOp, CmpOp};
use crate::types::{ArrayType, DType, KernelType};

/// Type of an IR variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IrType {
    /// Scalar of the given kind
    Prim(DType),
    /// Pointer to the data of a buffer
    Pointer(DType),
    /// Opaque runtime session handle
    Handle,
}

impl fmt::Display for IrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrType::Prim(dtype) => write!(f, "{}", dtype),
            IrType::Pointer(dtype) => write!(f, "ptr[{}]", dtype),
            IrType::Handle => write!(f, "handle"),
        }
    }
}

/// A named, typed variable
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrimVar {
    pub name: String,
    pub ty: IrType,
}

impl PrimVar {
    pub fn new(name: impl Into<String>, ty: IrType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }

    pub fn scalar(name: impl Into<String>, dtype: DType) -> Self {
        Self::new(name, IrType::Prim(dtype))
    }
}

/// Storage descriptor of an N-dimensional array
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Buffer {
    pub name: String,
    pub data: PrimVar,
    pub ty: ArrayType,
}

impl Buffer {
    pub fn new(name: impl Into<String>, ty: ArrayType) -> Self {
        let name = name.into();
        Self {
            data: PrimVar::new(name.clone(), IrType::Pointer(ty.dtype)),
            name,
            ty,
        }
    }

    pub fn dtype(&self) -> DType {
        self.ty.dtype
    }
}

/// Where a shape symbol's runtime value is read from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolBinding {
    pub symbol: String,
    pub param: String,
    pub axis: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

impl BinaryOp {
    /// IR counterpart of a source operator; `**` and `@` have none
    pub fn from_ast(op: BinOp) -> Option<Self> {
        let op = match op {
            BinOp::Add => BinaryOp::Add,
            BinOp::Sub => BinaryOp::Sub,
            BinOp::Mult => BinaryOp::Mul,
            BinOp::Div => BinaryOp::Div,
            BinOp::FloorDiv => BinaryOp::FloorDiv,
            BinOp::Mod => BinaryOp::Mod,
            BinOp::BitAnd => BinaryOp::BitAnd,
            BinOp::BitOr => BinaryOp::BitOr,
            BinOp::BitXor => BinaryOp::BitXor,
            BinOp::LShift => BinaryOp::Shl,
            BinOp::RShift => BinaryOp::Shr,
            BinOp::Pow | BinOp::MatMult => return None,
        };
        Some(op)
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::FloorDiv => "//",
            BinaryOp::Mod => "%",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn from_ast(op: CmpOp) -> Self {
        match op {
            CmpOp::Eq => CompareOp::Eq,
            CmpOp::NotEq => CompareOp::Ne,
            CmpOp::Lt => CompareOp::Lt,
            CmpOp::LtE => CompareOp::Le,
            CmpOp::Gt => CompareOp::Gt,
            CmpOp::GtE => CompareOp::Ge,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalOp {
    And,
    Or,
}

/// IR expressions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    IntImm { value: i64, dtype: DType },
    FloatImm { value: f64, dtype: DType },
    BoolImm(bool),
    NoneExpr,
    Var(PrimVar),
    /// Runtime value of a shape symbol (int64)
    Symbol(String),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        dtype: DType,
    },
    Compare {
        op: CompareOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Cast { dtype: DType, value: Box<Expr> },
    Load {
        buffer: String,
        indices: Vec<Expr>,
        dtype: DType,
    },
}

impl Expr {
    pub fn int(value: i64) -> Self {
        Expr::IntImm {
            value,
            dtype: DType::Int64,
        }
    }

    pub fn var(var: &PrimVar) -> Self {
        Expr::Var(var.clone())
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr, dtype: DType) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            dtype,
        }
    }

    pub fn compare(op: CompareOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Compare {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn logical(op: LogicalOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Logical {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// Element kind of a scalar expression; `None` for the none value and handles
    pub fn dtype(&self) -> Option<DType> {
        match self {
            Expr::IntImm { dtype, .. }
            | Expr::FloatImm { dtype, .. }
            | Expr::Binary { dtype, .. }
            | Expr::Cast { dtype, .. }
            | Expr::Load { dtype, .. } => Some(*dtype),
            Expr::BoolImm(_) | Expr::Compare { .. } | Expr::Logical { .. } => Some(DType::Bool),
            Expr::Symbol(_) => Some(DType::Int64),
            Expr::Var(var) => match var.ty {
                IrType::Prim(dtype) => Some(dtype),
                IrType::Pointer(_) | IrType::Handle => None,
            },
            Expr::NoneExpr => None,
        }
    }

    /// Convert to `dtype`, folding immediates and skipping no-op casts
    pub fn cast(self, dtype: DType) -> Expr {
        if self.dtype() == Some(dtype) {
            return self;
        }
        match self {
            Expr::IntImm { value, .. } if dtype.is_int() => Expr::IntImm { value, dtype },
            Expr::IntImm { value, .. } if dtype.is_float() => Expr::FloatImm {
                value: value as f64,
                dtype,
            },
            Expr::FloatImm { value, .. } if dtype.is_float() => Expr::FloatImm { value, dtype },
            Expr::BoolImm(value) if dtype.is_int() => Expr::IntImm {
                value: i64::from(value),
                dtype,
            },
            other => Expr::Cast {
                dtype,
                value: Box::new(other),
            },
        }
    }
}

/// IR statements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    Seq(Vec<Stmt>),
    /// Declare a scalar local, optionally initialized
    Let { var: PrimVar, value: Option<Expr> },
    Assign { var: PrimVar, value: Expr },
    Store {
        buffer: String,
        indices: Vec<Expr>,
        value: Expr,
    },
    Allocate(Buffer),
    For {
        var: PrimVar,
        start: Expr,
        stop: Expr,
        step: Expr,
        body: Box<Stmt>,
    },
    If {
        cond: Expr,
        then_body: Box<Stmt>,
        else_body: Option<Box<Stmt>>,
    },
    Return(Expr),
}

impl Stmt {
    /// A sequence, or the statement itself when there is exactly one
    pub fn seq(mut stmts: Vec<Stmt>) -> Stmt {
        if stmts.len() == 1 {
            stmts.remove(0)
        } else {
            Stmt::Seq(stmts)
        }
    }

    /// Last statement executed at the top level of this statement
    pub fn last(&self) -> &Stmt {
        match self {
            Stmt::Seq(stmts) => stmts.last().map(Stmt::last).unwrap_or(self),
            other => other,
        }
    }
}

/// Source span of a lowered function
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub file: String,
    pub line: usize,
    pub end_line: usize,
}

/// A lowered kernel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    /// One variable per parameter plus the trailing session handle
    pub params: Vec<PrimVar>,
    pub buffers: Vec<Buffer>,
    pub symbols: Vec<SymbolBinding>,
    pub body: Stmt,
    pub ret_type: KernelType,
    pub span: Span,
}

impl Function {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::IntImm { value, dtype } if *dtype == DType::Int64 => write!(f, "{}", value),
            Expr::IntImm { value, dtype } => write!(f, "{}({})", dtype, value),
            Expr::FloatImm { value, dtype } => write!(f, "{}({:?})", dtype, value),
            Expr::BoolImm(value) => write!(f, "{}", if *value { "True" } else { "False" }),
            Expr::NoneExpr => write!(f, "None"),
            Expr::Var(var) => write!(f, "{}", var.name),
            Expr::Symbol(name) => write!(f, "{}", name),
            Expr::Binary { op, lhs, rhs, .. } => write!(f, "({} {} {})", lhs, op.symbol(), rhs),
            Expr::Compare { op, lhs, rhs } => write!(f, "({} {} {})", lhs, op.symbol(), rhs),
            Expr::Logical { op, lhs, rhs } => {
                let word = match op {
                    LogicalOp::And => "and",
                    LogicalOp::Or => "or",
                };
                write!(f, "({} {} {})", lhs, word, rhs)
            }
            Expr::Cast { dtype, value } => write!(f, "{}({})", dtype, value),
            Expr::Load {
                buffer, indices, ..
            } => {
                write!(f, "{}[", buffer)?;
                write_list(f, indices)?;
                write!(f, "]")
            }
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

fn write_stmt(f: &mut fmt::Formatter<'_>, stmt: &Stmt, depth: usize) -> fmt::Result {
    let pad = "    ".repeat(depth);
    match stmt {
        Stmt::Seq(stmts) => {
            for s in stmts {
                write_stmt(f, s, depth)?;
            }
            Ok(())
        }
        Stmt::Let { var, value: Some(value) } => writeln!(f, "{}{}: {} = {}", pad, var.name, var.ty, value),
        Stmt::Let { var, value: None } => writeln!(f, "{}{}: {}", pad, var.name, var.ty),
        Stmt::Assign { var, value } => writeln!(f, "{}{} = {}", pad, var.name, value),
        Stmt::Store {
            buffer,
            indices,
            value,
        } => {
            write!(f, "{}{}[", pad, buffer)?;
            write_list(f, indices)?;
            writeln!(f, "] = {}", value)
        }
        Stmt::Allocate(buffer) => writeln!(f, "{}{} = allocate({})", pad, buffer.name, buffer.ty),
        Stmt::For {
            var,
            start,
            stop,
            step,
            body,
        } => {
            writeln!(f, "{}for {} in range({}, {}, {}):", pad, var.name, start, stop, step)?;
            write_stmt(f, body, depth + 1)
        }
        Stmt::If {
            cond,
            then_body,
            else_body,
        } => {
            writeln!(f, "{}if {}:", pad, cond)?;
            write_stmt(f, then_body, depth + 1)?;
            if let Some(else_body) = else_body {
                writeln!(f, "{}else:", pad)?;
                write_stmt(f, else_body, depth + 1)?;
            }
            Ok(())
        }
        Stmt::Return(value) => writeln!(f, "{}return {}", pad, value),
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_stmt(f, self, 0)
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "def {}(", self.name)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", param.name, param.ty)?;
        }
        writeln!(f, ") -> {}:", self.ret_type)?;
        for buffer in &self.buffers {
            writeln!(f, "    # buffer {}: {}", buffer.name, buffer.ty)?;
        }
        for binding in &self.symbols {
            writeln!(f, "    # {} = {}.shape[{}]", binding.symbol, binding.param, binding.axis)?;
        }
        write_stmt(f, &self.body, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::SymExpr;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cast_folds_immediates() {
        assert_eq!(Expr::int(3).cast(DType::Int32), Expr::IntImm { value: 3, dtype: DType::Int32 });
        assert_eq!(
            Expr::int(3).cast(DType::Float32),
            Expr::FloatImm { value: 3.0, dtype: DType::Float32 }
        );
        assert_eq!(Expr::int(3).cast(DType::Int64), Expr::int(3));

        let var = Expr::var(&PrimVar::scalar("x", DType::Int32));
        assert!(matches!(var.cast(DType::Float64), Expr::Cast { dtype: DType::Float64, .. }));
    }

    #[test]
    fn test_seq_collapses_single_statement() {
        let ret = Stmt::Return(Expr::NoneExpr);
        assert_eq!(Stmt::seq(vec![ret.clone()]), ret);
        assert_eq!(Stmt::seq(vec![ret.clone(), ret.clone()]).last(), &ret);
    }

    #[test]
    fn test_print_loop_nest() {
        let buffer = Buffer::new("a", ArrayType::new(DType::Int32, vec![SymExpr::symbol("N")]));
        let i = PrimVar::scalar("i", DType::Int64);
        let body = Stmt::For {
            var: i.clone(),
            start: Expr::int(0),
            stop: Expr::Symbol("N".into()),
            step: Expr::int(1),
            body: Box::new(Stmt::Store {
                buffer: buffer.name.clone(),
                indices: vec![Expr::var(&i)],
                value: Expr::IntImm { value: 0, dtype: DType::Int32 },
            }),
        };
        let expected = "for i in range(0, N, 1):\n    a[i] = int32(0)\n";
        assert_eq!(body.to_string(), expected);
    }
}
