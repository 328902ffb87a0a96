//! Type and shape resolution
//!
//! Computes the semantic type of names, literals and binary operations, and
//! validates index and range expressions against the shape algebra.

use tracing::warn;

use crate::ast::{BinOp, Constant};
use crate::error::{CompileError, CompileResult};
use crate::ir::{self, BinaryOp, IrType, PrimVar};
use crate::scope::ScopeContext;
use crate::symbol::{Assumptions, Atom, SymExpr, SymbolTable};
use crate::types::{ArrayType, DType, KernelType};

/// Type bound to `name`: shape symbols are int64 scalars, then parameters and locals
pub fn resolve_name(
    name: &str,
    symbols: &SymbolTable,
    scope: &ScopeContext,
    line: usize,
) -> CompileResult<KernelType> {
    if symbols.contains(name) {
        return Ok(KernelType::Scalar(DType::Int64));
    }
    scope
        .lookup(name)
        .map(|binding| binding.ty())
        .ok_or_else(|| CompileError::unresolved(line, name))
}

/// Type of a literal; strings have no lowering
pub fn resolve_literal(constant: &Constant, line: usize) -> CompileResult<KernelType> {
    match constant {
        Constant::None => Ok(KernelType::None),
        Constant::Str(_) => Err(CompileError::unsupported(line, "string literals are not supported")),
        other => DType::of_literal(other)
            .map(KernelType::Scalar)
            .ok_or_else(|| CompileError::unsupported(line, "unsupported literal")),
    }
}

/// Element kind produced by `lhs op rhs`
pub fn result_dtype(op: BinOp, lhs: DType, rhs: DType, line: usize) -> CompileResult<DType> {
    match op {
        BinOp::Pow | BinOp::MatMult => Err(CompileError::unsupported(
            line,
            format!("operator '{}' is not supported", op),
        )),
        BinOp::Div => Ok(DType::true_div(lhs, rhs)),
        BinOp::Add | BinOp::Sub | BinOp::Mult | BinOp::FloorDiv | BinOp::Mod => {
            Ok(DType::promote(lhs, rhs))
        }
        BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::LShift | BinOp::RShift => {
            if !lhs.is_integral() || !rhs.is_integral() {
                return Err(CompileError::unsupported(
                    line,
                    format!("operator '{}' is not supported between {} and {}", op, lhs, rhs),
                ));
            }
            let logical = matches!(op, BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor);
            if logical && lhs.is_bool() && rhs.is_bool() {
                Ok(DType::Bool)
            } else {
                Ok(DType::promote(lhs, rhs))
            }
        }
    }
}

/// Type of `lhs op rhs`: promoted element kind, broadcast shape if any operand is an array
pub fn binary_result(
    op: BinOp,
    lhs: &KernelType,
    rhs: &KernelType,
    line: usize,
) -> CompileResult<KernelType> {
    let (Some(l), Some(r)) = (lhs.dtype(), rhs.dtype()) else {
        return Err(CompileError::type_error(
            line,
            format!("unsupported operand types for {}: {} and {}", op, lhs, rhs),
        ));
    };
    let dtype = result_dtype(op, l, r, line)?;
    match (lhs, rhs) {
        (KernelType::Array(a), KernelType::Array(b)) => Ok(KernelType::Array(ArrayType::new(
            dtype,
            broadcast_shapes(&a.shape, &b.shape, line)?,
        ))),
        (KernelType::Array(a), _) | (_, KernelType::Array(a)) => {
            Ok(KernelType::Array(a.with_dtype(dtype)))
        }
        _ => Ok(KernelType::Scalar(dtype)),
    }
}

pub fn fmt_shape(shape: &[SymExpr]) -> String {
    let dims: Vec<String> = shape.iter().map(ToString::to_string).collect();
    format!("[{}]", dims.join(", "))
}

/// Right-aligned broadcast; a dimension of literal 1 stretches to the other
pub fn broadcast_shapes(lhs: &[SymExpr], rhs: &[SymExpr], line: usize) -> CompileResult<Vec<SymExpr>> {
    let rank = lhs.len().max(rhs.len());
    let one = SymExpr::int(1);
    let mut out = Vec::with_capacity(rank);

    for axis in 0..rank {
        let l = (axis + lhs.len()).checked_sub(rank).map(|i| &lhs[i]);
        let r = (axis + rhs.len()).checked_sub(rank).map(|i| &rhs[i]);
        let dim = match (l, r) {
            (Some(a), Some(b)) if a == b => a.clone(),
            (Some(a), Some(b)) if *a == one => b.clone(),
            (Some(a), Some(b)) if *b == one => a.clone(),
            (Some(a), None) | (None, Some(a)) => a.clone(),
            _ => {
                return Err(CompileError::shape_mismatch(line, fmt_shape(lhs), fmt_shape(rhs)));
            }
        };
        out.push(dim);
    }
    Ok(out)
}

/// Reject an index that is provably negative or provably past the extent
pub fn check_index(
    buffer: &str,
    axis: usize,
    index: &SymExpr,
    extent: &SymExpr,
    assumptions: &Assumptions,
    line: usize,
) -> CompileResult<()> {
    if index.is_negative(assumptions) || index.provably_ge(extent, assumptions) {
        return Err(CompileError::IndexOutOfBounds {
            line,
            buffer: buffer.to_string(),
            axis,
            index: index.to_string(),
            extent: extent.to_string(),
        });
    }
    Ok(())
}

/// Validate `range(start, stop, step)`; returns whether the range is provably empty
pub fn check_range(
    start: &SymExpr,
    stop: &SymExpr,
    step: &SymExpr,
    assumptions: &Assumptions,
    line: usize,
) -> CompileResult<bool> {
    if step.as_const() == Some(0) {
        return Err(CompileError::type_error(line, "range() step must not be zero"));
    }
    let empty = (step.is_positive(assumptions) && start.provably_ge(stop, assumptions))
        || (step.is_negative(assumptions) && stop.provably_ge(start, assumptions));
    if empty {
        warn!(line, %start, %stop, %step, "loop range is empty");
    }
    Ok(empty)
}

fn atom_to_ir(atom: &Atom) -> ir::Expr {
    match atom {
        Atom::Symbol(name) => ir::Expr::Symbol(name.clone()),
        Atom::Var { name, dtype } => ir::Expr::var(&PrimVar::scalar(name.clone(), *dtype)).cast(DType::Int64),
        Atom::FloorDiv(a, b) => ir::Expr::binary(BinaryOp::FloorDiv, sym_to_ir(a), sym_to_ir(b), DType::Int64),
        Atom::Mod(a, b) => ir::Expr::binary(BinaryOp::Mod, sym_to_ir(a), sym_to_ir(b), DType::Int64),
    }
}

/// Lower a symbolic integer expression to an int64 IR expression
pub fn sym_to_ir(expr: &SymExpr) -> ir::Expr {
    let terms = expr.terms();
    let ordered = terms
        .iter()
        .filter(|t| !t.factors.is_empty())
        .chain(terms.iter().filter(|t| t.factors.is_empty()));

    let mut acc: Option<ir::Expr> = None;
    for term in ordered {
        // i64::MIN has no positive counterpart and is added as is
        let subtract = acc.is_some() && term.coeff < 0 && term.coeff != i64::MIN;
        let magnitude = if subtract { -term.coeff } else { term.coeff };
        let mut factors = term.factors.iter().map(atom_to_ir);
        let monomial = match (magnitude, factors.next()) {
            (c, None) => ir::Expr::int(c),
            (c, Some(first)) => {
                let product = factors.fold(first, |lhs, rhs| ir::Expr::binary(BinaryOp::Mul, lhs, rhs, DType::Int64));
                if c == 1 {
                    product
                } else {
                    ir::Expr::binary(BinaryOp::Mul, ir::Expr::int(c), product, DType::Int64)
                }
            }
        };
        acc = Some(match acc {
            None => monomial,
            Some(lhs) if subtract => ir::Expr::binary(BinaryOp::Sub, lhs, monomial, DType::Int64),
            Some(lhs) => ir::Expr::binary(BinaryOp::Add, lhs, monomial, DType::Int64),
        });
    }
    acc.unwrap_or_else(|| ir::Expr::int(0))
}

/// Recover the symbolic form of an integer IR expression, if it has one
///
/// Expressions whose folded coefficients overflow i64 have none.
pub fn ir_to_sym(expr: &ir::Expr) -> Option<SymExpr> {
    match expr {
        ir::Expr::IntImm { value, dtype } if dtype.is_int() => Some(SymExpr::int(*value)),
        ir::Expr::Symbol(name) => Some(SymExpr::symbol(name.clone())),
        ir::Expr::Var(PrimVar {
            name,
            ty: IrType::Prim(dtype),
        }) if dtype.is_int() => Some(SymExpr::var(name.clone(), *dtype)),
        ir::Expr::Cast { dtype, value } if dtype.is_int() => {
            let inner = value.dtype()?;
            if inner.is_int() && inner.bits() <= dtype.bits() {
                ir_to_sym(value)
            } else {
                None
            }
        }
        ir::Expr::Binary { op, lhs, rhs, dtype } if dtype.is_int() => {
            let (l, r) = (ir_to_sym(lhs)?, ir_to_sym(rhs)?);
            match op {
                BinaryOp::Add => l.add(&r),
                BinaryOp::Sub => l.sub(&r),
                BinaryOp::Mul => l.mul(&r),
                BinaryOp::FloorDiv => l.floor_div(&r),
                BinaryOp::Mod => l.floor_mod(&r),
                _ => None,
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::{Binding, Frame, FrameKind};
    use pretty_assertions::assert_eq;

    fn m() -> SymExpr {
        SymExpr::symbol("M")
    }

    fn n() -> SymExpr {
        SymExpr::symbol("N")
    }

    fn asm() -> Assumptions {
        let mut asm = Assumptions::default();
        asm.positive_symbols.insert("M".into());
        asm.positive_symbols.insert("N".into());
        asm
    }

    #[test]
    fn test_resolve_name_order() {
        let a = ArrayType::new(DType::Int32, vec![m(), n()]);
        let symbols = SymbolTable::from_types([&a]);
        let mut scope = ScopeContext::new(symbols.assumptions());
        scope.push(Frame::new(FrameKind::Function, &[]).with_binding(
            "a",
            Binding::Array(ir::Buffer::new("a", a.clone())),
        ));

        assert_eq!(resolve_name("M", &symbols, &scope, 1).unwrap(), KernelType::Scalar(DType::Int64));
        assert_eq!(resolve_name("a", &symbols, &scope, 1).unwrap(), KernelType::Array(a));
        assert_eq!(
            resolve_name("k", &symbols, &scope, 7),
            Err(CompileError::unresolved(7, "k"))
        );
    }

    #[test]
    fn test_resolve_literal() {
        assert_eq!(resolve_literal(&Constant::Int(1), 1).unwrap(), KernelType::Scalar(DType::Int64));
        assert_eq!(resolve_literal(&Constant::Float(1.5), 1).unwrap(), KernelType::Scalar(DType::Float64));
        assert_eq!(resolve_literal(&Constant::None, 1).unwrap(), KernelType::None);
        assert!(matches!(
            resolve_literal(&Constant::Str("x".into()), 1),
            Err(CompileError::UnsupportedConstruct { .. })
        ));
    }

    #[test]
    fn test_binary_result_promotes_and_broadcasts() {
        let a = KernelType::Array(ArrayType::new(DType::Int32, vec![m(), n()]));
        let row = KernelType::Array(ArrayType::new(DType::Float32, vec![SymExpr::int(1), n()]));

        let ty = binary_result(BinOp::Add, &a, &row, 1).unwrap();
        assert_eq!(ty, KernelType::Array(ArrayType::new(DType::Float32, vec![m(), n()])));

        let scalar = KernelType::Scalar(DType::Int64);
        let ty = binary_result(BinOp::Div, &scalar, &scalar, 1).unwrap();
        assert_eq!(ty, KernelType::Scalar(DType::Float64));
    }

    #[test]
    fn test_unknown_operator_pairs() {
        assert!(matches!(
            result_dtype(BinOp::Pow, DType::Int32, DType::Int32, 1),
            Err(CompileError::UnsupportedConstruct { .. })
        ));
        assert!(matches!(
            result_dtype(BinOp::BitAnd, DType::Float32, DType::Int32, 1),
            Err(CompileError::UnsupportedConstruct { .. })
        ));
        assert_eq!(result_dtype(BinOp::BitOr, DType::Bool, DType::Bool, 1).unwrap(), DType::Bool);
    }

    #[test]
    fn test_broadcast_mismatch() {
        let err = broadcast_shapes(&[m(), n()], &[n(), m()], 3).unwrap_err();
        assert!(matches!(err, CompileError::ShapeMismatch { line: 3, .. }));
        assert_eq!(broadcast_shapes(&[m(), n()], &[n()], 3).unwrap(), vec![m(), n()]);
    }

    #[test]
    fn test_check_index() {
        let asm = asm();
        assert!(check_index("a", 0, &m().sub(&SymExpr::int(1)).unwrap(), &m(), &asm, 1).is_ok());
        assert!(check_index("a", 0, &m(), &m(), &asm, 1).is_err());
        assert!(check_index("a", 0, &SymExpr::int(-1), &m(), &asm, 1).is_err());
        // unknown sign is accepted
        assert!(check_index("a", 1, &SymExpr::var("k", DType::Int32), &n(), &asm, 1).is_ok());
    }

    #[test]
    fn test_check_range() {
        let asm = asm();
        let one = SymExpr::int(1);
        assert_eq!(check_range(&SymExpr::zero(), &n(), &one, &asm, 1), Ok(false));
        assert_eq!(check_range(&n(), &SymExpr::zero(), &one, &asm, 1), Ok(true));
        assert!(check_range(&SymExpr::zero(), &n(), &SymExpr::zero(), &asm, 1).is_err());
    }

    #[test]
    fn test_overflowing_ir_has_no_symbolic_form() {
        let max = ir::Expr::int(i64::MAX);
        let sum = ir::Expr::binary(BinaryOp::Add, max.clone(), ir::Expr::int(1), DType::Int64);
        assert_eq!(ir_to_sym(&sum), None);
        let product = ir::Expr::binary(BinaryOp::Mul, max, ir::Expr::Symbol("M".into()), DType::Int64);
        let doubled = ir::Expr::binary(BinaryOp::Mul, product, ir::Expr::int(2), DType::Int64);
        assert_eq!(ir_to_sym(&doubled), None);

        let lowest = m().add(&SymExpr::int(i64::MIN)).unwrap();
        assert_eq!(sym_to_ir(&lowest).to_string(), "(M + -9223372036854775808)");
    }

    #[test]
    fn test_symbolic_round_trip_through_ir() {
        let expr = SymExpr::int(2).mul(&m()).and_then(|e| e.sub(&SymExpr::int(1))).unwrap();
        let lowered = sym_to_ir(&expr);
        assert_eq!(lowered.to_string(), "((2 * M) - 1)");
        assert_eq!(ir_to_sym(&lowered), Some(expr));
    }
}
